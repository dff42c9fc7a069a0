//! Locates exception tokens inside arbitrary shell commands.
//!
//! A token may ride in either of two places: an environment-variable
//! assignment (`KLACK="EXC:GIT022" git push`) or a comment
//! (`git push # EXC:GIT022`). The assignment wins when both are present.
//! All lookup goes through the AST façade; nothing is ever matched against
//! the raw command string, so quoting, heredocs, and chains behave the way
//! the shell would see them.

use crate::bash;
use crate::config::ExceptionsConfig;
use crate::error::KlackErr;
use crate::error::Result;
use crate::token::ExceptionToken;
use crate::token::TokenSource;
use crate::token::parse_exception_token;

/// Result of scanning one command for an exception token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub found: bool,
    pub source: TokenSource,
    pub token: Option<ExceptionToken>,
}

impl ParseOutcome {
    fn not_found() -> Self {
        Self {
            found: false,
            source: TokenSource::Unknown,
            token: None,
        }
    }
}

pub struct TokenParser {
    prefix: String,
    env_var: String,
}

impl TokenParser {
    pub fn new(prefix: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            env_var: env_var.into(),
        }
    }

    pub fn from_config(config: &ExceptionsConfig) -> Self {
        Self::new(config.token_prefix.clone(), config.env_var.clone())
    }

    /// Scan `command` for an exception token.
    ///
    /// Errors: `EmptyCommand` for blank input, `ParseFailed` when the
    /// command is not valid shell, and `InvalidToken`/`InvalidErrorCode`
    /// when a candidate was located but is malformed. A command with no
    /// candidate at all returns `found: false` rather than an error.
    pub fn parse(&self, command: &str) -> Result<ParseOutcome> {
        let command = command.trim();
        if command.is_empty() {
            return Err(KlackErr::EmptyCommand);
        }

        let script = bash::parse_script(command)?;

        // The first assignment of the configured name wins over any comment.
        if let Some(assignment) = script
            .assignments
            .iter()
            .find(|a| a.name == self.env_var)
        {
            // A value containing any expansion was already reduced to None;
            // treat it exactly like an empty assignment.
            let value = assignment.value.as_deref().unwrap_or("");
            if !value.is_empty() {
                let token = parse_exception_token(value, &self.prefix)?;
                return Ok(ParseOutcome {
                    found: true,
                    source: TokenSource::EnvVar,
                    token: Some(token),
                });
            }
        }

        let needle = format!("{}:", self.prefix);
        for comment in &script.comments {
            if let Some(candidate) = find_boundary_anchored(comment, &needle) {
                let token = parse_exception_token(candidate, &self.prefix)?;
                return Ok(ParseOutcome {
                    found: true,
                    source: TokenSource::Comment,
                    token: Some(token),
                });
            }
        }

        Ok(ParseOutcome::not_found())
    }
}

/// Find the first occurrence of `needle` in `text` that sits on a word
/// boundary (start of string, or preceded by a space or tab) and return the
/// candidate running from there to the next whitespace. Occurrences without
/// a boundary are skipped, so `NOEXC:GIT019` never matches `EXC:`.
pub(crate) fn find_boundary_anchored<'a>(text: &'a str, needle: &str) -> Option<&'a str> {
    let mut from = 0;
    while let Some(pos) = text[from..].find(needle) {
        let idx = from + pos;
        let on_boundary = idx == 0 || matches!(text.as_bytes()[idx - 1], b' ' | b'\t');
        if on_boundary {
            let rest = &text[idx..];
            let end = rest
                .find(|c: char| c.is_whitespace())
                .unwrap_or(rest.len());
            return Some(&rest[..end]);
        }
        // Advance past the prefix and retry.
        from = idx + needle.len();
    }
    None
}
