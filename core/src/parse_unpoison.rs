//! Locates session-unpoison tokens inside shell commands.
//!
//! Shares the lookup machinery with the exception parser (env-var
//! assignment preferred over comment, boundary-anchored prefix scan) but
//! parses a comma-separated code list with no reason and no URL decoding.

use crate::bash;
use crate::config::SessionConfig;
use crate::error::KlackErr;
use crate::error::Result;
use crate::parse_token::find_boundary_anchored;
use crate::token::TokenSource;
use crate::token::UnpoisonToken;
use crate::token::parse_unpoison_token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpoisonOutcome {
    pub found: bool,
    pub source: TokenSource,
    pub token: Option<UnpoisonToken>,
}

/// Result of matching a command's unpoison token against the codes a
/// poisoned session is still waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// True only when the token's codes are a superset of the required ones.
    pub acknowledged: bool,
    /// The codes the token carried (empty when no token was found).
    pub codes: Vec<String>,
    /// The required codes the token did not cover, in required order.
    pub unacknowledged: Vec<String>,
    pub source: TokenSource,
}

pub struct UnpoisonParser {
    prefix: String,
    env_var: String,
}

impl UnpoisonParser {
    pub fn new(prefix: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            env_var: env_var.into(),
        }
    }

    pub fn from_config(config: &SessionConfig, env_var: impl Into<String>) -> Self {
        Self::new(config.token_prefix.clone(), env_var)
    }

    /// Scan `command` for an unpoison token. Same error contract as the
    /// exception parser.
    pub fn parse(&self, command: &str) -> Result<UnpoisonOutcome> {
        let command = command.trim();
        if command.is_empty() {
            return Err(KlackErr::EmptyCommand);
        }

        let script = bash::parse_script(command)?;

        if let Some(assignment) = script
            .assignments
            .iter()
            .find(|a| a.name == self.env_var)
        {
            let value = assignment.value.as_deref().unwrap_or("");
            if !value.is_empty() {
                let token = parse_unpoison_token(value, &self.prefix)?;
                return Ok(UnpoisonOutcome {
                    found: true,
                    source: TokenSource::EnvVar,
                    token: Some(token),
                });
            }
        }

        let needle = format!("{}:", self.prefix);
        for comment in &script.comments {
            if let Some(candidate) = find_boundary_anchored(comment, &needle) {
                let token = parse_unpoison_token(candidate, &self.prefix)?;
                return Ok(UnpoisonOutcome {
                    found: true,
                    source: TokenSource::Comment,
                    token: Some(token),
                });
            }
        }

        Ok(UnpoisonOutcome {
            found: false,
            source: TokenSource::Unknown,
            token: None,
        })
    }

    /// Check whether `command` acknowledges every code in `required`.
    ///
    /// Infallible by design: an unparsable command, a malformed token, or no
    /// token at all simply fails to acknowledge (the dispatcher keeps the
    /// session blocked and reports the whole required set).
    pub fn check_acknowledgment(&self, command: &str, required: &[String]) -> Ack {
        let outcome = match self.parse(command) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!("unpoison token lookup failed: {e}");
                return Ack {
                    acknowledged: false,
                    codes: Vec::new(),
                    unacknowledged: required.to_vec(),
                    source: TokenSource::Unknown,
                };
            }
        };

        let Some(token) = outcome.token else {
            return Ack {
                acknowledged: false,
                codes: Vec::new(),
                unacknowledged: required.to_vec(),
                source: TokenSource::Unknown,
            };
        };

        let unacknowledged: Vec<String> = required
            .iter()
            .filter(|code| !token.codes.iter().any(|c| c == *code))
            .cloned()
            .collect();

        Ack {
            acknowledged: unacknowledged.is_empty(),
            codes: token.codes,
            unacknowledged,
            source: outcome.source,
        }
    }
}
