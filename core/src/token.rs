//! Acknowledgment-token grammar.
//!
//! ```text
//! ExceptionToken := PREFIX ":" ERROR_CODE [ ":" URL_ENCODED_REASON ]
//! UnpoisonToken  := PREFIX ":" ERROR_CODE { "," ERROR_CODE }
//! ERROR_CODE     := [A-Z]{2,10}[0-9]{1,5}
//! ```
//!
//! Tokens are advisory acknowledgments, not capabilities: there is no
//! signing, and the only validation is shape.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::error::KlackErr;
use crate::error::Result;

#[allow(clippy::unwrap_used)] // constant pattern
static ERROR_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2,10}[0-9]{1,5}$").unwrap());

/// Where in the command a token was found. An environment-variable
/// assignment wins over a comment when both carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Comment,
    EnvVar,
    Unknown,
}

/// A parsed per-invocation exception token. Immutable once created; a
/// partially-parsed token is never observable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionToken {
    pub prefix: String,
    pub error_code: String,
    /// URL-decoded free text; possibly empty.
    pub reason: String,
    /// The unparsed slice as found in the command.
    pub raw: String,
}

/// A parsed session-unpoison token: an ordered set of error codes, no
/// reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpoisonToken {
    pub codes: Vec<String>,
    pub raw: String,
}

/// Returns true if `code` matches `/^[A-Z]{2,10}[0-9]{1,5}$/`.
pub fn is_valid_error_code(code: &str) -> bool {
    ERROR_CODE_RE.is_match(code)
}

/// Parse `raw` as an exception token with the configured `prefix`.
///
/// The string splits on `:` into at most three parts; fewer than two is
/// `InvalidToken`, a code of the wrong shape is `InvalidErrorCode`. The
/// reason part is URL-decoded; if decoding fails the raw string is kept.
pub fn parse_exception_token(raw: &str, prefix: &str) -> Result<ExceptionToken> {
    let mut parts = raw.splitn(3, ':');
    let got_prefix = parts.next().unwrap_or_default();
    let Some(code) = parts.next() else {
        return Err(KlackErr::InvalidToken(format!(
            "expected {prefix}:<CODE>, got {raw:?}"
        )));
    };
    if got_prefix != prefix {
        return Err(KlackErr::InvalidToken(format!(
            "expected prefix {prefix}, got {got_prefix:?}"
        )));
    }
    if !is_valid_error_code(code) {
        return Err(KlackErr::InvalidErrorCode(code.to_string()));
    }

    let reason = match parts.next() {
        None => String::new(),
        Some(encoded) => match urlencoding::decode(encoded) {
            Ok(decoded) => decoded.into_owned(),
            // Undecodable percent-escapes: keep what the user typed.
            Err(_) => encoded.to_string(),
        },
    };

    Ok(ExceptionToken {
        prefix: prefix.to_string(),
        error_code: code.to_string(),
        reason,
        raw: raw.to_string(),
    })
}

/// Parse `raw` as an unpoison token with the configured `prefix`: a
/// comma-separated list of error codes, order preserved, duplicates
/// dropped. At least one code must be present.
pub fn parse_unpoison_token(raw: &str, prefix: &str) -> Result<UnpoisonToken> {
    let mut parts = raw.splitn(2, ':');
    let got_prefix = parts.next().unwrap_or_default();
    let Some(list) = parts.next() else {
        return Err(KlackErr::InvalidToken(format!(
            "expected {prefix}:<CODE>[,<CODE>...], got {raw:?}"
        )));
    };
    if got_prefix != prefix {
        return Err(KlackErr::InvalidToken(format!(
            "expected prefix {prefix}, got {got_prefix:?}"
        )));
    }

    let mut codes: Vec<String> = Vec::new();
    for code in list.split(',') {
        let code = code.trim();
        if code.is_empty() {
            continue;
        }
        if !is_valid_error_code(code) {
            return Err(KlackErr::InvalidErrorCode(code.to_string()));
        }
        if !codes.iter().any(|c| c == code) {
            codes.push(code.to_string());
        }
    }
    if codes.is_empty() {
        return Err(KlackErr::InvalidToken(format!(
            "no error codes in {raw:?}"
        )));
    }

    Ok(UnpoisonToken {
        codes,
        raw: raw.to_string(),
    })
}
