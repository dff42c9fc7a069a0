//! Wire types exchanged with the hook dispatcher, plus the audit-entry
//! schemas for the two JSONL journals.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::audit::Timestamped;
use crate::token::TokenSource;

/// Commands recorded in audit entries and poison messages are clipped to
/// this many characters (plus an ellipsis) so a journal line stays
/// readable.
pub const MAX_AUDITED_COMMAND_CHARS: usize = 200;

/// The slice of the hook invocation the core consumes. Produced by the
/// external dispatcher; every field defaults so partial payloads
/// deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookContext {
    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub working_dir: String,

    #[serde(default)]
    pub session_id: String,

    #[serde(default)]
    pub validator_name: String,

    #[serde(default)]
    pub error_code: String,

    /// Repository identifier, when the dispatcher knows it.
    #[serde(default)]
    pub repository: String,
}

/// Input to the evaluation engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalRequest {
    pub command: String,
    pub validator_name: String,
    /// The code the failing validator reported. When non-empty, a token
    /// naming a different code is rejected.
    pub error_code: String,
    pub working_dir: String,
    pub repository: String,
}

impl EvalRequest {
    pub fn from_hook(hook: &HookContext) -> Self {
        Self {
            command: hook.command.clone(),
            validator_name: hook.validator_name.clone(),
            error_code: hook.error_code.clone(),
            working_dir: hook.working_dir.clone(),
            repository: hook.repository.clone(),
        }
    }
}

/// What the engine hands back to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionResult {
    pub allowed: bool,
    pub reason: String,
    /// Present whenever a token was actually found; the handler logs it.
    pub audit_entry: Option<ExceptionAuditEntry>,
}

/// Remaining quota attached to a response. `-1` means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub global_hourly_remaining: i64,
    pub global_daily_remaining: i64,
    pub code_hourly_remaining: i64,
    pub code_daily_remaining: i64,
}

/// The handler's structured answer to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionResponse {
    pub bypassed: bool,

    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<RateLimitInfo>,
}

impl ExceptionResponse {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            bypassed: false,
            reason: reason.into(),
            error_code: String::new(),
            token_reason: String::new(),
            rate_limit_info: None,
        }
    }
}

/// One line in the exception audit journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionAuditEntry {
    pub timestamp: DateTime<Utc>,

    pub error_code: String,

    pub validator_name: String,

    pub allowed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,

    pub source: TokenSource,

    /// The command, truncated to [`MAX_AUDITED_COMMAND_CHARS`].
    pub command: String,

    #[serde(default)]
    pub working_dir: String,

    #[serde(default)]
    pub repository: String,
}

impl Timestamped for ExceptionAuditEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionAction {
    Poison,
    Unpoison,
}

/// One line in the session audit journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionAuditEntry {
    pub timestamp: DateTime<Utc>,

    pub action: SessionAction,

    pub session_id: String,

    #[serde(default)]
    pub poison_codes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TokenSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poison_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl Timestamped for SessionAuditEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Verdict of the session gate for one incoming command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionCheck {
    /// Session is clean (or tracking is disabled); run the validators.
    Clean,
    /// Session is poisoned and the command did not acknowledge every
    /// outstanding code.
    Blocked {
        poison_codes: Vec<String>,
        unacknowledged: Vec<String>,
        message: String,
    },
    /// The command acknowledged every outstanding code; the session was
    /// cleared.
    Unpoisoned { codes: Vec<String> },
}

/// Clip `command` for audit purposes.
pub fn truncate_command(command: &str) -> String {
    let mut chars = command.chars();
    let clipped: String = chars.by_ref().take(MAX_AUDITED_COMMAND_CHARS).collect();
    if chars.next().is_some() {
        format!("{clipped}…")
    } else {
        clipped
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn truncation_only_clips_long_commands() {
        assert_eq!(truncate_command("git push"), "git push");

        let long = "x".repeat(MAX_AUDITED_COMMAND_CHARS + 17);
        let clipped = truncate_command(&long);
        assert_eq!(clipped.chars().count(), MAX_AUDITED_COMMAND_CHARS + 1);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn hook_context_tolerates_missing_fields() {
        let hook: HookContext =
            serde_json::from_str(r#"{"command":"git push"}"#).unwrap();
        assert_eq!(hook.command, "git push");
        assert_eq!(hook.session_id, "");
        assert_eq!(hook.repository, "");
    }

    #[test]
    fn token_source_serializes_snake_case() {
        let entry = ExceptionAuditEntry {
            timestamp: DateTime::UNIX_EPOCH,
            error_code: "GIT022".to_string(),
            validator_name: "git-push".to_string(),
            allowed: true,
            reason: Some("ok".to_string()),
            denial_reason: None,
            source: TokenSource::EnvVar,
            command: "git push".to_string(),
            working_dir: "/repo".to_string(),
            repository: "repo".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""source":"env_var""#));
        assert!(!json.contains("denial_reason"));
    }
}
