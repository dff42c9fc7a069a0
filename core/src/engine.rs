//! Evaluation engine: glues the token parser and the policy matcher into a
//! single decision, and prepares the audit entry for the handler to log.
//! The engine itself never touches the filesystem.

use crate::clock::Clock;
use crate::config::ExceptionsConfig;
use crate::error::KlackErr;
use crate::parse_token::TokenParser;
use crate::policy::PolicyMatcher;
use crate::protocol::EvalRequest;
use crate::protocol::ExceptionAuditEntry;
use crate::protocol::ExceptionResult;
use crate::protocol::truncate_command;
use crate::token::ExceptionToken;
use crate::token::TokenSource;

pub struct Engine {
    config: ExceptionsConfig,
    parser: TokenParser,
    clock: Clock,
}

impl Engine {
    pub fn new(config: ExceptionsConfig, clock: Clock) -> Self {
        let parser = TokenParser::from_config(&config);
        Self {
            config,
            parser,
            clock,
        }
    }

    /// Decide whether `request.command` carries a token that bypasses the
    /// block. Any parse failure is surfaced through the response reason so
    /// the denial stays traceable; it is never a hard error to the caller.
    pub fn evaluate(&self, request: &EvalRequest) -> ExceptionResult {
        if !self.config.enabled {
            return deny("exception system is disabled", None);
        }

        let outcome = match self.parser.parse(&request.command) {
            Ok(outcome) => outcome,
            Err(e @ (KlackErr::EmptyCommand | KlackErr::ParseFailed(_))) => {
                return deny(e.to_string(), None);
            }
            Err(e) => {
                // A candidate token was present but malformed; that is an
                // auditable attempt.
                return deny(
                    e.to_string(),
                    Some(self.audit_entry(request, None, TokenSource::Unknown, false, e.to_string())),
                );
            }
        };

        let Some(token) = outcome.token else {
            return deny(KlackErr::TokenNotFound.to_string(), None);
        };

        if !request.error_code.is_empty() && token.error_code != request.error_code {
            let reason = format!(
                "token code {} does not match validator error code {}",
                token.error_code, request.error_code
            );
            return deny(
                reason.clone(),
                Some(self.audit_entry(request, Some(&token), outcome.source, false, reason)),
            );
        }

        let decision = PolicyMatcher::new(&self.config).match_token(Some(&token));
        if !decision.allowed {
            return deny(
                decision.reason.clone(),
                Some(self.audit_entry(
                    request,
                    Some(&token),
                    outcome.source,
                    false,
                    decision.reason,
                )),
            );
        }

        let entry = self.audit_entry(request, Some(&token), outcome.source, true, String::new());
        ExceptionResult {
            allowed: true,
            reason: decision.reason,
            audit_entry: Some(entry),
        }
    }

    fn audit_entry(
        &self,
        request: &EvalRequest,
        token: Option<&ExceptionToken>,
        source: TokenSource,
        allowed: bool,
        denial_reason: String,
    ) -> ExceptionAuditEntry {
        let reason = token
            .map(|t| t.reason.clone())
            .filter(|r| !r.is_empty());
        ExceptionAuditEntry {
            timestamp: (self.clock)(),
            error_code: token
                .map(|t| t.error_code.clone())
                .unwrap_or_else(|| request.error_code.clone()),
            validator_name: request.validator_name.clone(),
            allowed,
            reason,
            denial_reason: (!denial_reason.is_empty()).then_some(denial_reason),
            source,
            command: truncate_command(&request.command),
            working_dir: request.working_dir.clone(),
            repository: request.repository.clone(),
        }
    }
}

fn deny(reason: impl Into<String>, audit_entry: Option<ExceptionAuditEntry>) -> ExceptionResult {
    ExceptionResult {
        allowed: false,
        reason: reason.into(),
        audit_entry,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ExceptionPolicyConfig;
    use crate::protocol::MAX_AUDITED_COMMAND_CHARS;

    fn clock() -> ManualClock {
        ManualClock::new(
            chrono::DateTime::parse_from_rfc3339("2025-06-01T10:30:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        )
    }

    fn engine() -> Engine {
        Engine::new(ExceptionsConfig::default(), clock().as_clock())
    }

    fn request(command: &str, error_code: &str) -> EvalRequest {
        EvalRequest {
            command: command.to_string(),
            validator_name: "git-push".to_string(),
            error_code: error_code.to_string(),
            working_dir: "/repo".to_string(),
            repository: "repo".to_string(),
        }
    }

    #[test]
    fn allows_matching_token_and_builds_entry() {
        let result = engine().evaluate(&request(
            "git push origin main # EXC:GIT022:Emergency%20hotfix",
            "GIT022",
        ));
        assert!(result.allowed);

        let entry = result.audit_entry.unwrap();
        assert!(entry.allowed);
        assert_eq!(entry.error_code, "GIT022");
        assert_eq!(entry.reason.as_deref(), Some("Emergency hotfix"));
        assert_eq!(entry.denial_reason, None);
        assert_eq!(entry.source, TokenSource::Comment);
        assert_eq!(entry.validator_name, "git-push");
    }

    #[test]
    fn code_mismatch_is_denied_and_audited() {
        let result = engine().evaluate(&request("git push # EXC:GIT022", "SEC001"));
        assert!(!result.allowed);
        assert!(result.reason.contains("does not match"));

        let entry = result.audit_entry.unwrap();
        assert!(!entry.allowed);
        assert_eq!(entry.error_code, "GIT022");
        assert!(entry.denial_reason.unwrap().contains("does not match"));
    }

    #[test]
    fn empty_validator_code_accepts_any_token() {
        let result = engine().evaluate(&request("git push # EXC:GIT022", ""));
        assert!(result.allowed);
    }

    #[test]
    fn no_token_is_denied_without_entry() {
        let result = engine().evaluate(&request("git push origin main", "GIT022"));
        assert!(!result.allowed);
        assert_eq!(result.reason, "no exception token found");
        assert!(result.audit_entry.is_none());
    }

    #[test]
    fn parse_failure_is_surfaced_in_reason() {
        let result = engine().evaluate(&request("if then fi ((", "GIT022"));
        assert!(!result.allowed);
        assert!(result.reason.contains("failed to parse command"));
        assert!(result.audit_entry.is_none());
    }

    #[test]
    fn disabled_system_short_circuits() {
        let config = ExceptionsConfig {
            enabled: false,
            ..ExceptionsConfig::default()
        };
        let result = Engine::new(config, clock().as_clock())
            .evaluate(&request("git push # EXC:GIT022", "GIT022"));
        assert!(!result.allowed);
        assert_eq!(result.reason, "exception system is disabled");
    }

    #[test]
    fn policy_denial_lands_in_denial_reason() {
        let mut config = ExceptionsConfig::default();
        config.policies.insert(
            "GIT022".to_string(),
            ExceptionPolicyConfig {
                require_reason: true,
                ..ExceptionPolicyConfig::default()
            },
        );
        let result = Engine::new(config, clock().as_clock())
            .evaluate(&request("git push # EXC:GIT022", "GIT022"));
        assert!(!result.allowed);

        let entry = result.audit_entry.unwrap();
        assert!(!entry.allowed);
        assert_eq!(
            entry.denial_reason.as_deref(),
            Some("a reason is required for GIT022")
        );
    }

    #[test]
    fn audited_command_is_truncated() {
        let long_tail = "x".repeat(300);
        let command = format!("git push {long_tail} # EXC:GIT022");
        let result = engine().evaluate(&request(&command, "GIT022"));
        let entry = result.audit_entry.unwrap();
        assert_eq!(
            entry.command.chars().count(),
            MAX_AUDITED_COMMAND_CHARS + 1
        );
        assert!(entry.command.ends_with('…'));
    }

    #[test]
    fn malformed_token_attempt_is_audited() {
        let result = engine().evaluate(&request("git push # EXC:git001", "GIT022"));
        assert!(!result.allowed);
        assert!(result.reason.contains("invalid error code"));

        let entry = result.audit_entry.unwrap();
        assert_eq!(entry.error_code, "GIT022");
        assert_eq!(entry.source, TokenSource::Unknown);
    }
}
