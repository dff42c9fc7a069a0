//! Per-error-code exception policy matching.
//!
//! The matcher is a pure decision cascade over borrowed configuration; it
//! performs no I/O and holds no state. Rate limiting is a separate concern
//! (the limiter runs after the policy allows).

use crate::config::ExceptionPolicyConfig;
use crate::config::ExceptionsConfig;
use crate::token::ExceptionToken;

/// Outcome of matching one token against policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    /// Whether the matched policy demanded a reason.
    pub required_reason: bool,
    /// The (trimmed) reason the token carried.
    pub provided_reason: String,
}

impl Decision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            required_reason: false,
            provided_reason: String::new(),
        }
    }
}

pub struct PolicyMatcher<'a> {
    config: &'a ExceptionsConfig,
}

impl<'a> PolicyMatcher<'a> {
    pub fn new(config: &'a ExceptionsConfig) -> Self {
        Self { config }
    }

    /// Decide whether `token` may bypass the validator block, short-circuiting
    /// on the first failing rule.
    pub fn match_token(&self, token: Option<&ExceptionToken>) -> Decision {
        let Some(token) = token else {
            return Decision::deny("no exception token provided");
        };

        if !self.config.enabled {
            return Decision::deny("exception system is disabled");
        }

        let default_policy = ExceptionPolicyConfig::default();
        let policy = self
            .config
            .policies
            .get(&token.error_code)
            .unwrap_or(&default_policy);

        if !policy.enabled {
            return Decision::deny(format!(
                "exceptions for {} are disabled",
                token.error_code
            ));
        }

        if !policy.allow_exception {
            return Decision::deny(format!(
                "exceptions are not allowed for {}",
                token.error_code
            ));
        }

        let provided = token.reason.trim().to_string();

        if policy.require_reason {
            if provided.is_empty() {
                return Decision {
                    allowed: false,
                    reason: format!("a reason is required for {}", token.error_code),
                    required_reason: true,
                    provided_reason: provided,
                };
            }

            if provided.len() < policy.min_reason_length {
                return Decision {
                    allowed: false,
                    reason: format!(
                        "reason is too short (minimum {} characters)",
                        policy.min_reason_length
                    ),
                    required_reason: true,
                    provided_reason: provided,
                };
            }

            if !policy.valid_reasons.is_empty() && !reason_in_list(&provided, &policy.valid_reasons)
            {
                return Decision {
                    allowed: false,
                    reason: "reason is not in the approved list".to_string(),
                    required_reason: true,
                    provided_reason: provided,
                };
            }
        }

        Decision {
            allowed: true,
            reason: "exception allowed by policy".to_string(),
            required_reason: policy.require_reason,
            provided_reason: provided,
        }
    }

    /// Per-code rate limits from policy; `(0, 0)` (unlimited) when no
    /// explicit policy exists.
    pub fn policy_limits(&self, error_code: &str) -> (u32, u32) {
        match self.config.policies.get(error_code) {
            Some(policy) => (policy.max_per_hour, policy.max_per_day),
            None => (0, 0),
        }
    }
}

/// A reason passes the whitelist when, case-folded and trimmed, it equals or
/// is prefixed by at least one entry. This admits `"Approved by @alice"`
/// when `"Approved by"` is whitelisted.
fn reason_in_list(provided: &str, valid_reasons: &[String]) -> bool {
    let provided = provided.trim().to_lowercase();
    valid_reasons.iter().any(|entry| {
        let entry = entry.trim().to_lowercase();
        !entry.is_empty() && provided.starts_with(&entry)
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ExceptionPolicyConfig;

    fn token(code: &str, reason: &str) -> ExceptionToken {
        ExceptionToken {
            prefix: "EXC".to_string(),
            error_code: code.to_string(),
            reason: reason.to_string(),
            raw: format!("EXC:{code}:{reason}"),
        }
    }

    fn config_with(code: &str, policy: ExceptionPolicyConfig) -> ExceptionsConfig {
        let mut config = ExceptionsConfig::default();
        config.policies.insert(code.to_string(), policy);
        config
    }

    #[test]
    fn missing_token_is_denied() {
        let config = ExceptionsConfig::default();
        let decision = PolicyMatcher::new(&config).match_token(None);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "no exception token provided");
    }

    #[test]
    fn disabled_system_denies_everything() {
        let config = ExceptionsConfig {
            enabled: false,
            ..ExceptionsConfig::default()
        };
        let decision =
            PolicyMatcher::new(&config).match_token(Some(&token("GIT022", "because")));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "exception system is disabled");
    }

    #[test]
    fn unknown_code_gets_default_allow() {
        let config = ExceptionsConfig::default();
        let decision =
            PolicyMatcher::new(&config).match_token(Some(&token("NET042", "")));
        assert!(decision.allowed);
    }

    #[test]
    fn disabled_code_is_denied() {
        let config = config_with(
            "GIT022",
            ExceptionPolicyConfig {
                enabled: false,
                ..ExceptionPolicyConfig::default()
            },
        );
        let decision =
            PolicyMatcher::new(&config).match_token(Some(&token("GIT022", "x")));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "exceptions for GIT022 are disabled");
    }

    #[test]
    fn not_allowed_code_is_denied() {
        let config = config_with(
            "SEC001",
            ExceptionPolicyConfig {
                allow_exception: false,
                ..ExceptionPolicyConfig::default()
            },
        );
        let decision =
            PolicyMatcher::new(&config).match_token(Some(&token("SEC001", "x")));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "exceptions are not allowed for SEC001");
    }

    #[test]
    fn required_reason_must_be_present() {
        let config = config_with(
            "GIT022",
            ExceptionPolicyConfig {
                require_reason: true,
                ..ExceptionPolicyConfig::default()
            },
        );
        let matcher = PolicyMatcher::new(&config);

        let denied = matcher.match_token(Some(&token("GIT022", "   ")));
        assert!(!denied.allowed);
        assert!(denied.required_reason);
        assert_eq!(denied.reason, "a reason is required for GIT022");

        let allowed = matcher.match_token(Some(&token("GIT022", "deploy window")));
        assert!(allowed.allowed);
        assert_eq!(allowed.provided_reason, "deploy window");
    }

    #[test]
    fn short_reason_is_denied() {
        let config = config_with(
            "GIT022",
            ExceptionPolicyConfig {
                require_reason: true,
                min_reason_length: 10,
                ..ExceptionPolicyConfig::default()
            },
        );
        let decision =
            PolicyMatcher::new(&config).match_token(Some(&token("GIT022", "short")));
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason,
            "reason is too short (minimum 10 characters)"
        );
    }

    #[test]
    fn whitelist_prefix_matches_case_folded() {
        let config = config_with(
            "GIT022",
            ExceptionPolicyConfig {
                require_reason: true,
                valid_reasons: vec!["Approved by".to_string()],
                ..ExceptionPolicyConfig::default()
            },
        );
        let matcher = PolicyMatcher::new(&config);

        assert!(
            matcher
                .match_token(Some(&token("GIT022", "approved BY @alice")))
                .allowed
        );
        assert!(
            matcher
                .match_token(Some(&token("GIT022", "Approved by")))
                .allowed
        );

        let denied = matcher.match_token(Some(&token("GIT022", "self-approved")));
        assert!(!denied.allowed);
        assert_eq!(denied.reason, "reason is not in the approved list");
    }

    #[test]
    fn policy_limits_default_to_unlimited() {
        let config = config_with(
            "GIT022",
            ExceptionPolicyConfig {
                max_per_hour: 2,
                max_per_day: 5,
                ..ExceptionPolicyConfig::default()
            },
        );
        let matcher = PolicyMatcher::new(&config);
        assert_eq!(matcher.policy_limits("GIT022"), (2, 5));
        assert_eq!(matcher.policy_limits("UNKNOWN1"), (0, 0));
    }
}
