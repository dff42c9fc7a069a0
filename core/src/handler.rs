//! Top-level orchestration for the exception hot path.
//!
//! The handler owns the engine, the rate limiter, and the exception audit
//! journal; the dispatcher calls [`Handler::handle`] once per validator
//! failure. Audit and rate-limit persistence failures degrade to warnings:
//! a bypass decision already made is never retracted because a disk write
//! failed.

use std::collections::HashMap;

use crate::audit::AuditJournal;
use crate::audit::JournalConfig;
use crate::clock::Clock;
use crate::config::Config;
use crate::config::expand_tilde;
use crate::engine::Engine;
use crate::policy::PolicyMatcher;
use crate::protocol::EvalRequest;
use crate::protocol::ExceptionAuditEntry;
use crate::protocol::ExceptionResponse;
use crate::protocol::HookContext;
use crate::protocol::RateLimitInfo;
use crate::rate_limit::CheckResult;
use crate::rate_limit::RateLimiter;

pub struct Handler {
    enabled: bool,
    engine: Engine,
    rate_limiter: RateLimiter,
    journal: AuditJournal<ExceptionAuditEntry>,
}

impl Handler {
    /// Wire up the exception subsystem from configuration. Persisted
    /// rate-limit state is loaded eagerly; a load failure is logged and the
    /// limiter starts fresh.
    pub fn new(config: &Config, clock: Clock) -> Self {
        let exceptions = &config.exceptions;

        let code_limits: HashMap<String, (u32, u32)> = {
            let matcher = PolicyMatcher::new(exceptions);
            exceptions
                .policies
                .keys()
                .map(|code| (code.clone(), matcher.policy_limits(code)))
                .collect()
        };

        let rate_limiter = RateLimiter::new(
            &exceptions.rate_limit,
            code_limits,
            expand_tilde(&exceptions.rate_limit.state_file),
            clock.clone(),
        );
        if let Err(e) = rate_limiter.load() {
            tracing::warn!("could not load rate-limit state: {e}");
        }

        let journal = AuditJournal::new(
            JournalConfig {
                enabled: exceptions.audit.enabled,
                log_file: expand_tilde(&exceptions.audit.log_file),
                max_size_mb: exceptions.audit.max_size_mb,
                max_age_days: exceptions.audit.max_age_days,
                max_backups: exceptions.audit.max_backups,
            },
            clock.clone(),
        );

        Self {
            enabled: exceptions.enabled,
            engine: Engine::new(exceptions.clone(), clock),
            rate_limiter,
            journal,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn journal(&self) -> &AuditJournal<ExceptionAuditEntry> {
        &self.journal
    }

    /// Evaluate one blocked command end to end: token, policy, rate limit,
    /// audit. Always returns a structured response; never panics and never
    /// fails the caller over infrastructure errors.
    pub fn handle(&self, hook: &HookContext) -> ExceptionResponse {
        if !self.enabled {
            return ExceptionResponse::denied("exception system is disabled");
        }

        if hook.command.trim().is_empty() {
            return ExceptionResponse::denied("no command to parse");
        }

        let request = EvalRequest::from_hook(hook);
        let result = self.engine.evaluate(&request);

        if !result.allowed {
            let error_code = result
                .audit_entry
                .as_ref()
                .map(|entry| entry.error_code.clone())
                .unwrap_or_else(|| hook.error_code.clone());
            if let Some(entry) = result.audit_entry {
                self.log_entry(&entry);
            }
            return ExceptionResponse {
                error_code,
                ..ExceptionResponse::denied(result.reason)
            };
        }

        // The engine only allows when a token was found, so the entry is
        // always present here.
        let Some(mut entry) = result.audit_entry else {
            return ExceptionResponse::denied("internal error: allowed without token");
        };
        let error_code = entry.error_code.clone();

        let check = self.rate_limiter.check(&error_code);
        if !check.allowed {
            entry.allowed = false;
            entry.denial_reason = Some(check.reason.clone());
            self.log_entry(&entry);
            return ExceptionResponse {
                bypassed: false,
                reason: check.reason.clone(),
                error_code,
                token_reason: String::new(),
                rate_limit_info: Some(rate_limit_info(&check)),
            };
        }

        if let Err(e) = self.rate_limiter.record(&error_code) {
            tracing::warn!("could not record exception usage: {e}");
        }

        self.log_entry(&entry);

        let after = self.rate_limiter.check(&error_code);
        ExceptionResponse {
            bypassed: true,
            reason: "exception allowed".to_string(),
            error_code,
            token_reason: entry.reason.clone().unwrap_or_default(),
            rate_limit_info: Some(rate_limit_info(&after)),
        }
    }

    fn log_entry(&self, entry: &ExceptionAuditEntry) {
        if let Err(e) = self.journal.log(entry) {
            tracing::warn!("could not write exception audit entry: {e}");
        }
    }
}

fn rate_limit_info(check: &CheckResult) -> RateLimitInfo {
    RateLimitInfo {
        global_hourly_remaining: check.global_hourly_remaining,
        global_daily_remaining: check.global_daily_remaining,
        code_hourly_remaining: check.code_hourly_remaining,
        code_daily_remaining: check.code_daily_remaining,
    }
}

/// Render a bypass for humans: code, reason, and what is left of the quota.
pub fn format_bypass_message(response: &ExceptionResponse) -> String {
    let mut message = format!("✅ Exception allowed for {}", response.error_code);
    if !response.token_reason.is_empty() {
        message.push_str(&format!(": {}", response.token_reason));
    }
    match response.rate_limit_info {
        Some(info) => {
            let hourly = tighter(info.global_hourly_remaining, info.code_hourly_remaining);
            let daily = tighter(info.global_daily_remaining, info.code_daily_remaining);
            if hourly < 0 && daily < 0 {
                message.push_str("\nQuota: unlimited");
            } else {
                message.push_str(&format!(
                    "\nRemaining: hourly={}, daily={}",
                    render_remaining(hourly),
                    render_remaining(daily)
                ));
            }
        }
        None => message.push_str("\nQuota: unlimited"),
    }
    message
}

/// Render a denial for humans: code (when known) and reason.
pub fn format_denial_message(response: &ExceptionResponse) -> String {
    if response.error_code.is_empty() {
        format!("❌ Exception denied: {}", response.reason)
    } else {
        format!(
            "❌ Exception denied for {}: {}",
            response.error_code, response.reason
        )
    }
}

/// The binding value across the global and per-code dimensions; `-1` means
/// unlimited on both.
fn tighter(global: i64, code: i64) -> i64 {
    match (global < 0, code < 0) {
        (true, true) => -1,
        (true, false) => code,
        (false, true) => global,
        (false, false) => global.min(code),
    }
}

fn render_remaining(remaining: i64) -> String {
    if remaining < 0 {
        "unlimited".to_string()
    } else {
        remaining.to_string()
    }
}
