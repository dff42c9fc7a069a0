//! Dual-window, two-dimensional exception rate limiter.
//!
//! Usage is counted in two windows (the current UTC hour and the current
//! UTC day) and two dimensions (globally and per error code). The daily
//! window is a fixed UTC day, not a rolling 24 hours: both window starts
//! are arithmetic floors of the clock to a 3600- or 86400-second multiple
//! since the epoch.
//!
//! State is persisted as JSON next to the other klack state files and
//! written atomically; a corrupt or missing file degrades to a fresh
//! zero state so the hot path is never broken by bad state on disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::ExceptionRateLimitConfig;
use crate::error::Result;
use crate::fsutil;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86400;

/// Persisted counter state. All fields default so that a state file written
/// by an older build (or missing fields entirely) loads as zeroes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitState {
    #[serde(default)]
    pub hourly_usage: HashMap<String, u32>,

    #[serde(default)]
    pub daily_usage: HashMap<String, u32>,

    #[serde(default)]
    pub global_hourly_count: u32,

    #[serde(default)]
    pub global_daily_count: u32,

    #[serde(default = "unix_epoch")]
    pub hour_start_time: DateTime<Utc>,

    #[serde(default = "unix_epoch")]
    pub day_start_time: DateTime<Utc>,

    #[serde(default = "unix_epoch")]
    pub last_updated: DateTime<Utc>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            hourly_usage: HashMap::new(),
            daily_usage: HashMap::new(),
            global_hourly_count: 0,
            global_daily_count: 0,
            hour_start_time: unix_epoch(),
            day_start_time: unix_epoch(),
            last_updated: unix_epoch(),
        }
    }
}

/// Outcome of a limit check. `-1` encodes "unlimited" in the remaining
/// fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason: String,
    pub global_hourly_remaining: i64,
    pub global_daily_remaining: i64,
    pub code_hourly_remaining: i64,
    pub code_daily_remaining: i64,
}

pub struct RateLimiter {
    enabled: bool,
    max_per_hour: u32,
    max_per_day: u32,
    /// Per-code `(max_per_hour, max_per_day)` from policy; zero = unlimited.
    code_limits: HashMap<String, (u32, u32)>,
    state_path: PathBuf,
    clock: Clock,
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    pub fn new(
        config: &ExceptionRateLimitConfig,
        code_limits: HashMap<String, (u32, u32)>,
        state_path: PathBuf,
        clock: Clock,
    ) -> Self {
        Self {
            enabled: config.enabled,
            max_per_hour: config.max_per_hour,
            max_per_day: config.max_per_day,
            code_limits,
            state_path,
            clock,
            state: Mutex::new(RateLimitState::default()),
        }
    }

    /// Check whether one more exception for `error_code` fits the limits.
    /// Read-only apart from the window refresh; does not consume quota.
    pub fn check(&self, error_code: &str) -> CheckResult {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refresh_windows(&mut state);

        let (code_hourly_limit, code_daily_limit) = self.limits_for(error_code);
        let code_hourly_used = state.hourly_usage.get(error_code).copied().unwrap_or(0);
        let code_daily_used = state.daily_usage.get(error_code).copied().unwrap_or(0);

        let result = |allowed: bool, reason: String, state: &RateLimitState| CheckResult {
            allowed,
            reason,
            global_hourly_remaining: remaining(self.max_per_hour, state.global_hourly_count),
            global_daily_remaining: remaining(self.max_per_day, state.global_daily_count),
            code_hourly_remaining: remaining(code_hourly_limit, code_hourly_used),
            code_daily_remaining: remaining(code_daily_limit, code_daily_used),
        };

        if !self.enabled {
            return result(true, "rate limiting is disabled".to_string(), &state);
        }

        // Deny-reason precedence: global hourly, global daily, code hourly,
        // code daily.
        if self.max_per_hour > 0 && state.global_hourly_count >= self.max_per_hour {
            return result(
                false,
                format!(
                    "global hourly limit reached ({} per hour)",
                    self.max_per_hour
                ),
                &state,
            );
        }
        if self.max_per_day > 0 && state.global_daily_count >= self.max_per_day {
            return result(
                false,
                format!("global daily limit reached ({} per day)", self.max_per_day),
                &state,
            );
        }
        if code_hourly_limit > 0 && code_hourly_used >= code_hourly_limit {
            return result(
                false,
                format!(
                    "hourly limit reached for {error_code} ({code_hourly_limit} per hour)"
                ),
                &state,
            );
        }
        if code_daily_limit > 0 && code_daily_used >= code_daily_limit {
            return result(
                false,
                format!(
                    "daily limit reached for {error_code} ({code_daily_limit} per day)"
                ),
                &state,
            );
        }

        result(true, "within limits".to_string(), &state)
    }

    /// Record one exception for `error_code` and persist the state.
    /// Callers must `check` first; `record` does not re-check.
    pub fn record(&self, error_code: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.refresh_windows(&mut state);

            state.global_hourly_count += 1;
            state.global_daily_count += 1;
            *state
                .hourly_usage
                .entry(error_code.to_string())
                .or_insert(0) += 1;
            *state.daily_usage.entry(error_code.to_string()).or_insert(0) += 1;
            state.last_updated = (self.clock)();
            state.clone()
        };
        self.write_state(&snapshot)
    }

    /// Persist the current state (`path.tmp` + rename). The snapshot is
    /// taken under the lock, the marshal and syscalls happen outside it.
    pub fn save(&self) -> Result<()> {
        let snapshot = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.write_state(&snapshot)
    }

    /// Load persisted state. A missing file yields fresh state; an
    /// unreadable one is preserved as `<path>.bad` (best-effort) and also
    /// yields fresh state. Windows are refreshed immediately so a stale
    /// file from yesterday cannot carry a hot hourly counter into today.
    pub fn load(&self) -> Result<()> {
        let loaded = match std::fs::read_to_string(&self.state_path) {
            Ok(contents) => match serde_json::from_str::<RateLimitState>(&contents) {
                Ok(state) => state,
                Err(e) => {
                    tracing::debug!(
                        "invalid rate-limit state in {}: {e}; starting fresh",
                        self.state_path.display()
                    );
                    self.preserve_bad_state_file();
                    RateLimitState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RateLimitState::default(),
            Err(e) => return Err(e.into()),
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = loaded;
        self.refresh_windows(&mut state);
        Ok(())
    }

    /// Zero all counters and realign both windows to the current clock.
    pub fn reset(&self) {
        let now = (self.clock)();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = RateLimitState {
            hour_start_time: floor_to(now, HOUR_SECS),
            day_start_time: floor_to(now, DAY_SECS),
            last_updated: now,
            ..RateLimitState::default()
        };
    }

    /// A deep copy of the current counters, for status output.
    pub fn usage_snapshot(&self) -> RateLimitState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refresh_windows(&mut state);
        state.clone()
    }

    fn limits_for(&self, error_code: &str) -> (u32, u32) {
        self.code_limits
            .get(error_code)
            .copied()
            .unwrap_or((0, 0))
    }

    /// Zero any window the clock has left behind. Fresh maps are allocated
    /// on a flip rather than mutating the old ones, so a snapshot already
    /// handed to a writer keeps observing the counters it was taken with.
    fn refresh_windows(&self, state: &mut RateLimitState) {
        let now = (self.clock)();
        let current_hour = floor_to(now, HOUR_SECS);
        let current_day = floor_to(now, DAY_SECS);

        if current_hour > state.hour_start_time {
            state.global_hourly_count = 0;
            state.hourly_usage = HashMap::new();
            state.hour_start_time = current_hour;
        }
        if current_day > state.day_start_time {
            state.global_daily_count = 0;
            state.daily_usage = HashMap::new();
            state.day_start_time = current_day;
        }
    }

    fn write_state(&self, snapshot: &RateLimitState) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        fsutil::atomic_write(&self.state_path, &json)
    }

    fn preserve_bad_state_file(&self) {
        let mut os = self.state_path.as_os_str().to_os_string();
        os.push(".bad");
        if let Err(e) = std::fs::rename(&self.state_path, PathBuf::from(os)) {
            tracing::debug!("could not preserve bad state file: {e}");
        }
    }
}

fn remaining(limit: u32, used: u32) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::from(limit.saturating_sub(used))
    }
}

/// Align `now` down to a `secs`-second multiple since the Unix epoch.
fn floor_to(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    let ts = now.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or(DateTime::UNIX_EPOCH)
}
