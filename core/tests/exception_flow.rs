//! End-to-end exception flow: token → policy → rate limit → audit.

#![allow(clippy::unwrap_used)]

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use klack_core::Handler;
use klack_core::clock::ManualClock;
use klack_core::config::Config;
use klack_core::config::ExceptionPolicyConfig;
use klack_core::protocol::HookContext;
use klack_core::rate_limit::RateLimitState;
use klack_core::token::TokenSource;
use tempfile::TempDir;

fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-01T10:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.exceptions.rate_limit.state_file = dir
        .path()
        .join("rate-limit.json")
        .to_string_lossy()
        .into_owned();
    config.exceptions.audit.log_file = dir
        .path()
        .join("exceptions.jsonl")
        .to_string_lossy()
        .into_owned();
    config.sessions.state_file = dir
        .path()
        .join("sessions.json")
        .to_string_lossy()
        .into_owned();
    config.sessions.audit.log_file = dir
        .path()
        .join("sessions-audit.jsonl")
        .to_string_lossy()
        .into_owned();
    config
}

fn hook(command: &str, error_code: &str) -> HookContext {
    HookContext {
        command: command.to_string(),
        working_dir: "/repo".to_string(),
        session_id: "sess-1".to_string(),
        validator_name: "git-push".to_string(),
        error_code: error_code.to_string(),
        repository: "repo".to_string(),
    }
}

#[test]
fn bypass_with_url_encoded_reason() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&config, clock.as_clock());

    let response = handler.handle(&hook(
        "git push origin main # EXC:GIT022:Emergency%20hotfix",
        "GIT022",
    ));

    assert!(response.bypassed);
    assert_eq!(response.error_code, "GIT022");
    assert_eq!(response.token_reason, "Emergency hotfix");

    let info = response.rate_limit_info.unwrap();
    assert_eq!(
        info.global_hourly_remaining,
        i64::from(config.exceptions.rate_limit.max_per_hour) - 1
    );

    let entries = handler.journal().read().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].allowed);
    assert_eq!(entries[0].source, TokenSource::Comment);
    assert_eq!(entries[0].reason.as_deref(), Some("Emergency hotfix"));
    assert_eq!(entries[0].working_dir, "/repo");
}

#[test]
fn env_var_beats_comment() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&test_config(&dir), clock.as_clock());

    let response = handler.handle(&hook(
        "KLACK=\"EXC:SEC001:env\" git push # EXC:GIT022:comment",
        "SEC001",
    ));

    assert!(response.bypassed);
    assert_eq!(response.error_code, "SEC001");

    let entries = handler.journal().read().unwrap();
    assert_eq!(entries[0].source, TokenSource::EnvVar);
}

#[test]
fn error_code_mismatch_is_denied() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&test_config(&dir), clock.as_clock());

    let response = handler.handle(&hook("git push # EXC:GIT022:reason", "SEC001"));

    assert!(!response.bypassed);
    assert!(response.reason.contains("does not match"));
}

#[test]
fn per_code_hourly_limit_exhaustion() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.exceptions.policies.insert(
        "GIT022".to_string(),
        ExceptionPolicyConfig {
            max_per_hour: 1,
            ..ExceptionPolicyConfig::default()
        },
    );
    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&config, clock.as_clock());

    let first = handler.handle(&hook("git push # EXC:GIT022", "GIT022"));
    assert!(first.bypassed);
    assert_eq!(first.rate_limit_info.unwrap().code_hourly_remaining, 0);

    let second = handler.handle(&hook("git push # EXC:GIT022", "GIT022"));
    assert!(!second.bypassed);
    assert!(second.reason.contains("hourly limit"));
}

#[test]
fn hourly_window_rollover_resets_hourly_only() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&test_config(&dir), clock.as_clock());

    let first = handler.handle(&hook("git push # EXC:GIT022", "GIT022"));
    assert!(first.bypassed);

    clock.advance(TimeDelta::hours(1));

    let snapshot = handler.rate_limiter().usage_snapshot();
    assert_eq!(snapshot.global_hourly_count, 0);
    assert_eq!(snapshot.global_daily_count, 1);

    let second = handler.handle(&hook("git push # EXC:GIT022", "GIT022"));
    let info = second.rate_limit_info.unwrap();
    // A fresh hourly budget, one more use consumed from the daily one.
    assert_eq!(info.global_hourly_remaining, 9);
    assert_eq!(info.global_daily_remaining, 48);
}

#[test]
fn audit_rotation_produces_backup_and_fresh_file() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.exceptions.audit.max_size_mb = 1;
    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&config, clock.as_clock());

    let log_path = dir.path().join("exceptions.jsonl");
    std::fs::write(&log_path, "x".repeat(1024 * 1024 + 100 * 1024)).unwrap();

    let response = handler.handle(&hook("git push # EXC:GIT022", "GIT022"));
    assert!(response.bypassed);

    let entries = handler.journal().read().unwrap();
    assert_eq!(entries.len(), 1);

    let backups = handler.journal().backups().unwrap();
    assert_eq!(backups.len(), 1);
    let name = backups[0].file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("exceptions."));
    assert!(name.ends_with(".jsonl"));
    let middle = &name["exceptions.".len()..name.len() - ".jsonl".len()];
    assert_eq!(middle.len(), 15);
    assert_eq!(middle.as_bytes()[8], b'-');
}

#[test]
fn rotation_preserves_every_logged_entry() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    // Small cap plus bulky commands force several rotations.
    config.exceptions.audit.max_size_mb = 1;
    config.exceptions.rate_limit.max_per_hour = 0;
    config.exceptions.rate_limit.max_per_day = 0;
    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&config, clock.as_clock());

    let log_path = dir.path().join("exceptions.jsonl");
    let total = 30usize;
    for i in 0..total {
        if i % 10 == 5 {
            // Push the live file over the cap between appends.
            let mut bulk = std::fs::read_to_string(&log_path).unwrap();
            bulk.push_str(&"x".repeat(1024 * 1024 + 1));
            bulk.push('\n');
            std::fs::write(&log_path, bulk).unwrap();
        }
        clock.advance(TimeDelta::seconds(1));
        assert!(handler.handle(&hook("git push # EXC:GIT022", "GIT022")).bypassed);
    }

    let mut seen = handler.journal().read().unwrap().len();
    for backup in handler.journal().backups().unwrap() {
        seen += handler.journal().read_backup(&backup).unwrap().len();
    }
    assert_eq!(seen, total);
}

#[test]
fn corrupt_rate_limit_state_recovers() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let state_path = dir.path().join("rate-limit.json");
    std::fs::write(&state_path, "{ invalid json }").unwrap();

    let clock = ManualClock::new(start_time());
    let handler = Handler::new(&config, clock.as_clock());

    // Loaded fresh despite the corrupt file, and usable immediately.
    let response = handler.handle(&hook("git push # EXC:GIT022", "GIT022"));
    assert!(response.bypassed);

    // The recorded use produced a valid state file again.
    let state: RateLimitState =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    assert_eq!(state.global_hourly_count, 1);
    assert_eq!(state.hourly_usage.get("GIT022"), Some(&1));
}

#[test]
fn state_round_trips_across_handlers() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let clock = ManualClock::new(start_time());

    {
        let handler = Handler::new(&config, clock.as_clock());
        assert!(handler.handle(&hook("git push # EXC:GIT022", "GIT022")).bypassed);
    }

    // A new handler (same paths) sees the recorded usage.
    let handler = Handler::new(&config, clock.as_clock());
    let snapshot = handler.rate_limiter().usage_snapshot();
    assert_eq!(snapshot.global_hourly_count, 1);
    assert_eq!(snapshot.hourly_usage.get("GIT022"), Some(&1));
}
