//! Session gate: the dispatcher-facing workflow around the session tracker.
//!
//! Runs before any validator: a clean session just has its command counted;
//! a poisoned one fast-fails unless the incoming command carries an
//! unpoison token acknowledging every outstanding code. Both poison and
//! unpoison transitions land in the session audit journal.

use crate::audit::AuditJournal;
use crate::audit::JournalConfig;
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::config::expand_tilde;
use crate::parse_unpoison::UnpoisonParser;
use crate::protocol::HookContext;
use crate::protocol::SessionAction;
use crate::protocol::SessionAuditEntry;
use crate::protocol::SessionCheck;
use crate::protocol::truncate_command;
use crate::session::SessionTracker;

pub struct SessionGate {
    tracker: SessionTracker,
    parser: UnpoisonParser,
    journal: AuditJournal<SessionAuditEntry>,
    clock: Clock,
}

impl SessionGate {
    /// Wire up the session subsystem from configuration. `env_var` is the
    /// same assignment name the exception parser uses (default `KLACK`).
    /// Persisted session state is loaded eagerly; a load failure is logged
    /// and the tracker starts empty.
    pub fn new(config: &SessionConfig, env_var: &str, clock: Clock) -> Self {
        let tracker = SessionTracker::new(
            config,
            expand_tilde(&config.state_file),
            clock.clone(),
        );
        if let Err(e) = tracker.load() {
            tracing::warn!("could not load session state: {e}");
        }

        let journal = AuditJournal::new(
            JournalConfig {
                enabled: config.audit.enabled,
                log_file: expand_tilde(&config.audit.log_file),
                max_size_mb: config.audit.max_size_mb,
                max_age_days: config.audit.max_age_days,
                max_backups: config.audit.max_backups,
            },
            clock.clone(),
        );

        Self {
            tracker,
            parser: UnpoisonParser::from_config(config, env_var),
            journal,
            clock,
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn journal(&self) -> &AuditJournal<SessionAuditEntry> {
        &self.journal
    }

    /// Gate one incoming command. Clean sessions are counted and pass;
    /// poisoned sessions either stay blocked (reporting the codes still
    /// unacknowledged) or are cleared when the command acknowledges every
    /// outstanding code in a single token.
    pub fn check(&self, hook: &HookContext) -> SessionCheck {
        if !self.tracker.is_enabled() || hook.session_id.is_empty() {
            return SessionCheck::Clean;
        }

        let (poisoned, info) = self.tracker.is_poisoned(&hook.session_id);
        let Some(info) = info.filter(|_| poisoned) else {
            self.tracker.record_command(&hook.session_id);
            self.save_tracker();
            return SessionCheck::Clean;
        };

        let ack = self
            .parser
            .check_acknowledgment(&hook.command, &info.poison_codes);
        if !ack.acknowledged {
            return SessionCheck::Blocked {
                message: format!(
                    "session is blocked; unacknowledged codes: {}",
                    ack.unacknowledged.join(", ")
                ),
                poison_codes: info.poison_codes,
                unacknowledged: ack.unacknowledged,
            };
        }

        self.tracker.unpoison(&hook.session_id);
        self.save_tracker();
        self.log_entry(&SessionAuditEntry {
            timestamp: (self.clock)(),
            action: SessionAction::Unpoison,
            session_id: hook.session_id.clone(),
            poison_codes: info.poison_codes.clone(),
            source: Some(ack.source),
            command: Some(truncate_command(&hook.command)),
            poison_message: None,
            working_dir: (!hook.working_dir.is_empty()).then(|| hook.working_dir.clone()),
        });

        SessionCheck::Unpoisoned {
            codes: info.poison_codes,
        }
    }

    /// Poison the session after a validator block, and audit the
    /// transition.
    pub fn poison(&self, hook: &HookContext, codes: &[String], message: &str) {
        if hook.session_id.is_empty() {
            return;
        }
        self.tracker.poison(&hook.session_id, codes, message);
        self.save_tracker();
        self.log_entry(&SessionAuditEntry {
            timestamp: (self.clock)(),
            action: SessionAction::Poison,
            session_id: hook.session_id.clone(),
            poison_codes: codes.to_vec(),
            source: None,
            command: (!hook.command.is_empty()).then(|| truncate_command(&hook.command)),
            poison_message: (!message.is_empty()).then(|| message.to_string()),
            working_dir: (!hook.working_dir.is_empty()).then(|| hook.working_dir.clone()),
        });
    }

    fn save_tracker(&self) {
        if let Err(e) = self.tracker.save() {
            tracing::warn!("could not persist session state: {e}");
        }
    }

    fn log_entry(&self, entry: &SessionAuditEntry) {
        if let Err(e) = self.journal.log(entry) {
            tracing::warn!("could not write session audit entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::token::TokenSource;

    fn clock() -> ManualClock {
        ManualClock::new(
            chrono::DateTime::parse_from_rfc3339("2025-06-01T10:30:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        )
    }

    fn gate(dir: &tempfile::TempDir, clock: &ManualClock) -> SessionGate {
        let config = SessionConfig {
            state_file: dir
                .path()
                .join("sessions.json")
                .to_string_lossy()
                .into_owned(),
            audit: crate::config::SessionAuditConfig {
                log_file: dir
                    .path()
                    .join("sessions-audit.jsonl")
                    .to_string_lossy()
                    .into_owned(),
                ..crate::config::SessionAuditConfig::default()
            },
            ..SessionConfig::default()
        };
        SessionGate::new(&config, "KLACK", clock.as_clock())
    }

    fn hook(session_id: &str, command: &str) -> HookContext {
        HookContext {
            command: command.to_string(),
            working_dir: "/repo".to_string(),
            session_id: session_id.to_string(),
            validator_name: String::new(),
            error_code: String::new(),
            repository: String::new(),
        }
    }

    fn codes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn clean_session_passes_and_counts() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = clock();
        let gate = gate(&dir, &clock);

        assert_eq!(gate.check(&hook("sess-1", "git status")), SessionCheck::Clean);
        assert_eq!(gate.check(&hook("sess-1", "git diff")), SessionCheck::Clean);
        assert_eq!(
            gate.tracker().get_info("sess-1").unwrap().command_count,
            2
        );
    }

    #[test]
    fn partial_acknowledgment_stays_blocked() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = clock();
        let gate = gate(&dir, &clock);

        gate.poison(
            &hook("sess-1", "git push"),
            &codes(&["GIT001", "SEC001"]),
            "blocked by validators",
        );

        let check = gate.check(&hook("sess-1", "git status # SESS:GIT001"));
        match check {
            SessionCheck::Blocked {
                poison_codes,
                unacknowledged,
                message,
            } => {
                assert_eq!(poison_codes, codes(&["GIT001", "SEC001"]));
                assert_eq!(unacknowledged, codes(&["SEC001"]));
                assert!(message.contains("SEC001"));
            }
            other => panic!("expected Blocked, got {other:?}"),
        }

        let (still_poisoned, _) = gate.tracker().is_poisoned("sess-1");
        assert!(still_poisoned);
    }

    #[test]
    fn full_acknowledgment_unpoisons_and_audits() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = clock();
        let gate = gate(&dir, &clock);

        gate.poison(
            &hook("sess-1", "git push"),
            &codes(&["GIT001", "SEC001"]),
            "blocked by validators",
        );

        let check = gate.check(&hook("sess-1", "git status # SESS:GIT001,SEC001"));
        assert_eq!(
            check,
            SessionCheck::Unpoisoned {
                codes: codes(&["GIT001", "SEC001"]),
            }
        );

        let (poisoned, _) = gate.tracker().is_poisoned("sess-1");
        assert!(!poisoned);

        let entries = gate.journal().read().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, SessionAction::Poison);
        assert_eq!(
            entries[0].poison_message.as_deref(),
            Some("blocked by validators")
        );
        assert_eq!(entries[1].action, SessionAction::Unpoison);
        assert_eq!(entries[1].poison_codes, codes(&["GIT001", "SEC001"]));
        assert_eq!(entries[1].source, Some(TokenSource::Comment));
        assert_eq!(
            entries[1].command.as_deref(),
            Some("git status # SESS:GIT001,SEC001")
        );
    }

    #[test]
    fn missing_session_id_is_clean() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = clock();
        let gate = gate(&dir, &clock);
        assert_eq!(gate.check(&hook("", "git status")), SessionCheck::Clean);
    }

    #[test]
    fn poison_state_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = clock();
        {
            let gate = gate(&dir, &clock);
            gate.poison(&hook("sess-1", "git push"), &codes(&["GIT001"]), "blocked");
        }

        let reborn = gate(&dir, &clock);
        let (poisoned, info) = reborn.tracker().is_poisoned("sess-1");
        assert!(poisoned);
        assert_eq!(info.unwrap().poison_codes, codes(&["GIT001"]));
    }
}
