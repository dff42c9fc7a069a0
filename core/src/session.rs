//! Poisoned-session tracking.
//!
//! Once a validator blocks a command, the dispatcher poisons the session:
//! subsequent commands in that session fast-fail without running any
//! validator until a single unpoison token acknowledges every outstanding
//! code. Sessions expire by inactivity so a stale poison can never block
//! future work: expiry is consulted on load and on every `is_poisoned` /
//! `record_command`, and expired entries are physically removed by
//! `cleanup_expired`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::PoisonError;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Clean,
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,

    pub status: SessionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poisoned_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub poison_codes: Vec<String>,

    #[serde(default)]
    pub poison_message: String,

    #[serde(default)]
    pub command_count: u64,

    pub last_activity: DateTime<Utc>,
}

impl SessionInfo {
    fn clean(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: SessionStatus::Clean,
            poisoned_at: None,
            poison_codes: Vec::new(),
            poison_message: String::new(),
            command_count: 0,
            last_activity: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    #[serde(default)]
    pub sessions: HashMap<String, SessionInfo>,

    #[serde(default = "unix_epoch")]
    pub last_updated: DateTime<Utc>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            last_updated: unix_epoch(),
        }
    }
}

pub struct SessionTracker {
    enabled: bool,
    max_session_age: TimeDelta,
    state_path: PathBuf,
    clock: Clock,
    state: RwLock<SessionState>,
}

impl SessionTracker {
    pub fn new(config: &SessionConfig, state_path: PathBuf, clock: Clock) -> Self {
        Self {
            enabled: config.enabled,
            max_session_age: TimeDelta::hours(config.max_session_age_hours),
            state_path,
            clock,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `session_id` is currently poisoned, with a deep copy of its
    /// info. An expired session reads as clean; removal happens elsewhere.
    pub fn is_poisoned(&self, session_id: &str) -> (bool, Option<SessionInfo>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(info) = state.sessions.get(session_id) else {
            return (false, None);
        };
        if self.expired(info) || info.status != SessionStatus::Poisoned {
            return (false, None);
        }
        (true, Some(info.clone()))
    }

    /// Mark `session_id` poisoned with the outstanding `codes`. Creates the
    /// entry if needed; `command_count` survives a poison transition.
    pub fn poison(&self, session_id: &str, codes: &[String], message: &str) {
        if session_id.is_empty() {
            return;
        }
        let now = (self.clock)();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let info = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionInfo::clean(session_id, now));
        info.status = SessionStatus::Poisoned;
        info.poisoned_at = Some(now);
        info.poison_codes = codes.to_vec();
        info.poison_message = message.to_string();
        info.last_activity = now;
        state.last_updated = now;
    }

    /// Clear the poison from `session_id`. Idempotent; unknown ids are
    /// ignored.
    pub fn unpoison(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let now = (self.clock)();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(info) = state.sessions.get_mut(session_id) else {
            return;
        };
        info.status = SessionStatus::Clean;
        info.poisoned_at = None;
        info.poison_codes = Vec::new();
        info.poison_message = String::new();
        info.last_activity = now;
        state.last_updated = now;
    }

    /// Count one command against `session_id`, creating the entry if
    /// missing. An entry that has already expired is reset (clean, zero
    /// count) before the increment, so an expired poisoned session never
    /// blocks new work.
    pub fn record_command(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let now = (self.clock)();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let expired = state
            .sessions
            .get(session_id)
            .is_some_and(|info| self.expired(info));
        let info = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionInfo::clean(session_id, now));
        if expired {
            *info = SessionInfo::clean(session_id, now);
        }
        info.command_count += 1;
        info.last_activity = now;
        state.last_updated = now;
    }

    /// Deep copy of the raw entry, expired or not.
    pub fn get_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .get(session_id)
            .cloned()
    }

    /// Deep copy of the whole tracked state.
    pub fn state_snapshot(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove one session outright.
    pub fn clear_session(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.sessions.remove(session_id);
        state.last_updated = (self.clock)();
    }

    /// Drop all tracked sessions.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = SessionState {
            sessions: HashMap::new(),
            last_updated: (self.clock)(),
        };
    }

    /// Physically remove expired sessions; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.sessions.len();
        let max_age = self.max_session_age;
        let now = (self.clock)();
        state
            .sessions
            .retain(|_, info| now - info.last_activity <= max_age);
        let removed = before - state.sessions.len();
        if removed > 0 {
            state.last_updated = now;
        }
        removed
    }

    /// Load persisted sessions, dropping expired entries. Missing file is
    /// empty state; a corrupt file is preserved as `<path>.bad`
    /// (best-effort) and treated as empty.
    pub fn load(&self) -> Result<()> {
        let mut loaded = match std::fs::read_to_string(&self.state_path) {
            Ok(contents) => match serde_json::from_str::<SessionState>(&contents) {
                Ok(state) => state,
                Err(e) => {
                    tracing::debug!(
                        "invalid session state in {}: {e}; starting fresh",
                        self.state_path.display()
                    );
                    self.preserve_bad_state_file();
                    SessionState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionState::default(),
            Err(e) => return Err(e.into()),
        };

        let now = (self.clock)();
        let max_age = self.max_session_age;
        loaded
            .sessions
            .retain(|_, info| now - info.last_activity <= max_age);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = loaded;
        Ok(())
    }

    /// Persist the tracked state. The snapshot is taken under the read
    /// lock; marshaling and file I/O happen outside it.
    pub fn save(&self) -> Result<()> {
        let snapshot = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        fsutil::atomic_write(&self.state_path, &json)
    }

    fn expired(&self, info: &SessionInfo) -> bool {
        (self.clock)() - info.last_activity > self.max_session_age
    }

    fn preserve_bad_state_file(&self) {
        let mut os = self.state_path.as_os_str().to_os_string();
        os.push(".bad");
        if let Err(e) = std::fs::rename(&self.state_path, PathBuf::from(os)) {
            tracing::debug!("could not preserve bad state file: {e}");
        }
    }
}
