//! Configuration tree for the exception and session subsystems.
//!
//! Everything here is plain serde data deserialized from
//! `$KLACK_HOME/config.toml` (default `~/.klack/config.toml`). Every field
//! has a default so that a missing file, a missing table, or a missing key
//! all behave identically: the documented default applies. Unknown keys are
//! ignored.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::KlackErr;
use crate::error::Result;

pub const CONFIG_TOML_FILE: &str = "config.toml";

/// Environment variable that overrides the state directory.
pub const KLACK_HOME_ENV_VAR: &str = "KLACK_HOME";

pub const DEFAULT_EXCEPTION_PREFIX: &str = "EXC";
pub const DEFAULT_UNPOISON_PREFIX: &str = "SESS";
pub const DEFAULT_TOKEN_ENV_VAR: &str = "KLACK";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub exceptions: ExceptionsConfig,

    #[serde(default)]
    pub sessions: SessionConfig,
}

/// Settings for the per-invocation exception-token subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Token prefix looked for in commands, e.g. `EXC` in `EXC:GIT022`.
    #[serde(default = "default_exception_prefix")]
    pub token_prefix: String,

    /// Name of the environment-variable assignment that may carry a token,
    /// e.g. `KLACK="EXC:GIT022" git push`.
    #[serde(default = "default_token_env_var")]
    pub env_var: String,

    /// Per-error-code policies. Codes without an entry get the defaults.
    #[serde(default)]
    pub policies: HashMap<String, ExceptionPolicyConfig>,

    #[serde(default)]
    pub rate_limit: ExceptionRateLimitConfig,

    #[serde(default)]
    pub audit: ExceptionAuditConfig,
}

impl Default for ExceptionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_prefix: default_exception_prefix(),
            env_var: default_token_env_var(),
            policies: HashMap::new(),
            rate_limit: ExceptionRateLimitConfig::default(),
            audit: ExceptionAuditConfig::default(),
        }
    }
}

/// Per-error-code exception policy. A zero limit means "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionPolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub allow_exception: bool,

    #[serde(default)]
    pub require_reason: bool,

    #[serde(default)]
    pub min_reason_length: usize,

    /// When non-empty, the (case-folded, trimmed) reason must equal or be
    /// prefixed by one of these entries.
    #[serde(default)]
    pub valid_reasons: Vec<String>,

    #[serde(default)]
    pub max_per_hour: u32,

    #[serde(default)]
    pub max_per_day: u32,
}

impl Default for ExceptionPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_exception: true,
            require_reason: false,
            min_reason_length: 0,
            valid_reasons: Vec::new(),
            max_per_hour: 0,
            max_per_day: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionRateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Global cap across all error codes per UTC hour. Zero means unlimited.
    #[serde(default = "default_global_max_per_hour")]
    pub max_per_hour: u32,

    /// Global cap across all error codes per UTC day. Zero means unlimited.
    #[serde(default = "default_global_max_per_day")]
    pub max_per_day: u32,

    #[serde(default = "default_rate_limit_state_file")]
    pub state_file: String,
}

impl Default for ExceptionRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_hour: default_global_max_per_hour(),
            max_per_day: default_global_max_per_day(),
            state_file: default_rate_limit_state_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionAuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_exception_log_file")]
    pub log_file: String,

    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for ExceptionAuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: default_exception_log_file(),
            max_size_mb: default_max_size_mb(),
            max_age_days: default_max_age_days(),
            max_backups: default_max_backups(),
        }
    }
}

/// Settings for the poisoned-session tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix of the unpoison token, e.g. `SESS` in `SESS:GIT001,SEC001`.
    #[serde(default = "default_unpoison_prefix")]
    pub token_prefix: String,

    #[serde(default = "default_session_state_file")]
    pub state_file: String,

    /// Sessions idle for longer than this many hours are expired.
    #[serde(default = "default_max_session_age_hours")]
    pub max_session_age_hours: i64,

    #[serde(default)]
    pub audit: SessionAuditConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_prefix: default_unpoison_prefix(),
            state_file: default_session_state_file(),
            max_session_age_hours: default_max_session_age_hours(),
            audit: SessionAuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionAuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_session_log_file")]
    pub log_file: String,

    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for SessionAuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: default_session_log_file(),
            max_size_mb: default_max_size_mb(),
            max_age_days: default_max_age_days(),
            max_backups: default_max_backups(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_exception_prefix() -> String {
    DEFAULT_EXCEPTION_PREFIX.to_string()
}

fn default_unpoison_prefix() -> String {
    DEFAULT_UNPOISON_PREFIX.to_string()
}

fn default_token_env_var() -> String {
    DEFAULT_TOKEN_ENV_VAR.to_string()
}

fn default_global_max_per_hour() -> u32 {
    10
}

fn default_global_max_per_day() -> u32 {
    50
}

fn default_rate_limit_state_file() -> String {
    "~/.klack/exception-rate-limit.json".to_string()
}

fn default_session_state_file() -> String {
    "~/.klack/sessions.json".to_string()
}

fn default_exception_log_file() -> String {
    "~/.klack/exceptions.jsonl".to_string()
}

fn default_session_log_file() -> String {
    "~/.klack/sessions-audit.jsonl".to_string()
}

fn default_max_size_mb() -> u64 {
    10
}

fn default_max_age_days() -> u32 {
    90
}

fn default_max_backups() -> usize {
    5
}

fn default_max_session_age_hours() -> i64 {
    24
}

impl Config {
    /// Load `config.toml` from `klack_home`. A missing file yields the
    /// defaults; a file that fails to deserialize is an error (a typo in the
    /// config should not silently disable the gatekeeper).
    pub fn load(klack_home: &Path) -> Result<Self> {
        let path = klack_home.join(CONFIG_TOML_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents)
            .map_err(|e| KlackErr::InvalidConfig(format!("{}: {e}", path.display())))
    }
}

/// Resolve the directory that stores klack state: `$KLACK_HOME` when set and
/// non-empty, otherwise `~/.klack`.
pub fn find_klack_home() -> Result<PathBuf> {
    match std::env::var(KLACK_HOME_ENV_VAR) {
        Ok(val) if !val.is_empty() => Ok(PathBuf::from(val)),
        _ => {
            let mut home = dirs::home_dir().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "could not determine home directory",
                )
            })?;
            home.push(".klack");
            Ok(home)
        }
    }
}

/// Expand a leading `~/` (or a bare `~`) to the user's home directory.
/// Anything else is used verbatim.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
