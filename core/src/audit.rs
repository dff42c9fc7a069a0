//! Append-only JSONL audit journals.
//!
//! Two independent instances run on the same machinery: one records
//! exception decisions, the other poison/unpoison transitions. Each journal
//! is **one JSON object per line** so it can be tailed and filtered with
//! standard JSON-Lines tooling. Writers are serialized by an in-process
//! mutex held across the stat + rotate + append sequence, so rotation and
//! append are linearizable and readers observe entries in write order.
//!
//! Rotation renames the live file to `<base>.YYYYMMDD-HHMMSS<ext>` once it
//! crosses the size cap; backups beyond `max_backups` are pruned, newest
//! first. Age-based cleanup drops entries older than the retention cutoff
//! but deliberately keeps malformed lines: losing data is worse than
//! keeping a stale unparsable line.

use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::clock::Clock;
use crate::error::KlackErr;
use crate::error::Result;
use crate::fsutil;

/// Entries must expose their timestamp for age-based cleanup.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Journal settings, shared by both instances.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub enabled: bool,
    pub log_file: PathBuf,
    pub max_size_mb: u64,
    pub max_age_days: u32,
    pub max_backups: usize,
}

/// Size and entry statistics for one journal.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalStats {
    pub log_file: PathBuf,
    pub size_bytes: u64,
    /// Formatted as e.g. `"1.25 MB"`.
    pub size_mb: String,
    pub entry_count: usize,
    pub backup_count: usize,
    pub mod_time: Option<DateTime<Utc>>,
}

pub struct AuditJournal<T> {
    config: JournalConfig,
    clock: Clock,
    lock: Mutex<()>,
    _entry: PhantomData<fn(T)>,
}

impl<T> AuditJournal<T>
where
    T: Serialize + DeserializeOwned + Timestamped,
{
    pub fn new(config: JournalConfig, clock: Clock) -> Self {
        Self {
            config,
            clock,
            lock: Mutex::new(()),
            _entry: PhantomData,
        }
    }

    /// Append one entry. A disabled journal reports success without
    /// touching the filesystem. A rotation failure is logged and does not
    /// block the append; a failed append surfaces as `WriteFailed`.
    pub fn log(&self, entry: &T) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = self.rotate_if_needed_locked() {
            tracing::warn!(
                "audit rotation failed for {}: {e}",
                self.config.log_file.display()
            );
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        fsutil::ensure_parent_dir(&self.config.log_file)
            .and_then(|()| {
                let mut file = fsutil::open_append(&self.config.log_file)?;
                file.write_all(line.as_bytes())
            })
            .map_err(|e| {
                KlackErr::WriteFailed(format!(
                    "append to {}: {e}",
                    self.config.log_file.display()
                ))
            })
    }

    /// Read every parseable entry from the live file. Malformed lines are
    /// debug-logged and skipped; a missing file is an empty journal.
    pub fn read(&self) -> Result<Vec<T>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_file_locked(&self.config.log_file)
    }

    /// Read one rotated backup (used by stats consumers and tests).
    pub fn read_backup(&self, backup: &Path) -> Result<Vec<T>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_file_locked(backup)
    }

    fn read_file_locked(&self, path: &Path) -> Result<Vec<T>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::debug!("skipping malformed audit line: {e}"),
            }
        }
        Ok(entries)
    }

    /// Drop entries older than the retention cutoff, keeping malformed
    /// lines. The trimmed file replaces the original atomically. Returns
    /// how many entries were dropped.
    pub fn cleanup(&self) -> Result<usize> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let contents = match std::fs::read_to_string(&self.config.log_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let cutoff = (self.clock)() - TimeDelta::days(i64::from(self.config.max_age_days));
        let mut kept = String::with_capacity(contents.len());
        let mut removed = 0usize;

        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(trimmed) {
                Ok(entry) if entry.timestamp() <= cutoff => removed += 1,
                // Parseable and fresh, or malformed: keep the line as-is.
                _ => {
                    kept.push_str(trimmed);
                    kept.push('\n');
                }
            }
        }

        fsutil::atomic_write(&self.config.log_file, kept.as_bytes())?;
        Ok(removed)
    }

    pub fn stats(&self) -> Result<JournalStats> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (size_bytes, mod_time) = match std::fs::metadata(&self.config.log_file) {
            Ok(meta) => {
                let mod_time = meta
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from);
                (meta.len(), mod_time)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, None),
            Err(e) => return Err(e.into()),
        };

        let entry_count = self.read_file_locked(&self.config.log_file)?.len();
        let backup_count = self.list_backups_locked()?.len();

        Ok(JournalStats {
            log_file: self.config.log_file.clone(),
            size_bytes,
            size_mb: format!("{:.2} MB", size_bytes as f64 / (1024.0 * 1024.0)),
            entry_count,
            backup_count,
            mod_time,
        })
    }

    /// Rotated backups of this journal, newest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.list_backups_locked()
    }

    fn rotate_if_needed_locked(&self) -> Result<()> {
        let meta = match std::fs::metadata(&self.config.log_file) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if self.config.max_size_mb == 0 || meta.len() < self.config.max_size_mb * 1024 * 1024 {
            return Ok(());
        }

        let stamp = (self.clock)().format("%Y%m%d-%H%M%S");
        let (stem, ext) = split_name(&self.config.log_file);
        let backup = self
            .config
            .log_file
            .with_file_name(format!("{stem}.{stamp}{ext}"));
        std::fs::rename(&self.config.log_file, &backup)?;

        self.prune_backups_locked()
    }

    fn prune_backups_locked(&self) -> Result<()> {
        let backups = self.list_backups_locked()?;
        for stale in backups.iter().skip(self.config.max_backups) {
            if let Err(e) = std::fs::remove_file(stale) {
                tracing::warn!("could not remove old backup {}: {e}", stale.display());
            }
        }
        Ok(())
    }

    fn list_backups_locked(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = self.config.log_file.parent() else {
            return Ok(Vec::new());
        };
        let (stem, ext) = split_name(&self.config.log_file);
        let prefix = format!("{stem}.");

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(middle) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&ext))
            else {
                continue;
            };
            if is_backup_timestamp(middle) {
                backups.push(entry.path());
            }
        }

        // Timestamps sort lexicographically; newest first.
        backups.sort();
        backups.reverse();
        Ok(backups)
    }
}

/// Split `exceptions.jsonl` into `("exceptions", ".jsonl")`. A file with no
/// extension yields an empty extension.
fn split_name(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.to_string(), String::new()),
    }
}

/// Exactly `NNNNNNNN-NNNNNN`: a 15-character timestamp with `-` at
/// position 8.
fn is_backup_timestamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'-'
        && bytes[..8].iter().all(|b| b.is_ascii_digit())
        && bytes[9..].iter().all(|b| b.is_ascii_digit())
}
