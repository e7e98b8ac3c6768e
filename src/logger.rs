//! Encrypted, capped, append-only event log.
//!
//! Shares the vault's content key and AEAD envelope (§4.3); masking rules
//! are grounded on `envvault`'s use of the `regex` crate for log sanitation.

use crate::config::KernelConfig;
use crate::crypto::{self, CryptoError, KEY_LEN};
use crate::fsutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

/// Maximum number of entries retained; the head is dropped once exceeded.
pub const MAX_LOG_ENTRIES: usize = 1000;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LoggerError {
    fn from(e: std::io::Error) -> Self {
        LoggerError::Io(e.to_string())
    }
}

/// Category of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    App,
    Access,
    Lock,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub message: String,
}

/// Totals returned by `getLogStats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogStats {
    pub total: usize,
    pub app: usize,
    pub access: usize,
    pub lock: usize,
    pub info: usize,
}

fn masking_patterns() -> &'static [(regex::Regex, MaskRule)] {
    static PATTERNS: OnceLock<Vec<(regex::Regex, MaskRule)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (regex::Regex::new(r"sk-[A-Za-z0-9]{20,}").unwrap(), MaskRule::KeepPrefix(6)),
            (regex::Regex::new(r"[A-Za-z0-9]{32,}").unwrap(), MaskRule::KeepPrefix(4)),
            (
                regex::Regex::new(r"(?i)(password\s*[:=]\s*)(\S+)").unwrap(),
                MaskRule::ReplaceCapture,
            ),
            (
                regex::Regex::new(r"(?i)(token\s*[:=]\s*)(\S+)").unwrap(),
                MaskRule::ReplaceCapture,
            ),
        ]
    })
}

enum MaskRule {
    KeepPrefix(usize),
    ReplaceCapture,
}

/// Applies the masking rules in order to `message` (§4.3).
pub fn mask_message(message: &str) -> String {
    let mut out = message.to_string();
    for (pattern, rule) in masking_patterns() {
        out = match rule {
            MaskRule::KeepPrefix(keep) => pattern
                .replace_all(&out, |caps: &regex::Captures| crypto::mask_sensitive_value(&caps[0], *keep))
                .into_owned(),
            MaskRule::ReplaceCapture => pattern
                .replace_all(&out, |caps: &regex::Captures| format!("{}***", &caps[1]))
                .into_owned(),
        };
    }
    out
}

struct LoggerState {
    key: Option<[u8; KEY_LEN]>,
    entries: Vec<LogEntry>,
}

/// The encrypted event log. Cheap to clone: state is `Arc`-shared.
#[derive(Clone)]
pub struct Logger {
    config: KernelConfig,
    state: Arc<Mutex<LoggerState>>,
}

impl Logger {
    pub fn new(config: KernelConfig) -> Self {
        Self { config, state: Arc::new(Mutex::new(LoggerState { key: None, entries: Vec::new() })) }
    }

    /// Loads the persisted log (if any) and starts accepting writes under `key`.
    pub fn set_encryption_key(&self, key: [u8; KEY_LEN]) {
        let entries = self.load(&key).unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.key = Some(key);
        state.entries = entries;
    }

    /// Drops the key; subsequent writes are dropped with a warning, reads
    /// return empty (§4.3). Does not clear already-loaded entries from
    /// memory by itself — callers wipe via `VaultStore::lock`.
    pub fn clear_encryption_key(&self) {
        let mut state = self.state.lock().unwrap();
        use zeroize::Zeroize;
        if let Some(key) = state.key.as_mut() {
            key.zeroize();
        }
        state.key = None;
        state.entries.clear();
    }

    fn load(&self, key: &[u8; KEY_LEN]) -> Option<Vec<LogEntry>> {
        let bytes = std::fs::read(self.config.logs_path()).ok()?;
        crypto::decrypt_json(&bytes, key).ok()
    }

    fn persist(&self, state: &LoggerState) -> Result<(), LoggerError> {
        let Some(key) = state.key else { return Ok(()) };
        let bytes = crypto::encrypt_json(&state.entries, &key)?;
        fsutil::write_restricted(&self.config.logs_path(), &bytes)?;
        Ok(())
    }

    /// Masks `message`, appends it, truncates to [`MAX_LOG_ENTRIES`], and
    /// persists. Silently drops the write (to stderr only) when no key is set.
    pub fn log(&self, message: &str, category: LogCategory) {
        let masked = mask_message(message);
        let mut state = self.state.lock().unwrap();
        if state.key.is_none() {
            eprintln!("logger: dropping entry, no encryption key set");
            return;
        }
        state.entries.push(LogEntry { timestamp: Utc::now(), category, message: masked });
        if state.entries.len() > MAX_LOG_ENTRIES {
            let overflow = state.entries.len() - MAX_LOG_ENTRIES;
            state.entries.drain(0..overflow);
        }
        if let Err(e) = self.persist(&state) {
            eprintln!("logger: failed to persist: {e}");
        }
    }

    pub fn log_access(&self, action: &str, project: &str, keys: &[String]) {
        self.log(&format!("{action} {project}: {}", keys.join(", ")), LogCategory::Access);
    }

    pub fn log_app(&self, event: &str) {
        self.log(event, LogCategory::App);
    }

    pub fn log_lock(&self, event: &str) {
        self.log(event, LogCategory::Lock);
    }

    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    /// Most-recent-first, optionally filtered by category, capped at `limit`.
    pub fn get_filtered_logs(&self, category: Option<LogCategory>, limit: usize) -> Vec<LogEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .rev()
            .filter(|e| category.map(|c| c == e.category).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_log_stats(&self) -> LogStats {
        let state = self.state.lock().unwrap();
        let mut stats = LogStats { total: 0, app: 0, access: 0, lock: 0, info: 0 };
        for entry in &state.entries {
            stats.total += 1;
            match entry.category {
                LogCategory::App => stats.app += 1,
                LogCategory::Access => stats.access += 1,
                LogCategory::Lock => stats.lock += 1,
                LogCategory::Info => stats.info += 1,
            }
        }
        stats
    }

    pub fn clear_logs(&self) -> Result<(), LoggerError> {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        let _ = std::fs::remove_file(self.config.logs_path());
        Ok(())
    }

    /// Splits entries by age: those older than `days_to_keep` move to a
    /// dated sibling file, the rest stay in the main log.
    pub fn archive_logs(&self, days_to_keep: i64, epoch_ms: i64) -> Result<(), LoggerError> {
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep);
        let mut state = self.state.lock().unwrap();
        let Some(key) = state.key else { return Ok(()) };

        let (keep, archive): (Vec<LogEntry>, Vec<LogEntry>) =
            state.entries.drain(..).partition(|e| e.timestamp >= cutoff);

        if !archive.is_empty() {
            let bytes = crypto::encrypt_json(&archive, &key)?;
            fsutil::write_restricted(&self.config.logs_archive_path(epoch_ms), &bytes)?;
        }
        state.entries = keep;
        self.persist(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn logger() -> (Logger, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = KernelConfig::new(dir.path().to_path_buf());
        (Logger::new(config), dir)
    }

    #[test]
    fn masks_api_key_prefix() {
        let masked = mask_message("leaked sk-abcdefghijklmnopqrstuvwxyz");
        assert!(masked.contains("sk-abc"));
        assert!(masked.contains("*"));
        assert!(!masked.contains("opqrstuvwxyz"));
    }

    #[test]
    fn masks_password_assignment() {
        let masked = mask_message("password=hunter2value");
        assert!(masked.contains("password=***"));
        assert!(!masked.contains("hunter2value"));
    }

    #[test]
    fn write_without_key_is_dropped() {
        let (logger, _dir) = logger();
        logger.log("no key yet", LogCategory::App);
        assert!(logger.get_logs().is_empty());
    }

    #[test]
    fn log_truncates_to_max_entries() {
        let (logger, _dir) = logger();
        logger.set_encryption_key([7u8; KEY_LEN]);
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            logger.log(&format!("event {i}"), LogCategory::Info);
        }
        assert_eq!(logger.get_logs().len(), MAX_LOG_ENTRIES);
    }

    #[test]
    fn filtered_logs_are_most_recent_first() {
        let (logger, _dir) = logger();
        logger.set_encryption_key([1u8; KEY_LEN]);
        logger.log_app("first");
        logger.log_access("read", "app", &["K".to_string()]);
        let filtered = logger.get_filtered_logs(None, 10);
        assert_eq!(filtered[0].message, "read app: K");
    }

    #[test]
    fn clear_removes_file() {
        let (logger, _dir) = logger();
        logger.set_encryption_key([2u8; KEY_LEN]);
        logger.log_app("hello");
        logger.clear_logs().unwrap();
        assert!(logger.get_logs().is_empty());
        assert!(!logger.config.logs_path().exists());
    }
}
