//! The password-derived encrypted vault: projects, secrets, history, favorites.
//!
//! Mutations are serialized behind one mutex; a background thread debounces
//! saves 1s after the last mutation, polling a shared deadline the same way
//! the CLI's idle-lock timer does in `lifecycle.rs`.

use crate::config::KernelConfig;
use crate::crypto::{self, CryptoError, KEY_LEN, SALT_LEN};
use crate::fsutil;
use crate::models::{
    HistoryEntryView, Project, ProjectSummary, Secret, SecretHistoryView, SecretSlot, SecretView,
    Statistics, VaultDocument,
};
use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Save debounce window: a mutation schedules a save this far in the future,
/// and successive mutations push the deadline back out (§4.2 Auto-save).
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);
/// Secrets expiring within this window count toward `expiringSecrets`.
const EXPIRY_WARNING_WINDOW: chrono::Duration = chrono::Duration::days(7);

/// Errors produced by vault-lifecycle and entity operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is not initialized")]
    NotInitialized,
    #[error("vault already exists")]
    AlreadyExists,
    #[error("vault is locked")]
    Locked,
    #[error("invalid password")]
    InvalidPassword,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("index out of range")]
    OutOfRange,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        VaultError::Io(e.to_string())
    }
}

/// In-memory state held only while unlocked.
struct Unlocked {
    key: [u8; KEY_LEN],
    document: VaultDocument,
}

struct VaultInner {
    unlocked: Option<Unlocked>,
}

/// The vault store. Cheap to clone: internal state is `Arc`-shared, and
/// cloning keeps the same debounce-save thread.
#[derive(Clone)]
pub struct VaultStore {
    config: KernelConfig,
    inner: Arc<Mutex<VaultInner>>,
    save_deadline: Arc<Mutex<Option<Instant>>>,
    stop: Arc<AtomicBool>,
}

impl VaultStore {
    pub fn new(config: KernelConfig) -> Self {
        let store = Self {
            config,
            inner: Arc::new(Mutex::new(VaultInner { unlocked: None })),
            save_deadline: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
        };
        store.spawn_debounce_thread();
        store
    }

    fn spawn_debounce_thread(&self) {
        let inner = self.inner.clone();
        let deadline = self.save_deadline.clone();
        let stop = self.stop.clone();
        let config = self.config.clone();
        thread::spawn(move || loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(crate::config::LIFECYCLE_POLL_MS));
            let due = {
                let guard = deadline.lock().unwrap();
                matches!(*guard, Some(at) if Instant::now() >= at)
            };
            if due {
                let mut inner_guard = inner.lock().unwrap();
                let _ = persist(&config, &mut inner_guard);
                *deadline.lock().unwrap() = None;
            }
        });
    }

    /// Stops the debounce thread. Does not flush a pending save; callers
    /// should `saveNow`/`lock(sync=true)` first.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn schedule_save(&self) {
        *self.save_deadline.lock().unwrap() = Some(Instant::now() + SAVE_DEBOUNCE);
    }

    /// The content key, shared with the logger for its own encrypted
    /// envelope (§5 "the Logger receives no pointer that survives lock").
    pub fn encryption_key(&self) -> Option<[u8; KEY_LEN]> {
        self.inner.lock().unwrap().unlocked.as_ref().map(|u| u.key)
    }

    pub fn is_unlocked(&self) -> bool {
        self.inner.lock().unwrap().unlocked.is_some()
    }

    pub fn exists(&self) -> bool {
        self.config.salt_path().exists() && self.config.vault_path().exists()
    }

    pub fn setup(&self, password: &str) -> Result<(), VaultError> {
        if self.exists() {
            return Err(VaultError::AlreadyExists);
        }
        fsutil::ensure_dir(&self.config.vault_dir)?;

        let salt = crypto::generate_salt();
        let key = crypto::derive_key(password, &salt)?;
        let now = Utc::now();
        let document = VaultDocument::new(now);

        let mut guard = self.inner.lock().unwrap();
        guard.unlocked = Some(Unlocked { key, document });
        persist_salt(&self.config, &salt)?;
        persist(&self.config, &mut guard)?;
        Ok(())
    }

    pub fn unlock(&self, password: &str) -> Result<(), VaultError> {
        if !self.exists() {
            return Err(VaultError::NotInitialized);
        }
        let salt_hex = std::fs::read_to_string(self.config.salt_path())?;
        let salt_bytes = hex::decode(salt_hex.trim()).map_err(|_| VaultError::InvalidPassword)?;
        if salt_bytes.len() != SALT_LEN {
            return Err(VaultError::InvalidPassword);
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&salt_bytes);

        let mut key = crypto::derive_key(password, &salt)?;
        let bytes = std::fs::read(self.config.vault_path())?;
        let decrypted: Result<VaultDocument, CryptoError> = crypto::decrypt_json(&bytes, &key);

        let mut document = match decrypted {
            Ok(d) => d,
            Err(_) => {
                use zeroize::Zeroize;
                key.zeroize();
                return Err(VaultError::InvalidPassword);
            }
        };
        document.normalize();

        let mut guard = self.inner.lock().unwrap();
        guard.unlocked = Some(Unlocked { key, document });
        drop(guard);

        fsutil::restrict(&self.config.salt_path())?;
        fsutil::restrict(&self.config.vault_path())?;
        Ok(())
    }

    /// Locks the vault. If `sync`, the pending save is flushed synchronously
    /// before wiping in-memory state; otherwise any already-scheduled save
    /// is simply dropped along with the document.
    pub fn lock(&self, sync: bool) -> Result<(), VaultError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.unlocked.is_none() {
            return Ok(());
        }
        if sync {
            persist(&self.config, &mut guard)?;
        }
        *self.save_deadline.lock().unwrap() = None;
        if let Some(unlocked) = guard.unlocked.as_mut() {
            use zeroize::Zeroize;
            unlocked.key.zeroize();
        }
        guard.unlocked = None;
        Ok(())
    }

    pub fn save_now(&self) -> Result<(), VaultError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.unlocked.is_none() {
            return Err(VaultError::Locked);
        }
        persist(&self.config, &mut guard)?;
        *self.save_deadline.lock().unwrap() = None;
        Ok(())
    }

    fn with_document<R>(
        &self,
        f: impl FnOnce(&mut VaultDocument) -> Result<R, VaultError>,
    ) -> Result<R, VaultError> {
        let mut guard = self.inner.lock().unwrap();
        let unlocked = guard.unlocked.as_mut().ok_or(VaultError::Locked)?;
        f(&mut unlocked.document)
    }

    fn with_document_mut<R>(
        &self,
        f: impl FnOnce(&mut VaultDocument) -> Result<R, VaultError>,
    ) -> Result<R, VaultError> {
        let result = self.with_document(f)?;
        self.schedule_save();
        Ok(result)
    }

    pub fn get_projects(&self) -> Result<Vec<ProjectSummary>, VaultError> {
        self.with_document(|doc| {
            Ok(doc
                .projects
                .values()
                .map(|p| ProjectSummary {
                    name: p.name.clone(),
                    secret_count: p.secrets.len(),
                    created_at: p.created_at,
                    updated_at: p.updated_at,
                })
                .collect())
        })
    }

    pub fn create_project(&self, name: &str) -> Result<(), VaultError> {
        self.with_document_mut(|doc| {
            if doc.projects.contains_key(name) {
                return Err(VaultError::Conflict);
            }
            let now = Utc::now();
            doc.projects.insert(name.to_string(), Project::new(name.to_string(), now));
            doc.updated_at = now;
            Ok(())
        })
    }

    pub fn delete_project(&self, name: &str) -> Result<(), VaultError> {
        self.with_document_mut(|doc| {
            if doc.projects.remove(name).is_none() {
                return Err(VaultError::NotFound);
            }
            doc.updated_at = Utc::now();
            doc.favorites.reconcile(&doc.projects);
            Ok(())
        })
    }

    pub fn get_secrets(&self, project: &str) -> Result<BTreeMap<String, SecretView>, VaultError> {
        self.with_document(|doc| {
            let project = doc.projects.get(project).ok_or(VaultError::NotFound)?;
            Ok(project.secrets.iter().map(|(k, v)| (k.clone(), v.view())).collect())
        })
    }

    /// Key names only, without touching any secret's value — lets a caller
    /// (the access server) know what a request would touch before deciding
    /// whether to approve it.
    pub fn list_secret_keys(&self, project: &str) -> Result<Vec<String>, VaultError> {
        self.with_document(|doc| {
            let project = doc.projects.get(project).ok_or(VaultError::NotFound)?;
            Ok(project.secrets.keys().cloned().collect())
        })
    }

    pub fn get_secret(&self, project: &str, key: &str) -> Result<SecretView, VaultError> {
        self.with_document(|doc| {
            let project = doc.projects.get(project).ok_or(VaultError::NotFound)?;
            let slot = project.secrets.get(key).ok_or(VaultError::NotFound)?;
            Ok(slot.view())
        })
    }

    /// Creates or updates a secret. An update only pushes history when
    /// `(value, expiresAt)` actually changed (invariant 4).
    pub fn set_secret(
        &self,
        project: &str,
        key: &str,
        value: &str,
        expires_at: Option<NaiveDate>,
    ) -> Result<(), VaultError> {
        self.with_document_mut(|doc| {
            let now = Utc::now();
            let project_entry = doc.projects.get_mut(project).ok_or(VaultError::NotFound)?;

            match project_entry.secrets.remove(key) {
                None => {
                    project_entry.secrets.insert(
                        key.to_string(),
                        SecretSlot::Structured(Secret::new(value.to_string(), expires_at, now)),
                    );
                }
                Some(slot) => {
                    let mut secret = slot.upgraded(now);
                    let changed = secret.value != value || secret.expires_at != expires_at;
                    if changed {
                        let prev_value = secret.value.clone();
                        let prev_expires = secret.expires_at;
                        let prev_updated = secret.updated_at;
                        secret.push_history(prev_value, prev_expires, prev_updated);
                        secret.value = value.to_string();
                        secret.expires_at = expires_at;
                        secret.updated_at = now;
                    }
                    project_entry.secrets.insert(key.to_string(), SecretSlot::Structured(secret));
                }
            }
            project_entry.updated_at = now;
            doc.updated_at = now;
            Ok(())
        })
    }

    /// Bulk import with `expiresAt=null`. Per-entry no-op when identical.
    pub fn set_secrets(&self, project: &str, values: &BTreeMap<String, String>) -> Result<(), VaultError> {
        for (key, value) in values {
            let unchanged = self
                .get_secret(project, key)
                .map(|existing| existing.value == *value && existing.expires_at.is_none())
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            self.set_secret(project, key, value, None)?;
        }
        Ok(())
    }

    pub fn delete_secret(&self, project: &str, key: &str) -> Result<(), VaultError> {
        self.with_document_mut(|doc| {
            let project_entry = doc.projects.get_mut(project).ok_or(VaultError::NotFound)?;
            if project_entry.secrets.remove(key).is_none() {
                return Err(VaultError::NotFound);
            }
            project_entry.updated_at = Utc::now();
            doc.updated_at = Utc::now();
            doc.favorites.reconcile(&doc.projects);
            Ok(())
        })
    }

    pub fn get_secret_history(&self, project: &str, key: &str) -> Result<SecretHistoryView, VaultError> {
        self.with_document(|doc| {
            let project = doc.projects.get(project).ok_or(VaultError::NotFound)?;
            let slot = project.secrets.get(key).ok_or(VaultError::NotFound)?;
            let secret = match slot {
                SecretSlot::Legacy(_) => {
                    let view = slot.view();
                    return Ok(SecretHistoryView {
                        current: HistoryEntryView {
                            value: view.value,
                            expires_at: view.expires_at,
                            changed_at: view.updated_at,
                            is_current: true,
                        },
                        history: Vec::new(),
                        total_versions: 1,
                    });
                }
                SecretSlot::Structured(secret) => secret,
            };
            let current = HistoryEntryView {
                value: secret.value.clone(),
                expires_at: secret.expires_at,
                changed_at: secret.updated_at,
                is_current: true,
            };
            let history: Vec<HistoryEntryView> = secret
                .history
                .iter()
                .map(|h| HistoryEntryView {
                    value: h.value.clone(),
                    expires_at: h.expires_at,
                    changed_at: h.changed_at,
                    is_current: false,
                })
                .collect();
            let total_versions = history.len() + 1;
            Ok(SecretHistoryView { current, history, total_versions })
        })
    }

    /// Restores `history[index]` as the current value. Implemented as a
    /// `setSecret` so the restoration itself is recorded in history (§4.2).
    pub fn restore_secret_version(&self, project: &str, key: &str, index: usize) -> Result<(), VaultError> {
        let (value, expires_at) = self.with_document(|doc| {
            let project_entry = doc.projects.get(project).ok_or(VaultError::NotFound)?;
            let slot = project_entry.secrets.get(key).ok_or(VaultError::NotFound)?;
            match slot {
                SecretSlot::Legacy(_) => Err(VaultError::OutOfRange),
                SecretSlot::Structured(secret) => {
                    let entry = secret.history.get(index).ok_or(VaultError::OutOfRange)?;
                    Ok((entry.value.clone(), entry.expires_at))
                }
            }
        })?;
        self.set_secret(project, key, &value, expires_at)
    }

    pub fn toggle_project_favorite(&self, project: &str) -> Result<bool, VaultError> {
        self.with_document_mut(|doc| {
            if !doc.projects.contains_key(project) {
                return Err(VaultError::NotFound);
            }
            let now_favorite = if let Some(pos) = doc.favorites.projects.iter().position(|p| p == project) {
                doc.favorites.projects.remove(pos);
                false
            } else {
                doc.favorites.projects.push(project.to_string());
                true
            };
            Ok(now_favorite)
        })
    }

    pub fn toggle_secret_favorite(&self, project: &str, key: &str) -> Result<bool, VaultError> {
        self.with_document_mut(|doc| {
            let project_entry = doc.projects.get(project).ok_or(VaultError::NotFound)?;
            if !project_entry.secrets.contains_key(key) {
                return Err(VaultError::NotFound);
            }
            let keys = doc.favorites.secrets.entry(project.to_string()).or_default();
            let now_favorite = if let Some(pos) = keys.iter().position(|k| k == key) {
                keys.remove(pos);
                false
            } else {
                keys.push(key.to_string());
                true
            };
            if keys.is_empty() {
                doc.favorites.secrets.remove(project);
            }
            Ok(now_favorite)
        })
    }

    pub fn get_statistics(&self) -> Result<Statistics, VaultError> {
        self.with_document(|doc| {
            let now = Utc::now();
            let warning_edge = now + EXPIRY_WARNING_WINDOW;
            let mut total_secrets = 0usize;
            let mut expiring_secrets = 0usize;
            let mut has_expired = false;

            for project in doc.projects.values() {
                for slot in project.secrets.values() {
                    total_secrets += 1;
                    if let Some(expires_at) = slot.view().expires_at {
                        let expires_at_dt = expires_at.and_hms_opt(0, 0, 0).unwrap().and_utc();
                        if expires_at_dt < now {
                            has_expired = true;
                        } else if expires_at_dt <= warning_edge {
                            expiring_secrets += 1;
                        }
                    }
                }
            }

            Ok(Statistics {
                total_projects: doc.projects.len(),
                total_secrets,
                expiring_secrets,
                has_expired,
            })
        })
    }
}

fn persist_salt(config: &KernelConfig, salt: &[u8; SALT_LEN]) -> Result<(), VaultError> {
    fsutil::write_restricted(&config.salt_path(), hex::encode(salt).as_bytes())?;
    Ok(())
}

fn persist(config: &KernelConfig, guard: &mut VaultInner) -> Result<(), VaultError> {
    let unlocked = guard.unlocked.as_mut().ok_or(VaultError::Locked)?;
    let bytes = crypto::encrypt_json(&unlocked.document, &unlocked.key)?;
    fsutil::write_restricted(&config.vault_path(), &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (VaultStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = KernelConfig::new(dir.path().to_path_buf());
        (VaultStore::new(config), dir)
    }

    #[test]
    fn setup_unlock_roundtrip_s1() {
        let (vault, _dir) = store();
        vault.setup("hunter2").unwrap();
        vault.create_project("app").unwrap();
        vault.set_secret("app", "K", "v1", None).unwrap();
        vault.lock(true).unwrap();
        assert!(!vault.is_unlocked());

        vault.unlock("hunter2").unwrap();
        let view = vault.get_secret("app", "K").unwrap();
        assert_eq!(view.value, "v1");
        assert_eq!(view.expires_at, None);
    }

    #[test]
    fn history_and_restore_s2() {
        let (vault, _dir) = store();
        vault.setup("hunter2").unwrap();
        vault.create_project("app").unwrap();
        vault.set_secret("app", "K", "v1", None).unwrap();
        vault.set_secret("app", "K", "v2", None).unwrap();
        vault.set_secret("app", "K", "v3", None).unwrap();

        let history = vault.get_secret_history("app", "K").unwrap();
        assert_eq!(history.current.value, "v3");
        assert_eq!(history.total_versions, 3);
        assert_eq!(history.history[0].value, "v2");
        assert_eq!(history.history[1].value, "v1");

        vault.restore_secret_version("app", "K", 1).unwrap();
        let current = vault.get_secret("app", "K").unwrap();
        assert_eq!(current.value, "v1");

        let history = vault.get_secret_history("app", "K").unwrap();
        assert_eq!(history.history[0].value, "v3");
        assert_eq!(history.history[1].value, "v2");
        assert_eq!(history.history[2].value, "v1");
    }

    #[test]
    fn wrong_password_s3() {
        let (vault, _dir) = store();
        vault.setup("hunter2").unwrap();
        vault.create_project("app").unwrap();
        vault.set_secret("app", "K", "v1", None).unwrap();
        vault.lock(true).unwrap();

        let err = vault.unlock("HUNTER2").unwrap_err();
        assert!(matches!(err, VaultError::InvalidPassword));
        assert!(!vault.is_unlocked());

        let err = vault.get_secret("app", "K").unwrap_err();
        assert!(matches!(err, VaultError::Locked));
    }

    #[test]
    fn no_op_write_does_not_grow_history() {
        let (vault, _dir) = store();
        vault.setup("hunter2").unwrap();
        vault.create_project("app").unwrap();
        vault.set_secret("app", "K", "v1", None).unwrap();
        vault.set_secret("app", "K", "v1", None).unwrap();

        let history = vault.get_secret_history("app", "K").unwrap();
        assert_eq!(history.total_versions, 1);
    }

    #[test]
    fn delete_project_cascades_favorites() {
        let (vault, _dir) = store();
        vault.setup("hunter2").unwrap();
        vault.create_project("app").unwrap();
        vault.set_secret("app", "K", "v1", None).unwrap();
        vault.toggle_project_favorite("app").unwrap();
        vault.toggle_secret_favorite("app", "K").unwrap();

        vault.delete_project("app").unwrap();

        let stats = vault.get_statistics().unwrap();
        assert_eq!(stats.total_projects, 0);
    }

    #[test]
    fn history_bound_respects_max() {
        let (vault, _dir) = store();
        vault.setup("hunter2").unwrap();
        vault.create_project("app").unwrap();
        for i in 0..(crate::models::MAX_HISTORY + 10) {
            vault.set_secret("app", "K", &format!("v{i}"), None).unwrap();
        }
        let history = vault.get_secret_history("app", "K").unwrap();
        assert!(history.history.len() <= crate::models::MAX_HISTORY);
    }
}
