//! The plaintext vault document: projects, secrets, history, and favorites.
//!
//! Everything here is the payload encrypted at rest by [`crate::vault`]; none
//! of it ever touches disk unencrypted.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current semantic version of the document schema.
pub const DOCUMENT_VERSION: &str = "1.0.0";
/// Maximum number of history entries retained per secret.
pub const MAX_HISTORY: usize = 50;

/// A past value of a secret. Index 0 in a secret's history is the most
/// recent prior value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub value: String,
    pub expires_at: Option<NaiveDate>,
    pub changed_at: DateTime<Utc>,
}

/// The structured, current shape of a secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Secret {
    pub value: String,
    pub expires_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Secret {
    pub fn new(value: String, expires_at: Option<NaiveDate>, now: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Pushes `{value, expiresAt, changedAt}` onto the history head and
    /// truncates to [`MAX_HISTORY`]. Caller is responsible for only calling
    /// this when the value actually changed (invariant 4).
    pub fn push_history(&mut self, value: String, expires_at: Option<NaiveDate>, changed_at: DateTime<Utc>) {
        self.history.insert(0, HistoryEntry { value, expires_at, changed_at });
        self.history.truncate(MAX_HISTORY);
    }
}

/// A secret as stored on disk: either the current structured shape, or a
/// legacy bare-string value from an older vault schema.
///
/// Legacy secrets are accepted on read and left untouched in memory; they
/// are only rewritten to [`Secret`] the next time a write touches them
/// (§4.2 "Normalization on unlock", §9 "Legacy secret shape").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SecretSlot {
    Legacy(String),
    Structured(Secret),
}

impl SecretSlot {
    /// The fabricated timestamp attributed to a legacy secret's unknown
    /// creation/update time: the Unix epoch. Confined to this one place so
    /// it is easy to re-derive or change; never exposed as "the real time".
    fn legacy_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    /// Renders a read-only, structured view regardless of on-disk shape.
    /// History is never included in a `SecretView` (§4.2 `getSecrets`).
    pub fn view(&self) -> SecretView {
        match self {
            SecretSlot::Legacy(value) => SecretView {
                value: value.clone(),
                expires_at: None,
                created_at: Self::legacy_epoch(),
                updated_at: Self::legacy_epoch(),
            },
            SecretSlot::Structured(secret) => SecretView {
                value: secret.value.clone(),
                expires_at: secret.expires_at,
                created_at: secret.created_at,
                updated_at: secret.updated_at,
            },
        }
    }

    /// Upgrades a legacy bare-string secret into the structured shape,
    /// leaving a structured secret untouched. Used right before a mutation
    /// applies, so the rewrite happens lazily rather than on unlock.
    pub fn upgraded(self, now: DateTime<Utc>) -> Secret {
        match self {
            SecretSlot::Legacy(value) => Secret::new(value, None, now),
            SecretSlot::Structured(secret) => secret,
        }
    }
}

/// Read-only view of a secret returned to callers. Never carries history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SecretView {
    pub value: String,
    pub expires_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single entry in a secret's version history, annotated with whether it
/// is the current value.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryEntryView {
    pub value: String,
    pub expires_at: Option<NaiveDate>,
    pub changed_at: DateTime<Utc>,
    pub is_current: bool,
}

/// Full version history of one secret.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SecretHistoryView {
    pub current: HistoryEntryView,
    pub history: Vec<HistoryEntryView>,
    pub total_versions: usize,
}

/// A named grouping of secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretSlot>,
}

impl Project {
    pub fn new(name: String, now: DateTime<Utc>) -> Self {
        Self { name, created_at: now, updated_at: now, secrets: BTreeMap::new() }
    }
}

/// Summary row returned by `getProjects`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProjectSummary {
    pub name: String,
    pub secret_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pinned favorite projects and, per project, pinned favorite secret keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Favorites {
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, Vec<String>>,
}

impl Favorites {
    /// Drops any favorite that no longer points at an existing
    /// project/secret, and de-duplicates in place (invariant 2, 5).
    pub fn reconcile(&mut self, projects: &BTreeMap<String, Project>) {
        self.projects.retain(|p| projects.contains_key(p));
        dedup_preserve_order(&mut self.projects);

        let mut stale_project_keys = Vec::new();
        for (project_name, keys) in self.secrets.iter_mut() {
            match projects.get(project_name) {
                Some(project) => {
                    keys.retain(|k| project.secrets.contains_key(k));
                    dedup_preserve_order(keys);
                }
                None => stale_project_keys.push(project_name.clone()),
            }
        }
        for key in stale_project_keys {
            self.secrets.remove(&key);
        }
        self.secrets.retain(|_, keys| !keys.is_empty());
    }
}

fn dedup_preserve_order(items: &mut Vec<String>) {
    let mut seen = std::collections::BTreeSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// The plaintext payload encrypted at rest as `vault.enc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultDocument {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
    #[serde(default)]
    pub favorites: Favorites,
}

impl VaultDocument {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            created_at: now,
            updated_at: now,
            projects: BTreeMap::new(),
            favorites: Favorites::default(),
        }
    }

    /// Normalizes favorites against the current project/secret set
    /// (§4.2 "Normalization on unlock"). Called once right after decrypting
    /// a document, never on every read.
    pub fn normalize(&mut self) {
        self.favorites.reconcile(&self.projects);
    }
}

/// Aggregate counts returned by `getStatistics`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Statistics {
    pub total_projects: usize,
    pub total_secrets: usize,
    pub expiring_secrets: usize,
    pub has_expired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_secret_view_has_no_history_and_epoch_timestamps() {
        let slot = SecretSlot::Legacy("plain-value".to_string());
        let view = slot.view();
        assert_eq!(view.value, "plain-value");
        assert_eq!(view.expires_at, None);
        assert_eq!(view.created_at, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn upgrading_legacy_preserves_value() {
        let now = Utc::now();
        let secret = SecretSlot::Legacy("v1".to_string()).upgraded(now);
        assert_eq!(secret.value, "v1");
        assert!(secret.history.is_empty());
        assert_eq!(secret.created_at, now);
    }

    #[test]
    fn history_push_truncates_to_max() {
        let now = Utc::now();
        let mut secret = Secret::new("v0".to_string(), None, now);
        for i in 0..(MAX_HISTORY + 10) {
            secret.push_history(format!("v{i}"), None, now);
        }
        assert_eq!(secret.history.len(), MAX_HISTORY);
        assert_eq!(secret.history[0].value, format!("v{}", MAX_HISTORY + 9));
    }

    #[test]
    fn favorites_reconcile_drops_missing_targets() {
        let mut projects = BTreeMap::new();
        projects.insert("app".to_string(), Project::new("app".to_string(), Utc::now()));

        let mut favorites = Favorites {
            projects: vec!["app".to_string(), "ghost".to_string()],
            secrets: BTreeMap::from([("ghost".to_string(), vec!["K".to_string()])]),
        };
        favorites.reconcile(&projects);

        assert_eq!(favorites.projects, vec!["app".to_string()]);
        assert!(favorites.secrets.is_empty());
    }
}
