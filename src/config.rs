//! Kernel-wide configuration: where files live, how long before auto-lock.

use std::path::PathBuf;

/// Default idle-lock timeout (5 minutes), per §4.7.
pub const DEFAULT_IDLE_LOCK_SECS: u64 = 300;
/// How often the idle-lock and save-debounce watcher thread wakes up.
pub const LIFECYCLE_POLL_MS: u64 = 100;
/// The product tag this build's license must match.
pub const PRODUCT_TAG: &str = "keyward";

/// Resolved on-disk layout and tunables for one kernel instance.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub vault_dir: PathBuf,
    pub idle_lock_secs: u64,
    pub allow_online_activation: bool,
}

impl KernelConfig {
    /// Builds a config rooted at `vault_dir` with spec defaults.
    pub fn new(vault_dir: PathBuf) -> Self {
        Self {
            vault_dir,
            idle_lock_secs: DEFAULT_IDLE_LOCK_SECS,
            allow_online_activation: false,
        }
    }

    /// Resolves the default vault directory under the platform data dir,
    /// falling back to `~/.keyward` when no platform data dir is available.
    pub fn default_vault_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("keyward"))
            .unwrap_or_else(|| {
                let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
                home.join(".keyward")
            })
    }

    pub fn salt_path(&self) -> PathBuf {
        self.vault_dir.join("salt.txt")
    }

    pub fn vault_path(&self) -> PathBuf {
        self.vault_dir.join("vault.enc")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.vault_dir.join("logs.enc")
    }

    pub fn logs_archive_path(&self, epoch_ms: i64) -> PathBuf {
        self.vault_dir.join(format!("logs_archive_{epoch_ms}.enc"))
    }

    pub fn license_path(&self) -> PathBuf {
        self.vault_dir.join("license.json")
    }

    pub fn handshake_path(&self) -> PathBuf {
        self.vault_dir.join("server-info.json")
    }
}
