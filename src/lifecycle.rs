//! Ties the vault, logger, license verifier, approval broker, and access
//! server into one kernel; owns the idle-lock timer and shutdown sequence
//! (§4.7). The idle-lock timer is a background thread waking on a fixed
//! interval and comparing a shared last-interaction timestamp against a
//! timeout.

use crate::approval::ApprovalBroker;
use crate::config::KernelConfig;
use crate::handshake::Handshake;
use crate::license::{LicenseConfig, LicenseStatus, LicenseVerifier};
use crate::logger::{Logger, LogCategory};
use crate::server::AccessServer;
use crate::vault::VaultStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("no valid license: {0}")]
    LicenseInvalid(String),
    #[error("vault error: {0}")]
    Vault(#[from] crate::vault::VaultError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The running kernel: unlocked vault, logger sharing its key, and an
/// access server gating both behind approval (§2 "Control flow").
pub struct Kernel {
    pub config: KernelConfig,
    pub vault: VaultStore,
    pub logger: Logger,
    license: LicenseVerifier,
    server: Mutex<Option<AccessServer>>,
    last_interaction: Arc<Mutex<Instant>>,
    stop_idle_timer: Arc<AtomicBool>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let vault = VaultStore::new(config.clone());
        let logger = Logger::new(config.clone());
        let license = LicenseVerifier::new(config.clone(), LicenseConfig::new(crate::config::PRODUCT_TAG));
        Self {
            config,
            vault,
            logger,
            license,
            server: Mutex::new(None),
            last_interaction: Arc::new(Mutex::new(Instant::now())),
            stop_idle_timer: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Invariant 6: the access server only starts after the local
    /// entitlement is valid.
    pub fn check_license(&self) -> LicenseStatus {
        self.license.check_local_license()
    }

    pub fn unlock(&self, password: &str) -> Result<(), KernelError> {
        self.vault.unlock(password)?;
        if let Some(key) = self.vault.encryption_key() {
            self.logger.set_encryption_key(key);
        }
        self.logger.log("vault unlocked", LogCategory::Lock);
        self.touch();
        Ok(())
    }

    pub fn setup(&self, password: &str) -> Result<(), KernelError> {
        self.vault.setup(password)?;
        if let Some(key) = self.vault.encryption_key() {
            self.logger.set_encryption_key(key);
        }
        self.logger.log("vault created", LogCategory::Lock);
        self.touch();
        Ok(())
    }

    /// Records user-initiated activity, resetting the idle-lock deadline.
    pub fn touch(&self) {
        *self.last_interaction.lock().unwrap() = Instant::now();
    }

    pub fn lock(&self, sync: bool) -> Result<(), KernelError> {
        self.logger.log("vault locked", LogCategory::Lock);
        self.logger.clear_encryption_key();
        self.vault.lock(sync)?;
        Ok(())
    }

    /// Starts the loopback server and publishes the handshake file.
    /// Refuses to start if the local entitlement is invalid (invariant 6):
    /// the access server has no path to real secrets without a license.
    pub fn start_server(&self, broker: Arc<dyn ApprovalBroker>) -> Result<(), KernelError> {
        if let LicenseStatus::Invalid(e) = self.check_license() {
            return Err(KernelError::LicenseInvalid(e.to_string()));
        }
        let server = AccessServer::start(self.vault.clone(), self.logger.clone(), broker)?;
        let handshake = Handshake::for_current_process(server.port(), server.auth_token().to_string());
        handshake.write(&self.config)?;
        *self.server.lock().unwrap() = Some(server);
        self.spawn_idle_timer();
        Ok(())
    }

    fn spawn_idle_timer(&self) {
        let last_interaction = self.last_interaction.clone();
        let stop = self.stop_idle_timer.clone();
        let timeout = Duration::from_secs(self.config.idle_lock_secs);
        let poll = Duration::from_millis(crate::config::LIFECYCLE_POLL_MS);
        let vault = self.vault.clone();
        let logger = self.logger.clone();

        thread::spawn(move || loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(poll);
            if !vault.is_unlocked() {
                continue;
            }
            let idle_for = Instant::now().duration_since(*last_interaction.lock().unwrap());
            if idle_for > timeout {
                logger.log("idle timeout", LogCategory::Lock);
                logger.clear_encryption_key();
                let _ = vault.lock(false);
            }
        });
    }

    /// Synchronously flushes pending writes, locks the vault, stops the
    /// server, and deletes the handshake file (§4.7 "On process shutdown").
    pub fn shutdown(&self) -> Result<(), KernelError> {
        self.stop_idle_timer.store(true, Ordering::Relaxed);
        self.logger.log_app("shutdown");
        self.lock(true)?;
        self.vault.shutdown();

        if let Some(server) = self.server.lock().unwrap().take() {
            server.shutdown();
        }
        Handshake::delete(&self.config)?;
        Ok(())
    }
}
