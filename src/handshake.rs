//! The handshake file: `{host, port, authToken, pid}`, the rendezvous a CLI
//! client reads to find the running access server (§6).

use crate::config::KernelConfig;
use crate::fsutil;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub host: String,
    pub port: u16,
    #[serde(rename = "authToken")]
    pub auth_token: String,
    pub pid: u32,
}

impl Handshake {
    pub fn for_current_process(port: u16, auth_token: String) -> Self {
        Self { host: "localhost".to_string(), port, auth_token, pid: std::process::id() }
    }

    pub fn write(&self, config: &KernelConfig) -> std::io::Result<()> {
        fsutil::ensure_dir(&config.vault_dir)?;
        let bytes = serde_json::to_vec_pretty(self).expect("Handshake serializes infallibly");
        fsutil::write_restricted(&config.handshake_path(), &bytes)
    }

    pub fn delete(config: &KernelConfig) -> std::io::Result<()> {
        match std::fs::remove_file(config.handshake_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads the handshake file, treating a stale `pid` (no longer a live
    /// process) as "server not running" rather than a parse success.
    pub fn read_live(config: &KernelConfig) -> Option<Self> {
        let bytes = std::fs::read(config.handshake_path()).ok()?;
        let handshake: Handshake = serde_json::from_slice(&bytes).ok()?;
        if pid_is_alive(handshake.pid) {
            Some(handshake)
        } else {
            None
        }
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 performs no-op permission/existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_live_round_trips_for_current_process() {
        let dir = tempdir().unwrap();
        let config = KernelConfig::new(dir.path().to_path_buf());
        let handshake = Handshake::for_current_process(4000, "deadbeef".to_string());
        handshake.write(&config).unwrap();

        let read_back = Handshake::read_live(&config).unwrap();
        assert_eq!(read_back, handshake);
    }

    #[test]
    fn stale_pid_is_treated_as_not_running() {
        let dir = tempdir().unwrap();
        let config = KernelConfig::new(dir.path().to_path_buf());
        let handshake = Handshake { host: "localhost".to_string(), port: 1, auth_token: "x".to_string(), pid: u32::MAX };
        handshake.write(&config).unwrap();

        assert!(Handshake::read_live(&config).is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = KernelConfig::new(dir.path().to_path_buf());
        Handshake::delete(&config).unwrap();
        Handshake::delete(&config).unwrap();
    }
}
