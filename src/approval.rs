//! The approval broker: a single interactive yes/no gate in front of every
//! secret-touching request (§4.5).
//!
//! Modeled as an injected trait object: the access server holds an
//! `Arc<dyn ApprovalBroker>` rather than a concrete state struct, so a
//! terminal prompt and a scripted auto-approve/deny fixture are
//! interchangeable at construction time.

use crate::logger::Logger;
use std::io::{self, Write};
use std::sync::Mutex;

/// What a pending request is asking to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
        }
    }
}

/// The broker's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl Decision {
    pub fn approve() -> Self {
        Self { approved: true, reason: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { approved: false, reason: Some(reason.into()) }
    }
}

/// A single synchronous approval decision for one batch of keys.
///
/// Implementations enforce "at most one pending prompt" either by
/// construction (a terminal prompt is inherently synchronous) or by an
/// internal lock; the access server additionally serializes request
/// handling so two prompts are never shown concurrently (§5).
pub trait ApprovalBroker: Send + Sync {
    fn request_approval(&self, project: &str, keys: &[String], action: Action) -> Decision;
}

/// Prompts on the controlling terminal. The default broker for the CLI
/// binary's own in-process use; unsuitable for a headless server without a
/// tty, in which case a caller should inject [`AutoDenyBroker`] instead.
pub struct TerminalApprovalBroker {
    logger: Logger,
    stdin_lock: Mutex<()>,
}

impl TerminalApprovalBroker {
    pub fn new(logger: Logger) -> Self {
        Self { logger, stdin_lock: Mutex::new(()) }
    }
}

impl ApprovalBroker for TerminalApprovalBroker {
    fn request_approval(&self, project: &str, keys: &[String], action: Action) -> Decision {
        if keys.is_empty() {
            return Decision::approve();
        }
        let _guard = self.stdin_lock.lock().unwrap();

        let key_list = keys.join(", ");
        print!("Allow {} access to {project}: {key_list}? [y/N] ", action.as_str());
        let _ = io::stdout().flush();

        let mut line = String::new();
        let decision = match io::stdin().read_line(&mut line) {
            Ok(_) if line.trim().eq_ignore_ascii_case("y") => Decision::approve(),
            Ok(_) => Decision::deny("User denied"),
            Err(e) => Decision::deny(format!("Prompt failed: {e}")),
        };

        let label = if decision.approved {
            "Access approved".to_string()
        } else {
            format!("Access denied: {}", decision.reason.as_deref().unwrap_or(""))
        };
        self.logger.log_access(&label, project, keys);

        decision
    }
}

/// Always approves. Used in tests and for non-interactive fixtures.
pub struct AutoApproveBroker {
    logger: Logger,
}

impl AutoApproveBroker {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl ApprovalBroker for AutoApproveBroker {
    fn request_approval(&self, project: &str, keys: &[String], _action: Action) -> Decision {
        self.logger.log_access("Access approved", project, keys);
        Decision::approve()
    }
}

/// Always denies. Used to exercise S5 (approval denial) without a tty.
pub struct AutoDenyBroker {
    logger: Logger,
    reason: String,
}

impl AutoDenyBroker {
    pub fn new(logger: Logger, reason: impl Into<String>) -> Self {
        Self { logger, reason: reason.into() }
    }
}

impl ApprovalBroker for AutoDenyBroker {
    fn request_approval(&self, project: &str, keys: &[String], _action: Action) -> Decision {
        if keys.is_empty() {
            return Decision::approve();
        }
        self.logger.log_access(&format!("Access denied: {}", self.reason), project, keys);
        Decision::deny(self.reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::crypto::KEY_LEN;
    use tempfile::tempdir;

    fn logger() -> (Logger, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let logger = Logger::new(KernelConfig::new(dir.path().to_path_buf()));
        logger.set_encryption_key([9u8; KEY_LEN]);
        (logger, dir)
    }

    #[test]
    fn empty_key_set_skips_approval_even_when_denying() {
        let (logger, _dir) = logger();
        let broker = AutoDenyBroker::new(logger, "unreachable");
        let decision = broker.request_approval("app", &[], Action::Read);
        assert!(decision.approved);
    }

    #[test]
    fn auto_deny_logs_access_denied_with_project_and_keys() {
        let (logger, _dir) = logger();
        let broker = AutoDenyBroker::new(logger.clone(), "User denied");
        let decision = broker.request_approval("app", &["K".to_string()], Action::Read);
        assert!(!decision.approved);

        let logs = logger.get_logs();
        let last = logs.last().unwrap();
        assert!(last.message.contains("Access denied"));
        assert!(last.message.contains("app"));
        assert!(last.message.contains("K"));
    }
}
