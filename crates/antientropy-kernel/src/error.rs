//! Error types shared by the history store and the scheduling runtime.

use thiserror::Error;

/// Illegal transition of a [crate::history::RepairSession].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SessionStateError {
    #[error("repair session was already started")]
    AlreadyUsed,
    #[error("repair session was never started")]
    NotStarted,
    #[error("repair session was already finished")]
    AlreadyFinished,
}

#[derive(Clone, Debug, Error)]
pub enum RepairError {
    /// The backing database failed a read or write. Retried by callers.
    #[error("driver: {0}")]
    Driver(String),
    #[error("session state: {0}")]
    SessionState(#[from] SessionStateError),
    #[error("lock busy: {0}")]
    LockBusy(String),
    #[error("repair rpc: {0}")]
    Rpc(String),
    #[error("config: {0}")]
    Config(String),
    /// The persisted schema cannot be used by this version.
    #[error("schema: {0}")]
    Schema(String),
    #[error("scheduler is shut down")]
    Shutdown,
}

impl RepairError {
    /// Errors that are expected to clear up on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Driver(_) | Self::LockBusy(_))
    }
}

pub(crate) fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> RepairError {
    RepairError::Driver(format!("{prefix}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_and_lock_errors_are_transient() {
        assert!(RepairError::Driver("down".into()).is_transient());
        assert!(RepairError::LockBusy("vnode".into()).is_transient());
        assert!(!RepairError::Rpc("boom".into()).is_transient());
        assert!(!RepairError::from(SessionStateError::AlreadyFinished).is_transient());
    }

    #[test]
    fn session_state_error_renders_transition() {
        let err = RepairError::from(SessionStateError::NotStarted);
        assert_eq!(err.to_string(), "session state: repair session was never started");
    }
}
