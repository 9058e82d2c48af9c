use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{InvalidTransition, SessionId, TaskId};

/// Reason codes shared by synchronous API errors and terminal-state events.
///
/// The presentation layer maps each code to a user-facing message; the core
/// never formats user-facing text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("peer is not reachable")]
    PeerUnreachable,
    #[error("a session with this peer is already active")]
    SessionAlreadyActive,
    #[error("session is not connected")]
    SessionNotConnected,
    #[error("file set is empty, unreadable or contains empty files")]
    InvalidFileSet,
    #[error("insufficient storage on the receiving device")]
    InsufficientStorage,
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("integrity check failed")]
    Corrupted,
    #[error("destination path is in use by another transfer")]
    DestinationBusy,
    #[error("device name must contain 1 to 63 characters")]
    InvalidDeviceName,
    #[error("save location is not a writable directory")]
    InvalidSaveLocation,
    #[error("timed out waiting for the peer")]
    TimedOut,
    #[error("rejected by the peer")]
    Rejected,
    #[error("canceled")]
    Canceled,
    #[error("session closed")]
    SessionClosed,
}

impl ErrorCode {
    /// Returns `true` for expected protocol outcomes, as opposed to
    /// transport, storage or validation failures.
    #[must_use]
    pub fn is_protocol_outcome(self) -> bool {
        matches!(self, Self::TimedOut | Self::Rejected | Self::Canceled)
    }

    /// Returns `true` for codes produced by synchronous validation.
    #[must_use]
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            Self::InvalidFileSet
                | Self::InvalidDeviceName
                | Self::InvalidSaveLocation
                | Self::DestinationBusy
        )
    }
}

/// Error returned by calls on the engine handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(transparent)]
    Code(#[from] ErrorCode),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown transfer {0}")]
    UnknownTransfer(TaskId),
    #[error("engine is not running")]
    EngineStopped,
    #[error("{0}")]
    Io(String),
}

impl CoreError {
    /// Returns the reason code carried by this error, if any.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Code(code) => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_protocol_outcomes_when_classified_then_only_timeout_reject_cancel_match() {
        let outcomes = [ErrorCode::TimedOut, ErrorCode::Rejected, ErrorCode::Canceled];
        for code in outcomes {
            assert!(code.is_protocol_outcome(), "{code:?}");
        }
        for code in [
            ErrorCode::NetworkUnavailable,
            ErrorCode::Corrupted,
            ErrorCode::InsufficientStorage,
            ErrorCode::SessionClosed,
        ] {
            assert!(!code.is_protocol_outcome(), "{code:?}");
        }
    }

    #[test]
    fn given_error_code_when_serialized_then_uses_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InsufficientStorage).unwrap();
        assert_eq!(json, "\"insufficient_storage\"");
    }

    #[test]
    fn given_core_error_from_code_when_queried_then_returns_code() {
        let err = CoreError::from(ErrorCode::SessionAlreadyActive);
        assert_eq!(err.code(), Some(ErrorCode::SessionAlreadyActive));
        assert_eq!(CoreError::EngineStopped.code(), None);
    }
}
