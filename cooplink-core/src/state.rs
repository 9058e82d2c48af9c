//! Session and transfer lifecycles as explicit transition tables.
//!
//! Every API call and protocol message that moves a session or a transfer
//! is expressed as an input to [`SessionState::on`] / [`TransferState::on`].
//! Inputs that are not valid for the current state are rejected with
//! [`InvalidTransition`] instead of being silently ignored, and terminal
//! states accept no input at all.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;

/// Locally unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally unique transfer task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who initiated a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Initiated locally.
    Outbound,
    /// Initiated by the remote peer.
    Inbound,
}

/// A state change was requested that the current state does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply {input} in state {state}")]
pub struct InvalidTransition {
    pub state: String,
    pub input: String,
}

impl InvalidTransition {
    #[must_use]
    pub fn new(state: impl fmt::Debug, input: impl fmt::Debug) -> Self {
        Self {
            state: format!("{state:?}"),
            input: format!("{input:?}"),
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Requesting,
    AwaitingConfirmation,
    Connected,
    Closed,
    Rejected,
    TimedOut,
    Canceled,
    Failed(ErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// A connect request was sent to the peer.
    Request,
    /// A connect request arrived from the peer.
    Incoming,
    Accept,
    Reject,
    Timeout,
    Cancel,
    Close,
    TransportLost,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Rejected | Self::TimedOut | Self::Canceled | Self::Failed(_)
        )
    }

    /// `Requesting` or `AwaitingConfirmation`.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Requesting | Self::AwaitingConfirmation)
    }

    /// Applies `input` and returns the next state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when `input` is not allowed in `self`.
    pub fn on(self, input: SessionInput) -> Result<Self, InvalidTransition> {
        use SessionInput as I;

        let next = match (self, input) {
            (Self::Idle, I::Request) => Self::Requesting,
            (Self::Idle, I::Incoming) => Self::AwaitingConfirmation,

            (Self::Requesting | Self::AwaitingConfirmation, I::Accept) => Self::Connected,
            (Self::Requesting | Self::AwaitingConfirmation, I::Reject) => Self::Rejected,
            (Self::Requesting | Self::AwaitingConfirmation, I::Timeout) => Self::TimedOut,
            (Self::Requesting | Self::AwaitingConfirmation, I::Cancel) => Self::Canceled,

            (Self::Idle | Self::Requesting | Self::AwaitingConfirmation | Self::Connected, I::Close) => {
                Self::Closed
            }
            (Self::Requesting | Self::AwaitingConfirmation | Self::Connected, I::TransportLost) => {
                Self::Failed(ErrorCode::NetworkUnavailable)
            }

            (state, input) => return Err(InvalidTransition::new(state, input)),
        };
        Ok(next)
    }

    /// Reason code attached to the `StateChanged` event for this state.
    #[must_use]
    pub fn reason(self) -> Option<ErrorCode> {
        match self {
            Self::Rejected => Some(ErrorCode::Rejected),
            Self::TimedOut => Some(ErrorCode::TimedOut),
            Self::Canceled => Some(ErrorCode::Canceled),
            Self::Closed => Some(ErrorCode::SessionClosed),
            Self::Failed(code) => Some(code),
            _ => None,
        }
    }
}

// ── Transfer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Queued,
    Negotiating,
    Transferring,
    Completed,
    /// Declined by the receiver; carries `Rejected` or `TimedOut`.
    Rejected(ErrorCode),
    Canceled,
    Failed(ErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferInput {
    /// The task became the active task for its direction.
    Promote,
    Accept,
    Reject(ErrorCode),
    Cancel,
    Finish,
    Fail(ErrorCode),
}

impl TransferState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected(_) | Self::Canceled | Self::Failed(_)
        )
    }

    /// Applies `input` and returns the next state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when `input` is not allowed in `self`.
    pub fn on(self, input: TransferInput) -> Result<Self, InvalidTransition> {
        use TransferInput as I;

        let next = match (self, input) {
            (Self::Queued, I::Promote) => Self::Negotiating,
            (Self::Negotiating, I::Accept) => Self::Transferring,
            (Self::Negotiating, I::Reject(code)) => Self::Rejected(code),
            (Self::Queued | Self::Negotiating | Self::Transferring, I::Cancel) => Self::Canceled,
            (Self::Transferring, I::Finish) => Self::Completed,
            (Self::Queued | Self::Negotiating | Self::Transferring, I::Fail(code)) => {
                Self::Failed(code)
            }
            (state, input) => return Err(InvalidTransition::new(state, input)),
        };
        Ok(next)
    }

    #[must_use]
    pub fn reason(self) -> Option<ErrorCode> {
        match self {
            Self::Rejected(code) | Self::Failed(code) => Some(code),
            Self::Canceled => Some(ErrorCode::Canceled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_idle_when_requested_and_accepted_then_connected() {
        let s = SessionState::Idle.on(SessionInput::Request).unwrap();
        assert_eq!(s, SessionState::Requesting);
        assert_eq!(s.on(SessionInput::Accept).unwrap(), SessionState::Connected);
    }

    #[test]
    fn given_awaiting_confirmation_when_timeout_then_timed_out() {
        let s = SessionState::Idle.on(SessionInput::Incoming).unwrap();
        assert_eq!(s.on(SessionInput::Timeout).unwrap(), SessionState::TimedOut);
    }

    #[test]
    fn given_connected_when_accept_then_invalid_transition() {
        let err = SessionState::Connected.on(SessionInput::Accept).unwrap_err();
        assert_eq!(err.state, "Connected");
        assert_eq!(err.input, "Accept");
    }

    #[test]
    fn given_connected_when_cancel_then_rejected_as_invalid() {
        assert!(SessionState::Connected.on(SessionInput::Cancel).is_err());
    }

    #[test]
    fn given_connected_when_transport_lost_then_failed_network_unavailable() {
        let s = SessionState::Connected.on(SessionInput::TransportLost).unwrap();
        assert_eq!(s, SessionState::Failed(ErrorCode::NetworkUnavailable));
        assert_eq!(s.reason(), Some(ErrorCode::NetworkUnavailable));
    }

    #[test]
    fn given_any_terminal_session_state_when_any_input_then_rejected() {
        let terminals = [
            SessionState::Closed,
            SessionState::Rejected,
            SessionState::TimedOut,
            SessionState::Canceled,
            SessionState::Failed(ErrorCode::NetworkUnavailable),
        ];
        let inputs = [
            SessionInput::Request,
            SessionInput::Incoming,
            SessionInput::Accept,
            SessionInput::Reject,
            SessionInput::Timeout,
            SessionInput::Cancel,
            SessionInput::Close,
            SessionInput::TransportLost,
        ];
        for state in terminals {
            assert!(state.is_terminal());
            for input in inputs {
                assert!(state.on(input).is_err(), "{state:?} accepted {input:?}");
            }
        }
    }

    #[test]
    fn given_queued_transfer_when_promoted_accepted_finished_then_completed() {
        let s = TransferState::Queued
            .on(TransferInput::Promote)
            .and_then(|s| s.on(TransferInput::Accept))
            .and_then(|s| s.on(TransferInput::Finish))
            .unwrap();
        assert_eq!(s, TransferState::Completed);
    }

    #[test]
    fn given_negotiating_when_rejected_with_timeout_then_reason_is_timed_out() {
        let s = TransferState::Negotiating
            .on(TransferInput::Reject(ErrorCode::TimedOut))
            .unwrap();
        assert_eq!(s.reason(), Some(ErrorCode::TimedOut));
        assert!(s.is_terminal());
    }

    #[test]
    fn given_queued_when_finish_then_invalid() {
        assert!(TransferState::Queued.on(TransferInput::Finish).is_err());
    }

    #[test]
    fn given_terminal_transfer_when_cancel_then_invalid() {
        for state in [
            TransferState::Completed,
            TransferState::Canceled,
            TransferState::Rejected(ErrorCode::Rejected),
            TransferState::Failed(ErrorCode::Corrupted),
        ] {
            assert!(state.on(TransferInput::Cancel).is_err());
            assert!(state.on(TransferInput::Fail(ErrorCode::SessionClosed)).is_err());
        }
    }

    #[test]
    fn given_transferring_when_canceled_then_canceled_not_failed() {
        let s = TransferState::Transferring.on(TransferInput::Cancel).unwrap();
        assert_eq!(s, TransferState::Canceled);
    }
}
