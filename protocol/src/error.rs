//! Top-level error type for PoD sessions.
//!
//! Each layer has its own error enum; [`PodError`] folds them into the
//! taxonomy callers act on. [`PodError::kind`] is what decides whether a
//! failure is worth a retry: transport errors and protocol violations end
//! the session, contract-call errors are surfaced for the caller to judge,
//! and an unavailable secret is not an error at all (see
//! [`crate::escrow::SecretOutcome`]).

use thiserror::Error;

use crate::crypto::signatures::SignatureError;
use crate::engine::EngineError;
use crate::escrow::deposit::DepositError;
use crate::escrow::ledger::LedgerError;
use crate::mode::ModeError;
use crate::receipt::ReceiptError;
use crate::transaction::status::TransitionError;
use crate::transaction::store::StoreError;
use crate::wire::WireError;

/// Coarse classification of a [`PodError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel I/O or framing failed. Fatal for the session.
    Transport,
    /// The peer broke the protocol (hint, id echo, mode, ordering).
    ProtocolViolation,
    /// A receipt signature had the wrong length or wrong signer.
    SignatureInvalid,
    /// An escrow contract call failed or reverted.
    ContractCall,
    /// The secret did not appear on chain within the retry policy.
    PollTimeout,
    /// Reading or writing a transaction record failed.
    Persistence,
    /// The PoD engine rejected an input or failed internally.
    Engine,
    /// Local verification of revealed data failed.
    Verification,
    /// Anything else (local file system, bad caller input).
    Internal,
}

impl ErrorKind {
    /// Stable lowercase label, used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::ContractCall => "contract_call",
            ErrorKind::PollTimeout => "poll_timeout",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Engine => "engine",
            ErrorKind::Verification => "verification",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors produced by the seller and buyer drivers.
#[derive(Debug, Error)]
pub enum PodError {
    #[error("transport error: {0}")]
    Transport(#[source] WireError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("session id mismatch: sent {sent:#x}, peer echoed {echoed:#x}")]
    SessionMismatch { sent: u64, echoed: u64 },

    #[error(transparent)]
    InvalidMode(#[from] ModeError),

    #[error("bulletin not found for merkle root {0}")]
    BulletinNotFound(String),

    #[error("invalid signature: {0}")]
    SignatureInvalid(#[from] SignatureError),

    #[error("invalid receipt: {0}")]
    Receipt(#[from] ReceiptError),

    #[error("contract call failed: {0}")]
    ContractCall(#[from] LedgerError),

    #[error("deposit rejected: {0}")]
    DepositRejected(#[from] DepositError),

    #[error("no secret available after {attempts} attempts")]
    PollTimeout { attempts: u32 },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid status transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PodResult<T> = Result<T, PodError>;

impl PodError {
    /// Classify the error for retry and reporting decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PodError::Transport(WireError::Protocol(_))
            | PodError::Transport(WireError::UnexpectedMessage { .. })
            | PodError::Transport(WireError::SessionMismatch { .. })
            | PodError::Transport(WireError::NonZeroHint(_)) => ErrorKind::ProtocolViolation,
            PodError::Transport(_) => ErrorKind::Transport,
            PodError::Receipt(ReceiptError::Signature(_)) => ErrorKind::SignatureInvalid,
            PodError::ProtocolViolation(_)
            | PodError::SessionMismatch { .. }
            | PodError::InvalidMode(_)
            | PodError::BulletinNotFound(_)
            | PodError::Receipt(_)
            | PodError::DepositRejected(_) => ErrorKind::ProtocolViolation,
            PodError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            PodError::ContractCall(_) => ErrorKind::ContractCall,
            PodError::PollTimeout { .. } => ErrorKind::PollTimeout,
            PodError::Persistence(_) | PodError::Transition(_) => ErrorKind::Persistence,
            PodError::Engine(_) => ErrorKind::Engine,
            PodError::Verification(_) => ErrorKind::Verification,
            PodError::Io(_) => ErrorKind::Internal,
        }
    }

    /// True for failures after which retrying the same call makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::PollTimeout)
            || matches!(self, PodError::ContractCall(e) if e.is_read())
    }
}

impl From<WireError> for PodError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::SessionMismatch { sent, echoed } => PodError::SessionMismatch { sent, echoed },
            other => PodError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_mismatch_is_a_protocol_violation_not_transport() {
        let err: PodError = WireError::SessionMismatch { sent: 1, echoed: 2 }.into();
        assert!(matches!(err, PodError::SessionMismatch { sent: 1, echoed: 2 }));
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn closed_channel_is_transport() {
        let err: PodError = WireError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!err.is_retryable());
    }

    #[test]
    fn poll_timeout_is_retryable() {
        let err = PodError::PollTimeout { attempts: 20 };
        assert_eq!(err.kind(), ErrorKind::PollTimeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn non_zero_hint_is_a_protocol_violation() {
        let err: PodError = WireError::NonZeroHint(7).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }
}
