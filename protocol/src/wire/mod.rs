//! # Wire Session Envelope
//!
//! Typed, ordered message exchange over an already-secured stream.
//!
//! ```text
//! message.rs:  WireMessage frames and the JSON extra-info block
//! envelope.rs: WireSession: one send/recv pair per protocol step
//! ```
//!
//! Frames are length-delimited (`tokio-util`), control messages are
//! bincode, and bulk request/response payloads are streamed from and to
//! scratch files as a header frame followed by raw chunk frames. Nothing
//! retries: the first framing or I/O error ends the session.

pub mod envelope;
pub mod message;

pub use envelope::{SessionAck, SessionRequest, WireSession};
pub use message::{ExtraInfo, WireMessage};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("channel closed by peer")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("session id mismatch: sent {sent:#x}, peer echoed {echoed:#x}")]
    SessionMismatch { sent: u64, echoed: u64 },

    #[error("new session request carries non-zero hint {0:#x}")]
    NonZeroHint(u64),

    #[error("transfer of {0} bytes exceeds the limit")]
    TooLarge(u64),
}

pub type WireResult<T> = Result<T, WireError>;
