//! Transaction status taxonomy.
//!
//! The happy path runs forward through the phases below; a flow may skip
//! phases that do not apply to it (non-OT sessions never negotiate, the
//! seller never sees `gotSecret`).
//!
//! ```text
//! start → nego → negoOk → requested → responded → receipted
//!       → generateSecret → gotSecret → claimed → closed
//! ```
//!
//! Every other status is a terminal failure, reachable from any
//! non-terminal status. Terminal statuses never change.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxStatus {
    Start,
    Nego,
    NegoOk,
    NegoFailed,
    Requested,
    InvalidRequest,
    RequestFailed,
    Responded,
    ResponseFailed,
    Receipted,
    ReceiptFailed,
    GenerateSecret,
    GenerateSecretFailed,
    GotSecret,
    GotSecretFailed,
    SecretTerminated,
    Claimed,
    ClaimFailed,
    Closed,
    VerifyFailed,
    DecryptFailed,
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: TxStatus,
    pub to: TxStatus,
}

impl TxStatus {
    /// Position on the happy path, `None` for failure statuses.
    fn phase(&self) -> Option<u8> {
        use TxStatus::*;
        Some(match self {
            Start => 0,
            Nego => 1,
            NegoOk => 2,
            Requested => 3,
            Responded => 4,
            Receipted => 5,
            GenerateSecret => 6,
            GotSecret => 7,
            Claimed => 8,
            Closed => 9,
            _ => return None,
        })
    }

    pub fn is_failure(&self) -> bool {
        self.phase().is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.is_failure() || *self == TxStatus::Closed
    }

    /// Whether a record may move from `self` to `next`.
    pub fn can_advance_to(&self, next: TxStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.phase(), next.phase()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use TxStatus::*;
        match self {
            Start => "start",
            Nego => "nego",
            NegoOk => "negoOk",
            NegoFailed => "negoFailed",
            Requested => "requested",
            InvalidRequest => "invalidRequest",
            RequestFailed => "requestFailed",
            Responded => "responded",
            ResponseFailed => "responseFailed",
            Receipted => "receipted",
            ReceiptFailed => "receiptFailed",
            GenerateSecret => "generateSecret",
            GenerateSecretFailed => "generateSecretFailed",
            GotSecret => "gotSecret",
            GotSecretFailed => "gotSecretFailed",
            SecretTerminated => "secretTerminated",
            Claimed => "claimed",
            ClaimFailed => "claimFailed",
            Closed => "closed",
            VerifyFailed => "verifyFailed",
            DecryptFailed => "decryptFailed",
            Error => "error",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
