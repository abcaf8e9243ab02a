//! # PoD Engine Seam
//!
//! The cryptographic engine builds requests and responses, checks
//! receipts and secrets, and decrypts delivered data. The session drivers
//! only move its blobs around and sequence its calls.
//!
//! Each side opens one engine session per PoD session. The session object
//! owns whatever native state the engine needs and releases it on drop,
//! so every exit path of a driver frees it.
//!
//! [`keystream::KeystreamEngine`] is a development engine that implements
//! both sides with Keccak keystream encryption and Merkle checks. It is not
//! zero-knowledge.

pub mod keystream;

use std::path::Path;

use ethers::types::Address;
use thiserror::Error;

use crate::bulletin::{Bulletin, PublishedBulletin};
use crate::mode::TransactionKind;
use crate::receipt::{ModeReceipt, Secret};
use crate::transaction::RecordPayload;

pub use keystream::KeystreamEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0} is not supported by this engine")]
    Unsupported(String),
}

impl EngineError {
    pub fn malformed(what: &'static str, reason: impl ToString) -> Self {
        EngineError::Malformed {
            what,
            reason: reason.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// What both sides know about a session once it is established.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: u64,
    pub kind: TransactionKind,
    pub bulletin: Bulletin,
    pub seller: Address,
    pub buyer: Address,
}

/// What the buyer learns from a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseSummary {
    /// Receipt body the buyer will sign.
    pub receipt: ModeReceipt,
    /// Items the receipt pays for.
    pub count: u64,
}

/// Outcome of decrypting a delivery with the revealed secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Verified { items: u64 },
    Corrupted { index: u64 },
}

/// Evidence for an on-chain complaint about one item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimEvidence {
    pub index: u64,
    pub evidence: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Seller side
// ---------------------------------------------------------------------------

pub trait SellerEngine: Send + Sync {
    fn open(
        &self,
        ctx: &SessionContext,
        published: &PublishedBulletin,
    ) -> EngineResult<Box<dyn SellerSession>>;
}

pub trait SellerSession: Send {
    /// Answer the buyer's negotiation request. Returns the ack and the
    /// seller's own request, sent back in one frame.
    fn on_nego_request(&mut self, request: &[u8]) -> EngineResult<(Vec<u8>, Vec<u8>)>;

    /// Check the buyer's answer to the seller's negotiation request.
    fn on_nego_ack(&mut self, ack: &[u8]) -> EngineResult<()>;

    /// Read a request file and write the response file. Returns the
    /// number of items the buyer will pay for.
    fn on_request(&mut self, request: &Path, response: &Path) -> EngineResult<u64>;

    /// Check a verified receipt against the response and release the
    /// secret it unlocks.
    fn on_receipt(&mut self, receipt: &ModeReceipt) -> EngineResult<Secret>;
}

// ---------------------------------------------------------------------------
// Buyer side
// ---------------------------------------------------------------------------

pub trait BuyerEngine: Send + Sync {
    fn open(
        &self,
        ctx: &SessionContext,
        payload: &RecordPayload,
    ) -> EngineResult<Box<dyn BuyerSession>>;
}

pub trait BuyerSession: Send {
    fn nego_request(&mut self) -> EngineResult<Vec<u8>>;

    /// Check the seller's ack and answer its reflected request.
    fn on_nego_ack_req(&mut self, ack: &[u8], request: &[u8]) -> EngineResult<Vec<u8>>;

    /// Write the request file.
    fn request(&mut self, path: &Path) -> EngineResult<()>;

    fn on_response(&mut self, path: &Path) -> EngineResult<ResponseSummary>;

    /// Whether `secret` opens the commitment in the response.
    fn on_secret(&mut self, secret: &Secret) -> EngineResult<bool>;

    /// Decrypt with the accepted secret and write the plaintext to
    /// `output` if every item verifies.
    fn decrypt(&mut self, output: &Path) -> EngineResult<Delivery>;

    /// Evidence for the first item that failed to decrypt, if any.
    fn claim(&self) -> Option<ClaimEvidence>;
}
