// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PoD Protocol: Core Library
//!
//! Pay-on-Delivery data exchange between a seller (data holder) and a
//! buyer. The seller streams encrypted chunks, the buyer answers with a
//! signed receipt, the seller reveals the decryption secret to an escrow
//! contract to get paid, and the buyer reads the secret back from the
//! contract. Neither side can walk away with the other's value: the
//! seller only gets paid by revealing a secret that matches the buyer's
//! receipt, and the buyer only gets the secret by committing to pay.
//!
//! ## Architecture
//!
//! - **mode**: wire mode registry and the [`mode::TransactionKind`]
//!   computed once per session.
//! - **wire**: typed message envelope over an already-secured channel.
//! - **session**: the establishment handshake (request, ack, echo ack).
//! - **receipt**: mode-specific receipts and their signing digests.
//! - **engine**: the seam to the PoD cryptographic engine, plus a
//!   development engine used by the node and the tests.
//! - **escrow**: ledger trait, adapter, deposit locks and secret polling.
//! - **transaction**: status taxonomy, records and their sled store.
//! - **seller** / **buyer**: the per-mode state machines.
//! - **registry**: process-local table of active sessions.
//! - **bulletin**: published dataset descriptions and the seller catalog.
//! - **crypto**: Keccak, packed encoding, signatures, Merkle trees, keys.
//! - **config**: protocol constants and the polling retry policy.

pub mod bulletin;
pub mod buyer;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod escrow;
pub mod mode;
pub mod receipt;
pub mod registry;
pub mod seller;
pub mod session;
pub mod transaction;
pub mod wire;

pub use error::{ErrorKind, PodError, PodResult};
pub use mode::{ModeDescriptor, SubMode, TopMode, TransactionKind};
