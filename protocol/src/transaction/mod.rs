//! # Transaction Records
//!
//! Persistent state for one PoD session, from establishment to a terminal
//! status. Sellers and buyers keep independent records for the same
//! session; the escrow contract is what they eventually agree on.
//!
//! ## Architecture
//!
//! ```text
//! status.rs: TxStatus and its transition rules
//! record.rs: TransactionRecord, Role and the mode-specific payload
//! store.rs:  sled-backed RecordStore (one tree per role)
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Create** on establishment with status `start`.
//! 2. **Advance** at every message exchange and contract call through
//!    [`TransactionRecord::advance`], which refuses illegal transitions.
//! 3. **Fail** into a terminal `*Failed` status on any fatal error, with
//!    the error text stored on the record.
//!
//! Records are upserted and never deleted.

pub mod record;
pub mod status;
pub mod store;

pub use record::{ItemRange, RecordPayload, Role, TransactionRecord};
pub use status::{TransitionError, TxStatus};
pub use store::{RecordStore, StoreError};
