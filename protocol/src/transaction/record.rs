use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::status::{TransitionError, TxStatus};
use crate::bulletin::Bulletin;
use crate::mode::{ModeDescriptor, TransactionKind};

/// Which side of the exchange owns a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seller,
    Buyer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Seller => "seller",
            Role::Buyer => "buyer",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seller" => Ok(Role::Seller),
            "buyer" => Ok(Role::Buyer),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// A contiguous run of items, `start..start + count`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRange {
    pub start: u64,
    pub count: u64,
}

impl ItemRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> {
        self.start..self.start.saturating_add(self.count)
    }
}

/// What the buyer asked for.
///
/// `phantoms` are only used by oblivious-transfer sessions, and
/// `key_name`/`key_values` only by VRF queries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub demands: Vec<ItemRange>,
    pub phantoms: Vec<ItemRange>,
    pub key_name: Option<String>,
    pub key_values: Vec<String>,
}

/// One session as seen by one side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Lowercase hex session id.
    pub session_id: String,
    pub role: Role,
    pub status: TxStatus,
    pub kind: TransactionKind,
    pub descriptor: ModeDescriptor,
    pub mode_code: u8,
    pub bulletin: Bulletin,
    /// Seller address, `0x`-prefixed.
    pub seller: String,
    /// Buyer address, `0x`-prefixed.
    pub buyer: String,
    /// Unit price in wei.
    pub unit_price: u64,
    /// Total price on the signed receipt, once there is one.
    pub price: Option<u64>,
    /// Receipt expiry (unix seconds), once there is a receipt.
    pub expire_at: Option<i64>,
    pub payload: RecordPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Error text of the failure that ended the session.
    pub error: Option<String>,
}

impl TransactionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: u64,
        role: Role,
        kind: TransactionKind,
        descriptor: ModeDescriptor,
        mode_code: u8,
        bulletin: Bulletin,
        seller: String,
        buyer: String,
        unit_price: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("{session_id:x}"),
            role,
            status: TxStatus::Start,
            kind,
            descriptor,
            mode_code,
            bulletin,
            seller,
            buyer,
            unit_price,
            price: None,
            expire_at: None,
            payload: RecordPayload::default(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Numeric session id.
    pub fn session_number(&self) -> Option<u64> {
        u64::from_str_radix(&self.session_id, 16).ok()
    }

    /// Move to `next`, refusing transitions the status machine forbids.
    pub fn advance(&mut self, next: TxStatus) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        debug!(session = %self.session_id, role = %self.role, from = %self.status, to = %next, "status transition");
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to a failure status and remember why.
    ///
    /// A record that is already terminal keeps its status; the error is
    /// still recorded if none was.
    pub fn fail(&mut self, status: TxStatus, error: impl fmt::Display) {
        debug_assert!(status.is_failure());
        if self.status.can_advance_to(status) {
            self.status = status;
        }
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{SubMode, TopMode};
    use ethers::types::H256;

    fn record() -> TransactionRecord {
        let descriptor = ModeDescriptor::new(TopMode::Plain, SubMode::Complaint, false);
        TransactionRecord::new(
            0x1f,
            Role::Seller,
            TransactionKind::try_from(descriptor).unwrap(),
            descriptor,
            8,
            Bulletin::new(10, 1, 10, H256::repeat_byte(1)),
            "0xseller".into(),
            "0xbuyer".into(),
            100,
        )
    }

    #[test]
    fn new_record_starts_with_hex_id() {
        let r = record();
        assert_eq!(r.session_id, "1f");
        assert_eq!(r.session_number(), Some(0x1f));
        assert_eq!(r.status, TxStatus::Start);
    }

    #[test]
    fn advance_rejects_backward_moves() {
        let mut r = record();
        r.advance(TxStatus::Requested).unwrap();
        let err = r.advance(TxStatus::Start).unwrap_err();
        assert_eq!(err.from, TxStatus::Requested);
        assert_eq!(r.status, TxStatus::Requested);
    }

    #[test]
    fn fail_is_sticky() {
        let mut r = record();
        r.fail(TxStatus::InvalidRequest, "bad request");
        r.fail(TxStatus::Error, "later");
        assert_eq!(r.status, TxStatus::InvalidRequest);
        assert_eq!(r.error.as_deref(), Some("bad request"));
    }

    #[test]
    fn bincode_round_trip_keeps_optional_fields() {
        let mut r = record();
        r.price = Some(1000);
        r.payload.demands.push(ItemRange::new(0, 10));
        let bytes = bincode::serialize(&r).unwrap();
        let back: TransactionRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn range_indices() {
        let r = ItemRange::new(3, 4);
        assert_eq!(r.indices().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }
}
