//! # Record Store
//!
//! sled-backed persistence for [`TransactionRecord`]s.
//!
//! | Tree                  | Key                          | Value                        |
//! |-----------------------|------------------------------|------------------------------|
//! | `seller_transactions` | session id (hex, UTF-8)      | `bincode(TransactionRecord)` |
//! | `buyer_transactions`  | `<seller addr>/<session id>` | `bincode(TransactionRecord)` |
//!
//! Buyer keys carry the seller address because two sellers may hand out
//! the same session id. Records are upserted and never removed.

use std::path::Path;

use sled::{Db, Tree};
use thiserror::Error;

use super::record::{Role, TransactionRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent store of seller and buyer transaction records.
///
/// Cheap to clone; clones share the same sled handles.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Db,
    seller: Tree,
    buyer: Tree,
}

impl RecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store removed on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let seller = db.open_tree("seller_transactions")?;
        let buyer = db.open_tree("buyer_transactions")?;
        Ok(Self { db, seller, buyer })
    }

    fn tree(&self, role: Role) -> &Tree {
        match role {
            Role::Seller => &self.seller,
            Role::Buyer => &self.buyer,
        }
    }

    /// Storage key of a record within its role's tree.
    pub fn key_of(record: &TransactionRecord) -> String {
        match record.role {
            Role::Seller => record.session_id.clone(),
            Role::Buyer => buyer_key(&record.seller, &record.session_id),
        }
    }

    /// Insert or replace a record and flush.
    pub fn put(&self, record: &TransactionRecord) -> StoreResult<()> {
        let bytes =
            bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.tree(record.role)
            .insert(Self::key_of(record).as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get(&self, role: Role, key: &str) -> StoreResult<Option<TransactionRecord>> {
        match self.tree(role).get(key.as_bytes())? {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing record is an error.
    pub fn require(&self, role: Role, key: &str) -> StoreResult<TransactionRecord> {
        self.get(role, key)?
            .ok_or_else(|| StoreError::NotFound(format!("{role}/{key}")))
    }

    /// All records of one role, in key order.
    pub fn list(&self, role: Role) -> StoreResult<Vec<TransactionRecord>> {
        self.tree(role)
            .iter()
            .values()
            .map(|v| {
                let bytes = v?;
                bincode::deserialize(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    /// Highest seller session id persisted so far.
    pub fn max_seller_session_id(&self) -> StoreResult<Option<u64>> {
        let mut max = None;
        for key in self.seller.iter().keys() {
            let key = key?;
            if let Some(id) = std::str::from_utf8(&key)
                .ok()
                .and_then(|s| u64::from_str_radix(s, 16).ok())
            {
                max = max.max(Some(id));
            }
        }
        Ok(max)
    }

    pub fn count(&self, role: Role) -> usize {
        self.tree(role).len()
    }
}

/// Buyer-side storage key for a session with `seller`.
pub fn buyer_key(seller: &str, session_id: &str) -> String {
    format!("{}/{}", seller.to_ascii_lowercase(), session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulletin::Bulletin;
    use crate::mode::{ModeDescriptor, SubMode, TopMode, TransactionKind};
    use crate::transaction::TxStatus;
    use ethers::types::H256;

    fn record(id: u64, role: Role, seller: &str) -> TransactionRecord {
        let d = ModeDescriptor::new(TopMode::Plain, SubMode::AtomicSwap, false);
        TransactionRecord::new(
            id,
            role,
            TransactionKind::try_from(d).unwrap(),
            d,
            10,
            Bulletin::new(64, 8, 8, H256::repeat_byte(2)),
            seller.into(),
            "0xbuyer".into(),
            5,
        )
    }

    #[test]
    fn put_then_get_by_session_id() {
        let store = RecordStore::open_temporary().unwrap();
        let mut r = record(0xa, Role::Seller, "0xseller");
        store.put(&r).unwrap();
        r.advance(TxStatus::Requested).unwrap();
        store.put(&r).unwrap();

        let back = store.require(Role::Seller, "a").unwrap();
        assert_eq!(back.status, TxStatus::Requested);
        assert_eq!(store.count(Role::Seller), 1);
        assert!(store.get(Role::Buyer, "a").unwrap().is_none());
    }

    #[test]
    fn buyer_records_from_two_sellers_do_not_collide() {
        let store = RecordStore::open_temporary().unwrap();
        store.put(&record(1, Role::Buyer, "0xAAAA")).unwrap();
        store.put(&record(1, Role::Buyer, "0xbbbb")).unwrap();
        assert_eq!(store.list(Role::Buyer).unwrap().len(), 2);
        assert!(store.get(Role::Buyer, &buyer_key("0xaaaa", "1")).unwrap().is_some());
    }

    #[test]
    fn max_seller_id_is_numeric_not_lexicographic() {
        let store = RecordStore::open_temporary().unwrap();
        assert_eq!(store.max_seller_session_id().unwrap(), None);
        for id in [0x9, 0x10, 0x2] {
            store.put(&record(id, Role::Seller, "0xs")).unwrap();
        }
        assert_eq!(store.max_seller_session_id().unwrap(), Some(0x10));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RecordStore::open(dir.path()).unwrap();
            store.put(&record(7, Role::Seller, "0xs")).unwrap();
        }
        let store = RecordStore::open(dir.path()).unwrap();
        assert!(store.get(Role::Seller, "7").unwrap().is_some());
    }

    #[test]
    fn missing_record_is_not_found() {
        let store = RecordStore::open_temporary().unwrap();
        assert!(matches!(
            store.require(Role::Seller, "ff"),
            Err(StoreError::NotFound(_))
        ));
    }
}
