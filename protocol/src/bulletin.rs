//! # Bulletins
//!
//! A bulletin is the public description of a published dataset: its byte
//! size, the row-group parameters `s` and `n`, and the Merkle root the
//! seller commits to. The escrow contract stores bulletins under a key
//! derived from those four fields ([`Bulletin::key`]).
//!
//! Sellers keep the bulletins they serve in a [`BulletinCatalog`], keyed by
//! Merkle root, because that is what a buyer names in its session request.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use ethers::types::{H256, U256};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::hash::{bulletin_key, parse_u256_hex, FieldError};
use crate::mode::{SubMode, TopMode};

/// Public, immutable dataset description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bulletin {
    /// Total plaintext size in bytes.
    pub size: u64,
    /// Fields per record (table) or bytes per chunk (plain).
    pub s: u64,
    /// Record or chunk count.
    pub n: u64,
    /// Hex Merkle root over the item leaves, without `0x`.
    pub sigma_mkl_root: String,
}

impl Bulletin {
    pub fn new(size: u64, s: u64, n: u64, root: H256) -> Self {
        Self {
            size,
            s,
            n,
            sigma_mkl_root: hex::encode(root.as_bytes()),
        }
    }

    /// The Merkle root as the contract stores it.
    pub fn root_u256(&self) -> Result<U256, FieldError> {
        parse_u256_hex(&self.sigma_mkl_root)
    }

    /// The escrow contract's mapping key for this bulletin.
    pub fn key(&self) -> Result<H256, FieldError> {
        Ok(bulletin_key(self.size, self.s, self.n, self.root_u256()?))
    }
}

/// Lowercase root without `0x`, the form catalogs and records key on.
pub fn normalize_root(root: &str) -> String {
    root.strip_prefix("0x").unwrap_or(root).to_ascii_lowercase()
}

/// On-chain bulletin lifecycle as reported by the escrow contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BulletinStatus {
    Ok,
    Canceling,
    Canceled,
    Unknown,
}

impl BulletinStatus {
    /// Map the contract's `stat` field.
    pub fn from_stat(stat: u8) -> Self {
        match stat {
            0 => BulletinStatus::Ok,
            1 => BulletinStatus::Canceling,
            2 => BulletinStatus::Canceled,
            _ => BulletinStatus::Unknown,
        }
    }

    pub fn as_stat(&self) -> u8 {
        match self {
            BulletinStatus::Ok => 0,
            BulletinStatus::Canceling => 1,
            BulletinStatus::Canceled => 2,
            BulletinStatus::Unknown => u8::MAX,
        }
    }
}

impl fmt::Display for BulletinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BulletinStatus::Ok => "OK",
            BulletinStatus::Canceling => "CANCELING",
            BulletinStatus::Canceled => "CANCELED",
            BulletinStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Seller catalog
// ---------------------------------------------------------------------------

/// A bulletin a seller is serving, with its local data and terms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishedBulletin {
    pub bulletin: Bulletin,
    pub mode: TopMode,
    /// Flows offered for this dataset. The first is the default.
    pub sub_modes: Vec<SubMode>,
    /// Unit price in wei per delivered item.
    pub price: u64,
    pub data_path: PathBuf,
}

impl PublishedBulletin {
    /// Resolve the sub-mode for a session: the buyer's hint if it is
    /// offered, otherwise the default. `None` if the hint is not offered.
    pub fn select_sub_mode(&self, hint: Option<SubMode>) -> Option<SubMode> {
        match hint {
            Some(sub) => self.sub_modes.iter().copied().find(|s| *s == sub),
            None => self.sub_modes.first().copied(),
        }
    }
}

/// Bulletins served by this seller, keyed by normalized Merkle root.
#[derive(Debug, Default)]
pub struct BulletinCatalog {
    entries: RwLock<HashMap<String, PublishedBulletin>>,
}

impl BulletinCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: PublishedBulletin) {
        let root = normalize_root(&entry.bulletin.sigma_mkl_root);
        self.entries.write().insert(root, entry);
    }

    pub fn get(&self, root: &str) -> Option<PublishedBulletin> {
        self.entries.read().get(&normalize_root(root)).cloned()
    }

    pub fn remove(&self, root: &str) -> Option<PublishedBulletin> {
        self.entries.write().remove(&normalize_root(root))
    }

    pub fn list(&self) -> Vec<PublishedBulletin> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.bulletin.sigma_mkl_root.cmp(&b.bulletin.sigma_mkl_root));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
