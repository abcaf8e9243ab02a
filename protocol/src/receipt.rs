//! # Receipts and Secrets
//!
//! After the seller's response, the buyer signs a receipt: a mode-specific
//! commitment plus the total price and an expiry. The seller only reveals
//! its secret against a receipt whose signature recovers to the buyer, and
//! the escrow contract re-checks the same signature before it accepts the
//! secret.
//!
//! ## Signing digests
//!
//! Each mode hashes a different packed layout. The encodings are not
//! uniform: `S`/`K` are hex `bytes32`, while `VW`, `D` and the VRF group
//! element are base-10 integers.
//!
//! ```text
//! complaint       sid:uint256 buyer:address S:bytes32 K:bytes32  count:uint64 price:uint256 expireAt:uint256
//! atomic swap     sid:uint256 buyer:address S:bytes32 VW:uint256 count:uint64 price:uint256 expireAt:uint256
//! atomic swap vc  sid:uint256 buyer:address D:uint256                         price:uint256 expireAt:uint256
//! vrf             sid:uint256 buyer:address g0:uint256 g1:uint256             price:uint256 expireAt:uint256
//! ```
//!
//! The Keccak-256 of the layout is then wrapped with the Ethereum
//! signed-message prefix.

use ethers::signers::LocalWallet;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::{parse_bytes32, parse_u256_dec, FieldError, Packed};
use crate::crypto::signatures::{eth_signed_digest, sign_digest, verify_signer, SignatureError};
use crate::mode::TransactionKind;

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("malformed receipt: {0}")]
    Malformed(String),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error("receipt is for {got}, session runs {expected}")]
    WrongKind {
        expected: &'static str,
        got: &'static str,
    },

    #[error("receipt price {got} does not match expected {expected}")]
    PriceMismatch { expected: u64, got: i64 },

    #[error("receipt expired at {expire_at}")]
    Expired { expire_at: i64 },

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Mode-specific receipt body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModeReceipt {
    Complaint {
        /// Commitment to the seller's seed, hex.
        #[serde(rename = "S")]
        seed2: String,
        /// Merkle root over the encrypted items, hex.
        #[serde(rename = "K")]
        k_root: String,
        count: u64,
    },
    AtomicSwap {
        #[serde(rename = "S")]
        seed2: String,
        /// Weighted commitment, base 10.
        #[serde(rename = "VW")]
        vw: String,
        count: u64,
    },
    AtomicSwapVc {
        /// Scalar commitment digest, base 10.
        #[serde(rename = "D")]
        digest: String,
    },
    Vrf {
        /// Group element, base-10 coordinates.
        g_exp_r: [String; 2],
    },
}

impl ModeReceipt {
    pub fn label(&self) -> &'static str {
        match self {
            ModeReceipt::Complaint { .. } => "complaint",
            ModeReceipt::AtomicSwap { .. } => "atomic_swap",
            ModeReceipt::AtomicSwapVc { .. } => "atomic_swap_vc",
            ModeReceipt::Vrf { .. } => "vrf",
        }
    }

    /// Whether this receipt belongs to a session of `kind`.
    pub fn matches(&self, kind: &TransactionKind) -> bool {
        matches!(
            (self, kind),
            (ModeReceipt::Complaint { .. }, TransactionKind::Complaint { .. })
                | (ModeReceipt::AtomicSwap { .. }, TransactionKind::AtomicSwap { .. })
                | (ModeReceipt::AtomicSwapVc { .. }, TransactionKind::AtomicSwapVc { .. })
                | (ModeReceipt::Vrf { .. }, TransactionKind::VrfQuery { .. })
        )
    }

    /// Prefixed digest the buyer signs and the contract recovers from.
    pub fn signing_digest(
        &self,
        session_id: u64,
        buyer: Address,
        price: u64,
        expire_at: i64,
    ) -> Result<H256, ReceiptError> {
        let head = Packed::new().uint256(U256::from(session_id)).address(buyer);
        let price = U256::from(price);
        let expire = U256::from(expire_at.max(0) as u64);
        let packed = match self {
            ModeReceipt::Complaint {
                seed2,
                k_root,
                count,
            } => head
                .bytes32(parse_bytes32(seed2)?)
                .bytes32(parse_bytes32(k_root)?)
                .uint64(*count),
            ModeReceipt::AtomicSwap { seed2, vw, count } => head
                .bytes32(parse_bytes32(seed2)?)
                .uint256(parse_u256_dec(vw)?)
                .uint64(*count),
            ModeReceipt::AtomicSwapVc { digest } => head.uint256(parse_u256_dec(digest)?),
            ModeReceipt::Vrf { g_exp_r } => head
                .uint256(parse_u256_dec(&g_exp_r[0])?)
                .uint256(parse_u256_dec(&g_exp_r[1])?),
        };
        Ok(eth_signed_digest(
            packed.uint256(price).uint256(expire).keccak(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Receipt as it travels on the wire: JSON body, 65-byte signature and
/// the terms it was signed over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptEnvelope {
    #[serde(with = "hex_bytes")]
    pub receipt_byte: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub receipt_sign: Vec<u8>,
    pub price: i64,
    pub expire_at: i64,
}

impl ReceiptEnvelope {
    /// Sign `receipt` as the buyer.
    pub fn sign(
        receipt: &ModeReceipt,
        session_id: u64,
        wallet: &LocalWallet,
        buyer: Address,
        price: u64,
        expire_at: i64,
    ) -> Result<Self, ReceiptError> {
        let digest = receipt.signing_digest(session_id, buyer, price, expire_at)?;
        let receipt_sign = sign_digest(wallet, digest)?;
        let receipt_byte =
            serde_json::to_vec(receipt).map_err(|e| ReceiptError::Malformed(e.to_string()))?;
        Ok(Self {
            receipt_byte,
            receipt_sign,
            price: i64::try_from(price).map_err(|_| ReceiptError::Malformed("price overflows i64".into()))?,
            expire_at,
        })
    }

    pub fn receipt(&self) -> Result<ModeReceipt, ReceiptError> {
        serde_json::from_slice(&self.receipt_byte).map_err(|e| ReceiptError::Malformed(e.to_string()))
    }

    /// Decode and check the receipt a buyer sent.
    ///
    /// The receipt must match the session's kind, carry exactly
    /// `expected_price`, not be expired at `now`, and be signed by `buyer`.
    pub fn verify(
        &self,
        kind: &TransactionKind,
        session_id: u64,
        buyer: Address,
        expected_price: u64,
        now: i64,
    ) -> Result<ModeReceipt, ReceiptError> {
        let receipt = self.receipt()?;
        if !receipt.matches(kind) {
            return Err(ReceiptError::WrongKind {
                expected: kind.label(),
                got: receipt.label(),
            });
        }
        if u64::try_from(self.price).ok() != Some(expected_price) {
            return Err(ReceiptError::PriceMismatch {
                expected: expected_price,
                got: self.price,
            });
        }
        if self.expire_at <= now {
            return Err(ReceiptError::Expired {
                expire_at: self.expire_at,
            });
        }
        let digest = receipt.signing_digest(session_id, buyer, expected_price, self.expire_at)?;
        verify_signer(digest, &self.receipt_sign, buyer)?;
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// What the seller reveals: the seed, plus the blinding value for the
/// atomic-swap-vc flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub seed: H256,
    pub rand: Option<H256>,
}

impl Secret {
    pub fn new(seed: H256) -> Self {
        Self { seed, rand: None }
    }

    pub fn with_rand(seed: H256, rand: H256) -> Self {
        Self {
            seed,
            rand: Some(rand),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}
