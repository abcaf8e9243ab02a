//! The escrow contract as this crate sees it.
//!
//! [`EscrowLedger`] is the full call surface the adapter uses. The node
//! implements it over JSON-RPC; tests and devnets use the in-process
//! contract model.

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bulletin::{Bulletin, BulletinStatus};
use crate::mode::{TopMode, TransactionKind};
use crate::receipt::{ModeReceipt, Secret};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A view call failed. Safe to retry.
    #[error("read failed: {0}")]
    Read(String),

    /// A transaction could not be sent or mined.
    #[error("send failed: {0}")]
    Send(String),

    /// The contract rejected the call.
    #[error("reverted: {0}")]
    Reverted(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl LedgerError {
    pub fn is_read(&self) -> bool {
        matches!(self, LedgerError::Read(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// A bulletin as stored by the contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulletinInfo {
    pub owner: Address,
    pub size: u64,
    pub s: u64,
    pub n: u64,
    pub sigma_mkl_root: U256,
    pub vrf_digest: U256,
    pub mode: TopMode,
    pub stake: U256,
    pub status: BulletinStatus,
    /// Unix seconds of the un-publish request, zero if none.
    pub un_publish_at: u64,
}

/// A buyer's deposit towards one seller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositInfo {
    pub value: U256,
    /// `0` normal, `1` un-deposit requested.
    pub stat: u8,
    /// Unix seconds of the un-deposit request, zero if none.
    pub un_deposit_at: u64,
}

/// Per-session record the contract keeps once a proof is submitted.
///
/// `submit_at == 0` means nothing has been submitted yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub submit_at: u64,
    pub secret: Option<Secret>,
    pub price: U256,
    pub expire_at: u64,
    /// The buyer filed a complaint against this session.
    pub claimed: bool,
    /// The complaint deal was settled.
    pub settled: bool,
}

/// Everything a proof submission carries. Each ledger maps it to the
/// contract method of its flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofSubmission {
    pub kind: TransactionKind,
    pub session_id: u64,
    pub buyer: Address,
    pub receipt: ModeReceipt,
    pub secret: Secret,
    pub price: u64,
    pub expire_at: i64,
    pub signature: Vec<u8>,
}

/// A buyer's on-chain dispute of a complaint-mode session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplaintClaim {
    pub seller: Address,
    pub session_id: u64,
    /// Index of the first item that failed verification.
    pub index: u64,
    /// Engine-specific evidence for that item.
    pub evidence: Vec<u8>,
}

#[async_trait]
pub trait EscrowLedger: Send + Sync {
    /// Address transactions are sent from.
    fn caller(&self) -> Address;

    async fn publish(
        &self,
        bulletin: &Bulletin,
        mode: TopMode,
        vrf_digest: U256,
        stake: U256,
    ) -> LedgerResult<H256>;

    async fn un_publish(&self, key: H256) -> LedgerResult<H256>;

    async fn withdraw_a(&self, key: H256) -> LedgerResult<H256>;

    async fn bob_deposit(&self, seller: Address, value: U256) -> LedgerResult<H256>;

    async fn bob_un_deposit(&self, seller: Address) -> LedgerResult<H256>;

    async fn withdraw_b(&self, seller: Address) -> LedgerResult<H256>;

    async fn submit_proof(&self, proof: &ProofSubmission) -> LedgerResult<H256>;

    async fn claim_complaint(&self, claim: &ComplaintClaim) -> LedgerResult<H256>;

    async fn settle_complaint_deal(
        &self,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> LedgerResult<H256>;

    async fn bulletin(&self, key: H256) -> LedgerResult<Option<BulletinInfo>>;

    async fn bob_deposit_of(&self, buyer: Address, seller: Address) -> LedgerResult<DepositInfo>;

    async fn session_record(
        &self,
        kind: &TransactionKind,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> LedgerResult<SessionRecord>;

    async fn balance(&self, who: Address) -> LedgerResult<U256>;
}
