//! # PoD Exchange Contract
//!
//! Executable model of the escrow contract both PoD parties settle
//! through. State and checks follow the Solidity contract's surface:
//!
//! 1. **Publish**: a seller stakes on a bulletin keyed by
//!    `keccak(size ‖ s ‖ n ‖ root)`. `unPublish` starts an 8 h cooldown,
//!    after which `withdrawA` returns the stake.
//! 2. **Deposit**: a buyer deposits towards one seller. `bobUnDeposit`
//!    freezes the deposit for 8 h, after which `withdrawB` returns it.
//! 3. **Submit proof**: the seller reveals its secret against the buyer's
//!    signed receipt. The receipt signature must recover to the buyer and
//!    the receipt must not be expired. The price moves out of the buyer's
//!    deposit.
//! 4. **Complaint**: in the complaint flow the price is held until
//!    `settleComplaintDeal`: a claimed session refunds the buyer, an
//!    unclaimed one pays the seller. Other flows pay the seller at once.
//!
//! The model does not check that the secret opens the receipt's
//! commitment, nor the claim evidence. Both depend on the PoD engine.

use std::collections::HashMap;

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use pod_protocol::bulletin::{Bulletin, BulletinStatus};
use pod_protocol::config::{UNDEPOSIT_COOLDOWN, UNPUBLISH_COOLDOWN};
use pod_protocol::crypto::signatures::verify_signer;
use pod_protocol::escrow::{BulletinInfo, ComplaintClaim, DepositInfo, ProofSubmission, SessionRecord};
use pod_protocol::mode::{TopMode, TransactionKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons the contract reverts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("bulletin {0:?} not found")]
    UnknownBulletin(H256),

    #[error("bulletin {0:?} already published")]
    AlreadyPublished(H256),

    #[error("caller is not the owner")]
    NotOwner,

    #[error("bulletin is {current}, expected {expected}")]
    BulletinState {
        current: BulletinStatus,
        expected: BulletinStatus,
    },

    #[error("invalid bulletin: {0}")]
    InvalidBulletin(String),

    #[error("value must be positive")]
    ZeroValue,

    #[error("deposit is being withdrawn")]
    Undepositing,

    #[error("no un-deposit requested")]
    NotUndepositing,

    #[error("cooldown has {remaining} seconds left")]
    Cooldown { remaining: u64 },

    #[error("deposit {deposit} does not cover price {price}")]
    InsufficientDeposit { deposit: U256, price: U256 },

    #[error("receipt expired at {expire_at}")]
    Expired { expire_at: i64 },

    #[error("receipt is not for this flow")]
    WrongFlow,

    #[error("invalid receipt: {0}")]
    InvalidReceipt(String),

    #[error("signature check failed: {0}")]
    BadSignature(String),

    #[error("session {0:#x} already has a proof")]
    AlreadySubmitted(u64),

    #[error("session {0:#x} has no proof")]
    NoRecord(u64),

    #[error("session {0:#x} was already claimed")]
    AlreadyClaimed(u64),

    #[error("session {0:#x} was already settled")]
    AlreadySettled(u64),

    #[error("caller is not a party to the session")]
    NotParty,
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The record mapping a session lives in. Each flow has its own
/// `getRecord*` view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flow {
    Complaint,
    AtomicSwap,
    AtomicSwapVc,
    Vrf,
}

impl From<&TransactionKind> for Flow {
    fn from(kind: &TransactionKind) -> Self {
        match kind {
            TransactionKind::Complaint { .. } => Flow::Complaint,
            TransactionKind::AtomicSwap { .. } => Flow::AtomicSwap,
            TransactionKind::AtomicSwapVc { .. } => Flow::AtomicSwapVc,
            TransactionKind::VrfQuery { .. } => Flow::Vrf,
        }
    }
}

type RecordKey = (Flow, Address, Address, u64);

/// Contract storage.
#[derive(Debug, Default, Clone)]
pub struct PodExchange {
    bulletins: HashMap<H256, BulletinInfo>,
    /// `(buyer, seller)` → deposit.
    deposits: HashMap<(Address, Address), DepositInfo>,
    records: HashMap<RecordKey, SessionRecord>,
    /// Complaint-flow payments awaiting settlement.
    held: HashMap<RecordKey, U256>,
    /// Withdrawn stakes, deposits and payouts per address.
    balances: HashMap<Address, U256>,
}

impl PodExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn credit(&mut self, who: Address, value: U256) {
        let entry = self.balances.entry(who).or_default();
        *entry = entry.saturating_add(value);
    }

    // -- bulletins ----------------------------------------------------------

    /// Returns the bulletin key.
    pub fn publish(
        &mut self,
        caller: Address,
        bulletin: &Bulletin,
        mode: TopMode,
        vrf_digest: U256,
        stake: U256,
    ) -> ExchangeResult<H256> {
        if stake.is_zero() {
            return Err(ExchangeError::ZeroValue);
        }
        let key = bulletin
            .key()
            .map_err(|e| ExchangeError::InvalidBulletin(e.to_string()))?;
        let root = bulletin
            .root_u256()
            .map_err(|e| ExchangeError::InvalidBulletin(e.to_string()))?;
        if let Some(existing) = self.bulletins.get(&key) {
            if existing.status != BulletinStatus::Canceled {
                return Err(ExchangeError::AlreadyPublished(key));
            }
        }
        self.bulletins.insert(
            key,
            BulletinInfo {
                owner: caller,
                size: bulletin.size,
                s: bulletin.s,
                n: bulletin.n,
                sigma_mkl_root: root,
                vrf_digest,
                mode,
                stake,
                status: BulletinStatus::Ok,
                un_publish_at: 0,
            },
        );
        debug!(?key, owner = ?caller, %stake, "bulletin published");
        Ok(key)
    }

    fn owned_bulletin(&mut self, caller: Address, key: H256) -> ExchangeResult<&mut BulletinInfo> {
        let info = self
            .bulletins
            .get_mut(&key)
            .ok_or(ExchangeError::UnknownBulletin(key))?;
        if info.owner != caller {
            return Err(ExchangeError::NotOwner);
        }
        Ok(info)
    }

    pub fn un_publish(&mut self, caller: Address, key: H256, now: u64) -> ExchangeResult<()> {
        let info = self.owned_bulletin(caller, key)?;
        if info.status != BulletinStatus::Ok {
            return Err(ExchangeError::BulletinState {
                current: info.status,
                expected: BulletinStatus::Ok,
            });
        }
        info.status = BulletinStatus::Canceling;
        info.un_publish_at = now;
        Ok(())
    }

    /// Publisher withdraws the stake once the un-publish cooldown is over.
    pub fn withdraw_a(&mut self, caller: Address, key: H256, now: u64) -> ExchangeResult<U256> {
        let info = self.owned_bulletin(caller, key)?;
        if info.status != BulletinStatus::Canceling {
            return Err(ExchangeError::BulletinState {
                current: info.status,
                expected: BulletinStatus::Canceling,
            });
        }
        let ends = info.un_publish_at.saturating_add(UNPUBLISH_COOLDOWN.as_secs());
        if now < ends {
            return Err(ExchangeError::Cooldown {
                remaining: ends - now,
            });
        }
        let stake = std::mem::take(&mut info.stake);
        info.status = BulletinStatus::Canceled;
        self.credit(caller, stake);
        Ok(stake)
    }

    // -- deposits -----------------------------------------------------------

    pub fn bob_deposit(&mut self, buyer: Address, seller: Address, value: U256) -> ExchangeResult<()> {
        if value.is_zero() {
            return Err(ExchangeError::ZeroValue);
        }
        let deposit = self.deposits.entry((buyer, seller)).or_default();
        if deposit.stat == 1 {
            return Err(ExchangeError::Undepositing);
        }
        deposit.value = deposit.value.saturating_add(value);
        Ok(())
    }

    pub fn bob_un_deposit(&mut self, buyer: Address, seller: Address, now: u64) -> ExchangeResult<()> {
        let deposit = self.deposits.entry((buyer, seller)).or_default();
        if deposit.value.is_zero() {
            return Err(ExchangeError::ZeroValue);
        }
        if deposit.stat == 1 {
            return Err(ExchangeError::Undepositing);
        }
        deposit.stat = 1;
        deposit.un_deposit_at = now;
        Ok(())
    }

    /// Buyer withdraws the deposit once the un-deposit cooldown is over.
    pub fn withdraw_b(&mut self, buyer: Address, seller: Address, now: u64) -> ExchangeResult<U256> {
        let deposit = self.deposits.entry((buyer, seller)).or_default();
        if deposit.stat != 1 {
            return Err(ExchangeError::NotUndepositing);
        }
        let ends = deposit
            .un_deposit_at
            .saturating_add(UNDEPOSIT_COOLDOWN.as_secs());
        if now < ends {
            return Err(ExchangeError::Cooldown {
                remaining: ends - now,
            });
        }
        let value = deposit.value;
        *deposit = DepositInfo::default();
        self.credit(buyer, value);
        Ok(value)
    }

    // -- proofs -------------------------------------------------------------

    /// `submitProof*` for the flow of `proof.kind`, called by the seller.
    pub fn submit_proof(
        &mut self,
        seller: Address,
        proof: &ProofSubmission,
        now: u64,
    ) -> ExchangeResult<()> {
        if !proof.receipt.matches(&proof.kind) {
            return Err(ExchangeError::WrongFlow);
        }
        if proof.expire_at <= now as i64 {
            return Err(ExchangeError::Expired {
                expire_at: proof.expire_at,
            });
        }
        let digest = proof
            .receipt
            .signing_digest(proof.session_id, proof.buyer, proof.price, proof.expire_at)
            .map_err(|e| ExchangeError::InvalidReceipt(e.to_string()))?;
        verify_signer(digest, &proof.signature, proof.buyer)
            .map_err(|e| ExchangeError::BadSignature(e.to_string()))?;
        if matches!(proof.kind, TransactionKind::AtomicSwapVc { .. }) && proof.secret.rand.is_none() {
            return Err(ExchangeError::InvalidReceipt("missing blinding value".into()));
        }

        let flow = Flow::from(&proof.kind);
        let key = (flow, seller, proof.buyer, proof.session_id);
        if self.records.contains_key(&key) {
            return Err(ExchangeError::AlreadySubmitted(proof.session_id));
        }
        let price = U256::from(proof.price);
        let deposit = self.deposits.entry((proof.buyer, seller)).or_default();
        if deposit.value < price {
            return Err(ExchangeError::InsufficientDeposit {
                deposit: deposit.value,
                price,
            });
        }
        deposit.value -= price;

        self.records.insert(
            key,
            SessionRecord {
                submit_at: now,
                secret: Some(proof.secret),
                price,
                expire_at: proof.expire_at.max(0) as u64,
                claimed: false,
                settled: false,
            },
        );
        if flow == Flow::Complaint {
            self.held.insert(key, price);
        } else {
            self.credit(seller, price);
        }
        debug!(?flow, session = proof.session_id, %price, "proof accepted");
        Ok(())
    }

    // -- complaint dispute --------------------------------------------------

    pub fn claim_complaint(&mut self, buyer: Address, claim: &ComplaintClaim) -> ExchangeResult<()> {
        let key = (Flow::Complaint, claim.seller, buyer, claim.session_id);
        let record = self
            .records
            .get_mut(&key)
            .ok_or(ExchangeError::NoRecord(claim.session_id))?;
        if record.settled {
            return Err(ExchangeError::AlreadySettled(claim.session_id));
        }
        if record.claimed {
            return Err(ExchangeError::AlreadyClaimed(claim.session_id));
        }
        record.claimed = true;
        debug!(session = claim.session_id, index = claim.index, "complaint claimed");
        Ok(())
    }

    /// Release a complaint-flow payment. Either party may call it.
    pub fn settle_complaint_deal(
        &mut self,
        caller: Address,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> ExchangeResult<()> {
        if caller != seller && caller != buyer {
            return Err(ExchangeError::NotParty);
        }
        let key = (Flow::Complaint, seller, buyer, session_id);
        let record = self
            .records
            .get_mut(&key)
            .ok_or(ExchangeError::NoRecord(session_id))?;
        if record.settled {
            return Err(ExchangeError::AlreadySettled(session_id));
        }
        record.settled = true;
        let payee = if record.claimed { buyer } else { seller };
        let value = self.held.remove(&key).unwrap_or_default();
        self.credit(payee, value);
        Ok(())
    }

    // -- views --------------------------------------------------------------

    pub fn bulletin(&self, key: H256) -> Option<BulletinInfo> {
        self.bulletins.get(&key).cloned()
    }

    pub fn bob_deposit_of(&self, buyer: Address, seller: Address) -> DepositInfo {
        self.deposits
            .get(&(buyer, seller))
            .copied()
            .unwrap_or_default()
    }

    /// `getRecordComplaint` / `getRecordAtomicSwap` / `getRecordAtomicSwapVC`
    /// / `getRecordVRF`.
    pub fn record(&self, flow: Flow, seller: Address, buyer: Address, session_id: u64) -> SessionRecord {
        self.records
            .get(&(flow, seller, buyer, session_id))
            .copied()
            .unwrap_or_default()
    }

    pub fn balance(&self, who: Address) -> U256 {
        self.balances.get(&who).copied().unwrap_or_default()
    }
}
