//! # In-Process Devnet
//!
//! A [`Devnet`] hosts one [`PodExchange`] behind a mutex and hands out
//! [`MemoryLedger`] handles, one per caller address. Handles implement
//! [`EscrowLedger`], so sellers and buyers can run against the model
//! exactly as they would against a node.
//!
//! The clock is either the system clock or a manual one that tests move
//! with [`Devnet::advance`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use parking_lot::Mutex;
use tracing::trace;

use pod_protocol::bulletin::Bulletin;
use pod_protocol::crypto::keccak256;
use pod_protocol::escrow::{
    BulletinInfo, ComplaintClaim, DepositInfo, EscrowLedger, LedgerError, LedgerResult,
    ProofSubmission, SessionRecord,
};
use pod_protocol::mode::{TopMode, TransactionKind};

use crate::exchange::{ExchangeError, Flow, PodExchange};

#[derive(Debug, Clone)]
enum Clock {
    System,
    Manual(Arc<AtomicU64>),
}

#[derive(Debug, Clone)]
pub struct Devnet {
    exchange: Arc<Mutex<PodExchange>>,
    clock: Clock,
    nonce: Arc<AtomicU64>,
}

impl Default for Devnet {
    fn default() -> Self {
        Self::new()
    }
}

impl Devnet {
    /// Devnet on the system clock.
    pub fn new() -> Self {
        Self {
            exchange: Arc::new(Mutex::new(PodExchange::new())),
            clock: Clock::System,
            nonce: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Devnet whose clock starts at `start` and only moves on
    /// [`advance`](Self::advance).
    pub fn with_manual_clock(start: u64) -> Self {
        Self {
            clock: Clock::Manual(Arc::new(AtomicU64::new(start))),
            ..Self::new()
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, secs: u64) {
        if let Clock::Manual(now) = &self.clock {
            now.fetch_add(secs, Ordering::SeqCst);
        }
    }

    pub fn now(&self) -> u64 {
        match &self.clock {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            Clock::Manual(now) => now.load(Ordering::SeqCst),
        }
    }

    /// A ledger handle sending transactions from `caller`.
    pub fn ledger(&self, caller: Address) -> MemoryLedger {
        MemoryLedger {
            devnet: self.clone(),
            caller,
        }
    }

    /// Read contract state directly.
    pub fn inspect<R>(&self, f: impl FnOnce(&PodExchange) -> R) -> R {
        f(&self.exchange.lock())
    }

    fn transact(
        &self,
        method: &'static str,
        f: impl FnOnce(&mut PodExchange, u64) -> Result<(), ExchangeError>,
    ) -> LedgerResult<H256> {
        let now = self.now();
        let mut exchange = self.exchange.lock();
        f(&mut exchange, now).map_err(|e| LedgerError::Reverted(format!("{method}: {e}")))?;
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let tx = H256(keccak256(nonce.to_be_bytes()));
        trace!(method, ?tx, "devnet transaction");
        Ok(tx)
    }
}

/// [`EscrowLedger`] over a [`Devnet`].
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    devnet: Devnet,
    caller: Address,
}

impl MemoryLedger {
    pub fn devnet(&self) -> &Devnet {
        &self.devnet
    }
}

#[async_trait]
impl EscrowLedger for MemoryLedger {
    fn caller(&self) -> Address {
        self.caller
    }

    async fn publish(
        &self,
        bulletin: &Bulletin,
        mode: TopMode,
        vrf_digest: U256,
        stake: U256,
    ) -> LedgerResult<H256> {
        self.devnet.transact("publish", |ex, _| {
            ex.publish(self.caller, bulletin, mode, vrf_digest, stake)
                .map(|_| ())
        })
    }

    async fn un_publish(&self, key: H256) -> LedgerResult<H256> {
        self.devnet
            .transact("unPublish", |ex, now| ex.un_publish(self.caller, key, now))
    }

    async fn withdraw_a(&self, key: H256) -> LedgerResult<H256> {
        self.devnet.transact("withdrawA", |ex, now| {
            ex.withdraw_a(self.caller, key, now).map(|_| ())
        })
    }

    async fn bob_deposit(&self, seller: Address, value: U256) -> LedgerResult<H256> {
        self.devnet.transact("bobDeposit", |ex, _| {
            ex.bob_deposit(self.caller, seller, value)
        })
    }

    async fn bob_un_deposit(&self, seller: Address) -> LedgerResult<H256> {
        self.devnet.transact("bobUnDeposit", |ex, now| {
            ex.bob_un_deposit(self.caller, seller, now)
        })
    }

    async fn withdraw_b(&self, seller: Address) -> LedgerResult<H256> {
        self.devnet.transact("withdrawB", |ex, now| {
            ex.withdraw_b(self.caller, seller, now).map(|_| ())
        })
    }

    async fn submit_proof(&self, proof: &ProofSubmission) -> LedgerResult<H256> {
        self.devnet.transact(proof.kind.submit_method(), |ex, now| {
            ex.submit_proof(self.caller, proof, now)
        })
    }

    async fn claim_complaint(&self, claim: &ComplaintClaim) -> LedgerResult<H256> {
        self.devnet.transact("claimComplaint", |ex, _| {
            ex.claim_complaint(self.caller, claim)
        })
    }

    async fn settle_complaint_deal(
        &self,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> LedgerResult<H256> {
        self.devnet.transact("settleComplaintDeal", |ex, _| {
            ex.settle_complaint_deal(self.caller, seller, buyer, session_id)
        })
    }

    async fn bulletin(&self, key: H256) -> LedgerResult<Option<BulletinInfo>> {
        Ok(self.devnet.inspect(|ex| ex.bulletin(key)))
    }

    async fn bob_deposit_of(&self, buyer: Address, seller: Address) -> LedgerResult<DepositInfo> {
        Ok(self.devnet.inspect(|ex| ex.bob_deposit_of(buyer, seller)))
    }

    async fn session_record(
        &self,
        kind: &TransactionKind,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> LedgerResult<SessionRecord> {
        let flow = Flow::from(kind);
        Ok(self
            .devnet
            .inspect(|ex| ex.record(flow, seller, buyer, session_id)))
    }

    async fn balance(&self, who: Address) -> LedgerResult<U256> {
        Ok(self.devnet.inspect(|ex| ex.balance(who)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handles_share_state_and_revert_cleanly() {
        let devnet = Devnet::with_manual_clock(1_000);
        let (seller, buyer) = (Address::repeat_byte(1), Address::repeat_byte(2));
        let bob = devnet.ledger(buyer);
        let alice = devnet.ledger(seller);

        let tx1 = bob.bob_deposit(seller, U256::from(10)).await.unwrap();
        let tx2 = bob.bob_deposit(seller, U256::from(5)).await.unwrap();
        assert_ne!(tx1, tx2);
        assert_eq!(
            alice.bob_deposit_of(buyer, seller).await.unwrap().value,
            U256::from(15)
        );

        bob.bob_un_deposit(seller).await.unwrap();
        let err = bob.withdraw_b(seller).await.unwrap_err();
        assert!(matches!(err, LedgerError::Reverted(ref m) if m.starts_with("withdrawB")));

        devnet.advance(8 * 3600);
        bob.withdraw_b(seller).await.unwrap();
        assert_eq!(bob.balance(buyer).await.unwrap(), U256::from(15));
    }

    #[test]
    fn manual_clock_moves_only_on_advance() {
        let devnet = Devnet::with_manual_clock(50);
        assert_eq!(devnet.now(), 50);
        devnet.advance(10);
        assert_eq!(devnet.now(), 60);
        assert!(Devnet::new().now() > 1_600_000_000);
    }
}
