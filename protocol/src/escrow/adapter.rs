//! # Escrow Adapter
//!
//! Translates session state into escrow contract calls. Every proof
//! submission re-derives the receipt digest for its flow and checks the
//! buyer's signature locally first; an unverified signature never reaches
//! the chain.
//!
//! State-changing calls are not retried here. Read calls may be retried
//! by the caller (see [`LedgerError::is_read`]).

use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use tracing::{error, info, warn};

use super::ledger::{
    BulletinInfo, ComplaintClaim, DepositInfo, EscrowLedger, LedgerError, ProofSubmission,
    SessionRecord,
};
use crate::bulletin::{Bulletin, BulletinStatus};
use crate::crypto::signatures::verify_signer;
use crate::error::{PodError, PodResult};
use crate::mode::{TopMode, TransactionKind};
use crate::receipt::{ModeReceipt, ReceiptError, Secret};

/// A buyer's receipt with the terms and signature it was sent with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedReceipt {
    pub session_id: u64,
    pub buyer: Address,
    pub receipt: ModeReceipt,
    pub price: u64,
    pub expire_at: i64,
    pub signature: Vec<u8>,
}

/// Contract-facing operations for one node.
#[derive(Clone)]
pub struct Escrow {
    ledger: Arc<dyn EscrowLedger>,
}

fn logged(op: &'static str) -> impl FnOnce(LedgerError) -> PodError {
    move |e| {
        error!(op, error = %e, "contract call failed");
        PodError::ContractCall(e)
    }
}

impl Escrow {
    pub fn new(ledger: Arc<dyn EscrowLedger>) -> Self {
        Self { ledger }
    }

    /// Address this node sends transactions from.
    pub fn address(&self) -> Address {
        self.ledger.caller()
    }

    pub fn ledger(&self) -> &Arc<dyn EscrowLedger> {
        &self.ledger
    }

    // -- publisher ----------------------------------------------------------

    pub async fn publish(
        &self,
        bulletin: &Bulletin,
        mode: TopMode,
        vrf_digest: U256,
        stake: U256,
    ) -> PodResult<H256> {
        let key = bulletin
            .key()
            .map_err(|e| PodError::Verification(e.to_string()))?;
        let tx = self
            .ledger
            .publish(bulletin, mode, vrf_digest, stake)
            .await
            .map_err(logged("publish"))?;
        info!(bulletin_key = ?key, tx = ?tx, %stake, "bulletin published");
        Ok(tx)
    }

    /// Request un-publishing. The flag reports whether the contract now
    /// shows the bulletin as canceling or canceled.
    pub async fn close(&self, key: H256) -> PodResult<(H256, bool)> {
        let tx = self
            .ledger
            .un_publish(key)
            .await
            .map_err(logged("unPublish"))?;
        let status = self.read_status(key).await?;
        let ok = matches!(status, BulletinStatus::Canceling | BulletinStatus::Canceled);
        info!(bulletin_key = ?key, tx = ?tx, %status, "bulletin close requested");
        Ok((tx, ok))
    }

    pub async fn read_status(&self, key: H256) -> PodResult<BulletinStatus> {
        Ok(self
            .bulletin_info(key)
            .await?
            .map(|b| b.status)
            .unwrap_or(BulletinStatus::Unknown))
    }

    pub async fn bulletin_info(&self, key: H256) -> PodResult<Option<BulletinInfo>> {
        self.ledger
            .bulletin(key)
            .await
            .map_err(logged("bulletins"))
    }

    pub async fn withdraw_publisher_stake(&self, key: H256) -> PodResult<H256> {
        let tx = self
            .ledger
            .withdraw_a(key)
            .await
            .map_err(logged("withdrawA"))?;
        info!(bulletin_key = ?key, tx = ?tx, "publisher stake withdrawn");
        Ok(tx)
    }

    // -- buyer deposits -----------------------------------------------------

    pub async fn deposit_buyer_stake(&self, amount: U256, seller: Address) -> PodResult<H256> {
        let tx = self
            .ledger
            .bob_deposit(seller, amount)
            .await
            .map_err(logged("bobDeposit"))?;
        info!(?seller, %amount, tx = ?tx, "buyer deposit");
        Ok(tx)
    }

    pub async fn undeposit_buyer_stake(&self, seller: Address) -> PodResult<H256> {
        let tx = self
            .ledger
            .bob_un_deposit(seller)
            .await
            .map_err(logged("bobUnDeposit"))?;
        info!(?seller, tx = ?tx, "buyer un-deposit requested");
        Ok(tx)
    }

    /// Withdraw the deposit after the cooldown. The flag reports whether
    /// the contract now shows it empty.
    pub async fn withdraw_buyer_stake(&self, seller: Address) -> PodResult<(H256, bool)> {
        let tx = self
            .ledger
            .withdraw_b(seller)
            .await
            .map_err(logged("withdrawB"))?;
        let left = self.deposit_of(self.address(), seller).await?;
        info!(?seller, tx = ?tx, remaining = %left.value, "buyer deposit withdrawn");
        Ok((tx, left.value.is_zero()))
    }

    pub async fn deposit_of(&self, buyer: Address, seller: Address) -> PodResult<DepositInfo> {
        self.ledger
            .bob_deposit_of(buyer, seller)
            .await
            .map_err(logged("bobDeposits"))
    }

    pub async fn balance(&self, who: Address) -> PodResult<U256> {
        self.ledger.balance(who).await.map_err(logged("balance"))
    }

    // -- proofs -------------------------------------------------------------

    pub async fn submit_proof_complaint(
        &self,
        kind: &TransactionKind,
        signed: &SignedReceipt,
        secret: &Secret,
    ) -> PodResult<H256> {
        self.expect_kind(kind, matches!(kind, TransactionKind::Complaint { .. }))?;
        self.submit(kind, signed, secret).await
    }

    pub async fn submit_proof_atomic_swap(
        &self,
        kind: &TransactionKind,
        signed: &SignedReceipt,
        secret: &Secret,
    ) -> PodResult<H256> {
        self.expect_kind(kind, matches!(kind, TransactionKind::AtomicSwap { .. }))?;
        self.submit(kind, signed, secret).await
    }

    pub async fn submit_proof_atomic_swap_vc(
        &self,
        kind: &TransactionKind,
        signed: &SignedReceipt,
        secret: &Secret,
    ) -> PodResult<H256> {
        self.expect_kind(kind, matches!(kind, TransactionKind::AtomicSwapVc { .. }))?;
        if secret.rand.is_none() {
            return Err(PodError::Verification(
                "atomic swap vc secret carries no blinding value".into(),
            ));
        }
        self.submit(kind, signed, secret).await
    }

    pub async fn submit_proof_vrf(
        &self,
        kind: &TransactionKind,
        signed: &SignedReceipt,
        secret: &Secret,
    ) -> PodResult<H256> {
        self.expect_kind(kind, matches!(kind, TransactionKind::VrfQuery { .. }))?;
        self.submit(kind, signed, secret).await
    }

    /// Dispatch to the submit call of `kind`'s flow.
    pub async fn submit_proof(
        &self,
        kind: &TransactionKind,
        signed: &SignedReceipt,
        secret: &Secret,
    ) -> PodResult<H256> {
        match kind {
            TransactionKind::Complaint { .. } => {
                self.submit_proof_complaint(kind, signed, secret).await
            }
            TransactionKind::AtomicSwap { .. } => {
                self.submit_proof_atomic_swap(kind, signed, secret).await
            }
            TransactionKind::AtomicSwapVc { .. } => {
                self.submit_proof_atomic_swap_vc(kind, signed, secret).await
            }
            TransactionKind::VrfQuery { .. } => self.submit_proof_vrf(kind, signed, secret).await,
        }
    }

    fn expect_kind(&self, kind: &TransactionKind, ok: bool) -> PodResult<()> {
        if ok {
            Ok(())
        } else {
            Err(PodError::ProtocolViolation(format!(
                "{} session routed to the wrong proof call",
                kind.label()
            )))
        }
    }

    async fn submit(
        &self,
        kind: &TransactionKind,
        signed: &SignedReceipt,
        secret: &Secret,
    ) -> PodResult<H256> {
        if !signed.receipt.matches(kind) {
            return Err(ReceiptError::WrongKind {
                expected: kind.label(),
                got: signed.receipt.label(),
            }
            .into());
        }
        let digest = signed.receipt.signing_digest(
            signed.session_id,
            signed.buyer,
            signed.price,
            signed.expire_at,
        )?;
        if let Err(e) = verify_signer(digest, &signed.signature, signed.buyer) {
            warn!(session = %format!("{:x}", signed.session_id), error = %e, "refusing to submit proof");
            return Err(e.into());
        }

        let proof = ProofSubmission {
            kind: *kind,
            session_id: signed.session_id,
            buyer: signed.buyer,
            receipt: signed.receipt.clone(),
            secret: *secret,
            price: signed.price,
            expire_at: signed.expire_at,
            signature: signed.signature.clone(),
        };
        let tx = self
            .ledger
            .submit_proof(&proof)
            .await
            .map_err(logged(kind.submit_method()))?;
        info!(
            session = %format!("{:x}", signed.session_id),
            method = kind.submit_method(),
            tx = ?tx,
            "proof submitted"
        );
        Ok(tx)
    }

    // -- complaint dispute --------------------------------------------------

    pub async fn claim_complaint(&self, claim: &ComplaintClaim) -> PodResult<H256> {
        let tx = self
            .ledger
            .claim_complaint(claim)
            .await
            .map_err(logged("claimComplaint"))?;
        info!(session = %format!("{:x}", claim.session_id), index = claim.index, tx = ?tx, "complaint claimed");
        Ok(tx)
    }

    pub async fn settle_complaint_deal(
        &self,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> PodResult<H256> {
        let tx = self
            .ledger
            .settle_complaint_deal(seller, buyer, session_id)
            .await
            .map_err(logged("settleComplaintDeal"))?;
        info!(session = %format!("{session_id:x}"), tx = ?tx, "complaint deal settled");
        Ok(tx)
    }

    pub async fn session_record(
        &self,
        kind: &TransactionKind,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> PodResult<SessionRecord> {
        self.ledger
            .session_record(kind, seller, buyer, session_id)
            .await
            .map_err(logged(kind.record_query()))
    }
}
