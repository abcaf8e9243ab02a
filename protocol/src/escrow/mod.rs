//! # Escrow Interaction
//!
//! ```text
//! ledger.rs:  EscrowLedger trait: the contract's call surface
//! adapter.rs: Escrow: session state → contract calls, with receipt checks
//! deposit.rs: buyer deposit admission and provisional locks
//! poll.rs:    bounded polling for a revealed secret
//! ```

pub mod adapter;
pub mod deposit;
pub mod ledger;
pub mod poll;

pub use adapter::{Escrow, SignedReceipt};
pub use deposit::{calcu_deposit, check_deposit, DepositError, DepositLease, DepositLocks};
pub use ledger::{
    BulletinInfo, ComplaintClaim, DepositInfo, EscrowLedger, LedgerError, LedgerResult,
    ProofSubmission, SessionRecord,
};
pub use poll::{poll_secret, SecretOutcome};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use ethers::types::{Address, H256, U256};

    use super::ledger::*;
    use crate::bulletin::Bulletin;
    use crate::mode::{TopMode, TransactionKind};
    use crate::receipt::Secret;

    /// Ledger whose session record turns up after a fixed number of reads.
    #[derive(Default)]
    pub struct ScriptedLedger {
        misses: u32,
        failing: u32,
        deposit: u64,
        seed: H256,
        reads: AtomicU32,
        submissions: AtomicU32,
    }

    impl ScriptedLedger {
        pub fn revealing_after(misses: u32, seed: H256) -> Self {
            Self {
                misses,
                seed,
                ..Self::default()
            }
        }

        pub fn failing_reads(mut self, n: u32) -> Self {
            self.failing = n;
            self
        }

        pub fn with_deposit(mut self, value: u64) -> Self {
            self.deposit = value;
            self
        }

        pub fn reads(&self) -> u32 {
            self.reads.load(Ordering::SeqCst)
        }

        pub fn submissions(&self) -> u32 {
            self.submissions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EscrowLedger for ScriptedLedger {
        fn caller(&self) -> Address {
            Address::repeat_byte(0xee)
        }

        async fn publish(&self, _: &Bulletin, _: TopMode, _: U256, _: U256) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn un_publish(&self, _: H256) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn withdraw_a(&self, _: H256) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn bob_deposit(&self, _: Address, _: U256) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn bob_un_deposit(&self, _: Address) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn withdraw_b(&self, _: Address) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn submit_proof(&self, _: &ProofSubmission) -> LedgerResult<H256> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            Ok(H256::random())
        }

        async fn claim_complaint(&self, _: &ComplaintClaim) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn settle_complaint_deal(&self, _: Address, _: Address, _: u64) -> LedgerResult<H256> {
            Ok(H256::random())
        }

        async fn bulletin(&self, _: H256) -> LedgerResult<Option<BulletinInfo>> {
            Ok(None)
        }

        async fn bob_deposit_of(&self, _: Address, _: Address) -> LedgerResult<DepositInfo> {
            Ok(DepositInfo {
                value: U256::from(self.deposit),
                ..DepositInfo::default()
            })
        }

        async fn session_record(
            &self,
            _: &TransactionKind,
            _: Address,
            _: Address,
            _: u64,
        ) -> LedgerResult<SessionRecord> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failing {
                return Err(LedgerError::Read("node unavailable".into()));
            }
            if n <= self.misses {
                return Ok(SessionRecord::default());
            }
            Ok(SessionRecord {
                submit_at: 1,
                secret: Some(Secret::new(self.seed)),
                ..SessionRecord::default()
            })
        }

        async fn balance(&self, _: Address) -> LedgerResult<U256> {
            Ok(U256::zero())
        }
    }
}
