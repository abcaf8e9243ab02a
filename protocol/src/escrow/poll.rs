//! Bounded polling for a secret revealed on chain.

use ethers::types::Address;
use tracing::{debug, info, warn};

use super::ledger::EscrowLedger;
use crate::config::RetryPolicy;
use crate::mode::TransactionKind;
use crate::receipt::Secret;

/// Result of polling the contract for a session's secret.
///
/// `NotAvailable` is not an error: the seller may still submit, and the
/// caller decides whether to poll again later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretOutcome {
    Revealed(Secret),
    NotAvailable { attempts: u32 },
}

/// Read the session record until a proof shows up or `policy` runs out.
///
/// Read failures count as misses. Sleeps use `tokio::time`, so the whole
/// loop is cancelled by dropping the future.
pub async fn poll_secret(
    ledger: &dyn EscrowLedger,
    kind: &TransactionKind,
    seller: Address,
    buyer: Address,
    session_id: u64,
    policy: &RetryPolicy,
) -> SecretOutcome {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match ledger.session_record(kind, seller, buyer, session_id).await {
            Ok(record) if record.submit_at != 0 => {
                if let Some(secret) = record.secret {
                    info!(session = %format!("{session_id:x}"), attempt, "secret revealed on chain");
                    return SecretOutcome::Revealed(secret);
                }
                warn!(session = %format!("{session_id:x}"), "record submitted without a secret");
            }
            Ok(_) => debug!(session = %format!("{session_id:x}"), attempt, "secret not yet submitted"),
            Err(e) => warn!(session = %format!("{session_id:x}"), attempt, error = %e, "record read failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }
    SecretOutcome::NotAvailable { attempts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::testing::ScriptedLedger;
    use crate::mode::TopMode;
    use ethers::types::H256;
    use std::time::Duration;

    const KIND: TransactionKind = TransactionKind::Complaint {
        mode: TopMode::Plain,
        ot: false,
    };

    #[tokio::test(start_paused = true)]
    async fn secret_on_the_twentieth_check_is_found() {
        let ledger = ScriptedLedger::revealing_after(19, H256::repeat_byte(7));
        let start = tokio::time::Instant::now();
        let outcome = poll_secret(
            &ledger,
            &KIND,
            Address::zero(),
            Address::zero(),
            1,
            &RetryPolicy::default(),
        )
        .await;
        assert_eq!(
            outcome,
            SecretOutcome::Revealed(Secret::new(H256::repeat_byte(7)))
        );
        assert_eq!(ledger.reads(), 20);
        assert_eq!(start.elapsed(), Duration::from_secs(19 * 30));
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_misses_is_not_available() {
        let ledger = ScriptedLedger::revealing_after(u32::MAX, H256::zero());
        let outcome = poll_secret(
            &ledger,
            &KIND,
            Address::zero(),
            Address::zero(),
            1,
            &RetryPolicy::default(),
        )
        .await;
        assert_eq!(outcome, SecretOutcome::NotAvailable { attempts: 20 });
        assert_eq!(ledger.reads(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_count_as_misses() {
        let ledger = ScriptedLedger::revealing_after(3, H256::repeat_byte(1)).failing_reads(2);
        let outcome = poll_secret(
            &ledger,
            &KIND,
            Address::zero(),
            Address::zero(),
            1,
            &RetryPolicy::fixed(5, Duration::from_secs(1)),
        )
        .await;
        assert!(matches!(outcome, SecretOutcome::Revealed(_)));
        assert_eq!(ledger.reads(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempt_policy_still_checks_once() {
        let ledger = ScriptedLedger::revealing_after(0, H256::repeat_byte(2));
        let outcome = poll_secret(
            &ledger,
            &KIND,
            Address::zero(),
            Address::zero(),
            1,
            &RetryPolicy::fixed(0, Duration::from_secs(1)),
        )
        .await;
        assert!(matches!(outcome, SecretOutcome::Revealed(_)));
    }
}
