//! Buyer deposit admission.
//!
//! Before serving a request the seller provisionally locks the price
//! against the buyer's on-chain deposit. Locks are process-local and only
//! keep concurrent sessions from the same buyer from overcommitting the
//! same deposit; the contract remains the authority and is re-read for
//! every admission.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::{Address, U256};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use super::ledger::DepositInfo;
use crate::config::UNDEPOSIT_COOLDOWN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DepositError {
    #[error("deposit is being withdrawn")]
    Undepositing,

    #[error("un-deposit cooldown active for another {remaining}s")]
    Cooldown { remaining: u64 },

    #[error("requested {requested} plus locked {locked} exceeds deposit {deposit}")]
    Insufficient {
        requested: U256,
        locked: U256,
        deposit: U256,
    },
}

/// Admit `requested` against `info` given `locked` already committed for
/// the same pair.
pub fn calcu_deposit(info: &DepositInfo, requested: U256, locked: U256) -> Result<(), DepositError> {
    if info.stat == 1 {
        return Err(DepositError::Undepositing);
    }
    let total = requested.saturating_add(locked);
    if total > info.value {
        return Err(DepositError::Insufficient {
            requested,
            locked,
            deposit: info.value,
        });
    }
    Ok(())
}

/// Reject deposits inside the un-deposit cooldown window at `now`.
pub fn check_deposit(info: &DepositInfo, now: u64) -> Result<(), DepositError> {
    if info.stat == 1 {
        let ends = info.un_deposit_at.saturating_add(UNDEPOSIT_COOLDOWN.as_secs());
        if now < ends {
            return Err(DepositError::Cooldown {
                remaining: ends - now,
            });
        }
    }
    Ok(())
}

type Pair = (Address, Address);

/// Provisionally locked value per `(seller, buyer)` pair.
#[derive(Debug, Default)]
pub struct DepositLocks {
    locked: Mutex<HashMap<Pair, U256>>,
}

impl DepositLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn locked(&self, seller: Address, buyer: Address) -> U256 {
        self.locked
            .lock()
            .get(&(seller, buyer))
            .copied()
            .unwrap_or_default()
    }

    /// Check and lock `requested` in one step. The lock is released when
    /// the returned lease drops.
    pub fn lock(
        self: &Arc<Self>,
        seller: Address,
        buyer: Address,
        info: &DepositInfo,
        requested: U256,
        now: u64,
    ) -> Result<DepositLease, DepositError> {
        check_deposit(info, now)?;
        let mut map = self.locked.lock();
        let current = map.get(&(seller, buyer)).copied().unwrap_or_default();
        calcu_deposit(info, requested, current)?;
        map.insert((seller, buyer), current + requested);
        debug!(?seller, ?buyer, %requested, locked = %(current + requested), "deposit locked");
        Ok(DepositLease {
            locks: Arc::clone(self),
            seller,
            buyer,
            value: requested,
        })
    }

    fn release(&self, seller: Address, buyer: Address, value: U256) {
        let mut map = self.locked.lock();
        if let Some(current) = map.get_mut(&(seller, buyer)) {
            *current = current.saturating_sub(value);
            if current.is_zero() {
                map.remove(&(seller, buyer));
            }
        }
    }
}

/// A held deposit lock.
#[derive(Debug)]
pub struct DepositLease {
    locks: Arc<DepositLocks>,
    seller: Address,
    buyer: Address,
    value: U256,
}

impl DepositLease {
    pub fn value(&self) -> U256 {
        self.value
    }
}

impl Drop for DepositLease {
    fn drop(&mut self) {
        self.locks.release(self.seller, self.buyer, self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit(value: u64) -> DepositInfo {
        DepositInfo {
            value: U256::from(value),
            stat: 0,
            un_deposit_at: 0,
        }
    }

    #[test]
    fn admits_up_to_the_deposit() {
        let info = deposit(100);
        assert!(calcu_deposit(&info, U256::from(60), U256::from(40)).is_ok());
        assert!(matches!(
            calcu_deposit(&info, U256::from(61), U256::from(40)),
            Err(DepositError::Insufficient { .. })
        ));
    }

    #[test]
    fn undepositing_rejects_everything() {
        let mut info = deposit(1_000);
        info.stat = 1;
        assert_eq!(
            calcu_deposit(&info, U256::zero(), U256::zero()),
            Err(DepositError::Undepositing)
        );
    }

    #[test]
    fn cooldown_window_is_eight_hours() {
        let info = DepositInfo {
            value: U256::from(10),
            stat: 1,
            un_deposit_at: 1_000,
        };
        assert_eq!(
            check_deposit(&info, 1_000 + 60),
            Err(DepositError::Cooldown {
                remaining: 28_800 - 60
            })
        );
        assert!(check_deposit(&info, 1_000 + 28_800).is_ok());
        assert!(check_deposit(&deposit(10), 0).is_ok());
    }

    #[test]
    fn repeated_locks_never_exceed_the_deposit() {
        let locks = DepositLocks::new();
        let (seller, buyer) = (Address::repeat_byte(1), Address::repeat_byte(2));
        let info = deposit(100);
        let mut leases = Vec::new();
        for _ in 0..10 {
            if let Ok(lease) = locks.lock(seller, buyer, &info, U256::from(30), 0) {
                leases.push(lease);
            }
            assert!(locks.locked(seller, buyer) <= info.value);
        }
        assert_eq!(leases.len(), 3);
        assert_eq!(locks.locked(seller, buyer), U256::from(90));
    }

    #[test]
    fn dropping_a_lease_releases_it() {
        let locks = DepositLocks::new();
        let (seller, buyer) = (Address::repeat_byte(1), Address::repeat_byte(2));
        let info = deposit(50);
        {
            let _a = locks.lock(seller, buyer, &info, U256::from(50), 0).unwrap();
            assert!(locks.lock(seller, buyer, &info, U256::from(1), 0).is_err());
        }
        assert!(locks.locked(seller, buyer).is_zero());
        assert!(locks.lock(seller, buyer, &info, U256::from(50), 0).is_ok());
    }

    #[test]
    fn pairs_are_independent() {
        let locks = DepositLocks::new();
        let info = deposit(10);
        let buyer = Address::repeat_byte(9);
        let _a = locks
            .lock(Address::repeat_byte(1), buyer, &info, U256::from(10), 0)
            .unwrap();
        assert!(locks
            .lock(Address::repeat_byte(2), buyer, &info, U256::from(10), 0)
            .is_ok());
    }
}
