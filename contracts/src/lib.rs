// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PoD Exchange Contract Model
//!
//! Off-chain, executable model of the escrow contract that PoD sellers
//! and buyers settle through:
//!
//! - **Exchange**: bulletin stakes, buyer deposits, proof submission and
//!   the complaint dispute, with the contract's checks and cooldowns.
//! - **Memory ledger**: an in-process devnet exposing the model through
//!   the protocol's `EscrowLedger` trait, one handle per caller address.
//!
//! ## Design Principles
//!
//! 1. Value never goes negative: deductions check the deposit first and
//!    credits saturate.
//! 2. Every state change takes the block time as an argument, so
//!    cooldowns are testable without waiting.
//! 3. A failed call leaves the state untouched, like a reverted
//!    transaction.

pub mod exchange;
pub mod memory_ledger;

pub use exchange::{ExchangeError, Flow, PodExchange};
pub use memory_ledger::{Devnet, MemoryLedger};
