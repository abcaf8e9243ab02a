//! # Protocol Configuration & Constants
//!
//! Every magic number of the PoD protocol lives here, together with the
//! [`RetryPolicy`] that bounds how long a buyer waits for a secret to
//! appear on chain.
//!
//! The polling defaults (20 attempts, 30 seconds apart) and the 8-hour
//! un-deposit cooldown mirror what the escrow contract enforces. Changing
//! them locally does not change the contract; it only changes how patient
//! this process is.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The full protocol version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire protocol version. Bumped when message layouts change.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Recoverable ECDSA signature length: `r ‖ s ‖ v`.
pub const SIGNATURE_LENGTH: usize = 65;

/// Keccak-256 digest length.
pub const HASH_OUTPUT_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Wire Limits
// ---------------------------------------------------------------------------

/// Largest single frame accepted from a peer. Bulk payloads are chunked
/// well below this, so anything bigger is a misbehaving peer.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Chunk size used when streaming request/response scratch files.
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a single transfer payload (request or response file).
pub const MAX_TRANSFER_LENGTH: u64 = 4 * 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Default number of on-chain secret lookups before giving up.
pub const SECRET_POLL_ATTEMPTS: u32 = 20;

/// Default pause between two on-chain secret lookups.
pub const SECRET_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Window after `bobUnDeposit` during which the deposit is frozen.
pub const UNDEPOSIT_COOLDOWN: Duration = Duration::from_secs(8 * 60 * 60);

/// Window after `unPublish` before the publisher may withdraw its stake.
pub const UNPUBLISH_COOLDOWN: Duration = Duration::from_secs(8 * 60 * 60);

/// How long a receipt stays valid after the buyer signs it.
pub const RECEIPT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default port for the seller's session listener.
pub const DEFAULT_P2P_PORT: u16 = 9840;

/// Default port for the HTTP API.
pub const DEFAULT_API_PORT: u16 = 9841;

/// Default port for Prometheus metrics.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Bounded retry schedule for reading a revealed secret from the contract.
///
/// The default is 20 attempts spaced 30 seconds apart with no backoff.
/// `backoff` multiplies the interval after every miss; `1.0` keeps it flat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of lookups, including the first one.
    pub max_attempts: u32,
    /// Pause after the first miss.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Interval multiplier applied after every miss.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: SECRET_POLL_ATTEMPTS,
            interval: SECRET_POLL_INTERVAL,
            backoff: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A flat policy with the given attempt count and interval.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: 1.0,
        }
    }

    /// The pause to take after the `miss`-th consecutive miss (1-based).
    pub fn delay_after(&self, miss: u32) -> Duration {
        let exponent = miss.saturating_sub(1) as i32;
        let factor = if self.backoff > 1.0 {
            self.backoff.powi(exponent)
        } else {
            1.0
        };
        self.interval.mul_f64(factor)
    }

    /// Worst-case time spent sleeping before the policy gives up.
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|miss| self.delay_after(miss)).sum()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
