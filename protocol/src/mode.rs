//! # Mode Registry
//!
//! A session runs in exactly one mode, described by the triple
//! `(TopMode, SubMode, ot)`. On the wire the triple travels as a single
//! byte. [`REGISTRY`] is the only place the mapping is written down; both
//! [`encode`] and [`decode`] read from it, so the two directions cannot
//! drift apart.
//!
//! ```text
//! code  mode   sub-mode        ot
//!  0    plain  batch1          no
//!  1    plain  batch1          yes
//!  2    plain  batch2          no
//!  3    table  batch1          no
//!  4    table  batch1          yes
//!  5    table  batch2          no
//!  6    table  vrf             no
//!  7    table  vrf             yes
//!  8    plain  complaint       no
//!  9    plain  complaint       yes
//! 10    plain  atomic_swap     no
//! 11    plain  atomic_swap_vc  no
//! 12    table  complaint       no
//! 13    table  complaint       yes
//! 14    table  atomic_swap     no
//! 15    table  atomic_swap_vc  no
//! ```
//!
//! Codes 0-7 are the original batch/VRF codes. `batch1` runs the complaint
//! flow and `batch2` the atomic-swap flow; the named sub-modes exist so
//! new sessions can say what they mean.
//!
//! Codes 8-15 extend that legacy set, so `decode(8)` is a plain complaint
//! session. Codes from 16 up are [`ModeError::InvalidCode`].
//!
//! After establishment the descriptor is collapsed into a
//! [`TransactionKind`], and every later layer branches on that.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("invalid wire mode code {0}")]
    InvalidCode(u8),

    #[error("invalid mode combination: {0}")]
    InvalidCombination(ModeDescriptor),

    #[error("unknown mode name: {0}")]
    UnknownName(String),
}

/// How the seller's data is shaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopMode {
    /// An opaque file cut into fixed-size chunks.
    Plain,
    /// A table of records that can be looked up by key.
    Table,
}

/// Which exchange protocol runs inside the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubMode {
    Batch1,
    Batch2,
    Vrf,
    Complaint,
    AtomicSwap,
    AtomicSwapVc,
}

/// The `(mode, sub-mode, oblivious transfer)` triple fixed at session creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeDescriptor {
    pub mode: TopMode,
    pub sub_mode: SubMode,
    pub ot: bool,
}

impl ModeDescriptor {
    pub const fn new(mode: TopMode, sub_mode: SubMode, ot: bool) -> Self {
        Self { mode, sub_mode, ot }
    }

    /// Whether the triple appears in [`REGISTRY`].
    pub fn is_legal(&self) -> bool {
        REGISTRY.iter().any(|(_, d)| d == self)
    }
}

impl fmt::Display for ModeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mode, self.sub_mode)?;
        if self.ot {
            write!(f, "/ot")?;
        }
        Ok(())
    }
}

use SubMode::*;
use TopMode::*;

/// The closed set of legal descriptors and their wire codes.
pub const REGISTRY: [(u8, ModeDescriptor); 16] = [
    (0, ModeDescriptor::new(Plain, Batch1, false)),
    (1, ModeDescriptor::new(Plain, Batch1, true)),
    (2, ModeDescriptor::new(Plain, Batch2, false)),
    (3, ModeDescriptor::new(Table, Batch1, false)),
    (4, ModeDescriptor::new(Table, Batch1, true)),
    (5, ModeDescriptor::new(Table, Batch2, false)),
    (6, ModeDescriptor::new(Table, Vrf, false)),
    (7, ModeDescriptor::new(Table, Vrf, true)),
    (8, ModeDescriptor::new(Plain, Complaint, false)),
    (9, ModeDescriptor::new(Plain, Complaint, true)),
    (10, ModeDescriptor::new(Plain, AtomicSwap, false)),
    (11, ModeDescriptor::new(Plain, AtomicSwapVc, false)),
    (12, ModeDescriptor::new(Table, Complaint, false)),
    (13, ModeDescriptor::new(Table, Complaint, true)),
    (14, ModeDescriptor::new(Table, AtomicSwap, false)),
    (15, ModeDescriptor::new(Table, AtomicSwapVc, false)),
];

/// Map a descriptor to its wire code.
pub fn encode(descriptor: ModeDescriptor) -> Result<u8, ModeError> {
    REGISTRY
        .iter()
        .find(|(_, d)| *d == descriptor)
        .map(|(code, _)| *code)
        .ok_or(ModeError::InvalidCombination(descriptor))
}

/// Map a wire code back to its descriptor.
pub fn decode(code: u8) -> Result<ModeDescriptor, ModeError> {
    REGISTRY
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
        .ok_or(ModeError::InvalidCode(code))
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

impl fmt::Display for TopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Plain => "plain",
            Table => "table",
        })
    }
}

impl FromStr for TopMode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Plain),
            "table" => Ok(Table),
            other => Err(ModeError::UnknownName(other.to_string())),
        }
    }
}

impl fmt::Display for SubMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Batch1 => "batch1",
            Batch2 => "batch2",
            Vrf => "vrf",
            Complaint => "complaint",
            AtomicSwap => "atomic_swap",
            AtomicSwapVc => "atomic_swap_vc",
        })
    }
}

impl FromStr for SubMode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch1" => Ok(Batch1),
            "batch2" => Ok(Batch2),
            "vrf" => Ok(Vrf),
            "complaint" => Ok(Complaint),
            "atomic_swap" => Ok(AtomicSwap),
            "atomic_swap_vc" => Ok(AtomicSwapVc),
            other => Err(ModeError::UnknownName(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction Kind
// ---------------------------------------------------------------------------

/// The exchange protocol a session runs, computed once at establishment.
///
/// Drivers, the escrow adapter and the record store all branch on this
/// value rather than on the raw descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Seed revealed on chain; the buyer may dispute a bad chunk.
    Complaint { mode: TopMode, ot: bool },
    /// Seed revealed on chain against a weighted commitment.
    AtomicSwap { mode: TopMode },
    /// Seed revealed on chain against a scalar commitment digest.
    AtomicSwapVc { mode: TopMode },
    /// Keyed lookup over a table with a VRF commitment.
    VrfQuery { ot: bool },
}

impl TransactionKind {
    pub fn top_mode(&self) -> TopMode {
        match self {
            TransactionKind::Complaint { mode, .. }
            | TransactionKind::AtomicSwap { mode }
            | TransactionKind::AtomicSwapVc { mode } => *mode,
            TransactionKind::VrfQuery { .. } => Table,
        }
    }

    pub fn ot(&self) -> bool {
        match self {
            TransactionKind::Complaint { ot, .. } | TransactionKind::VrfQuery { ot } => *ot,
            _ => false,
        }
    }

    /// Oblivious-transfer sessions agree on keys before the transfer.
    pub fn requires_negotiation(&self) -> bool {
        self.ot()
    }

    /// Only complaint sessions can be disputed on chain.
    pub fn supports_claim(&self) -> bool {
        matches!(self, TransactionKind::Complaint { .. })
    }

    /// Escrow contract function the seller calls to reveal the secret.
    pub fn submit_method(&self) -> &'static str {
        match self {
            TransactionKind::Complaint { .. } => "submitProofComplaint",
            TransactionKind::AtomicSwap { .. } => "submitProofAtomicSwap",
            TransactionKind::AtomicSwapVc { .. } => "submitProofAtomicSwapVC",
            TransactionKind::VrfQuery { .. } => "submitProofVRF",
        }
    }

    /// Escrow view function the buyer polls for the revealed secret.
    pub fn record_query(&self) -> &'static str {
        match self {
            TransactionKind::Complaint { .. } => "getRecordComplaint",
            TransactionKind::AtomicSwap { .. } => "getRecordAtomicSwap",
            TransactionKind::AtomicSwapVc { .. } => "getRecordAtomicSwapVC",
            TransactionKind::VrfQuery { .. } => "getRecordVRF",
        }
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TransactionKind::Complaint { ot: false, .. } => "complaint",
            TransactionKind::Complaint { ot: true, .. } => "complaint_ot",
            TransactionKind::AtomicSwap { .. } => "atomic_swap",
            TransactionKind::AtomicSwapVc { .. } => "atomic_swap_vc",
            TransactionKind::VrfQuery { ot: false } => "vrf",
            TransactionKind::VrfQuery { ot: true } => "vrf_ot",
        }
    }
}

impl TryFrom<ModeDescriptor> for TransactionKind {
    type Error = ModeError;

    fn try_from(d: ModeDescriptor) -> Result<Self, Self::Error> {
        if !d.is_legal() {
            return Err(ModeError::InvalidCombination(d));
        }
        Ok(match d.sub_mode {
            Batch1 | Complaint => TransactionKind::Complaint {
                mode: d.mode,
                ot: d.ot,
            },
            Batch2 | AtomicSwap => TransactionKind::AtomicSwap { mode: d.mode },
            AtomicSwapVc => TransactionKind::AtomicSwapVc { mode: d.mode },
            Vrf => TransactionKind::VrfQuery { ot: d.ot },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [TopMode; 2] = [Plain, Table];
    const ALL_SUBS: [SubMode; 6] = [Batch1, Batch2, Vrf, Complaint, AtomicSwap, AtomicSwapVc];

    #[test]
    fn every_registered_triple_round_trips() {
        for (code, descriptor) in REGISTRY {
            assert_eq!(encode(descriptor).unwrap(), code);
            assert_eq!(decode(code).unwrap(), descriptor);
        }
    }

    #[test]
    fn legacy_codes_keep_their_positions() {
        assert_eq!(encode(ModeDescriptor::new(Plain, Batch1, false)), Ok(0));
        assert_eq!(encode(ModeDescriptor::new(Plain, Batch1, true)), Ok(1));
        assert_eq!(encode(ModeDescriptor::new(Plain, Batch2, false)), Ok(2));
        assert_eq!(encode(ModeDescriptor::new(Table, Batch1, false)), Ok(3));
        assert_eq!(encode(ModeDescriptor::new(Table, Batch1, true)), Ok(4));
        assert_eq!(encode(ModeDescriptor::new(Table, Batch2, false)), Ok(5));
        assert_eq!(encode(ModeDescriptor::new(Table, Vrf, false)), Ok(6));
        assert_eq!(encode(ModeDescriptor::new(Table, Vrf, true)), Ok(7));
    }

    #[test]
    fn unregistered_codes_are_rejected() {
        for code in 0..=u8::MAX {
            let registered = REGISTRY.iter().any(|(c, _)| *c == code);
            assert_eq!(decode(code).is_ok(), registered, "code {code}");
        }
        assert_eq!(decode(16), Err(ModeError::InvalidCode(16)));
    }

    #[test]
    fn extended_codes_follow_the_legacy_eight() {
        assert_eq!(decode(7), Ok(ModeDescriptor::new(Table, Vrf, true)));
        assert_eq!(decode(8), Ok(ModeDescriptor::new(Plain, Complaint, false)));
        assert_eq!(decode(15), Ok(ModeDescriptor::new(Table, AtomicSwapVc, false)));
    }

    #[test]
    fn exhaustive_triples_are_a_bijection() {
        let mut seen = std::collections::HashSet::new();
        for mode in ALL_MODES {
            for sub in ALL_SUBS {
                for ot in [false, true] {
                    let d = ModeDescriptor::new(mode, sub, ot);
                    match encode(d) {
                        Ok(code) => {
                            assert!(seen.insert(code), "code {code} assigned twice");
                            assert_eq!(decode(code).unwrap(), d);
                        }
                        Err(e) => assert_eq!(e, ModeError::InvalidCombination(d)),
                    }
                }
            }
        }
        assert_eq!(seen.len(), REGISTRY.len());
    }

    #[test]
    fn vrf_on_plain_data_is_illegal() {
        let d = ModeDescriptor::new(Plain, Vrf, false);
        assert!(encode(d).is_err());
        assert!(TransactionKind::try_from(d).is_err());
        assert!(encode(ModeDescriptor::new(Plain, AtomicSwap, true)).is_err());
    }

    #[test]
    fn names_parse_back() {
        for sub in ALL_SUBS {
            assert_eq!(sub.to_string().parse::<SubMode>().unwrap(), sub);
        }
        for mode in ALL_MODES {
            assert_eq!(mode.to_string().parse::<TopMode>().unwrap(), mode);
        }
        assert!("vrf_query".parse::<SubMode>().is_err());
    }

    #[test]
    fn legacy_batches_collapse_to_named_flows() {
        let k = TransactionKind::try_from(ModeDescriptor::new(Plain, Batch1, true)).unwrap();
        assert_eq!(k, TransactionKind::Complaint { mode: Plain, ot: true });
        assert!(k.requires_negotiation());

        let k = TransactionKind::try_from(ModeDescriptor::new(Table, Batch2, false)).unwrap();
        assert_eq!(k, TransactionKind::AtomicSwap { mode: Table });
        assert!(!k.requires_negotiation());
        assert!(!k.supports_claim());
    }

    #[test]
    fn vrf_ot_requires_negotiation() {
        let k = TransactionKind::try_from(ModeDescriptor::new(Table, Vrf, true)).unwrap();
        assert_eq!(k, TransactionKind::VrfQuery { ot: true });
        assert!(k.requires_negotiation());
        assert_eq!(k.top_mode(), Table);
        assert_eq!(k.label(), "vrf_ot");
    }
}
