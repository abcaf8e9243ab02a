//! # Cryptographic Helpers
//!
//! Thin wrappers over the Ethereum primitives the escrow contract speaks:
//!
//! - **Keccak-256** and Solidity-style packed encoding, for bulletin keys
//!   and receipt digests.
//! - **Recoverable ECDSA (secp256k1)**, for receipt signatures that must
//!   recover to the buyer's address.
//! - **Keccak Merkle trees**, for the data commitment a bulletin carries.
//! - **Key loading**, for the wallet each node signs with.
//!
//! Everything here delegates to `ethers`; nothing is hand-rolled beyond
//! byte layout.

pub mod hash;
pub mod keys;
pub mod merkle;
pub mod signatures;

pub use hash::{bulletin_key, keccak256, Packed};
pub use keys::{generate_wallet, load_wallet};
pub use merkle::MerkleTree;
pub use signatures::{recover_signer, sign_digest, verify_signer, SignatureError};
