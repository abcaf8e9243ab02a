//! # Key Management
//!
//! Every node signs with one secp256k1 wallet: sellers send contract
//! transactions with it, buyers sign receipts with it, and both derive
//! their on-chain address from it.
//!
//! Key files hold the hex-encoded 32-byte private key (optionally `0x`
//! prefixed, trailing whitespace ignored). Key bytes are never logged.

use std::path::Path;
use std::str::FromStr;

use ethers::signers::{LocalWallet, Signer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid private key")]
    InvalidKey,
}

/// Generate a fresh wallet from the OS RNG.
pub fn generate_wallet() -> LocalWallet {
    LocalWallet::new(&mut rand::thread_rng())
}

/// Parse a hex private key.
pub fn wallet_from_hex(key: &str) -> Result<LocalWallet, KeyError> {
    let trimmed = key.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    LocalWallet::from_str(digits).map_err(|_| KeyError::InvalidKey)
}

/// Load a wallet from a key file.
pub fn load_wallet(path: &Path) -> Result<LocalWallet, KeyError> {
    let contents = std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.display().to_string(),
        source,
    })?;
    wallet_from_hex(&contents)
}

/// Hex encoding of the wallet's private key, for writing key files.
pub fn wallet_to_hex(wallet: &LocalWallet) -> String {
    hex::encode(wallet.signer().to_bytes())
}

/// Lowercase `0x`-prefixed address string.
pub fn address_hex(wallet: &LocalWallet) -> String {
    format!("{:?}", wallet.address())
}
