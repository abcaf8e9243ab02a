//! # Receipt Signatures
//!
//! Buyers sign receipts with their secp256k1 wallet key over an
//! Ethereum-prefixed digest (`"\x19Ethereum Signed Message:\n32" ‖ hash`).
//! The escrow contract recovers the signer with `ecrecover`, so this side
//! must accept exactly what the contract accepts: 65 bytes, `r ‖ s ‖ v`,
//! recovering to the buyer's address.
//!
//! Verification is a pure function of `(digest, signature, expected)`.

use ethers::signers::LocalWallet;
use ethers::types::{Address, Signature, H256};
use thiserror::Error;

use crate::config::SIGNATURE_LENGTH;

/// Errors during signature recovery.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature must be 65 bytes, got {0}")]
    InvalidLength(usize),

    #[error("signature does not recover to a public key")]
    Unrecoverable,

    #[error("signature recovers to {recovered:?}, expected {expected:?}")]
    WrongSigner { expected: Address, recovered: Address },

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Apply the Ethereum signed-message prefix to a 32-byte hash.
pub fn eth_signed_digest(hash: H256) -> H256 {
    ethers::utils::hash_message(hash.as_bytes())
}

/// Recover the address that produced `signature` over `digest`.
///
/// `digest` must already carry the signed-message prefix.
pub fn recover_signer(digest: H256, signature: &[u8]) -> Result<Address, SignatureError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(SignatureError::InvalidLength(signature.len()));
    }
    let sig = Signature::try_from(signature).map_err(|_| SignatureError::Unrecoverable)?;
    sig.recover(digest).map_err(|_| SignatureError::Unrecoverable)
}

/// Accept `signature` only if it recovers to `expected`.
pub fn verify_signer(
    digest: H256,
    signature: &[u8],
    expected: Address,
) -> Result<(), SignatureError> {
    let recovered = recover_signer(digest, signature)?;
    if recovered != expected {
        return Err(SignatureError::WrongSigner {
            expected,
            recovered,
        });
    }
    Ok(())
}

/// Sign an already-prefixed digest, returning the 65-byte `r ‖ s ‖ v` form.
pub fn sign_digest(wallet: &LocalWallet, digest: H256) -> Result<Vec<u8>, SignatureError> {
    let sig = wallet
        .sign_hash(digest)
        .map_err(|e| SignatureError::Signing(e.to_string()))?;
    Ok(sig.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::keccak256;
    use ethers::signers::Signer;

    fn wallet() -> LocalWallet {
        LocalWallet::new(&mut rand::thread_rng())
    }

    #[test]
    fn signature_recovers_to_signer() {
        let w = wallet();
        let digest = eth_signed_digest(H256(keccak256(b"receipt")));
        let sig = sign_digest(&w, digest).unwrap();
        assert_eq!(sig.len(), SIGNATURE_LENGTH);
        assert_eq!(recover_signer(digest, &sig).unwrap(), w.address());
        assert!(verify_signer(digest, &sig, w.address()).is_ok());
    }

    #[test]
    fn other_address_is_rejected() {
        let signer = wallet();
        let other = wallet();
        let digest = eth_signed_digest(H256(keccak256(b"receipt")));
        let sig = sign_digest(&signer, digest).unwrap();
        assert!(matches!(
            verify_signer(digest, &sig, other.address()),
            Err(SignatureError::WrongSigner { .. })
        ));
    }

    #[test]
    fn wrong_length_is_rejected_before_recovery() {
        let digest = H256::repeat_byte(1);
        assert_eq!(
            recover_signer(digest, &[0u8; 64]),
            Err(SignatureError::InvalidLength(64))
        );
        assert_eq!(
            recover_signer(digest, &[0u8; 66]),
            Err(SignatureError::InvalidLength(66))
        );
    }

    #[test]
    fn verification_is_deterministic() {
        let w = wallet();
        let digest = eth_signed_digest(H256(keccak256(b"same")));
        let sig = sign_digest(&w, digest).unwrap();
        for _ in 0..3 {
            assert!(verify_signer(digest, &sig, w.address()).is_ok());
        }
    }

    #[test]
    fn tampered_digest_recovers_someone_else() {
        let w = wallet();
        let digest = eth_signed_digest(H256(keccak256(b"original")));
        let sig = sign_digest(&w, digest).unwrap();
        let tampered = eth_signed_digest(H256(keccak256(b"tampered")));
        assert!(verify_signer(tampered, &sig, w.address()).is_err());
    }
}
