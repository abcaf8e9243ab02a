//! # Hashing and Packed Encoding
//!
//! The escrow contract hashes `abi.encodePacked(...)` with Keccak-256 for
//! both its bulletin mapping key and the receipt digests it recovers
//! signatures from. [`Packed`] reproduces that byte layout: integers are
//! big-endian at their declared width, addresses are 20 bytes, `bytes32`
//! is 32 bytes, and nothing is padded.
//!
//! `ethers::abi::encode_packed` is not used because it widens every
//! integer token to 32 bytes, which breaks `uint64` fields.

use ethers::types::{Address, H256, U256};
use thiserror::Error;

/// Errors parsing hex or decimal field values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid hex value {0:?}")]
    InvalidHex(String),

    #[error("invalid decimal value {0:?}")]
    InvalidDecimal(String),

    #[error("value {0:?} does not fit in 32 bytes")]
    TooLong(String),
}

/// Keccak-256 of `data`.
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    ethers::utils::keccak256(data)
}

/// Builder for Solidity `abi.encodePacked` byte strings.
#[derive(Clone, Debug, Default)]
pub struct Packed {
    buf: Vec<u8>,
}

impl Packed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uint64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn uint256(mut self, v: U256) -> Self {
        let mut word = [0u8; 32];
        v.to_big_endian(&mut word);
        self.buf.extend_from_slice(&word);
        self
    }

    pub fn address(mut self, a: Address) -> Self {
        self.buf.extend_from_slice(a.as_bytes());
        self
    }

    pub fn bytes32(mut self, b: H256) -> Self {
        self.buf.extend_from_slice(b.as_bytes());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// `keccak256(abi.encodePacked(...))`.
    pub fn keccak(&self) -> H256 {
        H256(keccak256(&self.buf))
    }
}

/// Parse a hex string (with or without `0x`) into a `bytes32`.
///
/// Short values are left-padded with zeros, so the result equals the
/// big-endian encoding of the same number. Values longer than 32 bytes
/// are rejected.
pub fn parse_bytes32(s: &str) -> Result<H256, FieldError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let raw = hex::decode(digits).map_err(|_| FieldError::InvalidHex(s.to_string()))?;
    if raw.len() > 32 {
        return Err(FieldError::TooLong(s.to_string()));
    }
    let mut out = [0u8; 32];
    out[32 - raw.len()..].copy_from_slice(&raw);
    Ok(H256(out))
}

/// Parse a hex string (with or without `0x`) as a 256-bit integer.
pub fn parse_u256_hex(s: &str) -> Result<U256, FieldError> {
    parse_bytes32(s).map(|h| U256::from_big_endian(h.as_bytes()))
}

/// Parse a base-10 string as a 256-bit integer.
pub fn parse_u256_dec(s: &str) -> Result<U256, FieldError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FieldError::InvalidDecimal(s.to_string()));
    }
    U256::from_dec_str(s).map_err(|_| FieldError::InvalidDecimal(s.to_string()))
}

/// The escrow contract's bulletin mapping key:
/// `keccak256(abi.encodePacked(uint64 size, uint64 s, uint64 n, uint256 root))`.
///
/// `root` is the Merkle root as the contract stores it, i.e. the
/// hex-encoded root interpreted as an integer.
pub fn bulletin_key(size: u64, s: u64, n: u64, root: U256) -> H256 {
    Packed::new()
        .uint64(size)
        .uint64(s)
        .uint64(n)
        .uint256(root)
        .keccak()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_of_empty_input_is_the_known_constant() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn packed_uint64_is_eight_bytes() {
        let p = Packed::new().uint64(1).uint64(2);
        assert_eq!(p.as_bytes().len(), 16);
        assert_eq!(p.as_bytes()[7], 1);
        assert_eq!(p.as_bytes()[15], 2);
    }

    #[test]
    fn packed_layout_of_mixed_fields() {
        let addr = Address::repeat_byte(0xab);
        let p = Packed::new()
            .uint256(U256::from(1))
            .address(addr)
            .bytes32(H256::repeat_byte(0xcd));
        let bytes = p.as_bytes();
        assert_eq!(bytes.len(), 32 + 20 + 32);
        assert_eq!(bytes[31], 1);
        assert!(bytes[32..52].iter().all(|b| *b == 0xab));
        assert!(bytes[52..].iter().all(|b| *b == 0xcd));
    }

    #[test]
    fn bulletin_key_is_deterministic() {
        let root = parse_u256_hex("0x1f2e3d4c").unwrap();
        let a = bulletin_key(1024, 8, 32, root);
        let b = bulletin_key(1024, 8, 32, root);
        assert_eq!(a, b);
        assert_ne!(a, bulletin_key(1024, 8, 33, root));
        assert_ne!(a, bulletin_key(1025, 8, 32, root));
    }

    #[test]
    fn bulletin_key_matches_manual_packing() {
        let root = U256::from(0xdead_beefu64);
        let mut manual = Vec::new();
        manual.extend_from_slice(&7u64.to_be_bytes());
        manual.extend_from_slice(&3u64.to_be_bytes());
        manual.extend_from_slice(&5u64.to_be_bytes());
        let mut word = [0u8; 32];
        root.to_big_endian(&mut word);
        manual.extend_from_slice(&word);
        assert_eq!(bulletin_key(7, 3, 5, root), H256(keccak256(&manual)));
    }

    #[test]
    fn hex_and_decimal_parsing_disagree_on_digits() {
        // "10" means sixteen in hex and ten in decimal.
        assert_eq!(parse_u256_hex("10").unwrap(), U256::from(16));
        assert_eq!(parse_u256_dec("10").unwrap(), U256::from(10));
        assert!(parse_u256_dec("0x10").is_err());
        assert!(parse_u256_dec("").is_err());
    }

    #[test]
    fn bytes32_parsing_accepts_prefix_and_rejects_overflow() {
        let h = parse_bytes32("0x01").unwrap();
        assert_eq!(h.as_bytes()[31], 1);
        assert_eq!(parse_bytes32("01").unwrap(), h);
        let too_long = "00".repeat(33);
        assert!(matches!(parse_bytes32(&too_long), Err(FieldError::TooLong(_))));
        assert!(matches!(parse_bytes32("zz"), Err(FieldError::InvalidHex(_))));
    }
}
