//! Block reference identifiers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Errors from parsing a hex encoded [`BlockRid`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Invalid length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// 32-byte reference to a block (the hash of its header).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockRid([u8; 32]);

impl BlockRid {
    /// All-zero reference, used as the parent of the first block.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wrap raw bytes without hashing.
    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Reference derived by hashing `data` with blake3.
    pub fn hash_of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Parse from a 64 character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        let len = bytes.len();
        let array: [u8; 32] = bytes.try_into().map_err(|_| HexError::InvalidLength(len))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlockRid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockRid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps status dumps readable.
        write!(f, "BlockRid({}..)", &self.to_hex()[..8])
    }
}

impl Serialize for BlockRid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockRid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_parse() {
        let rid = BlockRid::hash_of(b"block");
        assert_eq!(BlockRid::from_hex(&rid.to_hex()), Ok(rid));
        assert_eq!(BlockRid::from_hex("abcd"), Err(HexError::InvalidLength(2)));
        assert!(matches!(
            BlockRid::from_hex("zz"),
            Err(HexError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(BlockRid::hash_of(b"a"), BlockRid::hash_of(b"a"));
        assert_ne!(BlockRid::hash_of(b"a"), BlockRid::hash_of(b"b"));
        assert_ne!(BlockRid::hash_of(b"a"), BlockRid::ZERO);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let rid = BlockRid::from_raw([0xab; 32]);
        let json = serde_json::to_string(&rid).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
    }
}
