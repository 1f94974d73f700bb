use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte content checksum. Equality of checksums defines object
/// identity in every content-addressed namespace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    /// The all-zero checksum, used as the "absent section" sentinel in
    /// snapshot headers.
    pub const fn zero() -> Self {
        Checksum([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex-encode the full checksum for use in storage keys.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Parse a checksum from a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Checksum(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_zero() {
        assert!(Checksum::zero().is_zero());
        assert!(!Checksum([1u8; 32]).is_zero());
    }

    #[test]
    fn hex_roundtrip() {
        let c = Checksum([0xAB; 32]);
        let parsed = Checksum::from_hex(&c.to_hex()).unwrap();
        assert_eq!(c, parsed);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(Checksum::from_hex("abcd").is_err());
        assert!(Checksum::from_hex("zz").is_err());
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let c = Checksum([0xCD; 32]);
        assert_eq!(c.shard_prefix(), "cd");
    }

    #[test]
    fn serde_roundtrip() {
        let c = Checksum([0x42; 32]);
        let serialized = rmp_serde::to_vec(&c).unwrap();
        let deserialized: Checksum = rmp_serde::from_slice(&serialized).unwrap();
        assert_eq!(c, deserialized);
    }
}
