use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Hash of 256 bits used to identify blocks, transactions, and other content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// Creates a zeroed hash
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Creates a hash from a 32-byte array
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the hash
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes Keccak-256 hash of the provided data
    #[must_use]
    pub fn keccak256(data: &[u8]) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    /// Checks if the hash satisfies the given difficulty (leading hex-zero digits)
    #[must_use]
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.leading_hex_zeros() >= difficulty
    }

    /// Counts leading hex-zero nibbles in the hash. Difficulty is counted in
    /// hex digits, not bits: 0x0F contributes one leading zero, not four.
    #[must_use]
    pub fn leading_hex_zeros(&self) -> u32 {
        let mut zeros = 0;
        for &byte in &self.0 {
            let hi = byte >> 4;
            let lo = byte & 0x0F;
            if hi != 0 {
                break;
            }
            zeros += 1;
            if lo != 0 {
                break;
            }
            zeros += 1;
        }
        zeros
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<&str> for Hash256 {
    type Error = hex::FromHexError;

    fn try_from(hex_string: &str) -> Result<Self, Self::Error> {
        let bytes = hex::decode(hex_string)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_displays_as_sixty_four_zero_hex_chars() {
        let hash = Hash256::zero();
        assert_eq!(hash.to_string(), "0".repeat(64));
    }

    #[test]
    fn keccak256_is_deterministic_and_nonzero() {
        let data = b"aixon node";
        let a = Hash256::keccak256(data);
        let b = Hash256::keccak256(data);
        assert_eq!(a, b);
        assert_ne!(a, Hash256::zero());
    }

    #[test]
    fn difficulty_counts_hex_nibbles_not_bits() {
        // 0x00, 0x08: first byte contributes 2 zero nibbles, second byte's
        // high nibble is zero (3rd) then its low nibble (8) stops the count.
        let hash = Hash256::from_bytes([
            0x00, 0x08, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0, 0,
        ]);
        assert_eq!(hash.leading_hex_zeros(), 3);
        assert!(hash.meets_difficulty(3));
        assert!(!hash.meets_difficulty(4));
    }

    #[test]
    fn a_nonzero_high_nibble_stops_the_count_even_with_many_zero_bits() {
        // 0x01 has seven leading zero bits but its leading hex nibble is 0x0,
        // the next nibble is 0x1 - so exactly one hex zero, not zero.
        let hash = Hash256::from_bytes([
            0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0,
        ]);
        assert_eq!(hash.leading_hex_zeros(), 1);
    }
}
