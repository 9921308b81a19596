//! Types shared across the node's crates: addresses, aliases, and the
//! API-boundary vocabulary (reason codes, write-result discriminant).

use crate::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier (the transaction's `txid`).
pub type TxId = Hash256;

/// Block identifier (the block header hash).
pub type BlockId = Hash256;

/// Base-unit monetary amount. Never negative; balances and fees are
/// expressed in this unit throughout the node.
pub type Amount = u64;

/// Unix timestamp in seconds, advisory except where a rule depends on it
/// (block timestamp monotonicity, median-time-past).
pub type Timestamp = i64;

/// Height of a block in the canonical chain; genesis is height 0.
pub type BlockHeight = u64;

/// Per-sender transaction sequence number, starting at 0.
pub type Nonce = u64;

/// The network an address or chain belongs to, selecting the address
/// prefix, bootstrap list, and wire `network_id`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    /// Main production network.
    Mainnet,
    /// Public test network.
    Testnet,
    #[default]
    /// Local development network.
    Devnet,
    /// Deterministic regression-testing network.
    Regtest,
}

impl NetworkType {
    /// Textual address prefix for this network.
    #[must_use]
    pub const fn address_prefix(self) -> &'static str {
        match self {
            Self::Mainnet => "AIXN",
            Self::Testnet => "TXAI",
            Self::Devnet => "DVAI",
            Self::Regtest => "RGAI",
        }
    }

    /// Wire-level network identifier; peers with mismatched ids disconnect
    /// on handshake.
    #[must_use]
    pub const fn network_id(self) -> u32 {
        match self {
            Self::Mainnet => 1,
            Self::Testnet => 2,
            Self::Devnet => 3,
            Self::Regtest => 4,
        }
    }
}

/// An address: a network-prefixed digest of a public key. Equality and
/// hashing are by the underlying 32-byte digest; the prefix is a display
/// and parse concern only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(Hash256);

impl Address {
    #[must_use]
    pub const fn from_digest(digest: Hash256) -> Self {
        Self(digest)
    }

    #[must_use]
    pub const fn digest(&self) -> &Hash256 {
        &self.0
    }

    /// Encodes the address with the given network's textual prefix.
    #[must_use]
    pub fn encode(&self, network: NetworkType) -> String {
        format!("{}{}", network.address_prefix(), self.0)
    }

    /// Parses a prefixed address string for the given network, rejecting
    /// any prefix that does not match.
    pub fn decode(s: &str, network: NetworkType) -> Result<Self, AddressParseError> {
        let prefix = network.address_prefix();
        let hex_part = s
            .strip_prefix(prefix)
            .ok_or(AddressParseError::WrongPrefix)?;
        let digest =
            Hash256::try_from(hex_part).map_err(|_| AddressParseError::InvalidDigest)?;
        Ok(Self(digest))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("address does not carry the expected network prefix")]
    WrongPrefix,
    #[error("address digest is not a valid 32-byte hex value")]
    InvalidDigest,
}

/// Stable reason codes surfaced to external callers alongside an English
/// description (§7 "User-visible behavior"). Internal recovery events never
/// produce one of these unless they ultimately block service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    InsufficientBalance,
    NonceMismatch,
    InvalidSignature,
    MempoolFull,
    NodeSyncing,
    OversizedPayload,
    InvalidDifficulty,
    SubnetCap,
    RateLimited,
    ReorgTooDeep,
    ProtectedAddress,
    Unrecoverable,
}

impl ReasonCode {
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::InsufficientBalance => "sender balance is insufficient to cover amount + fee",
            Self::NonceMismatch => "transaction nonce does not match the sender's expected next nonce",
            Self::InvalidSignature => "signature does not verify against the canonical preimage",
            Self::MempoolFull => "mempool is at capacity and the transaction did not outrank the lowest entry",
            Self::NodeSyncing => "node is syncing and cannot yet serve or accept this request",
            Self::OversizedPayload => "transaction or block exceeds the configured size limit",
            Self::InvalidDifficulty => "block hash or declared difficulty fails the proof-of-work rule",
            Self::SubnetCap => "admitting this peer would exceed the per-subnet connection cap",
            Self::RateLimited => "peer exceeded its inbound message rate and has been temporarily banned",
            Self::ReorgTooDeep => "candidate fork reorganizes beyond the configured maximum depth",
            Self::ProtectedAddress => "sender is a protected address and the transaction lacks governance authorization",
            Self::Unrecoverable => "on-disk chain state could not be recovered from any source",
        }
    }
}

/// Outcome of a write operation at the core's API boundary (§6): a tri-state
/// the caller must discriminate on rather than a thrown exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteOutcome<T> {
    Accepted(T),
    Rejected { reason: ReasonCode },
    TransientError { retry_after_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_encode_decode() {
        let digest = Hash256::keccak256(b"alice");
        let addr = Address::from_digest(digest);
        let encoded = addr.encode(NetworkType::Testnet);
        assert!(encoded.starts_with("TXAI"));
        let decoded = Address::decode(&encoded, NetworkType::Testnet).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn address_decode_rejects_wrong_network_prefix() {
        let digest = Hash256::keccak256(b"alice");
        let addr = Address::from_digest(digest);
        let encoded = addr.encode(NetworkType::Mainnet);
        let err = Address::decode(&encoded, NetworkType::Testnet).unwrap_err();
        assert_eq!(err, AddressParseError::WrongPrefix);
    }

    #[test]
    fn network_ids_are_distinct() {
        let ids = [
            NetworkType::Mainnet.network_id(),
            NetworkType::Testnet.network_id(),
            NetworkType::Devnet.network_id(),
            NetworkType::Regtest.network_id(),
        ];
        for (i, a) in ids.iter().enumerate() {
            for (j, b) in ids.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }
}
