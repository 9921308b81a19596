//! Standard 256-bit elliptic-curve cryptography for the node: keypair
//! generation, deterministic signing, verification, and address derivation.

use crate::error::ValidationError;
use crate::types::{Address, NetworkType};
use crate::Hash256;
use chrono::{DateTime, Utc};
use secp256k1::{ecdsa, rand, Message, PublicKey as SecpPublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Signature algorithm identifier, carried alongside signatures so the
/// on-disk format can evolve without guessing from byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Secp256k1Ecdsa,
}

/// A public key on the curve, stored in compressed SEC1 form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

/// A private scalar on the curve. Zeroized on drop.
#[derive(Debug, Clone)]
pub struct PrivateKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

/// A keypair usable for signing transactions and deriving addresses.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

/// A deterministic ECDSA signature over a message, with the signing public
/// key attached so verification does not require a separate lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    data: Vec<u8>,
    public_key: PublicKey,
    algorithm: SignatureAlgorithm,
    timestamp: DateTime<Utc>,
}

impl PublicKey {
    /// # Errors
    /// Returns `ValidationError::BadSignature` if the bytes are not a valid
    /// compressed or uncompressed SEC1 public key.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ValidationError> {
        SecpPublicKey::from_slice(&bytes).map_err(|_| ValidationError::BadSignature)?;
        Ok(Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
        })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn to_secp(&self) -> SecpPublicKey {
        SecpPublicKey::from_slice(&self.key_data).expect("validated at construction")
    }

    /// Derives the network address for this public key: the Keccak-256
    /// digest of the compressed key bytes.
    #[must_use]
    pub fn to_address(&self) -> Address {
        Address::from_digest(Hash256::keccak256(&self.key_data))
    }
}

impl PrivateKey {
    /// # Errors
    /// Returns `ValidationError::BadSignature` if the bytes are not a valid
    /// scalar in the curve order.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ValidationError> {
        SecretKey::from_slice(&bytes).map_err(|_| ValidationError::BadSignature)?;
        Ok(Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
        })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn to_secp(&self) -> SecretKey {
        SecretKey::from_slice(&self.key_data).expect("validated at construction")
    }
}

impl KeyPair {
    /// Generates a new random keypair.
    #[must_use]
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let (secret_key, public_key) = secp.generate_keypair(&mut rng);

        Self {
            public_key: PublicKey {
                key_data: public_key.serialize().to_vec(),
                algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
            },
            private_key: PrivateKey {
                key_data: secret_key.secret_bytes().to_vec(),
                algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
            },
        }
    }

    /// Signs a 32-byte digest deterministically (RFC 6979).
    #[must_use]
    pub fn sign(&self, digest: &Hash256) -> Signature {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(*digest.as_bytes());
        let sig = secp.sign_ecdsa(&message, &self.private_key.to_secp());

        Signature {
            data: sig.serialize_compact().to_vec(),
            public_key: self.public_key.clone(),
            algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
            timestamp: Utc::now(),
        }
    }

    /// Derives this keypair's network address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.public_key.to_address()
    }
}

impl Signature {
    /// Verifies the signature against a 32-byte digest.
    #[must_use]
    pub fn verify(&self, digest: &Hash256) -> bool {
        let Ok(sig) = ecdsa::Signature::from_compact(&self.data) else {
            return false;
        };
        let secp = Secp256k1::verification_only();
        let message = Message::from_digest(*digest.as_bytes());
        secp.verify_ecdsa(&message, &sig, &self.public_key.to_secp())
            .is_ok()
    }

    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Zeroize for PrivateKey {
    fn zeroize(&mut self) {
        self.key_data.zeroize();
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Signs a transaction hash with the given keypair (§4.1: signatures cover
/// the canonical encoding of tx fields excluding `signature` and `txid`,
/// which callers hash into the digest passed here).
#[must_use]
pub fn sign_transaction_hash(tx_hash: &Hash256, keypair: &KeyPair) -> Signature {
    keypair.sign(tx_hash)
}

/// Verifies a signature against a transaction hash.
#[must_use]
pub fn verify_transaction_signature(tx_hash: &Hash256, signature: &Signature) -> bool {
    signature.verify(tx_hash)
}

/// Derives the address a public key controls, for the given network.
#[must_use]
pub fn address_from_pubkey(pk: &PublicKey, network: NetworkType) -> String {
    pk.to_address().encode(network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let keypair = KeyPair::generate();
        let digest = Hash256::keccak256(b"aixon transaction preimage");

        let signature = keypair.sign(&digest);
        assert!(signature.verify(&digest));
    }

    #[test]
    fn verification_fails_against_a_different_digest() {
        let keypair = KeyPair::generate();
        let digest = Hash256::keccak256(b"original payload");
        let other_digest = Hash256::keccak256(b"tampered payload");

        let signature = keypair.sign(&digest);
        assert!(!signature.verify(&other_digest));
    }

    #[test]
    fn signing_is_deterministic() {
        let keypair = KeyPair::generate();
        let digest = Hash256::keccak256(b"same message twice");

        let sig_a = keypair.sign(&digest);
        let sig_b = keypair.sign(&digest);
        assert_eq!(sig_a.as_bytes(), sig_b.as_bytes());
    }

    #[test]
    fn address_is_derived_from_public_key_and_network_prefixed() {
        let keypair = KeyPair::generate();
        let addr = address_from_pubkey(&keypair.public_key, NetworkType::Mainnet);
        assert!(addr.starts_with("AIXN"));
    }
}
