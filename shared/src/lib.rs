pub mod crypto;
pub mod error;
pub mod hash;
pub mod types;

pub use crypto::{
    address_from_pubkey, sign_transaction_hash, verify_transaction_signature, KeyPair,
    PrivateKey, PublicKey, Signature, SignatureAlgorithm,
};
pub use error::{
    ConfigError, ConsensusError, NetworkError, NodeError, ResourceError, StateError,
    StorageError, ValidationError,
};
pub use hash::Hash256;
pub use types::{Address, Amount, BlockHeight, BlockId, NetworkType, Nonce, ReasonCode, Timestamp, TxId, WriteOutcome};

pub type Result<T> = std::result::Result<T, NodeError>;
