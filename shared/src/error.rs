//! Error taxonomy shared by the `core` and `network` crates. Each member
//! corresponds to one of the seven kinds of failure the node distinguishes
//! and propagates differently (validation/consensus rejection, state or
//! storage recovery, network retry, resource back-off, fatal config error).

use thiserror::Error;

/// A tx or block failed a rule that is checked without reference to mutable
/// state, or against the current state snapshot. Never retried against the
/// same peer for the same payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("sender or recipient address is malformed")]
    MalformedAddress,
    #[error("fee {fee} is below the minimum fee {min_fee}")]
    FeeTooLow { fee: u64, min_fee: u64 },
    #[error("signature does not verify over the canonical preimage")]
    BadSignature,
    #[error("serialized size {size} exceeds the limit {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("coinbase transaction is malformed: {0}")]
    MalformedCoinbase(&'static str),
    #[error("sender balance {balance} is insufficient for amount+fee {required}")]
    InsufficientBalance { balance: u64, required: u64 },
    #[error("nonce {got} does not match expected next nonce {expected}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("sender is a protected address and no governance authorization was supplied")]
    ProtectedAddress,
}

/// A block-level chain rule was violated: this is rejected and the
/// contributing peer is penalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("block index {got} does not follow parent index {expected}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("previous_hash does not match the parent block's hash")]
    WrongParent,
    #[error("declared difficulty {declared} does not match the retargeted difficulty {expected}")]
    WrongDifficulty { expected: u32, declared: u32 },
    #[error("block hash does not satisfy the declared difficulty")]
    InsufficientWork,
    #[error("block timestamp is outside the allowed clock-skew window")]
    TimestampOutOfRange,
    #[error("block timestamp does not exceed the median of the previous 11 blocks")]
    TimestampNotIncreasing,
    #[error("merkle root does not match the transaction body")]
    MerkleMismatch,
    #[error("serialized block size {size} exceeds the limit {limit}")]
    BlockTooLarge { size: usize, limit: usize },
    #[error("coinbase pays {paid}, expected block_reward+fees {expected}")]
    WrongCoinbaseAmount { expected: u64, paid: u64 },
    #[error("candidate reorganizes {depth} blocks deep, exceeding max_reorg_depth")]
    ReorgTooDeep { depth: u64 },
}

/// A local invariant was broken; this halts the writer and triggers
/// recovery from the most recent checkpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("utxo index would go negative for an address during apply_block")]
    NegativeBalance,
    #[error("fork switch failed mid-way and could not roll back cleanly")]
    SwitchRollbackFailed,
    #[error("in-memory chain state diverged from its own index")]
    IndexInconsistent,
}

/// I/O or data-integrity failure in the persistence layer. Falls through
/// the recovery chain at startup; aborts the current write at runtime.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("checksum mismatch reading {path}")]
    ChecksumMismatch { path: String },
    #[error("serialized payload in {path} could not be decoded: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no recoverable chain state: chain.dat, backups, and checkpoints all failed")]
    Unrecoverable,
}

impl Clone for StorageError {
    fn clone(&self) -> Self {
        match self {
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::ChecksumMismatch { path } => Self::ChecksumMismatch { path: path.clone() },
            Self::Decode { path, source } => Self::Decode {
                path: path.clone(),
                source: serde_json::Error::io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    source.to_string(),
                )),
            },
            Self::Unrecoverable => Self::Unrecoverable,
        }
    }
}

/// Transient network I/O failure; retried with exponential back-off up to
/// a bounded attempt count, after which the peer is marked dead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request to peer {peer} timed out")]
    Timeout { peer: String },
    #[error("connection to peer {peer} was reset")]
    ConnectionReset { peer: String },
    #[error("peer {peer} sent a message that failed to decode")]
    Malformed { peer: String },
    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: String, reason: String },
}

/// A queue, memory, or connection-count limit was hit; the caller must
/// back off rather than retry immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("mempool is at capacity ({current}/{max})")]
    MempoolFull { current: usize, max: usize },
    #[error("per-peer send queue is full for peer {peer}")]
    PeerQueueFull { peer: String },
    #[error("connection cap reached: {current}/{max} peers")]
    PeerCapReached { current: usize, max: usize },
    #[error("subnet bucket cap reached for {subnet}: {current}/{max}")]
    SubnetCapReached {
        subnet: String,
        current: usize,
        max: usize,
    },
}

/// Invalid or missing configuration; fatal at startup, before any
/// subsystem is started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration key {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("data directory {0} is not writable")]
    DataDirUnwritable(String),
}

/// Top-level union of the node's error taxonomy. A single `NodeError`
/// threads through the `core` and `network` crates, generalized from the
/// node's prior single ad hoc enum into the seven-way taxonomy above.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StorageError> for NodeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl NodeError {
    /// Maps this error to the stable reason code surfaced to external
    /// callers (§7 "User-visible behavior").
    #[must_use]
    pub fn reason_code(&self) -> crate::types::ReasonCode {
        use crate::types::ReasonCode as R;
        match self {
            Self::Validation(ValidationError::InsufficientBalance { .. }) => {
                R::InsufficientBalance
            }
            Self::Validation(ValidationError::NonceMismatch { .. }) => R::NonceMismatch,
            Self::Validation(ValidationError::BadSignature) => R::InvalidSignature,
            Self::Validation(ValidationError::TooLarge { .. }) => R::OversizedPayload,
            Self::Validation(ValidationError::ProtectedAddress) => R::ProtectedAddress,
            Self::Consensus(ConsensusError::InsufficientWork)
            | Self::Consensus(ConsensusError::WrongDifficulty { .. }) => R::InvalidDifficulty,
            Self::Consensus(ConsensusError::BlockTooLarge { .. }) => R::OversizedPayload,
            Self::Consensus(ConsensusError::ReorgTooDeep { .. }) => R::ReorgTooDeep,
            Self::Resource(ResourceError::MempoolFull { .. }) => R::MempoolFull,
            Self::Resource(ResourceError::SubnetCapReached { .. })
            | Self::Resource(ResourceError::PeerCapReached { .. }) => R::SubnetCap,
            Self::Network(_) => R::RateLimited,
            Self::Storage(StorageError::Unrecoverable) => R::Unrecoverable,
            _ => R::NodeSyncing,
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
