pub mod block;
pub mod chainstore;
pub mod config;
pub mod mempool;
pub mod mining;
pub mod persistence;
pub mod transaction;
pub mod utxo;
pub mod validator;
pub mod writer;

pub use block::{merkle_root, Block, MAX_BLOCK_SIZE};
pub use chainstore::ChainStore;
pub use config::ChainParams;
pub use mempool::{Mempool, MempoolError};
pub use mining::{DifficultyAdjuster, Miner, MiningResult, NONCE_CHECK_INTERVAL};
pub use persistence::{ChainPersistence, PersistenceError, PersistenceOptions};
pub use transaction::{Transaction, TxKind, MAX_TX_SIZE};
pub use utxo::UtxoIndex;
pub use validator::{
    validate_block, validate_tx_contextual, validate_tx_stateless, GovernanceSigner,
    NoGovernanceSigner, NoProtectedAddresses, ProtectedAddressPredicate, ValidationParams,
};
pub use writer::{ChainStats, Writer, WriterHandle};

pub use shared::{NodeError, Result};
