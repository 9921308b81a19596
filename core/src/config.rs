//! Consensus and economic parameters (§6 "Configuration"): the subset of
//! `NodeConfig` the `core` crate needs to validate blocks, retarget
//! difficulty, and compute the block reward. The binary crate's
//! `NodeConfig` loads these from TOML/CLI and passes this struct down.

use serde::{Deserialize, Serialize};
use shared::{Amount, NetworkType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    pub network: NetworkType,
    pub initial_difficulty: u32,
    pub target_interval: i64,
    pub retarget_interval: u64,
    pub retarget_clamp: u32,
    pub max_clock_skew: i64,
    pub initial_reward: Amount,
    pub halving_interval: u64,
    pub max_supply: Amount,
    pub min_fee: Amount,
    pub max_block_size: usize,
    pub max_block_txs: usize,
    pub max_tx_size: usize,
    pub max_mempool: usize,
    pub max_reorg_depth: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            network: NetworkType::Devnet,
            initial_difficulty: 1,
            target_interval: 600,
            retarget_interval: 2016,
            retarget_clamp: 4,
            max_clock_skew: 120,
            initial_reward: 50,
            halving_interval: 210_000,
            max_supply: 21_000_000,
            min_fee: 1,
            max_block_size: crate::block::MAX_BLOCK_SIZE,
            max_block_txs: 5_000,
            max_tx_size: crate::transaction::MAX_TX_SIZE,
            max_mempool: 10_000,
            max_reorg_depth: 100,
        }
    }
}

impl ChainParams {
    #[must_use]
    pub fn validation_params(&self) -> crate::validator::ValidationParams {
        crate::validator::ValidationParams {
            min_fee: self.min_fee,
            max_tx_size: self.max_tx_size,
            max_block_size: self.max_block_size,
            max_block_txs: self.max_block_txs,
            max_clock_skew: self.max_clock_skew,
        }
    }
}
