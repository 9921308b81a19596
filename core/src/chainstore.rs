//! Chain store (C6): the authoritative chain as an indexed sequence plus
//! a side index from hash to height. Owns the canonical chain and the
//! UTxO index exclusively; everything else reads through it or submits
//! mutations via the single writer (`writer.rs`).

use crate::block::Block;
use crate::config::ChainParams;
use crate::mining::DifficultyAdjuster;
use crate::utxo::UtxoIndex;
use crate::validator::{self, GovernanceSigner, ProtectedAddressPredicate, ValidationParams};
use serde::{Deserialize, Serialize};
use shared::{BlockHeight, ConsensusError, Hash256, NodeError, Timestamp};
use std::collections::HashMap;

/// How many of the most recent timestamps feed the median-time-past rule
/// (§4.5: "strictly greater than the median of the previous 11").
const MEDIAN_TIME_WINDOW: usize = 11;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStore {
    blocks: Vec<Block>,
    #[serde(skip)]
    by_hash: HashMap<Hash256, BlockHeight>,
    utxo: UtxoIndex,
    params: ChainParams,
}

impl ChainStore {
    /// Creates a fresh store from a genesis block, crediting its
    /// coinbase into the UTxO index.
    ///
    /// # Errors
    /// `StateError` if the genesis block's own coinbase cannot be
    /// applied (only possible if the caller built a malformed genesis).
    pub fn new(genesis: Block, params: ChainParams) -> Result<Self, NodeError> {
        let mut utxo = UtxoIndex::new();
        utxo.apply_block(&genesis)?;
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash(), genesis.index);
        Ok(Self { blocks: vec![genesis], by_hash, utxo, params })
    }

    /// Rebuilds the `hash -> height` side index after deserializing from
    /// disk (it is not itself persisted).
    pub fn reindex(&mut self) {
        self.by_hash = self.blocks.iter().map(|b| (b.hash(), b.index)).collect();
    }

    #[must_use]
    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("chain store always holds at least a genesis block")
    }

    #[must_use]
    pub fn height(&self) -> BlockHeight {
        self.tip().index
    }

    #[must_use]
    pub fn block_at(&self, height: BlockHeight) -> Option<&Block> {
        self.blocks.get(usize::try_from(height).ok()?)
    }

    #[must_use]
    pub fn block_by_hash(&self, hash: &Hash256) -> Option<&Block> {
        let height = *self.by_hash.get(hash)?;
        self.block_at(height)
    }

    #[must_use]
    pub fn utxo(&self) -> &UtxoIndex {
        &self.utxo
    }

    #[must_use]
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Cumulative proof-of-work over a run of blocks: `sum(2^difficulty)`
    /// (§4.6, Glossary "Cumulative work").
    #[must_use]
    pub fn cumulative_work(blocks: &[Block]) -> u128 {
        blocks.iter().map(|b| 1u128 << b.difficulty.min(127)).sum()
    }

    #[must_use]
    pub fn chain_work(&self) -> u128 {
        Self::cumulative_work(&self.blocks)
    }

    fn recent_timestamps(&self) -> Vec<Timestamp> {
        let start = self.blocks.len().saturating_sub(MEDIAN_TIME_WINDOW);
        self.blocks[start..].iter().map(|b| b.timestamp).collect()
    }

    fn validation_params(&self) -> ValidationParams {
        self.params.validation_params()
    }

    /// Validates and applies each transaction in a candidate block's
    /// body against a scratch copy of the UTxO index, enforcing that
    /// per-sender nonces form a contiguous ascending sequence within
    /// the block (§8). Returns the resulting scratch index on success,
    /// leaving `self.utxo` untouched either way.
    fn apply_body_to_scratch(
        &self,
        block: &Block,
        protected: &dyn ProtectedAddressPredicate,
        governance: &dyn GovernanceSigner,
    ) -> Result<UtxoIndex, NodeError> {
        let mut scratch = self.utxo.clone();
        let stateless_params = self.validation_params();
        for tx in block.transactions.iter().skip(1) {
            validator::validate_tx_stateless(tx, &stateless_params)?;
            validator::validate_tx_contextual(tx, &scratch, protected, governance)?;
        }
        scratch.apply_block(block)?;
        Ok(scratch)
    }

    /// Attempts to extend the canonical chain with a block that builds
    /// directly on the current tip (§4.6 `try_extend`).
    ///
    /// # Errors
    /// `NodeError::Consensus` if a chain rule fails, `NodeError::Validation`
    /// if a body transaction fails, `NodeError::State` if UTxO application
    /// fails despite passing validation (an internal invariant break).
    pub fn try_extend(
        &mut self,
        candidate: Block,
        now: Timestamp,
        protected: &dyn ProtectedAddressPredicate,
        governance: &dyn GovernanceSigner,
    ) -> Result<(), NodeError> {
        let expected_difficulty = DifficultyAdjuster::expected_difficulty(&self.params, &self.blocks);
        let expected_reward = DifficultyAdjuster::block_reward(&self.params, candidate.index, self.utxo.total_supply())
            + candidate.total_fees();
        let recent = self.recent_timestamps();

        validator::validate_block(
            &candidate,
            self.tip(),
            expected_difficulty,
            expected_reward,
            &recent,
            now,
            &self.validation_params(),
        )?;

        let new_utxo = self.apply_body_to_scratch(&candidate, protected, governance)?;

        self.by_hash.insert(candidate.hash(), candidate.index);
        self.blocks.push(candidate);
        self.utxo = new_utxo;
        Ok(())
    }

    /// Attempts a reorganization onto `fork_blocks`, a complete
    /// alternative chain suffix whose first block's `previous_hash`
    /// names an existing ancestor (§4.6 `try_switch_to`).
    ///
    /// Returns `Ok(false)` without mutating anything if the fork does
    /// not carry strictly greater cumulative work than the current
    /// suffix from the same ancestor (earliest-arrival tie-break, §9).
    ///
    /// # Errors
    /// `ConsensusError::ReorgTooDeep` if the ancestor is more than
    /// `max_reorg_depth` blocks back. Any validation failure mid-switch
    /// rolls the store back to its pre-switch state and returns the
    /// error so the caller can penalize the contributing peer.
    pub fn try_switch_to(
        &mut self,
        fork_blocks: Vec<Block>,
        now: Timestamp,
        protected: &dyn ProtectedAddressPredicate,
        governance: &dyn GovernanceSigner,
    ) -> Result<bool, NodeError> {
        let Some(first) = fork_blocks.first() else { return Ok(false) };
        let Some(&ancestor_height) = self.by_hash.get(&first.previous_hash) else {
            return Err(ConsensusError::WrongParent.into());
        };

        let depth = self.height().saturating_sub(ancestor_height);
        if depth > self.params.max_reorg_depth {
            return Err(ConsensusError::ReorgTooDeep { depth }.into());
        }

        let ancestor_index = usize::try_from(ancestor_height).unwrap_or(usize::MAX);
        let old_suffix = &self.blocks[ancestor_index + 1..];
        let old_work = Self::cumulative_work(old_suffix);
        let new_work = Self::cumulative_work(&fork_blocks);
        if new_work <= old_work {
            return Ok(false);
        }

        // Operate on a full snapshot so any mid-switch failure rolls back
        // cleanly (§4.6, §9 "thread + lock discipline").
        let snapshot = self.clone();

        for block in old_suffix.iter().rev() {
            self.utxo.revert_block(block)?;
            self.by_hash.remove(&block.hash());
        }
        self.blocks.truncate(ancestor_index + 1);

        for block in fork_blocks {
            let expected_difficulty = DifficultyAdjuster::expected_difficulty(&self.params, &self.blocks);
            let expected_reward =
                DifficultyAdjuster::block_reward(&self.params, block.index, self.utxo.total_supply()) + block.total_fees();
            let recent = self.recent_timestamps();

            let validated = validator::validate_block(
                &block,
                self.tip(),
                expected_difficulty,
                expected_reward,
                &recent,
                now,
                &self.validation_params(),
            )
            .map_err(NodeError::from)
            .and_then(|()| self.apply_body_to_scratch(&block, protected, governance));

            match validated {
                Ok(new_utxo) => {
                    self.by_hash.insert(block.hash(), block.index);
                    self.blocks.push(block);
                    self.utxo = new_utxo;
                }
                Err(e) => {
                    *self = snapshot;
                    return Err(e);
                }
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use crate::validator::{NoGovernanceSigner, NoProtectedAddresses};
    use shared::Address;

    fn addr(seed: &str) -> Address {
        Address::from_digest(Hash256::keccak256(seed.as_bytes()))
    }

    fn genesis_store() -> ChainStore {
        let params = ChainParams { initial_difficulty: 1, ..ChainParams::default() };
        let cb = Transaction::coinbase(addr("miner"), 50, 0, 1_700_000_000);
        let genesis = Block::genesis(cb, 1, 1_700_000_000);
        ChainStore::new(genesis, params).unwrap()
    }

    fn mined_block(parent: &Block, difficulty: u32, timestamp: Timestamp, reward: u64) -> Block {
        let cb = Transaction::coinbase(addr("miner"), reward, parent.index + 1, timestamp);
        let mut block = Block::new(parent.index + 1, timestamp, parent.hash(), vec![cb], 0, difficulty);
        while !block.hash().meets_difficulty(difficulty) {
            block.set_nonce(block.nonce + 1);
        }
        block
    }

    #[test]
    fn extends_the_chain_with_a_valid_block() {
        let mut store = genesis_store();
        let parent = store.tip().clone();
        let block = mined_block(&parent, 1, 1_700_000_600, 50);

        store.try_extend(block, 1_700_001_000, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();
        assert_eq!(store.height(), 1);
    }

    #[test]
    fn rejects_a_block_with_the_wrong_parent_hash() {
        let mut store = genesis_store();
        let mut block = mined_block(store.tip(), 1, 1_700_000_600, 50);
        block.previous_hash = Hash256::keccak256(b"not the real parent");

        let err = store.try_extend(block, 1_700_001_000, &NoProtectedAddresses, &NoGovernanceSigner).unwrap_err();
        assert!(matches!(err, NodeError::Consensus(ConsensusError::WrongParent)));
    }

    #[test]
    fn switches_to_a_fork_with_greater_cumulative_work() {
        let mut store = genesis_store();
        let b1 = mined_block(store.tip(), 1, 1_700_000_600, 50);
        store.try_extend(b1.clone(), 1_700_001_000, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();

        // Fork from genesis with two higher-difficulty blocks: strictly
        // more cumulative work than the single-block current suffix.
        let genesis = store.block_at(0).unwrap().clone();
        let fork1 = mined_block(&genesis, 2, 1_700_000_500, 50);
        let fork2 = mined_block(&fork1, 2, 1_700_001_100, 50);

        let switched = store
            .try_switch_to(vec![fork1.clone(), fork2.clone()], 1_700_002_000, &NoProtectedAddresses, &NoGovernanceSigner)
            .unwrap();

        assert!(switched);
        assert_eq!(store.tip().hash(), fork2.hash());
        assert_eq!(store.height(), 2);
    }

    #[test]
    fn refuses_a_fork_without_strictly_greater_work() {
        let mut store = genesis_store();
        let b1 = mined_block(store.tip(), 1, 1_700_000_600, 50);
        store.try_extend(b1, 1_700_001_000, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();

        let genesis = store.block_at(0).unwrap().clone();
        let equal_work_fork = mined_block(&genesis, 1, 1_700_000_500, 50);

        let switched = store
            .try_switch_to(vec![equal_work_fork], 1_700_002_000, &NoProtectedAddresses, &NoGovernanceSigner)
            .unwrap();
        assert!(!switched);
        assert_eq!(store.height(), 1);
    }

    #[test]
    fn reorg_deeper_than_the_configured_max_is_refused() {
        let mut store = genesis_store();
        // store.params.max_reorg_depth defaults to 100; shrink it for the test.
        let mut params = store.params().clone();
        params.max_reorg_depth = 0;
        let mut store = ChainStore { params, ..store.clone() };

        let b1 = mined_block(store.tip(), 1, 1_700_000_600, 50);
        store.try_extend(b1, 1_700_001_000, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();

        let genesis = store.block_at(0).unwrap().clone();
        let fork = mined_block(&genesis, 3, 1_700_000_500, 50);

        let err = store
            .try_switch_to(vec![fork], 1_700_002_000, &NoProtectedAddresses, &NoGovernanceSigner)
            .unwrap_err();
        assert!(matches!(err, NodeError::Consensus(ConsensusError::ReorgTooDeep { .. })));
    }
}
