//! Miner (C8): candidate assembly, difficulty retargeting, reward
//! halving, and a cancellable nonce search. The search runs on a
//! blocking thread (the caller is expected to run it via
//! `tokio::task::spawn_blocking`) and checks `cancel` every
//! `NONCE_CHECK_INTERVAL` hashes (§5 "Suspension points").

use crate::block::Block;
use crate::config::ChainParams;
use crate::mempool::Mempool;
use crate::transaction::Transaction;
use shared::{Address, Amount, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};

/// How many candidate hashes the nonce search tries between cancellation
/// checks (§5).
pub const NONCE_CHECK_INTERVAL: u64 = 10_000;

/// Pure difficulty-retargeting and reward-halving rules (§4.8), kept as
/// a namespace rather than a stateful type since both are functions of
/// the chain's own history, not of any mutable adjuster state.
pub struct DifficultyAdjuster;

impl DifficultyAdjuster {
    /// The difficulty the next block (at `chain.len()`) must meet.
    /// Unchanged outside retarget boundaries; otherwise scaled by the
    /// clamped ratio of target to actual interval over the last
    /// `retarget_interval` blocks (§4.8).
    #[must_use]
    pub fn expected_difficulty(params: &ChainParams, chain: &[Block]) -> u32 {
        let height = chain.len() as u64;
        let Some(tip) = chain.last() else {
            return params.initial_difficulty;
        };
        if params.retarget_interval == 0
            || height % params.retarget_interval != 0
            || height < params.retarget_interval
        {
            return tip.difficulty;
        }

        let window_start = (height - params.retarget_interval) as usize;
        let first = &chain[window_start];
        let actual_interval = (tip.timestamp - first.timestamp).max(1);
        let target_interval = params.target_interval * params.retarget_interval as i64;

        let clamp_max = f64::from(params.retarget_clamp.max(1));
        let clamp_min = 1.0 / clamp_max;
        let ratio = (target_interval as f64 / actual_interval as f64).clamp(clamp_min, clamp_max);

        let scaled = (f64::from(tip.difficulty) * ratio).round();
        scaled.max(1.0) as u32
    }

    /// `INITIAL_REWARD` halved every `HALVING_INTERVAL` blocks, floored
    /// at 0 and capped so circulating supply never exceeds `MAX_SUPPLY`
    /// (§4.8).
    #[must_use]
    pub fn block_reward(params: &ChainParams, height: u64, circulating_supply: Amount) -> Amount {
        let halvings = height / params.halving_interval.max(1);
        let reward = if halvings >= 64 { 0 } else { params.initial_reward >> halvings };
        let remaining = params.max_supply.saturating_sub(circulating_supply);
        reward.min(remaining)
    }
}

/// Result of a completed (not cancelled) nonce search.
#[derive(Debug, Clone)]
pub struct MiningResult {
    pub block: Block,
    pub attempts: u64,
}

#[derive(Clone)]
pub struct Miner {
    params: ChainParams,
}

impl Miner {
    #[must_use]
    pub fn new(params: ChainParams) -> Self {
        Self { params }
    }

    /// Assembles a candidate block: selects up to `max_block_txs` from
    /// the mempool by `(fee/size, arrival_time)`, computes the coinbase
    /// paying `reward + sum(fees)` to `coinbase_recipient`, and builds
    /// the merkle root over the resulting body (§4.8). The nonce is left
    /// at 0; call `search_nonce` to mine it.
    #[must_use]
    pub fn assemble_candidate(
        &self,
        parent: &Block,
        chain: &[Block],
        mempool: &Mempool,
        coinbase_recipient: Address,
        now: Timestamp,
        circulating_supply: Amount,
    ) -> Block {
        let height = parent.index + 1;
        let difficulty = DifficultyAdjuster::expected_difficulty(&self.params, chain);
        let reward = DifficultyAdjuster::block_reward(&self.params, height, circulating_supply);

        let body_budget = self.params.max_block_size.saturating_sub(256);
        let selected = mempool.select_for_block(self.params.max_block_txs, body_budget);
        let fees: Amount = selected.iter().map(|tx| tx.fee).sum();

        let coinbase = Transaction::coinbase(coinbase_recipient, reward + fees, height, now);
        let mut body = Vec::with_capacity(selected.len() + 1);
        body.push(coinbase);
        body.extend(selected);

        Block::new(height, now, parent.hash(), body, 0, difficulty)
    }

    /// Searches for a nonce satisfying the candidate's declared
    /// difficulty, checking `cancel` every `NONCE_CHECK_INTERVAL`
    /// attempts. Returns `None` if cancelled or the nonce space is
    /// exhausted (astronomically unlikely at any real difficulty).
    #[must_use]
    pub fn search_nonce(&self, mut candidate: Block, cancel: &AtomicBool) -> Option<MiningResult> {
        let mut attempts: u64 = 0;
        loop {
            if candidate.hash().meets_difficulty(candidate.difficulty) {
                return Some(MiningResult { block: candidate, attempts });
            }
            if candidate.nonce == u64::MAX {
                return None;
            }
            candidate.set_nonce(candidate.nonce + 1);
            attempts += 1;
            if attempts % NONCE_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxKind;
    use crate::validator::ValidationParams;
    use shared::Hash256;

    fn addr(seed: &str) -> Address {
        Address::from_digest(Hash256::keccak256(seed.as_bytes()))
    }

    #[test]
    fn difficulty_is_unchanged_between_retarget_boundaries() {
        let params = ChainParams { retarget_interval: 10, ..ChainParams::default() };
        let mut chain = Vec::new();
        for i in 0..5 {
            chain.push(Block::new(i, 1_700_000_000 + i as i64 * 600, Hash256::zero(), vec![], 0, 3));
        }
        assert_eq!(DifficultyAdjuster::expected_difficulty(&params, &chain), 3);
    }

    #[test]
    fn difficulty_increases_when_blocks_arrive_faster_than_target() {
        let params = ChainParams {
            retarget_interval: 4,
            target_interval: 600,
            retarget_clamp: 4,
            ..ChainParams::default()
        };
        let mut chain = Vec::new();
        for i in 0..4 {
            // blocks arriving every 60s instead of the 600s target: 10x too fast
            chain.push(Block::new(i, 1_700_000_000 + i as i64 * 60, Hash256::zero(), vec![], 0, 2));
        }
        let next = DifficultyAdjuster::expected_difficulty(&params, &chain);
        assert!(next > 2, "expected difficulty to rise, got {next}");
    }

    #[test]
    fn reward_halves_on_schedule_and_floors_at_zero() {
        let params = ChainParams { initial_reward: 50, halving_interval: 100, max_supply: u64::MAX, ..ChainParams::default() };
        assert_eq!(DifficultyAdjuster::block_reward(&params, 0, 0), 50);
        assert_eq!(DifficultyAdjuster::block_reward(&params, 100, 0), 25);
        assert_eq!(DifficultyAdjuster::block_reward(&params, 200, 0), 12);
        assert_eq!(DifficultyAdjuster::block_reward(&params, 100 * 64, 0), 0);
    }

    #[test]
    fn reward_never_exceeds_the_remaining_supply() {
        let params = ChainParams { initial_reward: 50, max_supply: 30, ..ChainParams::default() };
        assert_eq!(DifficultyAdjuster::block_reward(&params, 0, 10), 20);
        assert_eq!(DifficultyAdjuster::block_reward(&params, 0, 30), 0);
    }

    #[test]
    fn mined_candidate_satisfies_its_own_difficulty() {
        let params = ChainParams { initial_difficulty: 1, ..ChainParams::default() };
        let miner = Miner::new(params.clone());
        let genesis_cb = Transaction::coinbase(addr("miner"), 50, 0, 1_700_000_000);
        let genesis = Block::genesis(genesis_cb, 1, 1_700_000_000);
        let mempool = Mempool::new(100, ValidationParams::default());

        let candidate = miner.assemble_candidate(&genesis, &[genesis.clone()], &mempool, addr("miner"), 1_700_000_600, 50);
        let cancel = AtomicBool::new(false);
        let result = miner.search_nonce(candidate, &cancel).expect("search should find a nonce at difficulty 1");
        assert!(result.block.hash().meets_difficulty(result.block.difficulty));
        assert_eq!(result.block.transactions[0].kind, TxKind::Coinbase);
    }

    #[test]
    fn search_is_cancellable() {
        // an unreachable difficulty forces the search to run past the first check interval
        let params = ChainParams { initial_difficulty: 64, ..ChainParams::default() };
        let miner = Miner::new(params);
        let cb = Transaction::coinbase(addr("miner"), 50, 1, 1_700_000_600);
        let candidate = Block::new(1, 1_700_000_600, Hash256::zero(), vec![cb], 0, 64);
        let cancel = AtomicBool::new(true);
        assert!(miner.search_nonce(candidate, &cancel).is_none());
    }
}
