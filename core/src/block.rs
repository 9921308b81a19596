//! Block and header entity (C2). The header hash covers
//! `index ‖ timestamp ‖ previous_hash ‖ merkle_root ‖ nonce ‖ difficulty`
//! and is computed lazily and cached, same as `Transaction::txid`.

use crate::transaction::Transaction;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use shared::{BlockHeight, Hash256, Timestamp};

/// Hard ceiling on a block's serialized size (§4.5 block rule).
pub const MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub index: BlockHeight,
    pub timestamp: Timestamp,
    pub previous_hash: Hash256,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub difficulty: u32,
    pub merkle_root: Hash256,
    #[serde(skip)]
    hash_cache: OnceCell<Hash256>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.timestamp == other.timestamp
            && self.previous_hash == other.previous_hash
            && self.transactions == other.transactions
            && self.nonce == other.nonce
            && self.difficulty == other.difficulty
            && self.merkle_root == other.merkle_root
    }
}
impl Eq for Block {}

impl Block {
    #[must_use]
    pub fn new(
        index: BlockHeight,
        timestamp: Timestamp,
        previous_hash: Hash256,
        transactions: Vec<Transaction>,
        nonce: u64,
        difficulty: u32,
    ) -> Self {
        let merkle_root = merkle_root(&transactions);
        Self {
            index,
            timestamp,
            previous_hash,
            transactions,
            nonce,
            difficulty,
            merkle_root,
            hash_cache: OnceCell::new(),
        }
    }

    /// The canonical header preimage hashed to produce `hash()`.
    #[must_use]
    pub fn header_preimage(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + 8 + 32 + 32 + 8 + 4);
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(self.previous_hash.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.difficulty.to_be_bytes());
        buf
    }

    /// The block hash: computed lazily and cached (§3, §4.2).
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        *self.hash_cache.get_or_init(|| Hash256::keccak256(&self.header_preimage()))
    }

    /// Sets the candidate nonce during mining search, invalidating the
    /// cached hash so the next `hash()` call recomputes it.
    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
        self.hash_cache = OnceCell::new();
    }

    /// Recomputes the merkle root from `transactions` and compares it
    /// against the stored `merkle_root` field (§8 "Merkle round-trip").
    #[must_use]
    pub fn merkle_root_matches_body(&self) -> bool {
        merkle_root(&self.transactions) == self.merkle_root
    }

    #[must_use]
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Sum of `fee` over every non-coinbase transaction in the body.
    #[must_use]
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .skip(1)
            .map(|tx| tx.fee)
            .sum()
    }

    /// Approximate serialized size: the header preimage plus each
    /// transaction's own `serialized_size`.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.header_preimage().len()
            + self.transactions.iter().map(Transaction::serialized_size).sum::<usize>()
    }

    /// Builds the genesis block: a single coinbase transaction, mined at
    /// `difficulty`, with no predecessor.
    #[must_use]
    pub fn genesis(coinbase: Transaction, difficulty: u32, timestamp: Timestamp) -> Self {
        let mut block = Self::new(0, timestamp, Hash256::zero(), vec![coinbase], 0, difficulty);
        while !block.hash().meets_difficulty(block.difficulty) {
            block.nonce += 1;
            block.hash_cache = OnceCell::new();
        }
        block
    }
}

/// Binary merkle root of transaction `txid`s, duplicating the last leaf at
/// each level with an odd count (§3, §4.2).
#[must_use]
pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return Hash256::zero();
    }

    let mut level: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut buf = Vec::with_capacity(64);
            buf.extend_from_slice(left.as_bytes());
            buf.extend_from_slice(right.as_bytes());
            next.push(Hash256::keccak256(&buf));
        }
        level = next;
    }
    level[0]
}
