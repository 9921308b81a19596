//! Mempool (C4): validated-but-unconfirmed transactions keyed by `txid`,
//! bounded by count and by per-sender nonce gap, with a priority view by
//! `(fee/size, arrival_time)` for both eviction and miner selection.
//!
//! "Arrival time" is a monotonically increasing admission counter rather
//! than a wall-clock timestamp, so ordering is deterministic and
//! replayable (§1.1 "no reliance on wall-clock... inside assertions").

use crate::transaction::Transaction;
use crate::utxo::UtxoIndex;
use crate::validator::{
    validate_tx_contextual, validate_tx_stateless, GovernanceSigner, ProtectedAddressPredicate,
    ValidationParams,
};
use shared::{Address, Hash256, Nonce, ResourceError, ValidationError};
use std::collections::{BTreeMap, HashMap};

/// How far beyond the expected next nonce a sender's future transactions
/// may be buffered before being refused outright (§4.4 "small gap").
pub const MAX_NONCE_GAP: u64 = 16;

#[derive(Debug, Clone)]
struct Entry {
    tx: Transaction,
    arrival: u64,
}

/// Priority key: higher `fee_rate` sorts first; ties broken by the
/// earlier `arrival`. Stored so the ascending `BTreeMap` gives us the
/// *lowest*-priority entry first, which is exactly what eviction wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    fee_rate: u128,
    arrival: u64,
    txid_tiebreak: [u8; 32],
}

pub struct Mempool {
    entries: HashMap<Hash256, Entry>,
    priority: BTreeMap<PriorityKey, Hash256>,
    /// Transactions whose nonce is ahead of the sender's expected next
    /// nonce, held until the gap closes.
    future: HashMap<Address, BTreeMap<Nonce, Transaction>>,
    arrival_counter: u64,
    max_size: usize,
    params: ValidationParams,
}

impl Mempool {
    #[must_use]
    pub fn new(max_size: usize, params: ValidationParams) -> Self {
        Self {
            entries: HashMap::new(),
            priority: BTreeMap::new(),
            future: HashMap::new(),
            arrival_counter: 0,
            max_size,
            params,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    fn priority_key(tx: &Transaction, arrival: u64) -> PriorityKey {
        PriorityKey { fee_rate: tx.fee_rate_scaled(), arrival, txid_tiebreak: *tx.txid().as_bytes() }
    }

    fn insert_admitted(&mut self, tx: Transaction) {
        let arrival = self.arrival_counter;
        self.arrival_counter += 1;
        let txid = tx.txid();
        let key = Self::priority_key(&tx, arrival);
        self.priority.insert(key, txid);
        self.entries.insert(txid, Entry { tx, arrival });
    }

    fn remove_by_txid(&mut self, txid: &Hash256) -> Option<Transaction> {
        let entry = self.entries.remove(txid)?;
        let key = Self::priority_key(&entry.tx, entry.arrival);
        self.priority.remove(&key);
        Some(entry.tx)
    }

    /// Lowest-priority admitted entry, the one `(fee/size, arrival_time)`
    /// eviction removes first.
    fn lowest_priority(&self) -> Option<&PriorityKey> {
        self.priority.keys().next()
    }

    /// Admits a transaction: stateless + contextual validation, then
    /// either immediate admission (nonce matches), future buffering
    /// (nonce is ahead, within `MAX_NONCE_GAP`), or rejection.
    ///
    /// # Errors
    /// `ValidationError` for a rule failure, `ResourceError::MempoolFull`
    /// if the pool is at capacity and this tx does not outrank the
    /// current lowest-priority entry (§8 "Mempool at capacity evicts
    /// exactly the lowest-priority entry").
    pub fn admit(
        &mut self,
        tx: Transaction,
        utxo: &UtxoIndex,
        protected: &dyn ProtectedAddressPredicate,
        governance: &dyn GovernanceSigner,
    ) -> Result<(), MempoolError> {
        validate_tx_stateless(&tx, &self.params)?;

        let expected = utxo.next_nonce(&tx.sender);
        if tx.nonce < expected {
            return Err(ValidationError::NonceMismatch { expected, got: tx.nonce }.into());
        }

        if tx.nonce > expected {
            if tx.nonce - expected > MAX_NONCE_GAP {
                return Err(ValidationError::NonceMismatch { expected, got: tx.nonce }.into());
            }
            self.future.entry(tx.sender).or_default().insert(tx.nonce, tx);
            return Ok(());
        }

        validate_tx_contextual(&tx, utxo, protected, governance)?;
        self.admit_checked(tx)?;
        self.promote_future(utxo, protected, governance);
        Ok(())
    }

    fn admit_checked(&mut self, tx: Transaction) -> Result<(), MempoolError> {
        if self.entries.len() >= self.max_size {
            let candidate_key = Self::priority_key(&tx, self.arrival_counter);
            let lowest = self.lowest_priority().copied();
            match lowest {
                Some(lowest) if candidate_key > lowest => {
                    let evicted_txid = self.priority[&lowest];
                    self.remove_by_txid(&evicted_txid);
                }
                _ => {
                    return Err(ResourceError::MempoolFull { current: self.entries.len(), max: self.max_size }.into());
                }
            }
        }
        self.insert_admitted(tx);
        Ok(())
    }

    /// After a sender's nonce advances, pull any contiguous
    /// future-buffered transactions into the main pool.
    fn promote_future(
        &mut self,
        utxo: &UtxoIndex,
        protected: &dyn ProtectedAddressPredicate,
        governance: &dyn GovernanceSigner,
    ) {
        let senders: Vec<Address> = self.future.keys().copied().collect();
        for sender in senders {
            loop {
                let expected = utxo.next_nonce(&sender);
                let next = self.future.get_mut(&sender).and_then(|buf| buf.remove(&expected));
                let Some(tx) = next else { break };
                if validate_tx_contextual(&tx, utxo, protected, governance).is_ok() {
                    let _ = self.admit_checked(tx);
                } else {
                    break;
                }
            }
            if self.future.get(&sender).is_some_and(BTreeMap::is_empty) {
                self.future.remove(&sender);
            }
        }
    }

    /// Removes confirmed transactions and drops any that are no longer
    /// valid against the post-block state (§4.4).
    pub fn on_new_block(
        &mut self,
        included: &[Hash256],
        utxo: &UtxoIndex,
        protected: &dyn ProtectedAddressPredicate,
        governance: &dyn GovernanceSigner,
    ) {
        for txid in included {
            self.remove_by_txid(txid);
        }

        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| validate_tx_contextual(&e.tx, utxo, protected, governance).is_err())
            .map(|e| e.tx.txid())
            .collect();
        for txid in stale {
            self.remove_by_txid(&txid);
        }

        self.promote_future(utxo, protected, governance);
    }

    /// Up to `max_txs` transactions in priority order (`(fee/size,
    /// arrival_time)`, highest first) subject to `max_total_size` (§4.8).
    #[must_use]
    pub fn select_for_block(&self, max_txs: usize, max_total_size: usize) -> Vec<Transaction> {
        let mut selected = Vec::new();
        let mut total_size = 0usize;
        for (_, txid) in self.priority.iter().rev() {
            if selected.len() >= max_txs {
                break;
            }
            let Some(entry) = self.entries.get(txid) else { continue };
            let size = entry.tx.serialized_size();
            if total_size + size > max_total_size {
                continue;
            }
            total_size += size;
            selected.push(entry.tx.clone());
        }
        selected
    }

    #[must_use]
    pub fn all(&self) -> Vec<Transaction> {
        self.entries.values().map(|e| e.tx.clone()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxKind;
    use crate::validator::{NoGovernanceSigner, NoProtectedAddresses};
    use shared::KeyPair;

    fn funded(utxo: &mut UtxoIndex, keypair: &KeyPair, amount: u64) {
        let cb = Transaction::coinbase(keypair.address(), amount, 0, 1_700_000_000);
        let block = crate::block::Block::new(0, 1_700_000_000, Hash256::zero(), vec![cb], 0, 1);
        utxo.apply_block(&block).unwrap();
    }

    fn signed(keypair: &KeyPair, recipient: Address, amount: u64, fee: u64, nonce: u64) -> Transaction {
        let mut tx = Transaction::new(
            keypair.address(), recipient, amount, fee, nonce, 1_700_000_000, TxKind::Normal,
            Some(keypair.public_key.clone()), None, None,
        );
        let h = Hash256::keccak256(&tx.canonical_preimage());
        tx.signature = Some(keypair.sign(&h));
        tx
    }

    #[test]
    fn admits_a_transaction_matching_the_expected_nonce() {
        let keypair = KeyPair::generate();
        let mut utxo = UtxoIndex::new();
        funded(&mut utxo, &keypair, 100);
        let mut pool = Mempool::new(10, ValidationParams::default());
        let bob = Address::from_digest(Hash256::keccak256(b"bob"));
        let tx = signed(&keypair, bob, 10, 1, 0);

        pool.admit(tx, &utxo, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn buffers_a_future_nonce_transaction_without_admitting_it() {
        let keypair = KeyPair::generate();
        let mut utxo = UtxoIndex::new();
        funded(&mut utxo, &keypair, 100);
        let mut pool = Mempool::new(10, ValidationParams::default());
        let bob = Address::from_digest(Hash256::keccak256(b"bob"));
        let tx = signed(&keypair, bob, 10, 1, 3);

        pool.admit(tx, &utxo, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn rejects_a_stale_nonce_below_the_expected_value() {
        let keypair = KeyPair::generate();
        let mut utxo = UtxoIndex::new();
        funded(&mut utxo, &keypair, 100);
        utxo.apply_block(&crate::block::Block::new(
            1, 1_700_000_001, Hash256::zero(),
            vec![Transaction::coinbase(keypair.address(), 0, 1, 1_700_000_001),
                 signed(&keypair, Address::from_digest(Hash256::keccak256(b"bob")), 1, 1, 0)],
            0, 1,
        )).unwrap();
        let mut pool = Mempool::new(10, ValidationParams::default());
        let bob = Address::from_digest(Hash256::keccak256(b"bob"));
        let tx = signed(&keypair, bob, 1, 1, 0);

        let err = pool.admit(tx, &utxo, &NoProtectedAddresses, &NoGovernanceSigner).unwrap_err();
        assert!(matches!(err, MempoolError::Validation(ValidationError::NonceMismatch { .. })));
    }

    #[test]
    fn eviction_at_capacity_drops_exactly_the_lowest_priority_entry() {
        let keypair = KeyPair::generate();
        let mut utxo = UtxoIndex::new();
        funded(&mut utxo, &keypair, 1000);
        let mut pool = Mempool::new(1, ValidationParams::default());
        let bob = Address::from_digest(Hash256::keccak256(b"bob"));

        let low_fee = signed(&keypair, bob, 1, 1, 0);
        pool.admit(low_fee, &utxo, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();

        let mut utxo2 = utxo.clone();
        utxo2.apply_block(&crate::block::Block::new(
            1, 1_700_000_001, Hash256::zero(),
            vec![Transaction::coinbase(keypair.address(), 0, 1, 1_700_000_001)],
            0, 1,
        )).unwrap();
        let high_fee = signed(&keypair, bob, 1, 50, 0);
        pool.admit(high_fee.clone(), &utxo2, &NoProtectedAddresses, &NoGovernanceSigner).unwrap();

        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&high_fee.txid()));
    }
}
