//! UTxO index (C3): an account/balance ledger keyed by address, not an
//! unspent-output set — the name is carried over from this chain's
//! UTXO-model sibling, but there is no per-output spend tracking here.
//! Derived state: always reproducible by replaying the chain from genesis.

use crate::block::Block;
use serde::{Deserialize, Serialize};
use shared::{Address, Amount, Nonce, StateError};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoIndex {
    balances: HashMap<Address, Amount>,
    nonces: HashMap<Address, Nonce>,
}

impl UtxoIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn balance(&self, addr: &Address) -> Amount {
        self.balances.get(addr).copied().unwrap_or(0)
    }

    /// The next nonce this address is expected to use (§3, §4.3).
    #[must_use]
    pub fn next_nonce(&self, addr: &Address) -> Nonce {
        self.nonces.get(addr).copied().unwrap_or(0)
    }

    fn credit(&mut self, addr: Address, amount: Amount) {
        *self.balances.entry(addr).or_insert(0) += amount;
    }

    fn debit(&mut self, addr: &Address, amount: Amount) -> Result<(), StateError> {
        let balance = self.balances.entry(*addr).or_insert(0);
        *balance = balance.checked_sub(amount).ok_or(StateError::NegativeBalance)?;
        Ok(())
    }

    /// Applies a block's transactions: debits each sender by
    /// `amount + fee`, credits each recipient by `amount`, credits the
    /// coinbase recipient by its full minted amount, and advances each
    /// non-coinbase sender's nonce by one (§4.3).
    ///
    /// # Errors
    /// `StateError::NegativeBalance` if any debit would go negative; the
    /// caller must treat the block as unapplied (contextual validation is
    /// expected to have ruled this out already, so this is a defensive
    /// invariant check, not the primary admission gate).
    pub fn apply_block(&mut self, block: &Block) -> Result<(), StateError> {
        let coinbase = block.transactions.first().ok_or(StateError::IndexInconsistent)?;

        for tx in block.transactions.iter().skip(1) {
            self.debit(&tx.sender, tx.amount + tx.fee)?;
            self.credit(tx.recipient, tx.amount);
            *self.nonces.entry(tx.sender).or_insert(0) += 1;
        }

        self.credit(coinbase.recipient, coinbase.amount);
        Ok(())
    }

    /// Reverses `apply_block`, exactly undoing its effects in reverse
    /// order. `apply_block` then `revert_block` is the identity (§8).
    ///
    /// # Errors
    /// `StateError::NegativeBalance` if undoing a credit would leave the
    /// recipient negative, which indicates the index was not in the
    /// post-`apply_block` state this block produced.
    pub fn revert_block(&mut self, block: &Block) -> Result<(), StateError> {
        let coinbase = block.transactions.first().ok_or(StateError::IndexInconsistent)?;
        self.debit(&coinbase.recipient, coinbase.amount)?;

        for tx in block.transactions.iter().skip(1).rev() {
            let nonce = self.nonces.entry(tx.sender).or_insert(0);
            *nonce = nonce.checked_sub(1).ok_or(StateError::IndexInconsistent)?;
            self.debit(&tx.recipient, tx.amount)?;
            self.credit(tx.sender, tx.amount + tx.fee);
        }

        Ok(())
    }

    #[must_use]
    pub fn total_supply(&self) -> Amount {
        self.balances.values().sum()
    }
}
