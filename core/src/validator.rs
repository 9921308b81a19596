//! Validator (C5): stateless rules (checked against the transaction
//! alone), contextual rules (checked against the current UTxO/nonce
//! view), and block-level rules (header + body). Governance is consumed
//! as an injected capability (§9 "polymorphic AI/governance hooks") so
//! this crate has no dependency on the governance implementation.

use crate::block::Block;
use crate::transaction::{Transaction, TxKind, MAX_TX_SIZE};
use crate::utxo::UtxoIndex;
use shared::{Address, Amount, ConsensusError, Timestamp, ValidationError};

/// Predicate supplied by the governance collaborator: does this address
/// currently sit on the protected-address set? (§4.5 contextual rule.)
pub trait ProtectedAddressPredicate: Send + Sync {
    fn is_protected(&self, addr: &Address) -> bool;
}

/// Capability supplied by the governance collaborator: does this
/// transaction carry a valid governance authorization to move a
/// protected address's funds? (§4.5, §9.)
pub trait GovernanceSigner: Send + Sync {
    fn authorizes(&self, tx: &Transaction) -> bool;
}

/// A predicate that treats no address as protected; the default when no
/// governance collaborator is wired in.
pub struct NoProtectedAddresses;
impl ProtectedAddressPredicate for NoProtectedAddresses {
    fn is_protected(&self, _addr: &Address) -> bool {
        false
    }
}

/// A signer that never authorizes anything; paired with
/// `NoProtectedAddresses` this makes the protected-address rule inert.
pub struct NoGovernanceSigner;
impl GovernanceSigner for NoGovernanceSigner {
    fn authorizes(&self, _tx: &Transaction) -> bool {
        false
    }
}

/// Consensus and sizing parameters the validator needs but does not own
/// (they come from `NodeConfig` / the chain's `NetworkParams`).
#[derive(Debug, Clone, Copy)]
pub struct ValidationParams {
    pub min_fee: Amount,
    pub max_tx_size: usize,
    pub max_block_size: usize,
    pub max_block_txs: usize,
    pub max_clock_skew: i64,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            min_fee: 1,
            max_tx_size: MAX_TX_SIZE,
            max_block_size: crate::block::MAX_BLOCK_SIZE,
            max_block_txs: 5_000,
            max_clock_skew: 120,
        }
    }
}

/// Stateless validation (§4.5): rules checkable from the transaction
/// alone, with no reference to mutable chain state.
pub fn validate_tx_stateless(tx: &Transaction, params: &ValidationParams) -> Result<(), ValidationError> {
    if tx.is_coinbase() {
        if tx.signature.is_some() || tx.public_key.is_some() {
            return Err(ValidationError::MalformedCoinbase("coinbase must carry no signature"));
        }
        if tx.sender != tx.recipient {
            return Err(ValidationError::MalformedCoinbase("coinbase sender must equal recipient"));
        }
        return Ok(());
    }

    if tx.fee < params.min_fee {
        return Err(ValidationError::FeeTooLow { fee: tx.fee, min_fee: params.min_fee });
    }

    let size = tx.serialized_size();
    if size > params.max_tx_size {
        return Err(ValidationError::TooLarge { size, limit: params.max_tx_size });
    }

    let (Some(pk), Some(sig)) = (&tx.public_key, &tx.signature) else {
        return Err(ValidationError::BadSignature);
    };
    if pk.to_address() != tx.sender {
        return Err(ValidationError::BadSignature);
    }
    let preimage_hash = shared::Hash256::keccak256(&tx.canonical_preimage());
    if !sig.verify(&preimage_hash) {
        return Err(ValidationError::BadSignature);
    }

    Ok(())
}

/// Contextual validation (§4.5): rules checked against the current
/// UTxO/nonce view and the governance collaborator's capabilities.
pub fn validate_tx_contextual(
    tx: &Transaction,
    utxo: &UtxoIndex,
    protected: &dyn ProtectedAddressPredicate,
    governance: &dyn GovernanceSigner,
) -> Result<(), ValidationError> {
    let required = tx.amount + tx.fee;
    let balance = utxo.balance(&tx.sender);
    if balance < required {
        return Err(ValidationError::InsufficientBalance { balance, required });
    }

    let expected = utxo.next_nonce(&tx.sender);
    if tx.nonce != expected {
        return Err(ValidationError::NonceMismatch { expected, got: tx.nonce });
    }

    if protected.is_protected(&tx.sender)
        && !(matches!(tx.kind, TxKind::Protected) && governance.authorizes(tx))
    {
        return Err(ValidationError::ProtectedAddress);
    }

    Ok(())
}

/// Median of the previous (up to) 11 block timestamps, used for the
/// "strictly greater than median-time-past" rule (§4.5).
#[must_use]
pub fn median_time_past(recent_timestamps: &[Timestamp]) -> Timestamp {
    let mut sorted = recent_timestamps.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

/// Block-level validation (§4.5): header linkage, PoW, timestamp,
/// merkle root, size, and coinbase amount. Does not mutate `utxo`; the
/// caller applies the block only after this returns `Ok`.
#[allow(clippy::too_many_arguments)]
pub fn validate_block(
    block: &Block,
    parent: &Block,
    expected_difficulty: u32,
    expected_reward_plus_fees: Amount,
    recent_timestamps: &[Timestamp],
    now: Timestamp,
    params: &ValidationParams,
) -> Result<(), ConsensusError> {
    if block.index != parent.index + 1 {
        return Err(ConsensusError::WrongHeight { expected: parent.index + 1, got: block.index });
    }
    if block.previous_hash != parent.hash() {
        return Err(ConsensusError::WrongParent);
    }
    if block.difficulty != expected_difficulty {
        return Err(ConsensusError::WrongDifficulty { expected: expected_difficulty, declared: block.difficulty });
    }
    if !block.hash().meets_difficulty(block.difficulty) {
        return Err(ConsensusError::InsufficientWork);
    }
    if block.timestamp < parent.timestamp - params.max_clock_skew || block.timestamp > now + params.max_clock_skew {
        return Err(ConsensusError::TimestampOutOfRange);
    }
    if !recent_timestamps.is_empty() && block.timestamp <= median_time_past(recent_timestamps) {
        return Err(ConsensusError::TimestampNotIncreasing);
    }
    if !block.merkle_root_matches_body() {
        return Err(ConsensusError::MerkleMismatch);
    }
    let size = block.serialized_size();
    if size > params.max_block_size {
        return Err(ConsensusError::BlockTooLarge { size, limit: params.max_block_size });
    }

    let Some(coinbase) = block.transactions.first().filter(|tx| tx.is_coinbase()) else {
        return Err(ConsensusError::WrongCoinbaseAmount { expected: expected_reward_plus_fees, paid: 0 });
    };
    for tx in block.transactions.iter().skip(1) {
        if tx.is_coinbase() {
            return Err(ConsensusError::WrongCoinbaseAmount { expected: expected_reward_plus_fees, paid: tx.amount });
        }
    }
    if coinbase.amount != expected_reward_plus_fees {
        return Err(ConsensusError::WrongCoinbaseAmount { expected: expected_reward_plus_fees, paid: coinbase.amount });
    }

    Ok(())
}
