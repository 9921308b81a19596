//! Transaction entity (C2): a closed sum of variants (`normal`, `coinbase`,
//! `governance`, `protected`), each with its own stateless rule and signing
//! preimage, generalized from the node's prior single UTXO-input/output
//! transaction shape into the account-model shape this chain uses.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use shared::{Address, Amount, Hash256, Nonce, PublicKey, Signature, Timestamp};

/// Hard ceiling on a transaction's serialized size (§4.5 stateless rule).
pub const MAX_TX_SIZE: usize = 16 * 1024;

/// The closed sum of transaction variants (§3, §9 "dynamic duck-typed
/// transactions"). Each carries its own validation rule in `validator.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Normal,
    Coinbase,
    Governance,
    Protected,
}

/// A transaction as carried on the chain or in the mempool.
///
/// `txid` is not a field: it is derived from the canonical encoding of
/// every other field and is computed lazily, cached in `txid_cache`, and
/// never serialized (`#[serde(skip)]`) so that loading a transaction from
/// disk recomputes rather than trusts a stored digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: Amount,
    pub fee: Amount,
    pub nonce: Nonce,
    pub timestamp: Timestamp,
    pub kind: TxKind,
    pub public_key: Option<PublicKey>,
    pub signature: Option<Signature>,
    pub data: Option<Vec<u8>>,
    #[serde(skip)]
    txid_cache: OnceCell<Hash256>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.sender == other.sender
            && self.recipient == other.recipient
            && self.amount == other.amount
            && self.fee == other.fee
            && self.nonce == other.nonce
            && self.timestamp == other.timestamp
            && self.kind == other.kind
            && self.public_key == other.public_key
            && self.data == other.data
    }
}
impl Eq for Transaction {}

impl Transaction {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender: Address,
        recipient: Address,
        amount: Amount,
        fee: Amount,
        nonce: Nonce,
        timestamp: Timestamp,
        kind: TxKind,
        public_key: Option<PublicKey>,
        signature: Option<Signature>,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            sender,
            recipient,
            amount,
            fee,
            nonce,
            timestamp,
            kind,
            public_key,
            signature,
            data,
            txid_cache: OnceCell::new(),
        }
    }

    /// Builds the implicit coinbase transaction for a block: mints
    /// `reward + sum(fees)` to `recipient`, at `nonce = height` (coinbase
    /// txs are not subject to per-sender nonce sequencing).
    #[must_use]
    pub fn coinbase(recipient: Address, amount: Amount, height: u64, timestamp: Timestamp) -> Self {
        Self::new(
            recipient,
            recipient,
            amount,
            0,
            height,
            timestamp,
            TxKind::Coinbase,
            None,
            None,
            None,
        )
    }

    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TxKind::Coinbase)
    }

    /// The canonical preimage used both for `txid` and for the signature:
    /// a stable field order with fixed-width integer encodings, excluding
    /// `signature` (and `txid`, which is not a field) per §4.1.
    #[must_use]
    pub fn canonical_preimage(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96 + self.data.as_ref().map_or(0, Vec::len));
        buf.extend_from_slice(self.sender.digest().as_bytes());
        buf.extend_from_slice(self.recipient.digest().as_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.push(kind_tag(self.kind));
        if let Some(pk) = &self.public_key {
            buf.push(1);
            buf.extend_from_slice(pk.as_bytes());
        } else {
            buf.push(0);
        }
        if let Some(data) = &self.data {
            buf.push(1);
            buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
            buf.extend_from_slice(data);
        } else {
            buf.push(0);
        }
        buf
    }

    /// The transaction's identifier: Keccak-256 over the canonical
    /// preimage. Computed lazily and cached (§4.2).
    #[must_use]
    pub fn txid(&self) -> Hash256 {
        *self.txid_cache.get_or_init(|| Hash256::keccak256(&self.canonical_preimage()))
    }

    /// Size of the canonical preimage plus the attached signature, used
    /// against `MAX_TX_SIZE` (§4.5).
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.canonical_preimage().len() + self.signature.as_ref().map_or(0, Signature::size)
    }

    /// `fee / size`, used as the primary mempool priority key (§4.4). Kept
    /// as a rational via integer scaling so equal-fee, equal-size
    /// transactions compare equal rather than drifting on float rounding.
    #[must_use]
    pub fn fee_rate_scaled(&self) -> u128 {
        let size = self.serialized_size().max(1) as u128;
        (self.fee as u128 * 1_000_000) / size
    }
}

#[must_use]
const fn kind_tag(kind: TxKind) -> u8 {
    match kind {
        TxKind::Normal => 0,
        TxKind::Coinbase => 1,
        TxKind::Governance => 2,
        TxKind::Protected => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::NetworkType;

    fn addr(seed: &str) -> Address {
        Address::from_digest(Hash256::keccak256(seed.as_bytes()))
    }

    #[test]
    fn txid_is_deterministic_over_the_canonical_encoding() {
        let tx = Transaction::new(
            addr("alice"),
            addr("bob"),
            10,
            1,
            0,
            1_700_000_000,
            TxKind::Normal,
            None,
            None,
            None,
        );
        assert_eq!(tx.txid(), tx.txid());
        let tx2 = tx.clone();
        assert_eq!(tx.txid(), tx2.txid());
    }

    #[test]
    fn txid_changes_when_any_field_changes() {
        let base = Transaction::new(
            addr("alice"),
            addr("bob"),
            10,
            1,
            0,
            1_700_000_000,
            TxKind::Normal,
            None,
            None,
            None,
        );
        let mut changed = base.clone();
        changed.amount = 11;
        assert_ne!(base.txid(), changed.txid());
    }

    #[test]
    fn coinbase_transaction_is_recognized() {
        let cb = Transaction::coinbase(addr("miner"), 50, 1, 1_700_000_000);
        assert!(cb.is_coinbase());
        assert_eq!(cb.sender, cb.recipient);
    }

    #[test]
    fn serialize_then_deserialize_yields_an_equal_value_and_hash() {
        let tx = Transaction::new(
            addr("alice"),
            addr("bob"),
            10,
            1,
            0,
            1_700_000_000,
            TxKind::Normal,
            None,
            None,
            Some(vec![1, 2, 3]),
        );
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, back);
        assert_eq!(tx.txid(), back.txid());
    }

    #[test]
    fn address_encodes_with_the_network_prefix() {
        let a = addr("alice");
        assert!(a.encode(NetworkType::Testnet).starts_with("TXAI"));
    }
}
