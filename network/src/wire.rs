//! Wire protocol (§6 "Wire protocol"): the messages exchanged with a
//! peer collaborator over an authenticated transport, carried as a
//! single serde-tagged enum over gossipsub topics (broadcast-class
//! messages) and a request-response protocol (point-to-point pairs),
//! generalized from the node's existing `NetworkMessage` enum.

use core::{Block, Transaction};
use serde::{Deserialize, Serialize};
use shared::{BlockHeight, Hash256, Timestamp};

/// Gossipsub topic names. Broadcast-class messages (`inv`, block and tx
/// announcements) are published here; request/reply pairs go over the
/// request-response protocol instead.
pub const BLOCK_TOPIC: &str = "aixon/blocks/1";
pub const TX_TOPIC: &str = "aixon/transactions/1";
pub const STATUS_TOPIC: &str = "aixon/status/1";

/// libp2p request-response protocol name for point-to-point pairs
/// (`get_headers`, `get_block`, `get_data`, `get_peers`).
pub const SYNC_PROTOCOL: &str = "/aixon/sync/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

/// A minimal header, independent of the full transaction body, used by
/// the two-phase sync engine's header-first round (§4.12).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: BlockHeight,
    pub timestamp: Timestamp,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub nonce: u64,
    pub difficulty: u32,
    pub hash: Hash256,
}

impl From<&Block> for BlockHeader {
    fn from(block: &Block) -> Self {
        Self {
            index: block.index,
            timestamp: block.timestamp,
            previous_hash: block.previous_hash,
            merkle_root: block.merkle_root,
            nonce: block.nonce,
            difficulty: block.difficulty,
            hash: block.hash(),
        }
    }
}

/// The node's entire wire vocabulary (§6). `handshake` must be
/// exchanged first; a mismatched `network_id` or `genesis_hash` is an
/// immediate disconnect, enforced by the caller, not by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    Handshake {
        version: String,
        network_id: u32,
        genesis_hash: Hash256,
        best_height: BlockHeight,
        node_id: String,
    },
    GetPeers,
    Peers {
        urls: Vec<String>,
    },
    AnnouncePeer {
        url: String,
    },
    Inv {
        kind: InvKind,
        hashes: Vec<Hash256>,
    },
    GetData {
        kind: InvKind,
        hashes: Vec<Hash256>,
    },
    Tx {
        tx: Transaction,
    },
    GetHeaders {
        from_height: BlockHeight,
        to_height: BlockHeight,
    },
    Headers {
        headers: Vec<BlockHeader>,
    },
    GetBlock {
        height: Option<BlockHeight>,
        hash: Option<Hash256>,
    },
    BlockMsg {
        block: Block,
    },
}
