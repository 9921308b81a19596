pub mod actor;
pub mod admission;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod peer;
pub mod propagation;
pub mod sync;
pub mod wire;

pub use actor::NetworkActor;
pub use admission::Admission;
pub use config::NetworkParams;
pub use dedup::DedupCache;
pub use discovery::{diversity_score, plan_tick, DiscoveryPlan};
pub use peer::{subnet_bucket, PeerRecord, PeerRegistry};
pub use propagation::{PeerEvent, PeerQueue, PeerState, Propagation, RelayOutcome};
pub use sync::{
    cumulative_work, select_best_header_chain, select_header_peers, should_cancel_for_announcement,
    validate_header_chain, BlockDownloadWindow, HeaderChainCandidate,
};
pub use wire::{BlockHeader, InvKind, WireMessage, BLOCK_TOPIC, STATUS_TOPIC, SYNC_PROTOCOL, TX_TOPIC};

pub use libp2p::Multiaddr;
pub use shared::{NodeError, Result};
