//! Genesis block construction: either loaded from a TOML file naming the
//! coinbase recipient, or a deterministic built-in default for nodes that
//! never name one (development and tests).

use core::{Block, Transaction};
use serde::Deserialize;
use shared::{Address, ConfigError, NetworkType, Timestamp};

/// The coinbase recipient, amount, and timestamp that seed a chain's
/// first block (§6 "on-disk formats": genesis is not mined, it is
/// declared).
#[derive(Debug, Clone, Deserialize)]
pub struct GenesisSpec {
    pub coinbase_recipient: String,
    pub amount: u64,
    pub timestamp: Timestamp,
}

/// Used when no `genesis_file` is configured: a fixed timestamp keeps the
/// resulting genesis hash reproducible across runs of the same network.
const DEFAULT_GENESIS_TIMESTAMP: Timestamp = 1_700_000_000;

pub fn load_or_default(
    path: Option<&std::path::Path>,
    network: NetworkType,
    initial_difficulty: u32,
    initial_reward: u64,
) -> Result<Block, ConfigError> {
    let spec = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
                key: "genesis_file",
                reason: format!("{}: {e}", path.display()),
            })?;
            toml::from_str(&text).map_err(|e| ConfigError::Invalid {
                key: "genesis_file",
                reason: format!("{}: {e}", path.display()),
            })?
        }
        None => GenesisSpec {
            coinbase_recipient: Address::from_digest(shared::Hash256::keccak256(b"genesis")).encode(network),
            amount: initial_reward,
            timestamp: DEFAULT_GENESIS_TIMESTAMP,
        },
    };

    let recipient = Address::decode(&spec.coinbase_recipient, network)
        .map_err(|e| ConfigError::Invalid { key: "genesis_file.coinbase_recipient", reason: e.to_string() })?;
    let coinbase = Transaction::coinbase(recipient, spec.amount, 0, spec.timestamp);
    Ok(Block::genesis(coinbase, initial_difficulty, spec.timestamp))
}
