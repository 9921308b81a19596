//! Node configuration (§4.14, §6 "Configuration"): everything `main`
//! needs to construct the chain store, mempool, persistence, and network
//! actor, loaded from an optional TOML file and overridden by CLI flags.

use core::{ChainParams, PersistenceOptions};
use network::NetworkParams;
use serde::Deserialize;
use shared::ConfigError;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Full node configuration. Every field has a default so a config file
/// only needs to name what it overrides (`#[serde(default)]` throughout).
/// `network: devnet|testnet|mainnet|regtest` lives on `chain`, since it is
/// already the field `ChainParams` validates and retargets against.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub genesis_file: Option<PathBuf>,
    pub bind_address: IpAddr,
    pub p2p_port: u16,
    pub log_level: String,
    pub bootstrap: Vec<String>,
    pub checkpoint_interval: u64,
    pub max_backups: usize,
    pub backup_on_save: bool,
    pub chain: ChainParams,
    pub peer: NetworkParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            genesis_file: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            p2p_port: 4001,
            log_level: "info".to_string(),
            bootstrap: Vec::new(),
            checkpoint_interval: core::persistence::CHECKPOINT_INTERVAL,
            max_backups: core::persistence::MAX_BACKUPS,
            backup_on_save: true,
            chain: ChainParams::default(),
            peer: NetworkParams::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a config from a TOML file, falling back to all-defaults if
    /// `path` is `None`.
    ///
    /// # Errors
    /// `ConfigError::Invalid` if the file exists but cannot be read or
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else { return Ok(Self::default()) };
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
            key: "config_file",
            reason: format!("{}: {e}", path.display()),
        })?;
        toml::from_str(&text)
            .map_err(|e| ConfigError::Invalid { key: "config_file", reason: format!("{}: {e}", path.display()) })
    }

    #[must_use]
    pub fn persistence_options(&self) -> PersistenceOptions {
        PersistenceOptions {
            checkpoint_interval: self.checkpoint_interval,
            max_backups: self.max_backups,
            backup_on_save: self.backup_on_save,
        }
    }
}
