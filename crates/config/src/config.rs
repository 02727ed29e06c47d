//! Main configuration module.
//!
//! All node settings are defined in one `valcore.toml` file. Every section
//! has a `Default` suitable for a local devnet and a `validate()` that is
//! run before the node starts.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chain identity
    #[serde(default)]
    pub chain: ChainConfig,
    /// Consensus parameters
    #[serde(default)]
    pub consensus: ConsensusConfig,
    /// P2P network parameters
    #[serde(default)]
    pub network: NetworkConfig,
    /// Mempool limits
    #[serde(default)]
    pub mempool: MempoolConfig,
    /// Storage paths and persistence knobs
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!(path = %path.display(), "loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content)?;

        debug!("configuration parsed, validating");
        config.validate()?;

        info!(
            chain_id = config.chain.chain_id,
            network_id = %config.chain.network_id,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.chain.validate()?;
        self.consensus.validate()?;
        self.network.validate()?;
        self.mempool.validate()?;
        self.storage.validate()?;
        self.logging.validate()?;
        debug!("configuration validation passed");
        Ok(())
    }

    /// Saves configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

/// Chain identity. Handshakes reject peers whose chain_id or network_id
/// differ from ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Numeric chain identifier
    pub chain_id: u64,
    /// Network name, e.g. "valcore-mainnet"
    pub network_id: String,
}

impl ChainConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chain_id == 0 {
            return Err(ConfigError::Invalid("chain_id must be non-zero".into()));
        }
        if self.network_id.is_empty() {
            return Err(ConfigError::Invalid("network_id must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 6000,
            network_id: "valcore-devnet".to_string(),
        }
    }
}

/// Consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Quorum threshold numerator (power quorum when
    /// voted * denominator >= total * numerator)
    pub quorum_numerator: u64,
    /// Quorum threshold denominator
    pub quorum_denominator: u64,
    /// Rounds allowed per height before consensus is declared failed
    pub max_rounds_per_height: u64,
    /// Base propose-phase timeout in milliseconds
    pub propose_timeout_ms: u64,
    /// Base prevote-phase timeout in milliseconds
    pub prevote_timeout_ms: u64,
    /// Base precommit-phase timeout in milliseconds
    pub precommit_timeout_ms: u64,
    /// Base commit-phase timeout in milliseconds
    pub commit_timeout_ms: u64,
    /// Per-round linear backoff added to each base timeout, in milliseconds
    pub timeout_delta_ms: u64,
    /// Maximum transactions selected into one proposal
    pub max_block_transactions: usize,
}

impl ConsensusConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.quorum_denominator == 0 {
            return Err(ConfigError::Invalid(
                "quorum_denominator must be non-zero".into(),
            ));
        }
        if self.quorum_numerator * 3 < self.quorum_denominator * 2 {
            // Below 2/3 the protocol loses BFT safety.
            return Err(ConfigError::Invalid(format!(
                "quorum {}/{} is below the 2/3 safety floor",
                self.quorum_numerator, self.quorum_denominator
            )));
        }
        if self.quorum_numerator > self.quorum_denominator {
            return Err(ConfigError::Invalid(
                "quorum numerator exceeds denominator".into(),
            ));
        }
        if self.max_rounds_per_height == 0 {
            return Err(ConfigError::Invalid(
                "max_rounds_per_height must be at least 1".into(),
            ));
        }
        if self.max_block_transactions == 0 {
            return Err(ConfigError::Invalid(
                "max_block_transactions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_numerator: 67,
            quorum_denominator: 100,
            max_rounds_per_height: 10,
            propose_timeout_ms: 3_000,
            prevote_timeout_ms: 2_000,
            precommit_timeout_ms: 2_000,
            commit_timeout_ms: 2_000,
            timeout_delta_ms: 500,
            max_block_transactions: 500,
        }
    }
}

/// P2P network parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Socket address to listen on
    pub listen_addr: String,
    /// Peers dialed at startup
    pub boot_nodes: Vec<String>,
    /// Below this peer count, discovery broadcasts are issued
    pub min_peers: usize,
    /// Connections beyond this cap are rejected
    pub max_peers: usize,
    /// PING interval in milliseconds; peers silent for three intervals
    /// are disconnected
    pub heartbeat_interval_ms: u64,
    /// Interval of the maintenance pass (nonce-set trim, ban expiry)
    pub cleanup_interval_ms: u64,
    /// Maximum wire frame size in bytes
    pub max_frame_bytes: usize,
    /// Capacity of the recently-seen nonce set
    pub seen_nonce_capacity: usize,
    /// Dial timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Default ban duration in milliseconds
    pub default_ban_ms: u64,
}

impl NetworkConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".into()));
        }
        if self.min_peers > self.max_peers {
            return Err(ConfigError::Invalid(
                "min_peers must not exceed max_peers".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be non-zero".into(),
            ));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be at least 1024".into(),
            ));
        }
        if self.seen_nonce_capacity == 0 {
            return Err(ConfigError::Invalid(
                "seen_nonce_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:30600".to_string(),
            boot_nodes: Vec::new(),
            min_peers: 3,
            max_peers: 50,
            heartbeat_interval_ms: 15_000,
            cleanup_interval_ms: 30_000,
            max_frame_bytes: 4 * 1024 * 1024,
            seen_nonce_capacity: 10_000,
            connection_timeout_ms: 5_000,
            default_ban_ms: 10 * 60 * 1_000,
        }
    }
}

/// Mempool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Maximum transactions held in the pool
    pub max_size: usize,
    /// Maximum pending transactions per sender account
    pub max_pending_per_account: usize,
}

impl MempoolConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("mempool max_size must be non-zero".into()));
        }
        if self.max_pending_per_account == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_per_account must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_pending_per_account: 64,
        }
    }
}

/// Storage paths and persistence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the block log, WAL, indices and state snapshot
    pub data_dir: String,
    /// Persist the block index snapshot every this many blocks
    pub index_snapshot_interval: u64,
    /// Heights retained by pruning (0 disables pruning)
    pub retention_window: u64,
    /// Pruning never goes above latest - min_sync_retention, so slower
    /// peers can still sync
    pub min_sync_retention: u64,
}

impl StorageConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.data_dir.is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        if self.index_snapshot_interval == 0 {
            return Err(ConfigError::Invalid(
                "index_snapshot_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            index_snapshot_interval: 16,
            retention_window: 0,
            min_sync_retention: 1_024,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive, e.g. "info" or "valcore=debug"
    pub level: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.level.is_empty() {
            return Err(ConfigError::Invalid("logging level must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_quorum_below_safety_floor_rejected() {
        let mut config = Config::default();
        config.consensus.quorum_numerator = 1;
        config.consensus.quorum_denominator = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_peers_above_max_rejected() {
        let mut config = Config::default();
        config.network.min_peers = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_round_trip() {
        let toml_str = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = Config::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.chain.chain_id, 6000);
        assert_eq!(parsed.consensus.quorum_numerator, 67);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valcore.toml");
        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.chain.chain_id, config.chain.chain_id);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg = Config::from_toml("[chain]\nchain_id = 42\nnetwork_id = \"local\"\n").unwrap();
        assert_eq!(cfg.chain.chain_id, 42);
        assert_eq!(cfg.mempool.max_size, 10_000);
        assert_eq!(cfg.network.max_peers, 50);
    }
}
