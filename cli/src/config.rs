//! Node configuration file

use agora_core::Address;
use agora_network::{AuthorizationConfig, NetworkConfig, TransportConfig};
use agora_storage::StorageConfig;
use agora_trade::TradeConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub network: NetworkConfig,
    /// Overrides `network.authorization`
    pub authorization: Option<AuthorizationConfig>,
    pub storage: StorageConfig,
    pub trade: TradeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: PathBuf,
    /// Defaults to `node.key` inside `data_dir`
    pub key_file: Option<PathBuf>,
    pub listen: String,
    /// Address announced to peers, when behind a proxy
    pub advertise: Option<String>,
    pub seeds: Vec<String>,
    pub log_level: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("agora-data"),
            key_file: None,
            listen: "0.0.0.0:8600".to_string(),
            advertise: None,
            seeds: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn key_file(&self) -> PathBuf {
        self.node
            .key_file
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("node.key"))
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.node.data_dir.join("snapshots")
    }

    /// Network settings with the `[authorization]` section applied
    pub fn network_config(&self) -> NetworkConfig {
        let mut network = self.network.clone();
        if let Some(authorization) = &self.authorization {
            network.authorization = authorization.clone();
        }
        network
    }

    pub fn transport_config(&self) -> Result<TransportConfig> {
        let bind = Address::from_str(&self.node.listen)
            .with_context(|| format!("invalid listen address {}", self.node.listen))?;
        let advertise = self
            .node
            .advertise
            .as_deref()
            .map(Address::from_str)
            .transpose()
            .context("invalid advertise address")?;
        Ok(TransportConfig {
            bind,
            advertise,
            ..Default::default()
        })
    }

    pub fn seeds(&self) -> Result<Vec<Address>> {
        self.node
            .seeds
            .iter()
            .map(|seed| {
                Address::from_str(seed).with_context(|| format!("invalid seed address {}", seed))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_sections() {
        let config = NodeConfig::parse("").unwrap();
        assert_eq!(config.node.listen, "0.0.0.0:8600");
        assert_eq!(config.key_file(), PathBuf::from("agora-data/node.key"));
        assert_eq!(config.trade.response_timeout_ms, 60_000);
        assert!(config.seeds().unwrap().is_empty());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = NodeConfig::parse(
            r#"
            [node]
            data_dir = "/var/lib/agora"
            listen = "127.0.0.1:9000"
            seeds = ["10.0.0.1:8600", "10.0.0.2:8600"]
            log_level = "debug"

            [network]
            max_connections = 8

            [authorization]
            direct_bits = 4

            [storage]
            snapshot_interval_secs = 0

            [trade]
            response_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.key_file(), PathBuf::from("/var/lib/agora/node.key"));
        assert_eq!(config.transport_config().unwrap().bind, Address::localhost(9000));
        assert_eq!(config.seeds().unwrap().len(), 2);
        assert_eq!(config.network_config().max_connections, 8);
        assert_eq!(config.network_config().authorization.direct_bits, 4);
        assert_eq!(config.storage.snapshot_interval_secs, 0);
        assert_eq!(config.trade.response_timeout_ms, 1500);
    }

    #[test]
    fn test_bad_seed_is_reported() {
        let config = NodeConfig::parse("[node]\nseeds = [\"nowhere\"]").unwrap();
        assert!(config.seeds().is_err());
    }

    #[test]
    fn test_sample_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("agorad.toml");
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.network_config().authorization.direct_bits, 8);
        assert_eq!(config.storage.inventory.request_timeout_ms, 30_000);
    }
}
