//! Service wiring for a running node

use crate::config::NodeConfig;
use agora_core::TransportType;
use agora_crypto::{hash_sha256_parts, KeyPair};
use agora_network::{
    retry_with_backoff, ClearNetTransport, NetworkError, NetworkService, RetryPolicy,
};
use agora_storage::{SnapshotStore, StorageService};
use agora_trade::{MockWallet, NetworkMessenger, TradeService};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Read the hex key file, creating one when it does not exist
pub fn load_or_create_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?;
        return KeyPair::from_private_key_hex(contents.trim())
            .with_context(|| format!("invalid key in {}", path.display()));
    }
    let keypair = KeyPair::generate();
    write_key(path, &keypair)?;
    info!(path = %path.display(), pubkey = %keypair.public_key_hex(), "Created node key");
    Ok(keypair)
}

pub fn write_key(path: &Path, keypair: &KeyPair) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    std::fs::write(path, keypair.private_key_hex())
        .with_context(|| format!("writing key file {}", path.display()))?;
    Ok(())
}

pub struct Node {
    pub network: Arc<NetworkService>,
    pub storage: Arc<StorageService>,
    pub trades: Arc<TradeService>,
}

impl Node {
    pub async fn start(config: &NodeConfig, keypair: KeyPair) -> Result<Self> {
        let keypair = Arc::new(keypair);

        let network = Arc::new(NetworkService::new(
            keypair.public_key(),
            config.network_config(),
        )?);
        network.add_transport(Arc::new(ClearNetTransport::new(config.transport_config()?)));
        let local_id = network.start().await?;
        info!(node = %local_id.node_id, "Network started");

        let storage = Arc::new(
            StorageService::new(keypair.clone(), network.clone(), config.storage.clone())
                .with_snapshots(SnapshotStore::open(config.snapshot_dir())?),
        );
        storage.start().await?;

        // no chain backend yet; settlement steps are simulated
        warn!("Settlement wallet is simulated");
        let wallet_seed = hash_sha256_parts(&[b"agora-wallet", keypair.private_key_hex().as_bytes()]);
        let trades = Arc::new(
            TradeService::new(
                keypair.clone(),
                local_id,
                storage.store().clone(),
                Arc::new(NetworkMessenger::new(network.clone())),
                Arc::new(MockWallet::new(wallet_seed)),
                config.trade.clone(),
            )?
            .with_snapshots(SnapshotStore::open(config.snapshot_dir())?),
        );
        trades.start().await?;
        trades.attach(&network).await;

        Ok(Self {
            network,
            storage,
            trades,
        })
    }

    /// Dial the seeds concurrently; storage pulls an inventory from every
    /// peer it connects to
    pub async fn dial_seeds(&self, config: &NodeConfig) -> Result<usize> {
        let seeds = config.seeds()?;
        let dials = seeds.iter().map(|seed| async move {
            let dial = retry_with_backoff(
                RetryPolicy::default(),
                || self.network.connect(TransportType::Clear, seed),
                NetworkError::is_transient,
            )
            .await;
            match dial {
                Ok(connection) => {
                    info!(seed = %seed, connection = %connection.id(), "Connected to seed");
                    true
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Seed unreachable");
                    false
                }
            }
        });
        let connected = join_all(dials).await.into_iter().filter(|ok| *ok).count();
        Ok(connected)
    }

    pub async fn shutdown(&self) {
        self.trades.shutdown().await;
        self.storage.shutdown().await;
        self.network.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_key_file_is_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let created = load_or_create_key(&path).unwrap();
        let loaded = load_or_create_key(&path).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
    }

    #[test]
    fn test_corrupt_key_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(load_or_create_key(&path).is_err());
    }
}
