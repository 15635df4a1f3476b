//! Storage service
//!
//! Glues the data store to the network: applies and relays gossiped
//! requests, answers and issues inventory requests, publishes our own
//! records and runs the prune, re-broadcast and snapshot loops.

use crate::inventory::{
    ApplyReport, InventoryConfig, InventoryMessage, InventoryResponse, InventoryService,
};
use crate::record::{
    AuthenticatedRecord, DataRequest, DataType, RefreshRequest, RemoveRequest, SignedRecord,
    StorageKey,
};
use crate::snapshot::SnapshotStore;
use crate::store::{DataStore, StoreConfig, StoreEvent, StoreSnapshot, StoredEntry};
use crate::{StorageError, StorageResult};
use agora_core::time::now_millis;
use agora_crypto::KeyPair;
use agora_network::{
    BroadcastResult, Channel, Connection, ConnectionId, Direction, InboundMessage, MessageHandler,
    NetworkMessage, NetworkService,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Snapshot name of the data store
pub const STORE_SNAPSHOT: &str = "data_store";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub prune_interval_secs: u64,
    /// Re-broadcast of our own records; 0 disables
    pub rebroadcast_interval_secs: u64,
    /// 0 disables periodic snapshots
    pub snapshot_interval_secs: u64,
    /// Pull an inventory from every peer we dial
    pub sync_on_connect: bool,
    pub store: StoreConfig,
    pub inventory: InventoryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prune_interval_secs: 60,
            rebroadcast_interval_secs: 3_600,
            snapshot_interval_secs: 300,
            sync_on_connect: true,
            store: StoreConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }
}

type PendingInventory = DashMap<u64, (ConnectionId, oneshot::Sender<InventoryResponse>)>;

pub struct StorageService {
    config: StorageConfig,
    keypair: Arc<KeyPair>,
    network: Arc<NetworkService>,
    store: Arc<DataStore>,
    inventory: Arc<InventoryService>,
    pending: Arc<PendingInventory>,
    snapshots: Option<SnapshotStore>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StorageService {
    pub fn new(keypair: Arc<KeyPair>, network: Arc<NetworkService>, config: StorageConfig) -> Self {
        let store = Arc::new(DataStore::with_config(config.store.clone()));
        let inventory = Arc::new(InventoryService::with_config(
            store.clone(),
            config.inventory.clone(),
        ));
        Self {
            config,
            keypair,
            network,
            store,
            inventory,
            pending: Arc::new(DashMap::new()),
            snapshots: None,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Persist the store under `snapshots`
    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn inventory(&self) -> &Arc<InventoryService> {
        &self.inventory
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Load the last snapshot, register with the network and start the
    /// background loops
    pub async fn start(self: &Arc<Self>) -> StorageResult<()> {
        if self.snapshots.is_some() {
            match self.load_snapshot() {
                Ok(restored) => info!(records = restored, "Data store restored from snapshot"),
                Err(StorageError::SnapshotNotFound(_)) => {}
                Err(e) => error!(error = %e, "Failed to load data store snapshot"),
            }
        }

        self.network.register_handler(self.clone()).await;

        let mut tasks = Vec::new();

        let service = self.clone();
        let interval = Duration::from_secs(self.config.prune_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.prune().await;
            }
        }));

        if self.config.rebroadcast_interval_secs > 0 {
            let service = self.clone();
            let interval = Duration::from_secs(self.config.rebroadcast_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    service.rebroadcast_own().await;
                }
            }));
        }

        if self.snapshots.is_some() && self.config.snapshot_interval_secs > 0 {
            let service = self.clone();
            let interval = Duration::from_secs(self.config.snapshot_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = service.save_snapshot() {
                        error!(error = %e, "Failed to save data store snapshot");
                    }
                }
            }));
        }

        self.tasks.lock().extend(tasks);
        info!(records = self.store.len(), "Storage service started");
        Ok(())
    }

    /// Stop background loops and write a final snapshot
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.pending.clear();
        if self.snapshots.is_some() {
            if let Err(e) = self.save_snapshot() {
                error!(error = %e, "Failed to save data store snapshot");
            }
        }
        info!("Storage service stopped");
    }

    /// Sign and gossip a new version of one of our records
    pub async fn publish(
        &self,
        data_type: DataType,
        id: &str,
        body: Vec<u8>,
    ) -> StorageResult<SignedRecord> {
        let key = StorageKey::derive(data_type, &self.keypair.public_key(), id);
        let sequence = self.store.sequence_of(&key).map_or(1, |s| s + 1);
        let record = AuthenticatedRecord::new(
            data_type,
            id,
            self.keypair.public_key(),
            sequence,
            body,
            now_millis(),
        );
        let signed = SignedRecord::sign(record, &self.keypair)?;
        self.store.add_or_update(&signed)?;

        let result = self.gossip(&DataRequest::Add(signed.clone())).await?;
        info!(key = %key, data_type = %data_type, sequence, sent = result.sent, "Published record");
        Ok(signed)
    }

    /// Retract one of our records with a gossiped tombstone
    pub async fn retract(&self, data_type: DataType, id: &str) -> StorageResult<()> {
        let key = StorageKey::derive(data_type, &self.keypair.public_key(), id);
        let sequence = self.store.sequence_of(&key).map_or(1, |s| s + 1);
        let remove = RemoveRequest::sign(data_type, id, sequence, &self.keypair)?;
        self.store.remove(&remove)?;
        self.gossip(&DataRequest::Remove(remove)).await?;
        info!(key = %key, data_type = %data_type, "Retracted record");
        Ok(())
    }

    /// Extend the TTL of one of our records
    pub async fn refresh(&self, data_type: DataType, id: &str) -> StorageResult<()> {
        let key = StorageKey::derive(data_type, &self.keypair.public_key(), id);
        let sequence = self.store.sequence_of(&key).map_or(1, |s| s + 1);
        let refresh = RefreshRequest::sign(data_type, id, sequence, now_millis(), &self.keypair)?;
        self.store.refresh(&refresh)?;
        self.gossip(&DataRequest::Refresh(refresh)).await?;
        Ok(())
    }

    async fn gossip(&self, request: &DataRequest) -> StorageResult<BroadcastResult> {
        let body = request.serialize()?;
        Ok(self
            .network
            .broadcast(NetworkMessage::Gossip { body }, None)
            .await?)
    }

    /// Pull everything a peer has that we lack
    pub async fn sync_with(&self, connection: ConnectionId) -> StorageResult<ApplyReport> {
        sync_inventory(
            self.network.clone(),
            self.inventory.clone(),
            self.pending.clone(),
            connection,
        )
        .await
    }

    /// Sweep expired records and gossip tombstones for our retractable ones
    pub async fn prune(&self) {
        let expired = self.store.prune_expired();
        let ours = self.keypair.public_key();
        for record in expired {
            if record.author != ours || !record.data_type.retractable() {
                continue;
            }
            let remove = match RemoveRequest::sign(
                record.data_type,
                record.id.as_str(),
                record.sequence + 1,
                &self.keypair,
            ) {
                Ok(remove) => remove,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "Failed to sign tombstone");
                    continue;
                }
            };
            if let Err(e) = self.store.remove(&remove) {
                debug!(key = %record.key, error = %e, "Tombstone not stored");
                continue;
            }
            if let Err(e) = self.gossip(&DataRequest::Remove(remove)).await {
                warn!(key = %record.key, error = %e, "Failed to gossip tombstone");
            }
        }
    }

    /// Gossip our live records again so peers that missed them catch up.
    ///
    /// A refreshed record is re-signed first, carrying the refreshed expiry,
    /// since peers reject an add whose signed expiry has passed.
    pub async fn rebroadcast_own(&self) {
        let now = now_millis();
        let own = self
            .store
            .live_entries_by_author_at(&self.keypair.public_key(), now);
        for entry in own {
            let StoredEntry::Live {
                record,
                sequence,
                expires_at,
                refresh,
            } = entry
            else {
                continue;
            };
            let key = record.key();
            let record = if refresh.is_some() {
                match self.resign(record, sequence + 1, expires_at, now) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to re-sign refreshed record");
                        continue;
                    }
                }
            } else {
                record
            };
            if let Err(e) = self.gossip(&DataRequest::Add(record)).await {
                debug!(key = %key, error = %e, "Re-broadcast failed");
            }
        }
    }

    fn resign(
        &self,
        record: SignedRecord,
        sequence: u64,
        expires_at: i64,
        now: i64,
    ) -> StorageResult<SignedRecord> {
        let record = AuthenticatedRecord {
            sequence,
            created_at: now,
            expires_at,
            ..record.record
        };
        let signed = SignedRecord::sign(record, &self.keypair)?;
        self.store.add_or_update_at(&signed, now)?;
        Ok(signed)
    }

    pub fn save_snapshot(&self) -> StorageResult<()> {
        let snapshots = self
            .snapshots
            .as_ref()
            .ok_or(StorageError::SnapshotNotConfigured)?;
        snapshots.save(STORE_SNAPSHOT, &self.store.snapshot())
    }

    /// Restore the store from disk; returns restored entry count
    pub fn load_snapshot(&self) -> StorageResult<usize> {
        let snapshots = self
            .snapshots
            .as_ref()
            .ok_or(StorageError::SnapshotNotConfigured)?;
        let snapshot: StoreSnapshot = snapshots.load(STORE_SNAPSHOT)?;
        Ok(self.store.restore_at(snapshot, now_millis()))
    }

    fn on_gossip(&self, inbound: &InboundMessage, body: &[u8]) {
        let request = match DataRequest::deserialize(body) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection = %inbound.connection, error = %e, "Undecodable gossip dropped");
                return;
            }
        };

        match self.store.apply(&request) {
            Ok(key) => {
                debug!(key = %key, sequence = request.sequence(), peer = %inbound.peer.node_id, "Relaying accepted data");
                let network = self.network.clone();
                let origin = inbound.connection;
                let message = NetworkMessage::Gossip {
                    body: body.to_vec(),
                };
                tokio::spawn(async move {
                    if let Err(e) = network.broadcast(message, Some(origin)).await {
                        debug!(key = %key, error = %e, "Relay failed");
                    }
                });
            }
            Err(e) => {
                debug!(key = %request.key(), error = %e, "Rejected gossiped data");
            }
        }
    }

    fn on_inventory(&self, inbound: &InboundMessage, body: &[u8]) {
        let message = match InventoryMessage::deserialize(body) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %inbound.connection, error = %e, "Undecodable inventory message");
                return;
            }
        };

        match message {
            InventoryMessage::Request(request) => {
                let response = self.inventory.respond(&request);
                let body = match InventoryMessage::Response(response).serialize() {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode inventory response");
                        return;
                    }
                };
                let network = self.network.clone();
                let connection = inbound.connection;
                tokio::spawn(async move {
                    let reply = NetworkMessage::Direct {
                        channel: Channel::Inventory,
                        body,
                    };
                    if let Err(e) = network.send_to_connection(connection, reply).await {
                        debug!(connection = %connection, error = %e, "Inventory response not sent");
                    }
                });
            }
            InventoryMessage::Response(response) => {
                let waiting = self
                    .pending
                    .remove_if(&response.request_id, |_, (from, _)| *from == inbound.connection);
                match waiting {
                    Some((_, (_, reply))) => {
                        let _ = reply.send(response);
                    }
                    None => {
                        debug!(
                            connection = %inbound.connection,
                            request_id = response.request_id,
                            "Unsolicited inventory response"
                        );
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for StorageService {
    async fn on_message(&self, inbound: &InboundMessage) {
        match &inbound.message {
            NetworkMessage::Gossip { body } => self.on_gossip(inbound, body),
            NetworkMessage::Direct {
                channel: Channel::Inventory,
                body,
            } => self.on_inventory(inbound, body),
            _ => {}
        }
    }

    async fn on_connected(&self, connection: Arc<Connection>) {
        if !self.config.sync_on_connect || connection.direction() != Direction::Outbound {
            return;
        }
        let network = self.network.clone();
        let inventory = self.inventory.clone();
        let pending = self.pending.clone();
        let id = connection.id();
        tokio::spawn(async move {
            match sync_inventory(network, inventory, pending, id).await {
                Ok(report) => {
                    info!(connection = %id, accepted = report.accepted, rejected = report.rejected, "Inventory sync complete")
                }
                Err(e) => warn!(connection = %id, error = %e, "Inventory sync failed"),
            }
        });
    }

    async fn on_disconnected(&self, connection: ConnectionId) {
        self.pending.retain(|_, (from, _)| *from != connection);
    }
}

/// Request rounds until the peer reports nothing more to send
async fn sync_inventory(
    network: Arc<NetworkService>,
    inventory: Arc<InventoryService>,
    pending: Arc<PendingInventory>,
    connection: ConnectionId,
) -> StorageResult<ApplyReport> {
    let mut total = ApplyReport::default();
    let rounds = inventory.config().max_rounds.max(1);

    for round in 1..=rounds {
        let request = inventory.build_request();
        let request_id = request.request_id;
        let body = InventoryMessage::Request(request).serialize()?;

        let (tx, rx) = oneshot::channel();
        pending.insert(request_id, (connection, tx));

        let message = NetworkMessage::Direct {
            channel: Channel::Inventory,
            body,
        };
        if let Err(e) = network.send_to_connection(connection, message).await {
            pending.remove(&request_id);
            return Err(e.into());
        }

        let response = match tokio::time::timeout(inventory.config().request_timeout(), rx).await {
            Ok(Ok(response)) => response,
            _ => {
                pending.remove(&request_id);
                return Err(StorageError::InventoryTimeout(connection));
            }
        };

        let report = inventory.apply_response(&response);
        total.accepted += report.accepted;
        total.rejected += report.rejected;
        debug!(
            connection = %connection,
            round,
            accepted = report.accepted,
            more = response.max_size_reached,
            "Inventory round applied"
        );
        if !response.max_size_reached {
            break;
        }
    }
    Ok(total)
}
