//! Network service
//!
//! Owns the transports and live connections. Inbound frames are decoded,
//! authorized and dispatched to registered handlers; failures are dropped
//! silently and cost the connection a strike.

use crate::authorization::{AuthorizationConfig, AuthorizationService};
use crate::connection::{exchange_handshake, Connection, ConnectionId, Direction, Outbound};
use crate::frame::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
use crate::protocol::{Envelope, Handshake, NetworkMessage};
use crate::router::{BroadcastResult, GossipRouter, RouterConfig};
use crate::strikes::{ConnectionStrikes, StrikeReason};
use crate::transport::{BoxedStream, Transport, TransportError};
use crate::{NetworkError, NetworkResult};
use agora_core::{Address, NetworkId, TransportType};
use agora_crypto::PublicKey;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Message delivered to handlers after authorization
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection: ConnectionId,
    pub peer: NetworkId,
    pub message: NetworkMessage,
}

/// Consumer of inbound messages and connection events
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, inbound: &InboundMessage);

    async fn on_connected(&self, _connection: Arc<Connection>) {}

    async fn on_disconnected(&self, _connection: ConnectionId) {}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    pub max_frame_size: usize,
    /// Outbound messages buffered per connection
    pub outbound_queue: usize,
    pub strike_threshold: u32,
    pub strike_window_secs: u64,
    pub housekeeping_interval_secs: u64,
    pub router: RouterConfig,
    pub authorization: AuthorizationConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            handshake_timeout_ms: 10_000,
            max_frame_size: MAX_FRAME_SIZE,
            outbound_queue: 256,
            strike_threshold: 3,
            strike_window_secs: 600,
            housekeeping_interval_secs: 30,
            router: RouterConfig::default(),
            authorization: AuthorizationConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

pub struct NetworkService {
    config: NetworkConfig,
    pubkey: PublicKey,
    node_id: String,
    local_id: parking_lot::RwLock<Option<NetworkId>>,
    transports: parking_lot::RwLock<HashMap<TransportType, Arc<dyn Transport>>>,
    connections: Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>,
    authorization: Arc<AuthorizationService>,
    strikes: ConnectionStrikes,
    router: Arc<GossipRouter>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    next_connection_id: AtomicU64,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkService {
    pub fn new(pubkey: PublicKey, config: NetworkConfig) -> NetworkResult<Self> {
        let node_id = NetworkId::derive_node_id(&pubkey);
        let authorization = Arc::new(AuthorizationService::with_config(
            node_id.clone(),
            config.authorization.clone(),
        )?);
        let strikes = ConnectionStrikes::with_threshold(
            config.strike_threshold,
            Duration::from_secs(config.strike_window_secs),
        );
        let router = Arc::new(GossipRouter::with_config(config.router.clone()));

        Ok(Self {
            config,
            pubkey,
            node_id,
            local_id: parking_lot::RwLock::new(None),
            transports: parking_lot::RwLock::new(HashMap::new()),
            connections: Arc::new(RwLock::new(HashMap::new())),
            authorization,
            strikes,
            router,
            handlers: RwLock::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .write()
            .insert(transport.transport_type(), transport);
    }

    pub async fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Bind every transport and start accepting; returns our network id
    pub async fn start(self: &Arc<Self>) -> NetworkResult<NetworkId> {
        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().values().cloned().collect();
        if transports.is_empty() {
            return Err(NetworkError::NoRoute("no transport configured".into()));
        }

        let mut addresses = BTreeMap::new();
        for transport in transports {
            let address = transport.bind().await?;
            addresses.insert(transport.transport_type(), address);

            let service = self.clone();
            let handle = tokio::spawn(async move { service.accept_loop(transport).await });
            self.tasks.lock().push(handle);
        }

        let network_id = NetworkId::new(self.pubkey, self.node_id.clone(), addresses)
            .map_err(|e| NetworkError::NoRoute(e.to_string()))?;
        *self.local_id.write() = Some(network_id.clone());

        let service = self.clone();
        let interval = Duration::from_secs(self.config.housekeeping_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                service.router.prune();
                service.strikes.cleanup_expired().await;
            }
        });
        self.tasks.lock().push(handle);

        info!(network_id = %network_id, "Network service started");
        Ok(network_id)
    }

    /// Close transports and connections and stop background tasks
    pub async fn shutdown(&self) {
        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().values().cloned().collect();
        for transport in transports {
            transport.close().await;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        let connections: Vec<Arc<Connection>> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.close();
            self.authorization.release_connection(connection.id());
        }
        info!(node_id = %self.node_id, "Network service stopped");
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_network_id(&self) -> Option<NetworkId> {
        self.local_id.read().clone()
    }

    pub fn router(&self) -> &Arc<GossipRouter> {
        &self.router
    }

    pub fn authorization(&self) -> &Arc<AuthorizationService> {
        &self.authorization
    }

    pub fn strikes(&self) -> &ConnectionStrikes {
        &self.strikes
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn find_connection(&self, node_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .await
            .values()
            .find(|c| c.peer().node_id == node_id && !c.is_closed())
            .cloned()
    }

    /// Dial an address on one transport
    pub async fn connect(
        self: &Arc<Self>,
        transport_type: TransportType,
        address: &Address,
    ) -> NetworkResult<Arc<Connection>> {
        let transport = self
            .transports
            .read()
            .get(&transport_type)
            .cloned()
            .ok_or(NetworkError::Transport(TransportError::Unsupported(
                transport_type,
            )))?;
        let stream = transport.connect(address).await?;
        self.establish(stream, transport_type, Direction::Outbound)
            .await
    }

    /// Existing connection to a node, or a new one over any shared transport
    pub async fn connection_to(self: &Arc<Self>, to: &NetworkId) -> NetworkResult<Arc<Connection>> {
        if let Some(connection) = self.find_connection(&to.node_id).await {
            return Ok(connection);
        }

        let supported: Vec<TransportType> = {
            let transports = self.transports.read();
            to.transports()
                .filter(|t| transports.contains_key(t))
                .copied()
                .collect()
        };

        let mut last_error = None;
        for transport_type in supported {
            if let Some(address) = to.address_for(transport_type) {
                match self.connect(transport_type, address).await {
                    Ok(connection) => return Ok(connection),
                    Err(e) => {
                        debug!(peer = %to.node_id, transport = %transport_type, error = %e, "Dial failed");
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NetworkError::NoRoute(to.to_string())))
    }

    /// Send to a node and wait until the frame is written
    pub async fn send(self: &Arc<Self>, to: &NetworkId, message: NetworkMessage) -> NetworkResult<()> {
        let connection = self.connection_to(to).await?;
        connection.send(message).await
    }

    pub async fn send_to_connection(
        &self,
        connection: ConnectionId,
        message: NetworkMessage,
    ) -> NetworkResult<()> {
        let connection = self
            .connections
            .read()
            .await
            .get(&connection)
            .cloned()
            .ok_or(NetworkError::ConnectionClosed(connection))?;
        connection.send(message).await
    }

    /// Gossip to a random subset of peers, skipping `exclude`
    pub async fn broadcast(
        &self,
        message: NetworkMessage,
        exclude: Option<ConnectionId>,
    ) -> NetworkResult<BroadcastResult> {
        let connections = self.connections().await;
        self.router.broadcast(connections, message, exclude).await
    }

    /// Politely close a connection
    pub async fn close_connection(&self, connection: ConnectionId, reason: &str) {
        let found = self.connections.read().await.get(&connection).cloned();
        if let Some(conn) = found {
            let close = NetworkMessage::Close {
                reason: reason.to_string(),
            };
            let _ = tokio::time::timeout(Duration::from_secs(1), conn.send(close)).await;
            conn.close();
        }
        self.remove_connection(connection).await;
    }

    async fn current_load(&self) -> f64 {
        let count = self.connections.read().await.len();
        count as f64 / self.config.max_connections.max(1) as f64
    }

    /// Recompute local load and re-advertise it to peers whose price changed
    async fn update_load(&self) {
        let load = self.current_load().await;
        self.authorization.set_load(load);
        for connection in self.connections().await {
            if !self.authorization.advertise_load(connection.id(), load) {
                continue;
            }
            debug!(connection = %connection.id(), load, "Advertising new load");
            if let Err(e) = connection.enqueue(NetworkMessage::load_update(load)) {
                debug!(connection = %connection.id(), error = %e, "Load update not queued");
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let transport_type = transport.transport_type();
        loop {
            match transport.accept().await {
                Ok((stream, from)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service
                            .establish(stream, transport_type, Direction::Inbound)
                            .await
                        {
                            debug!(peer = %from, error = %e, "Inbound connection rejected");
                        }
                    });
                }
                Err(TransportError::Closed) | Err(TransportError::NotBound) => break,
                Err(e) => {
                    warn!(transport = %transport_type, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!(transport = %transport_type, "Accept loop stopped");
    }

    async fn establish(
        self: &Arc<Self>,
        mut stream: BoxedStream,
        transport: TransportType,
        direction: Direction,
    ) -> NetworkResult<Arc<Connection>> {
        if self.connection_count().await >= self.config.max_connections {
            return Err(NetworkError::ConnectionLimit(self.config.max_connections));
        }
        let local = self.local_network_id().ok_or(NetworkError::NotStarted)?;
        let ours = Handshake::new(local, self.current_load().await);

        let theirs = tokio::time::timeout(
            self.config.handshake_timeout(),
            exchange_handshake(&mut stream, &ours, direction, self.config.max_frame_size),
        )
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)??;

        if theirs.network_id.node_id == self.node_id {
            return Err(NetworkError::SelfConnection);
        }

        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst));
        self.authorization.advertise_initial(id, ours.load);
        let (connection, queue) =
            Connection::new(id, &theirs, transport, direction, self.config.outbound_queue);
        let (reader, writer) = tokio::io::split(stream);

        self.connections
            .write()
            .await
            .insert(id, connection.clone());
        self.update_load().await;

        tokio::spawn(run_writer(
            connection.clone(),
            writer,
            queue,
            self.authorization.clone(),
            self.config.max_frame_size,
        ));
        tokio::spawn(self.clone().run_reader(connection.clone(), reader));

        info!(
            connection = %id,
            peer = %theirs.network_id.node_id,
            direction = ?direction,
            "Connection established"
        );

        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            handler.on_connected(connection.clone()).await;
        }
        Ok(connection)
    }

    async fn run_reader(self: Arc<Self>, connection: Arc<Connection>, mut reader: ReadHalf<BoxedStream>) {
        let mut closed = connection.closed_signal();
        loop {
            if connection.is_closed() {
                break;
            }
            let frame = tokio::select! {
                frame = read_frame(&mut reader, self.config.max_frame_size) => frame,
                _ = closed.changed() => break,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(FrameError::Closed) => break,
                Err(e) => {
                    debug!(connection = %connection.id(), error = %e, "Read failed");
                    break;
                }
            };

            let envelope = match Envelope::deserialize(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    let reason = StrikeReason::MalformedEnvelope {
                        reason: e.to_string(),
                    };
                    if self.strike(&connection, reason).await {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) =
                self.authorization
                    .authorize(connection.id(), &envelope.token, &envelope.message)
            {
                debug!(connection = %connection.id(), error = %e, "Dropped unauthorized message");
                let reason = StrikeReason::Unauthorized {
                    reason: e.to_string(),
                };
                if self.strike(&connection, reason).await {
                    break;
                }
                continue;
            }

            if !self.dispatch(&connection, envelope.message).await {
                break;
            }
        }
        self.remove_connection(connection.id()).await;
    }

    /// Returns false when the connection should stop reading
    async fn dispatch(&self, connection: &Arc<Connection>, message: NetworkMessage) -> bool {
        let deliver = match &message {
            NetworkMessage::Ack { message_hash } => {
                self.router.on_ack(*message_hash, connection.id());
                false
            }
            NetworkMessage::Close { reason } => {
                debug!(connection = %connection.id(), reason = %reason, "Peer closed connection");
                return false;
            }
            NetworkMessage::LoadUpdate { load_permille } => {
                let load = f64::from(*load_permille) / 1000.0;
                debug!(connection = %connection.id(), load, "Peer load updated");
                connection.set_peer_load(load);
                false
            }
            NetworkMessage::Gossip { .. } => match message.hash() {
                Ok(hash) => {
                    if let Err(e) = connection.enqueue(NetworkMessage::Ack { message_hash: hash }) {
                        debug!(connection = %connection.id(), error = %e, "Ack not queued");
                    }
                    let fresh = self.router.is_new(hash);
                    if !fresh {
                        debug!(connection = %connection.id(), "Duplicate gossip ignored");
                    }
                    fresh
                }
                Err(_) => false,
            },
            NetworkMessage::Direct { .. } => true,
        };

        if deliver {
            let inbound = InboundMessage {
                connection: connection.id(),
                peer: connection.peer().clone(),
                message,
            };
            let handlers = self.handlers.read().await.clone();
            for handler in handlers {
                handler.on_message(&inbound).await;
            }
        }
        true
    }

    async fn strike(&self, connection: &Arc<Connection>, reason: StrikeReason) -> bool {
        let outcome = self.strikes.record(connection.id(), reason).await;
        if outcome.should_close {
            connection.close();
        }
        outcome.should_close
    }

    async fn remove_connection(&self, id: ConnectionId) {
        let removed = self.connections.write().await.remove(&id);
        if let Some(connection) = removed {
            connection.close();
            self.authorization.release_connection(id);
            self.strikes.release(id).await;
            self.update_load().await;
            info!(connection = %id, peer = %connection.peer().node_id, "Connection closed");

            let handlers = self.handlers.read().await.clone();
            for handler in handlers {
                handler.on_disconnected(id).await;
            }
        }
    }
}

async fn run_writer(
    connection: Arc<Connection>,
    mut writer: WriteHalf<BoxedStream>,
    mut queue: mpsc::Receiver<Outbound>,
    authorization: Arc<AuthorizationService>,
    max_frame_size: usize,
) {
    let mut closed = connection.closed_signal();
    loop {
        if connection.is_closed() {
            break;
        }
        let outbound = tokio::select! {
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            _ = closed.changed() => break,
        };

        let result = write_envelope(
            &connection,
            &mut writer,
            &authorization,
            outbound.message,
            max_frame_size,
        )
        .await;
        let failed = result.is_err();
        if let Err(e) = &result {
            debug!(connection = %connection.id(), error = %e, "Write failed");
        }
        if let Some(done) = outbound.done {
            let _ = done.send(result);
        }
        if failed {
            connection.close();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_envelope(
    connection: &Connection,
    writer: &mut WriteHalf<BoxedStream>,
    authorization: &AuthorizationService,
    message: NetworkMessage,
    max_frame_size: usize,
) -> NetworkResult<()> {
    let token = authorization
        .create_token(
            connection.id(),
            &connection.peer().node_id,
            connection.peer_load(),
            &message,
            connection.cancel_flag(),
        )
        .await?;
    let bytes = Envelope::new(token, message).serialize()?;
    write_frame(writer, &bytes, max_frame_size).await?;
    Ok(())
}
