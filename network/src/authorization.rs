//! Proof-of-work admission control
//!
//! Every envelope carries a token: a nonce whose hash, bound to the message
//! payload and to a per-connection counter, has enough leading zero bits for
//! the message class. Receivers recompute the hash and refuse any counter
//! that is not above the highest one already seen on that connection.
//!
//! Difficulty follows the load the receiver advertised to that peer. Tokens
//! priced for the current or the previous advertisement are accepted, so a
//! load change never invalidates work already in flight.

use crate::connection::ConnectionId;
use crate::protocol::NetworkMessage;
use agora_crypto::{hash_sha256_parts, leading_zero_bits};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Nonces tried between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Pricing class of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageClass {
    /// Unauthenticated broadcast to the whole network
    Broadcast,
    /// Point-to-point on an established channel
    Direct,
    /// Receipts and control messages
    Ack,
}

impl MessageClass {
    pub const ALL: [MessageClass; 3] = [
        MessageClass::Broadcast,
        MessageClass::Direct,
        MessageClass::Ack,
    ];
}

/// Proof of work attached to every envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationToken {
    pub class: MessageClass,
    pub counter: u64,
    pub payload_hash: [u8; 32],
    /// Leading zero bits the sender claims to have solved for
    pub difficulty: u32,
    pub nonce: u64,
}

impl AuthorizationToken {
    /// Token with no work done; only useful for tests and zero-difficulty classes
    pub fn unsolved(class: MessageClass, counter: u64, payload_hash: [u8; 32]) -> Self {
        Self {
            class,
            counter,
            payload_hash,
            difficulty: 0,
            nonce: 0,
        }
    }

    /// Hash the token's nonce against the receiver's challenge
    pub fn solution_hash(&self, receiver_node_id: &str) -> [u8; 32] {
        let challenge = challenge(receiver_node_id, self.counter);
        solution_hash(&self.payload_hash, &challenge, self.nonce)
    }
}

fn challenge(receiver_node_id: &str, counter: u64) -> [u8; 32] {
    hash_sha256_parts(&[receiver_node_id.as_bytes(), &counter.to_le_bytes()])
}

fn solution_hash(payload_hash: &[u8; 32], challenge: &[u8; 32], nonce: u64) -> [u8; 32] {
    hash_sha256_parts(&[payload_hash, challenge, &nonce.to_le_bytes()])
}

/// Cancels in-flight proof-of-work when its connection goes away
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Proof of work cancelled")]
    Cancelled,

    #[error("Token payload hash does not match message")]
    PayloadMismatch,

    #[error("Token class {declared:?} does not match message class {actual:?}")]
    ClassMismatch {
        declared: MessageClass,
        actual: MessageClass,
    },

    #[error("Insufficient difficulty: required {required} bits, token declares {declared}")]
    InsufficientDifficulty { required: u32, declared: u32 },

    #[error("Proof of work does not meet declared difficulty")]
    InvalidProof,

    #[error("Counter {counter} already used (highest seen {highest})")]
    ReplayedCounter { counter: u64, highest: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

pub type AuthorizationResult<T> = Result<T, AuthorizationError>;

/// Difficulty settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Base leading-zero bits for broadcast messages
    pub broadcast_bits: u32,
    /// Base bits for direct messages
    pub direct_bits: u32,
    /// Base bits for acks and control messages
    pub ack_bits: u32,
    /// Extra bits demanded at full receiver load
    pub load_bits: u32,
    pub min_bits: u32,
    pub max_bits: u32,
    /// Slack for load changes between token creation and verification
    pub tolerance_bits: u32,
    /// Worker threads per message class
    pub threads_per_class: usize,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            broadcast_bits: 12,
            direct_bits: 8,
            ack_bits: 4,
            load_bits: 4,
            min_bits: 0,
            max_bits: 24,
            tolerance_bits: 1,
            threads_per_class: 2,
        }
    }
}

impl AuthorizationConfig {
    fn base_bits(&self, class: MessageClass) -> u32 {
        match class {
            MessageClass::Broadcast => self.broadcast_bits,
            MessageClass::Direct => self.direct_bits,
            MessageClass::Ack => self.ack_bits,
        }
    }

    /// Required bits for a class given the receiver's load
    pub fn required_bits(&self, class: MessageClass, load: f64) -> u32 {
        let load = if load.is_finite() {
            load.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let extra = (load * self.load_bits as f64).round() as u32;
        self.base_bits(class)
            .saturating_add(extra)
            .max(self.min_bits)
            .min(self.max_bits)
    }
}

/// Issues and verifies proof-of-work tokens
pub struct AuthorizationService {
    config: AuthorizationConfig,
    local_node_id: String,
    pools: HashMap<MessageClass, Arc<rayon::ThreadPool>>,
    outbound_counters: DashMap<ConnectionId, u64>,
    inbound_highest: DashMap<ConnectionId, u64>,
    /// Loads last advertised to each peer: (current, previous)
    advertised: DashMap<ConnectionId, (f64, f64)>,
    /// Local load as f64 bits; prices peers we advertised nothing to
    load: AtomicU64,
}

impl AuthorizationService {
    /// Create a service with default difficulties
    pub fn new(local_node_id: impl Into<String>) -> AuthorizationResult<Self> {
        Self::with_config(local_node_id, AuthorizationConfig::default())
    }

    pub fn with_config(
        local_node_id: impl Into<String>,
        config: AuthorizationConfig,
    ) -> AuthorizationResult<Self> {
        let mut pools = HashMap::new();
        for class in MessageClass::ALL {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads_per_class.max(1))
                .thread_name(move |i| format!("pow-{:?}-{}", class, i))
                .build()
                .map_err(|e| AuthorizationError::WorkerPool(e.to_string()))?;
            pools.insert(class, Arc::new(pool));
        }

        Ok(Self {
            config,
            local_node_id: local_node_id.into(),
            pools,
            outbound_counters: DashMap::new(),
            inbound_highest: DashMap::new(),
            advertised: DashMap::new(),
            load: AtomicU64::new(0f64.to_bits()),
        })
    }

    pub fn config(&self) -> &AuthorizationConfig {
        &self.config
    }

    /// Update the local load used when verifying inbound tokens
    pub fn set_load(&self, load: f64) {
        self.load
            .store(load.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.load.load(Ordering::Relaxed))
    }

    /// Record the load sent to a peer in its handshake
    pub fn advertise_initial(&self, connection: ConnectionId, load: f64) {
        let load = clamp_load(load);
        self.advertised.insert(connection, (load, load));
    }

    /// Record a new load for a peer if it changes the price of any class.
    ///
    /// Returns true when the peer must be told; the prior advertisement stays
    /// acceptable until the next change.
    pub fn advertise_load(&self, connection: ConnectionId, load: f64) -> bool {
        let load = clamp_load(load);
        let Some(mut entry) = self.advertised.get_mut(&connection) else {
            return false;
        };
        let (current, _) = *entry;
        let changed = MessageClass::ALL.iter().any(|class| {
            self.config.required_bits(*class, current) != self.config.required_bits(*class, load)
        });
        if changed {
            *entry = (load, current);
        }
        changed
    }

    /// Bits a peer's token must carry for `class`
    pub fn required_bits_for(&self, connection: ConnectionId, class: MessageClass) -> u32 {
        match self.advertised.get(&connection) {
            Some(entry) => {
                let (current, previous) = *entry;
                self.config
                    .required_bits(class, current)
                    .min(self.config.required_bits(class, previous))
            }
            None => self.config.required_bits(class, self.load()),
        }
    }

    fn next_counter(&self, connection: ConnectionId) -> u64 {
        let mut counter = self.outbound_counters.entry(connection).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Solve a token for `message` addressed to `receiver_node_id`.
    ///
    /// The nonce search runs on the worker pool of the message class; the
    /// caller only awaits its result.
    pub async fn create_token(
        &self,
        connection: ConnectionId,
        receiver_node_id: &str,
        receiver_load: f64,
        message: &NetworkMessage,
        cancel: &CancelFlag,
    ) -> AuthorizationResult<AuthorizationToken> {
        let class = message.class();
        let payload_hash = message
            .hash()
            .map_err(|e| AuthorizationError::Serialization(e.to_string()))?;
        let difficulty = self.config.required_bits(class, receiver_load);
        let counter = self.next_counter(connection);
        let challenge = challenge(receiver_node_id, counter);

        let pool = self
            .pools
            .get(&class)
            .cloned()
            .ok_or_else(|| AuthorizationError::WorkerPool(format!("no pool for {:?}", class)))?;
        let (tx, rx) = oneshot::channel();
        let cancel = cancel.clone();
        pool.spawn(move || {
            let _ = tx.send(solve(&payload_hash, &challenge, difficulty, &cancel));
        });

        let nonce = rx
            .await
            .map_err(|_| AuthorizationError::WorkerPool("worker dropped result".into()))??;

        Ok(AuthorizationToken {
            class,
            counter,
            payload_hash,
            difficulty,
            nonce,
        })
    }

    /// Check a received token against its message and connection history
    pub fn authorize(
        &self,
        connection: ConnectionId,
        token: &AuthorizationToken,
        message: &NetworkMessage,
    ) -> AuthorizationResult<()> {
        let class = message.class();
        if token.class != class {
            return Err(AuthorizationError::ClassMismatch {
                declared: token.class,
                actual: class,
            });
        }

        let payload_hash = message
            .hash()
            .map_err(|e| AuthorizationError::Serialization(e.to_string()))?;
        if token.payload_hash != payload_hash {
            return Err(AuthorizationError::PayloadMismatch);
        }

        let required = self.required_bits_for(connection, class);
        if token.difficulty.saturating_add(self.config.tolerance_bits) < required {
            return Err(AuthorizationError::InsufficientDifficulty {
                required,
                declared: token.difficulty,
            });
        }

        let hash = token.solution_hash(&self.local_node_id);
        if leading_zero_bits(&hash) < token.difficulty {
            return Err(AuthorizationError::InvalidProof);
        }

        let mut highest = self.inbound_highest.entry(connection).or_insert(0);
        if token.counter <= *highest {
            debug!(
                connection = %connection,
                counter = token.counter,
                highest = *highest,
                "Rejected reused token counter"
            );
            return Err(AuthorizationError::ReplayedCounter {
                counter: token.counter,
                highest: *highest,
            });
        }
        *highest = token.counter;
        Ok(())
    }

    /// Forget counters of a closed connection
    pub fn release_connection(&self, connection: ConnectionId) {
        self.outbound_counters.remove(&connection);
        self.inbound_highest.remove(&connection);
        self.advertised.remove(&connection);
    }
}

fn clamp_load(load: f64) -> f64 {
    if load.is_finite() {
        load.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn solve(
    payload_hash: &[u8; 32],
    challenge: &[u8; 32],
    difficulty: u32,
    cancel: &CancelFlag,
) -> AuthorizationResult<u64> {
    let mut nonce: u64 = 0;
    loop {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(AuthorizationError::Cancelled);
        }
        let hash = solution_hash(payload_hash, challenge, nonce);
        if leading_zero_bits(&hash) >= difficulty {
            return Ok(nonce);
        }
        nonce = nonce.wrapping_add(1);
    }
}
