//! Agora Storage Layer
//!
//! Signed, versioned records replicated by gossip and reconciled between
//! peers with bloom-filter inventories. State stays in memory and is
//! snapshotted to disk periodically.

pub mod bloom;
pub mod filter;
pub mod inventory;
pub mod record;
pub mod service;
pub mod snapshot;
pub mod store;

pub use bloom::BloomFilter;
pub use filter::DataFilter;
pub use inventory::{
    ApplyReport, InventoryConfig, InventoryMessage, InventoryRequest, InventoryResponse,
    InventoryService,
};
pub use record::{
    AuthenticatedRecord, DataRequest, DataType, RefreshRequest, RefreshedRecord, RemoveRequest,
    SignedRecord, StorageKey,
};
pub use service::{StorageConfig, StorageService, STORE_SNAPSHOT};
pub use snapshot::SnapshotStore;
pub use store::{DataStore, ExpiredRecord, StoreConfig, StoreEvent, StoreSnapshot, StoredEntry};

use agora_network::{ConnectionId, NetworkError};
use thiserror::Error;

/// Why a record or request was refused by the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataStoreError {
    #[error("Invalid signature for {0}")]
    InvalidSignature(StorageKey),

    #[error("Key {0} does not belong to the signing author")]
    KeyMismatch(StorageKey),

    #[error("Record author does not match signing key")]
    AuthorMismatch,

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record body of {size} bytes exceeds {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Record {0} has expired")]
    Expired(StorageKey),

    #[error("Stale sequence for {key}: stored {stored}, received {received}")]
    StaleSequence {
        key: StorageKey,
        stored: u64,
        received: u64,
    },

    #[error("Store full for {0} records")]
    StoreFull(DataType),

    #[error("{0} records cannot be retracted")]
    NotRetractable(DataType),

    #[error("No live record for {0}")]
    NotFound(StorageKey),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DataStoreResult<T> = Result<T, DataStoreError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("No snapshot directory configured")]
    SnapshotNotConfigured,

    #[error("Data store error: {0}")]
    DataStore(#[from] DataStoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Inventory request to {0} timed out")]
    InventoryTimeout(ConnectionId),
}

pub type StorageResult<T> = Result<T, StorageError>;
