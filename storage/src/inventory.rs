//! Bloom-filter inventory reconciliation
//!
//! The requester sends one filter per data type describing which versions it
//! holds. The responder returns what passes the filter, highest priority
//! first, until the response budget is used up: live records, records kept
//! alive by a refresh together with that refresh, and signed retractions.

use crate::filter::DataFilter;
use crate::record::{DataType, RefreshedRecord, RemoveRequest, SignedRecord, StorageKey};
use crate::store::{DataStore, StoredEntry};
use crate::{DataStoreError, DataStoreResult};
use agora_core::time::now_millis;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Filters larger than this are ignored
pub const MAX_FILTER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub max_response_bytes: usize,
    pub request_timeout_ms: u64,
    pub false_positive_rate: f64,
    /// Request rounds per sync before giving up on `max_size_reached`
    pub max_rounds: usize,
    pub offset_pct: u8,
    pub range_pct: u8,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: 2000 * 1024,
            request_timeout_ms: 30_000,
            false_positive_rate: 0.01,
            max_rounds: 10,
            offset_pct: 0,
            range_pct: 100,
        }
    }
}

impl InventoryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRequest {
    pub request_id: u64,
    pub filters: Vec<DataFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub request_id: u64,
    pub records: Vec<SignedRecord>,
    pub refreshed: Vec<RefreshedRecord>,
    pub removals: Vec<RemoveRequest>,
    /// More items passed the filters than fit in the budget
    pub max_size_reached: bool,
}

impl InventoryResponse {
    pub fn len(&self) -> usize {
        self.records.len() + self.refreshed.len() + self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inventory exchange on the direct inventory channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InventoryMessage {
    Request(InventoryRequest),
    Response(InventoryResponse),
}

impl InventoryMessage {
    pub fn serialize(&self) -> DataStoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DataStoreError::Serialization(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> DataStoreResult<Self> {
        bincode::deserialize(data).map_err(|e| DataStoreError::Serialization(e.to_string()))
    }
}

/// One servable version of a key
enum Item {
    Record(SignedRecord),
    Refreshed(RefreshedRecord),
    Removal(RemoveRequest),
}

impl Item {
    fn from_entry(entry: StoredEntry) -> Option<Self> {
        match entry {
            StoredEntry::Live {
                record,
                refresh: Some(refresh),
                ..
            } => Some(Item::Refreshed(RefreshedRecord { record, refresh })),
            StoredEntry::Live { record, .. } => Some(Item::Record(record)),
            StoredEntry::Tombstone { removal, .. } => removal.map(Item::Removal),
        }
    }

    fn key(&self) -> StorageKey {
        match self {
            Item::Record(record) => record.key(),
            Item::Refreshed(refreshed) => refreshed.key(),
            Item::Removal(removal) => removal.key,
        }
    }

    fn sequence(&self) -> u64 {
        match self {
            Item::Record(record) => record.record.sequence,
            Item::Refreshed(refreshed) => refreshed.sequence(),
            Item::Removal(removal) => removal.sequence,
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            Item::Record(record) => record.record.data_type,
            Item::Refreshed(refreshed) => refreshed.record.record.data_type,
            Item::Removal(removal) => removal.data_type,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Item::Record(record) => record.encoded_len(),
            Item::Refreshed(refreshed) => refreshed.encoded_len(),
            Item::Removal(removal) => {
                bincode::serialized_size(removal).map_or(usize::MAX, |n| n as usize)
            }
        }
    }
}

/// Outcome of applying a response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub accepted: usize,
    pub rejected: usize,
}

pub struct InventoryService {
    config: InventoryConfig,
    store: Arc<DataStore>,
    next_request_id: AtomicU64,
}

impl InventoryService {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self::with_config(store, InventoryConfig::default())
    }

    pub fn with_config(store: Arc<DataStore>, config: InventoryConfig) -> Self {
        Self {
            config,
            store,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &InventoryConfig {
        &self.config
    }

    /// One filter per data type over every version we hold
    pub fn build_request(&self) -> InventoryRequest {
        let filters = DataType::ALL
            .iter()
            .map(|data_type| {
                let held = self.store.held_versions(*data_type);
                DataFilter::new(*data_type, &held, self.config.false_positive_rate)
                    .with_range(self.config.offset_pct, self.config.range_pct)
            })
            .collect();

        InventoryRequest {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            filters,
        }
    }

    pub fn respond(&self, request: &InventoryRequest) -> InventoryResponse {
        self.respond_at(request, now_millis())
    }

    /// Versions the requester probably lacks, bounded by the response budget
    pub fn respond_at(&self, request: &InventoryRequest, now: i64) -> InventoryResponse {
        let mut candidates: Vec<Item> = Vec::new();
        for filter in &request.filters {
            if !filter.bloom.is_valid() || filter.bloom.byte_len() > MAX_FILTER_BYTES {
                debug!(data_type = %filter.data_type, "Ignoring malformed inventory filter");
                continue;
            }
            candidates.extend(
                self.store
                    .servable_entries_at(filter.data_type, now)
                    .into_iter()
                    .filter_map(Item::from_entry)
                    .filter(|item| filter.do_include(&item.key(), item.sequence())),
            );
        }

        candidates.sort_by_key(|item| {
            (
                Reverse(item.data_type().priority()),
                Reverse(item.sequence()),
                item.key(),
            )
        });

        let mut response = InventoryResponse {
            request_id: request.request_id,
            records: Vec::new(),
            refreshed: Vec::new(),
            removals: Vec::new(),
            max_size_reached: false,
        };
        let mut used = 0usize;
        for item in candidates {
            let size = item.encoded_len();
            if used.saturating_add(size) > self.config.max_response_bytes {
                response.max_size_reached = true;
                break;
            }
            used += size;
            match item {
                Item::Record(record) => response.records.push(record),
                Item::Refreshed(refreshed) => response.refreshed.push(refreshed),
                Item::Removal(removal) => response.removals.push(removal),
            }
        }

        debug!(
            request_id = request.request_id,
            records = response.records.len(),
            refreshed = response.refreshed.len(),
            removals = response.removals.len(),
            bytes = used,
            max_size_reached = response.max_size_reached,
            "Answered inventory request"
        );
        response
    }

    pub fn apply_response(&self, response: &InventoryResponse) -> ApplyReport {
        self.apply_response_at(response, now_millis())
    }

    /// Feed received items to the store; inventory results are not relayed
    pub fn apply_response_at(&self, response: &InventoryResponse, now: i64) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut tally = |key: StorageKey, result: DataStoreResult<()>| match result {
            Ok(()) => report.accepted += 1,
            Err(e) => {
                debug!(key = %key, error = %e, "Inventory item rejected");
                report.rejected += 1;
            }
        };
        for record in &response.records {
            tally(record.key(), self.store.add_or_update_at(record, now).map(|_| ()));
        }
        for refreshed in &response.refreshed {
            tally(refreshed.key(), self.store.add_refreshed_at(refreshed, now).map(|_| ()));
        }
        for removal in &response.removals {
            tally(removal.key, self.store.remove_at(removal, now));
        }
        report
    }
}
