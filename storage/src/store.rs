//! Replicated data store
//!
//! Mutations of one key are compare-and-swap on its `DashMap` entry, so
//! concurrent arrivals of the same record from different connections cannot
//! interleave. There is no store-wide lock.

use crate::record::{
    DataType, RefreshRequest, RefreshedRecord, RemoveRequest, SignedRecord, StorageKey,
};
use crate::{DataRequest, DataStoreError, DataStoreResult};
use agora_core::time::now_millis;
use agora_crypto::PublicKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Overrides every data type's entry limit when set
    pub max_entries: Option<usize>,
    pub max_body_bytes: usize,
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            max_body_bytes: 64 * 1024,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredEntry {
    Live {
        record: SignedRecord,
        sequence: u64,
        expires_at: i64,
        /// Latest refresh, when one extended the signed expiry
        refresh: Option<RefreshRequest>,
    },
    /// Retracted; blocks older adds until it expires
    Tombstone {
        data_type: DataType,
        author: PublicKey,
        sequence: u64,
        expires_at: i64,
        /// Author-signed retraction; `None` when left by the expiry sweep
        removal: Option<RemoveRequest>,
    },
}

impl StoredEntry {
    pub fn sequence(&self) -> u64 {
        match self {
            StoredEntry::Live { sequence, .. } | StoredEntry::Tombstone { sequence, .. } => {
                *sequence
            }
        }
    }

    pub fn expires_at(&self) -> i64 {
        match self {
            StoredEntry::Live { expires_at, .. } | StoredEntry::Tombstone { expires_at, .. } => {
                *expires_at
            }
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            StoredEntry::Live { record, .. } => record.record.data_type,
            StoredEntry::Tombstone { data_type, .. } => *data_type,
        }
    }

    pub fn author(&self) -> PublicKey {
        match self {
            StoredEntry::Live { record, .. } => record.record.author,
            StoredEntry::Tombstone { author, .. } => *author,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, StoredEntry::Live { .. })
    }

    /// The record with the refresh keeping it alive, if any
    pub fn refreshed(&self) -> Option<RefreshedRecord> {
        match self {
            StoredEntry::Live {
                record,
                refresh: Some(refresh),
                ..
            } => Some(RefreshedRecord {
                record: record.clone(),
                refresh: refresh.clone(),
            }),
            _ => None,
        }
    }

    fn verify(&self, key: &StorageKey) -> DataStoreResult<()> {
        match self {
            StoredEntry::Live {
                record, refresh, ..
            } => {
                record.verify()?;
                if record.key() != *key {
                    return Err(DataStoreError::KeyMismatch(*key));
                }
                if let Some(refresh) = refresh {
                    refresh.verify()?;
                    if refresh.key != *key {
                        return Err(DataStoreError::KeyMismatch(*key));
                    }
                }
            }
            StoredEntry::Tombstone {
                removal: Some(removal),
                ..
            } => {
                removal.verify()?;
                if removal.key != *key {
                    return Err(DataStoreError::KeyMismatch(*key));
                }
            }
            StoredEntry::Tombstone { removal: None, .. } => {}
        }
        Ok(())
    }

    fn live_record_at(&self, now: i64) -> Option<&SignedRecord> {
        match self {
            StoredEntry::Live {
                record, expires_at, ..
            } if *expires_at > now => Some(record),
            _ => None,
        }
    }
}

/// Change notification for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added(SignedRecord),
    Removed {
        key: StorageKey,
        data_type: DataType,
    },
    Refreshed {
        key: StorageKey,
        expires_at: i64,
    },
    Expired {
        key: StorageKey,
        data_type: DataType,
    },
}

/// Record dropped by a prune pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredRecord {
    pub key: StorageKey,
    pub data_type: DataType,
    pub id: String,
    pub author: PublicKey,
    pub sequence: u64,
}

/// Persisted form of the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub entries: Vec<(StorageKey, StoredEntry)>,
}

pub struct DataStore {
    config: StoreConfig,
    entries: DashMap<StorageKey, StoredEntry>,
    live_counts: [AtomicUsize; 4],
    events: broadcast::Sender<StoreEvent>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            entries: DashMap::new(),
            live_counts: std::array::from_fn(|_| AtomicUsize::new(0)),
            events,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn max_entries(&self, data_type: DataType) -> usize {
        self.config
            .max_entries
            .unwrap_or_else(|| data_type.max_entries())
    }

    /// Live records of one type, including ones awaiting the sweep
    pub fn count(&self, data_type: DataType) -> usize {
        self.live_counts[data_type.index()].load(Ordering::Acquire)
    }

    /// Entries including tombstones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn emit(&self, event: StoreEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Claim a live slot for `data_type`, failing once the limit is reached
    fn reserve(&self, data_type: DataType) -> DataStoreResult<()> {
        let max = self.max_entries(data_type);
        self.live_counts[data_type.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| DataStoreError::StoreFull(data_type))
    }

    fn dec(&self, data_type: DataType) {
        let _ = self.live_counts[data_type.index()].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| Some(n.saturating_sub(1)),
        );
    }

    /// Apply any gossiped request
    pub fn apply(&self, request: &DataRequest) -> DataStoreResult<StorageKey> {
        self.apply_at(request, now_millis())
    }

    pub fn apply_at(&self, request: &DataRequest, now: i64) -> DataStoreResult<StorageKey> {
        match request {
            DataRequest::Add(signed) => self.add_or_update_at(signed, now),
            DataRequest::Remove(remove) => self.remove_at(remove, now).map(|_| remove.key),
            DataRequest::Refresh(refresh) => self.refresh_at(refresh, now).map(|_| refresh.key),
        }
    }

    pub fn add_or_update(&self, signed: &SignedRecord) -> DataStoreResult<StorageKey> {
        self.add_or_update_at(signed, now_millis())
    }

    /// Store a record if its sequence is newer than anything held for its key.
    ///
    /// `Ok` means the record was accepted and should be relayed.
    pub fn add_or_update_at(&self, signed: &SignedRecord, now: i64) -> DataStoreResult<StorageKey> {
        signed.verify()?;
        let record = &signed.record;
        record.validate(now, self.config.max_body_bytes)?;
        let key = record.key();
        if record.is_expired_at(now) {
            return Err(DataStoreError::Expired(key));
        }

        let data_type = record.data_type;
        let live = StoredEntry::Live {
            record: signed.clone(),
            sequence: record.sequence,
            expires_at: record.expires_at,
            refresh: None,
        };
        self.insert_live(key, data_type, live)?;

        debug!(key = %key, data_type = %data_type, sequence = record.sequence, "Record stored");
        self.emit(StoreEvent::Added(signed.clone()));
        Ok(key)
    }

    /// Store a record that a refresh keeps alive past its signed expiry.
    ///
    /// The entry takes the refresh's sequence and expiry, as if the record
    /// and the refresh had arrived one after the other.
    pub fn add_refreshed_at(
        &self,
        refreshed: &RefreshedRecord,
        now: i64,
    ) -> DataStoreResult<StorageKey> {
        refreshed.verify()?;
        let record = &refreshed.record.record;
        record.validate(now, self.config.max_body_bytes)?;
        let key = record.key();
        let refresh = &refreshed.refresh;
        if refresh.expires_at <= now {
            return Err(DataStoreError::Expired(key));
        }
        let max_expiry = now.saturating_add(record.data_type.default_ttl_ms() as i64);

        let live = StoredEntry::Live {
            record: refreshed.record.clone(),
            sequence: refresh.sequence,
            expires_at: refresh.expires_at.min(max_expiry),
            refresh: Some(refresh.clone()),
        };
        self.insert_live(key, record.data_type, live)?;

        debug!(key = %key, sequence = refresh.sequence, "Refreshed record stored");
        self.emit(StoreEvent::Added(refreshed.record.clone()));
        Ok(key)
    }

    fn insert_live(
        &self,
        key: StorageKey,
        data_type: DataType,
        live: StoredEntry,
    ) -> DataStoreResult<()> {
        let received = live.sequence();
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get().sequence();
                if received <= stored {
                    return Err(DataStoreError::StaleSequence {
                        key,
                        stored,
                        received,
                    });
                }
                if !slot.get().is_live() {
                    self.reserve(data_type)?;
                }
                slot.insert(live);
            }
            Entry::Vacant(slot) => {
                self.reserve(data_type)?;
                slot.insert(live);
            }
        }
        Ok(())
    }

    pub fn remove(&self, request: &RemoveRequest) -> DataStoreResult<()> {
        self.remove_at(request, now_millis())
    }

    /// Replace the record with a tombstone, creating one if nothing is held
    pub fn remove_at(&self, request: &RemoveRequest, now: i64) -> DataStoreResult<()> {
        request.verify()?;
        let data_type = request.data_type;
        if !data_type.retractable() {
            return Err(DataStoreError::NotRetractable(data_type));
        }

        let tombstone = StoredEntry::Tombstone {
            data_type,
            author: request.author,
            sequence: request.sequence,
            expires_at: now.saturating_add(data_type.default_ttl_ms() as i64),
            removal: Some(request.clone()),
        };

        match self.entries.entry(request.key) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get().sequence();
                if request.sequence <= stored {
                    return Err(DataStoreError::StaleSequence {
                        key: request.key,
                        stored,
                        received: request.sequence,
                    });
                }
                if slot.get().is_live() {
                    self.dec(data_type);
                }
                slot.insert(tombstone);
            }
            Entry::Vacant(slot) => {
                slot.insert(tombstone);
            }
        }

        debug!(key = %request.key, sequence = request.sequence, "Record retracted");
        self.emit(StoreEvent::Removed {
            key: request.key,
            data_type,
        });
        Ok(())
    }

    pub fn refresh(&self, request: &RefreshRequest) -> DataStoreResult<()> {
        self.refresh_at(request, now_millis())
    }

    /// Extend the TTL of a live record
    pub fn refresh_at(&self, request: &RefreshRequest, now: i64) -> DataStoreResult<()> {
        request.verify()?;
        if request.expires_at <= now {
            return Err(DataStoreError::Expired(request.key));
        }
        let max_expiry = now.saturating_add(request.data_type.default_ttl_ms() as i64);
        let new_expiry = request.expires_at.min(max_expiry);

        match self.entries.get_mut(&request.key) {
            Some(mut entry) => match &mut *entry {
                StoredEntry::Live {
                    sequence,
                    expires_at,
                    refresh,
                    ..
                } => {
                    if request.sequence <= *sequence {
                        return Err(DataStoreError::StaleSequence {
                            key: request.key,
                            stored: *sequence,
                            received: request.sequence,
                        });
                    }
                    *sequence = request.sequence;
                    *expires_at = new_expiry;
                    *refresh = Some(request.clone());
                }
                StoredEntry::Tombstone { .. } => return Err(DataStoreError::NotFound(request.key)),
            },
            None => return Err(DataStoreError::NotFound(request.key)),
        }

        self.emit(StoreEvent::Refreshed {
            key: request.key,
            expires_at: new_expiry,
        });
        Ok(())
    }

    pub fn get(&self, key: &StorageKey) -> Option<SignedRecord> {
        self.get_at(key, now_millis())
    }

    /// Live, unexpired record for a key
    pub fn get_at(&self, key: &StorageKey, now: i64) -> Option<SignedRecord> {
        self.entries
            .get(key)
            .and_then(|entry| entry.live_record_at(now).cloned())
    }

    pub fn entry(&self, key: &StorageKey) -> Option<StoredEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Highest sequence seen for a key, live or retracted
    pub fn sequence_of(&self, key: &StorageKey) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.sequence())
    }

    pub fn records(&self, data_type: DataType) -> Vec<SignedRecord> {
        self.records_at(data_type, now_millis())
    }

    pub fn records_at(&self, data_type: DataType, now: i64) -> Vec<SignedRecord> {
        self.entries
            .iter()
            .filter_map(|entry| entry.live_record_at(now).cloned())
            .filter(|record| record.record.data_type == data_type)
            .collect()
    }

    /// Unexpired live entries written by one author
    pub fn live_entries_by_author_at(&self, author: &PublicKey, now: i64) -> Vec<StoredEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.live_record_at(now).is_some() && &entry.author() == author)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Keys and sequences held for a type, tombstones included
    pub fn held_versions(&self, data_type: DataType) -> Vec<(StorageKey, u64)> {
        self.entries
            .iter()
            .filter(|entry| entry.data_type() == data_type)
            .map(|entry| (*entry.key(), entry.sequence()))
            .collect()
    }

    /// Entries another peer can be sent: unexpired live records and
    /// unexpired tombstones that carry their signed removal
    pub fn servable_entries_at(&self, data_type: DataType, now: i64) -> Vec<StoredEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.data_type() == data_type && entry.expires_at() > now)
            .filter(|entry| match entry.value() {
                StoredEntry::Live { .. } => true,
                StoredEntry::Tombstone { removal, .. } => removal.is_some(),
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn prune_expired(&self) -> Vec<ExpiredRecord> {
        self.prune_expired_at(now_millis())
    }

    /// Drop expired entries.
    ///
    /// Expired live records of retractable types are turned into tombstones
    /// and returned so their authors can gossip the retraction.
    pub fn prune_expired_at(&self, now: i64) -> Vec<ExpiredRecord> {
        let candidates: Vec<StorageKey> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at() <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = Vec::new();
        for key in candidates {
            let Entry::Occupied(mut slot) = self.entries.entry(key) else {
                continue;
            };
            // re-check: a newer record may have arrived since the scan
            if slot.get().expires_at() > now {
                continue;
            }
            let data_type = slot.get().data_type();
            match slot.get().clone() {
                StoredEntry::Live {
                    record, sequence, ..
                } => {
                    self.dec(data_type);
                    if data_type.retractable() {
                        slot.insert(StoredEntry::Tombstone {
                            data_type,
                            author: record.record.author,
                            sequence,
                            expires_at: now.saturating_add(data_type.default_ttl_ms() as i64),
                            removal: None,
                        });
                    } else {
                        slot.remove();
                    }
                    expired.push(ExpiredRecord {
                        key,
                        data_type,
                        id: record.record.id,
                        author: record.record.author,
                        sequence,
                    });
                }
                StoredEntry::Tombstone { .. } => {
                    slot.remove();
                }
            }
        }

        for record in &expired {
            self.emit(StoreEvent::Expired {
                key: record.key,
                data_type: record.data_type,
            });
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Pruned expired records");
        }
        expired
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            entries: self
                .entries
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        }
    }

    /// Load persisted entries, skipping expired or unverifiable ones
    pub fn restore_at(&self, snapshot: StoreSnapshot, now: i64) -> usize {
        let mut restored = 0;
        for (key, entry) in snapshot.entries {
            if entry.expires_at() <= now {
                continue;
            }
            if let Err(e) = entry.verify(&key) {
                debug!(key = %key, error = %e, "Skipping unverifiable snapshot entry");
                continue;
            }
            let data_type = entry.data_type();
            let is_live = entry.is_live();
            match self.entries.entry(key) {
                Entry::Occupied(mut slot) => {
                    if entry.sequence() <= slot.get().sequence() {
                        continue;
                    }
                    match (slot.get().is_live(), is_live) {
                        (true, false) => self.dec(data_type),
                        (false, true) => {
                            if self.reserve(data_type).is_err() {
                                continue;
                            }
                        }
                        _ => {}
                    }
                    slot.insert(entry);
                }
                Entry::Vacant(slot) => {
                    if is_live && self.reserve(data_type).is_err() {
                        continue;
                    }
                    slot.insert(entry);
                }
            }
            restored += 1;
        }
        restored
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}
