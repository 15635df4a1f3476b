//! Signed, versioned data records
//!
//! A record's storage key is derived from its data type, author key and id,
//! so only the holder of the author key can write to that slot.

use crate::{DataStoreError, DataStoreResult};
use agora_crypto::{hash_sha256_parts, KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Clock skew tolerated on `created_at`
pub const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Offer,
    Mailbox,
    Profile,
    Chat,
}

impl DataType {
    pub const ALL: [DataType; 4] = [
        DataType::Offer,
        DataType::Mailbox,
        DataType::Profile,
        DataType::Chat,
    ];

    pub fn index(&self) -> usize {
        match self {
            DataType::Offer => 0,
            DataType::Mailbox => 1,
            DataType::Profile => 2,
            DataType::Chat => 3,
        }
    }

    /// Default time to live in milliseconds
    pub fn default_ttl_ms(&self) -> u64 {
        const MINUTE: u64 = 60 * 1000;
        const DAY: u64 = 24 * 60 * MINUTE;
        match self {
            DataType::Offer => 10 * DAY,
            DataType::Mailbox => 15 * DAY,
            DataType::Profile => 15 * DAY,
            DataType::Chat => 30 * MINUTE,
        }
    }

    /// Whether removal leaves a gossiped tombstone
    pub fn retractable(&self) -> bool {
        !matches!(self, DataType::Chat)
    }

    /// Inventory priority, higher is sent first
    pub fn priority(&self) -> u8 {
        match self {
            DataType::Mailbox => 3,
            DataType::Offer => 2,
            DataType::Profile => 1,
            DataType::Chat => 0,
        }
    }

    pub fn max_entries(&self) -> usize {
        match self {
            DataType::Offer => 10_000,
            DataType::Mailbox => 5_000,
            DataType::Profile => 10_000,
            DataType::Chat => 1_000,
        }
    }

    fn tag(&self) -> u8 {
        self.index() as u8
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Offer => "offer",
            DataType::Mailbox => "mailbox",
            DataType::Profile => "profile",
            DataType::Chat => "chat",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey(pub [u8; 32]);

impl StorageKey {
    pub fn derive(data_type: DataType, author: &PublicKey, id: &str) -> Self {
        Self(hash_sha256_parts(&[
            &[data_type.tag()],
            author.as_bytes(),
            id.as_bytes(),
        ]))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Record content covered by the author's signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedRecord {
    pub data_type: DataType,
    pub id: String,
    pub author: PublicKey,
    pub sequence: u64,
    /// Unix milliseconds
    pub created_at: i64,
    pub expires_at: i64,
    pub body: Vec<u8>,
}

impl AuthenticatedRecord {
    /// Record expiring after the data type's default TTL
    pub fn new(
        data_type: DataType,
        id: impl Into<String>,
        author: PublicKey,
        sequence: u64,
        body: Vec<u8>,
        now: i64,
    ) -> Self {
        let ttl = data_type.default_ttl_ms() as i64;
        Self {
            data_type,
            id: id.into(),
            author,
            sequence,
            created_at: now,
            expires_at: now.saturating_add(ttl),
            body,
        }
    }

    pub fn key(&self) -> StorageKey {
        StorageKey::derive(self.data_type, &self.author, &self.id)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn signing_bytes(&self) -> DataStoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DataStoreError::Serialization(e.to_string()))
    }

    /// Structural checks that need no store state
    pub fn validate(&self, now: i64, max_body_bytes: usize) -> DataStoreResult<()> {
        if self.id.is_empty() {
            return Err(DataStoreError::InvalidRecord("empty id".into()));
        }
        if self.author.is_empty() {
            return Err(DataStoreError::InvalidRecord("empty author".into()));
        }
        if self.body.len() > max_body_bytes {
            return Err(DataStoreError::TooLarge {
                size: self.body.len(),
                max: max_body_bytes,
            });
        }
        if self.created_at > now.saturating_add(MAX_CLOCK_SKEW_MS) {
            return Err(DataStoreError::InvalidRecord("created in the future".into()));
        }
        let max_ttl = self.data_type.default_ttl_ms() as i64;
        if self.expires_at > self.created_at.saturating_add(max_ttl) {
            return Err(DataStoreError::InvalidRecord("ttl exceeds data type limit".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord {
    pub record: AuthenticatedRecord,
    pub signature: Vec<u8>,
}

impl SignedRecord {
    pub fn sign(record: AuthenticatedRecord, keypair: &KeyPair) -> DataStoreResult<Self> {
        if record.author != keypair.public_key() {
            return Err(DataStoreError::AuthorMismatch);
        }
        let signature = keypair.sign(&record.signing_bytes()?);
        Ok(Self { record, signature })
    }

    pub fn verify(&self) -> DataStoreResult<()> {
        let bytes = self.record.signing_bytes()?;
        self.record
            .author
            .verify(&bytes, &self.signature)
            .map_err(|_| DataStoreError::InvalidSignature(self.key()))
    }

    pub fn key(&self) -> StorageKey {
        self.record.key()
    }

    /// Encoded size used for inventory budgeting
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map_or(usize::MAX, |n| n as usize)
    }
}

#[derive(Serialize)]
struct RequestPayload<'a> {
    kind: &'static str,
    data_type: DataType,
    id: &'a str,
    author: &'a PublicKey,
    sequence: u64,
    expires_at: Option<i64>,
}

fn signed_payload(
    kind: &'static str,
    data_type: DataType,
    id: &str,
    author: &PublicKey,
    sequence: u64,
    expires_at: Option<i64>,
) -> DataStoreResult<Vec<u8>> {
    bincode::serialize(&RequestPayload {
        kind,
        data_type,
        id,
        author,
        sequence,
        expires_at,
    })
    .map_err(|e| DataStoreError::Serialization(e.to_string()))
}

/// Author-signed retraction; stored as a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub key: StorageKey,
    pub data_type: DataType,
    pub id: String,
    pub author: PublicKey,
    pub sequence: u64,
    pub signature: Vec<u8>,
}

impl RemoveRequest {
    pub fn sign(
        data_type: DataType,
        id: impl Into<String>,
        sequence: u64,
        keypair: &KeyPair,
    ) -> DataStoreResult<Self> {
        let id = id.into();
        let author = keypair.public_key();
        let bytes = signed_payload("remove", data_type, &id, &author, sequence, None)?;
        Ok(Self {
            key: StorageKey::derive(data_type, &author, &id),
            data_type,
            signature: keypair.sign(&bytes),
            id,
            author,
            sequence,
        })
    }

    pub fn verify(&self) -> DataStoreResult<()> {
        if StorageKey::derive(self.data_type, &self.author, &self.id) != self.key {
            return Err(DataStoreError::KeyMismatch(self.key));
        }
        let bytes = signed_payload(
            "remove",
            self.data_type,
            &self.id,
            &self.author,
            self.sequence,
            None,
        )?;
        self.author
            .verify(&bytes, &self.signature)
            .map_err(|_| DataStoreError::InvalidSignature(self.key))
    }
}

/// Author-signed TTL extension of a live record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub key: StorageKey,
    pub data_type: DataType,
    pub id: String,
    pub author: PublicKey,
    pub sequence: u64,
    pub expires_at: i64,
    pub signature: Vec<u8>,
}

impl RefreshRequest {
    pub fn sign(
        data_type: DataType,
        id: impl Into<String>,
        sequence: u64,
        now: i64,
        keypair: &KeyPair,
    ) -> DataStoreResult<Self> {
        let id = id.into();
        let author = keypair.public_key();
        let expires_at = now.saturating_add(data_type.default_ttl_ms() as i64);
        let bytes = signed_payload(
            "refresh",
            data_type,
            &id,
            &author,
            sequence,
            Some(expires_at),
        )?;
        Ok(Self {
            key: StorageKey::derive(data_type, &author, &id),
            data_type,
            signature: keypair.sign(&bytes),
            id,
            author,
            sequence,
            expires_at,
        })
    }

    pub fn verify(&self) -> DataStoreResult<()> {
        if StorageKey::derive(self.data_type, &self.author, &self.id) != self.key {
            return Err(DataStoreError::KeyMismatch(self.key));
        }
        let bytes = signed_payload(
            "refresh",
            self.data_type,
            &self.id,
            &self.author,
            self.sequence,
            Some(self.expires_at),
        )?;
        self.author
            .verify(&bytes, &self.signature)
            .map_err(|_| DataStoreError::InvalidSignature(self.key))
    }
}

/// Record whose signed expiry has been extended by a later refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshedRecord {
    pub record: SignedRecord,
    pub refresh: RefreshRequest,
}

impl RefreshedRecord {
    pub fn key(&self) -> StorageKey {
        self.record.key()
    }

    /// Sequence of the refresh, which supersedes the record's
    pub fn sequence(&self) -> u64 {
        self.refresh.sequence
    }

    pub fn verify(&self) -> DataStoreResult<()> {
        self.record.verify()?;
        self.refresh.verify()?;
        if self.refresh.key != self.record.key() {
            return Err(DataStoreError::KeyMismatch(self.refresh.key));
        }
        if self.refresh.sequence <= self.record.record.sequence {
            return Err(DataStoreError::StaleSequence {
                key: self.refresh.key,
                stored: self.record.record.sequence,
                received: self.refresh.sequence,
            });
        }
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map_or(usize::MAX, |n| n as usize)
    }
}

/// Gossiped mutation of the data store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRequest {
    Add(SignedRecord),
    Remove(RemoveRequest),
    Refresh(RefreshRequest),
}

impl DataRequest {
    pub fn key(&self) -> StorageKey {
        match self {
            DataRequest::Add(signed) => signed.key(),
            DataRequest::Remove(remove) => remove.key,
            DataRequest::Refresh(refresh) => refresh.key,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            DataRequest::Add(signed) => signed.record.sequence,
            DataRequest::Remove(remove) => remove.sequence,
            DataRequest::Refresh(refresh) => refresh.sequence,
        }
    }

    pub fn serialize(&self) -> DataStoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DataStoreError::Serialization(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> DataStoreResult<Self> {
        bincode::deserialize(data).map_err(|e| DataStoreError::Serialization(e.to_string()))
    }
}
