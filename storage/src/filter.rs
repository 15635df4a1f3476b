//! Reconciliation filter
//!
//! A `DataFilter` describes what the requester already holds for one data
//! type, optionally restricted to a slice of the key space. Each bloom entry
//! covers a key at one sequence, so a newer version of a held key still
//! passes the filter.

use crate::bloom::BloomFilter;
use crate::record::{DataType, StorageKey};
use agora_crypto::hash_sha256_parts;
use serde::{Deserialize, Serialize};

/// Bloom entry for a key held at `sequence`
pub fn inventory_item(key: &StorageKey, sequence: u64) -> [u8; 32] {
    hash_sha256_parts(&[key.as_bytes().as_slice(), &sequence.to_le_bytes()[..]])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFilter {
    pub data_type: DataType,
    /// Start of the key-space slice, in percent
    pub offset_pct: u8,
    /// Width of the slice, in percent; 100 covers every key
    pub range_pct: u8,
    pub bloom: BloomFilter,
}

impl DataFilter {
    /// Filter over the whole key space
    pub fn new(data_type: DataType, held: &[(StorageKey, u64)], false_positive_rate: f64) -> Self {
        let items: Vec<[u8; 32]> = held
            .iter()
            .map(|(key, sequence)| inventory_item(key, *sequence))
            .collect();
        let bloom = BloomFilter::from_items(
            items.iter().map(|item| item.as_slice()),
            items.len(),
            false_positive_rate,
        );
        Self {
            data_type,
            offset_pct: 0,
            range_pct: 100,
            bloom,
        }
    }

    pub fn with_range(mut self, offset_pct: u8, range_pct: u8) -> Self {
        self.offset_pct = offset_pct % 100;
        self.range_pct = range_pct.min(100);
        self
    }

    /// Position of a key in the key space, 0..=99
    pub fn key_position(key: &StorageKey) -> u8 {
        let prefix = u16::from_be_bytes([key.0[0], key.0[1]]) as u32;
        (prefix * 100 / 65_536) as u8
    }

    pub fn in_range(&self, key: &StorageKey) -> bool {
        if self.range_pct >= 100 {
            return true;
        }
        let position = Self::key_position(key) as u16;
        let offset = (self.offset_pct % 100) as u16;
        (position + 100 - offset) % 100 < self.range_pct as u16
    }

    /// Whether the requester probably lacks this version of the key
    pub fn do_include(&self, key: &StorageKey, sequence: u64) -> bool {
        self.in_range(key) && !self.bloom.might_contain(&inventory_item(key, sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(first: u8, second: u8) -> StorageKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        bytes[1] = second;
        bytes[31] = first ^ second;
        StorageKey(bytes)
    }

    #[test]
    fn test_held_keys_excluded() {
        let held = vec![(key(1, 1), 1), (key(2, 2), 4)];
        let filter = DataFilter::new(DataType::Offer, &held, 0.001);
        assert!(!filter.do_include(&key(1, 1), 1));
        assert!(!filter.do_include(&key(2, 2), 4));
        assert!(filter.do_include(&key(200, 3), 1));
    }

    #[test]
    fn test_newer_sequence_included() {
        let held = vec![(key(1, 1), 1)];
        let filter = DataFilter::new(DataType::Offer, &held, 0.001);
        assert!(!filter.do_include(&key(1, 1), 1));
        assert!(filter.do_include(&key(1, 1), 2));
    }

    #[test]
    fn test_range_restricts_key_space() {
        let filter = DataFilter::new(DataType::Offer, &[], 0.01).with_range(0, 50);
        // first byte 0 is position 0, first byte 255 is position 99
        assert!(filter.in_range(&key(0, 0)));
        assert!(!filter.in_range(&key(255, 255)));

        let upper = DataFilter::new(DataType::Offer, &[], 0.01).with_range(50, 50);
        assert!(!upper.in_range(&key(0, 0)));
        assert!(upper.in_range(&key(255, 255)));
    }

    #[test]
    fn test_range_wraps_around() {
        let filter = DataFilter::new(DataType::Offer, &[], 0.01).with_range(90, 20);
        assert!(filter.in_range(&key(255, 255)));
        assert!(filter.in_range(&key(0, 0)));
        assert!(!filter.in_range(&key(128, 0)));
    }

    #[test]
    fn test_key_position_bounds() {
        assert_eq!(DataFilter::key_position(&key(0, 0)), 0);
        assert_eq!(DataFilter::key_position(&key(255, 255)), 99);
    }
}
