//! Bloom filter over storage keys
//!
//! Index positions come from SHA-256 double hashing. Inserted items always
//! test positive; false positives are bounded by the sizing parameters.

use agora_crypto::hash_sha256;
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;

const MIN_BITS: u64 = 64;
const MAX_HASHES: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at `false_positive_rate`
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let m = (-(n * p.ln()) / (LN_2 * LN_2)).ceil().max(MIN_BITS as f64) as u64;
        let k = ((m as f64 / n) * LN_2).round().clamp(1.0, MAX_HASHES as f64) as u32;

        Self {
            bits: vec![0; m.div_ceil(64) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn from_items<'a>(
        items: impl IntoIterator<Item = &'a [u8]>,
        expected_items: usize,
        false_positive_rate: f64,
    ) -> Self {
        let mut filter = Self::new(expected_items, false_positive_rate);
        for item in items {
            filter.insert(item);
        }
        filter
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Size in bytes of the bit array
    pub fn byte_len(&self) -> usize {
        self.bits.len() * 8
    }

    /// Whether a filter received from a peer is internally consistent
    pub fn is_valid(&self) -> bool {
        self.num_bits > 0
            && self.num_hashes > 0
            && self.num_hashes <= MAX_HASHES
            && (self.bits.len() as u64).saturating_mul(64) >= self.num_bits
    }

    pub fn insert(&mut self, item: &[u8]) {
        if !self.is_valid() {
            return;
        }
        for index in self.indices(item) {
            if let Some(word) = self.bits.get_mut((index / 64) as usize) {
                *word |= 1 << (index % 64);
            }
        }
    }

    /// False means the item was definitely never inserted
    pub fn might_contain(&self, item: &[u8]) -> bool {
        if !self.is_valid() {
            return false;
        }
        self.indices(item).all(|index| {
            self.bits
                .get((index / 64) as usize)
                .is_some_and(|word| word & (1 << (index % 64)) != 0)
        })
    }

    fn indices(&self, item: &[u8]) -> impl Iterator<Item = u64> {
        let digest = hash_sha256(item);
        let h1 = u64_at(&digest, 0);
        let h2 = u64_at(&digest, 8) | 1;
        let m = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}

fn u64_at(bytes: &[u8; 32], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(i: u32) -> Vec<u8> {
        format!("record-{}", i).into_bytes()
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            filter.insert(&item(i));
        }
        for i in 0..1_000 {
            assert!(filter.might_contain(&item(i)), "false negative for {}", i);
        }
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            filter.insert(&item(i));
        }
        let false_positives = (1_000..11_000)
            .filter(|i| filter.might_contain(&item(*i)))
            .count();
        // 1% target; allow generous slack
        assert!(false_positives < 300, "{} false positives", false_positives);
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::new(10, 0.01);
        assert!(!filter.might_contain(b"anything"));
        assert!(filter.num_bits() >= MIN_BITS);
    }

    #[test]
    fn test_overfull_filter_still_no_false_negatives() {
        let mut filter = BloomFilter::new(1, 0.1);
        for i in 0..500 {
            filter.insert(&item(i));
        }
        assert!((0..500).all(|i| filter.might_contain(&item(i))));
    }

    #[test]
    fn test_malformed_filter_is_inert() {
        let filter = BloomFilter {
            bits: Vec::new(),
            num_bits: 1_000,
            num_hashes: 3,
        };
        assert!(!filter.is_valid());
        assert!(!filter.might_contain(b"x"));

        let zero = BloomFilter {
            bits: vec![u64::MAX],
            num_bits: 0,
            num_hashes: 3,
        };
        assert!(!zero.might_contain(b"x"));
    }

    #[test]
    fn test_serde_preserves_membership() {
        let filter = BloomFilter::from_items(
            [b"a".as_slice(), b"b".as_slice()],
            2,
            0.01,
        );
        let bytes = bincode::serialize(&filter).unwrap();
        let decoded: BloomFilter = bincode::deserialize(&bytes).unwrap();
        assert!(decoded.might_contain(b"a"));
        assert!(decoded.might_contain(b"b"));
        assert_eq!(decoded, filter);
    }
}
