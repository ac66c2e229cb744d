// Trawler is an open source large-scale web crawler.
// Copyright (C) 2024 Trawler ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;

pub fn split_u128(num: u128) -> [u64; 2] {
    [(num >> 64) as u64, num as u64]
}

const XXH3_SECRET: &[u8] = &xxhash_rust::const_xxh3::const_custom_default_secret(42);
pub fn fast_stable_hash_64(t: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64_with_secret(t, XXH3_SECRET)
}

pub fn fast_stable_hash_128(t: &[u8]) -> u128 {
    xxhash_rust::xxh3::xxh3_128_with_secret(t, XXH3_SECRET)
}

/// Calculate the number of bits needed for a Bloom filter.
#[inline]
fn num_bits(estimated_items: u64, fp: f64) -> u64 {
    (((estimated_items as f64) * fp.ln() / (-8.0 * 2.0_f64.ln().powi(2))).ceil() as u64 * 8).max(64)
}

/// Calculate the number of hash functions needed for a Bloom filter.
#[inline]
fn num_hashes(num_bits: u64, estimated_items: u64) -> u64 {
    (((num_bits as f64) / estimated_items as f64 * 2.0_f64.ln()).ceil() as u64).max(1)
}

const NUM_STRIPES: usize = 1024;

/// Bloom filter over u64 keys that is safe for concurrent insertion.
///
/// `contains` is lock-free. `insert` takes a stripe lock chosen by the key so
/// that concurrent inserts of the same key observe each other: exactly one of
/// them reports the key as new.
pub struct U64BloomFilter {
    words: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u64,
    stripes: Vec<Mutex<()>>,
}

#[derive(bincode::Encode, bincode::Decode)]
struct Snapshot {
    num_bits: u64,
    num_hashes: u64,
    words: Vec<u64>,
}

impl U64BloomFilter {
    pub fn new(estimated_items: u64, fp: f64) -> Self {
        let num_bits = num_bits(estimated_items, fp);
        let num_hashes = num_hashes(num_bits, estimated_items);

        Self::with_params(num_bits, num_hashes)
    }

    fn with_params(num_bits: u64, num_hashes: u64) -> Self {
        let num_words = num_bits.div_ceil(64) as usize;

        Self {
            words: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes,
            stripes: (0..NUM_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn bit_positions(&self, item: u64) -> impl Iterator<Item = u64> + '_ {
        let [a, b] = split_u128(fast_stable_hash_128(&item.to_le_bytes()));

        (0..self.num_hashes).map(move |i| (a.wrapping_add(i.wrapping_mul(b))) % self.num_bits)
    }

    pub fn contains(&self, item: u64) -> bool {
        self.bit_positions(item).all(|bit| {
            let word = self.words[(bit / 64) as usize].load(Ordering::Relaxed);
            word & (1 << (bit % 64)) != 0
        })
    }

    /// Insert the key and report whether it was new.
    ///
    /// Returns `false` if all bits were already set, either by a previous
    /// insert of the same key or by hash collisions with other keys. The
    /// latter is the filter's false-positive case.
    pub fn insert(&self, item: u64) -> bool {
        let stripe = (item % NUM_STRIPES as u64) as usize;
        let _guard = self.stripes[stripe].lock().unwrap_or_else(|e| e.into_inner());

        let mut was_new = false;
        for bit in self.bit_positions(item) {
            let mask = 1 << (bit % 64);
            let prev = self.words[(bit / 64) as usize].fetch_or(mask, Ordering::Relaxed);

            if prev & mask == 0 {
                was_new = true;
            }
        }

        was_new
    }

    pub fn estimate_card(&self) -> u64 {
        let num_ones: u64 = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum();

        if num_ones == 0 {
            return 0;
        }

        if num_ones >= self.num_bits {
            return u64::MAX;
        }

        let fraction = num_ones as f64 / self.num_bits as f64;
        let estimate = -(self.num_bits as f64 / self.num_hashes as f64) * (1.0 - fraction).ln();

        estimate as u64
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = Snapshot {
            num_bits: self.num_bits,
            num_hashes: self.num_hashes,
            words: self
                .words
                .iter()
                .map(|w| w.load(Ordering::Relaxed))
                .collect(),
        };

        let bytes = bincode::encode_to_vec(&snapshot, bincode::config::standard())?;

        let tmp = path.as_ref().with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path.as_ref())?;

        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let (snapshot, _): (Snapshot, _) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;

        let filter = Self::with_params(snapshot.num_bits, snapshot.num_hashes);
        for (word, val) in filter.words.iter().zip(snapshot.words) {
            word.store(val, Ordering::Relaxed);
        }

        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_then_contains() {
        let filter = U64BloomFilter::new(1_000, 0.001);

        assert!(!filter.contains(42));
        assert!(filter.insert(42));
        assert!(filter.contains(42));
        assert!(!filter.insert(42));
    }

    #[test]
    fn no_false_negatives() {
        let filter = U64BloomFilter::new(10_000, 0.001);

        for i in 0..10_000u64 {
            filter.insert(i);
        }

        for i in 0..10_000u64 {
            assert!(filter.contains(i));
        }
    }

    #[test]
    fn false_positive_rate_within_bound() {
        let filter = U64BloomFilter::new(100_000, 0.001);

        for i in 0..100_000u64 {
            filter.insert(i);
        }

        let false_positives = (100_000..200_000u64).filter(|&i| filter.contains(i)).count();

        // 10x headroom over the configured rate
        assert!(false_positives < 1_000);
    }

    #[test]
    fn concurrent_inserts_of_same_key_yield_one_true() {
        let filter = Arc::new(U64BloomFilter::new(100_000, 0.001));

        for key in 0..100u64 {
            let mut handles = Vec::new();

            for _ in 0..8 {
                let filter = Arc::clone(&filter);
                handles.push(std::thread::spawn(move || filter.insert(key)));
            }

            let news = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&was_new| was_new)
                .count();

            assert!(news <= 1, "key {key} was new {news} times");
        }
    }

    #[test]
    fn save_open_roundtrip() {
        let filter = U64BloomFilter::new(1_000, 0.01);
        for i in 0..500u64 {
            filter.insert(i);
        }

        let path = std::env::temp_dir().join(format!("bloom.test.{}", std::process::id()));
        filter.save(&path).unwrap();

        let reopened = U64BloomFilter::open(&path).unwrap();
        std::fs::remove_file(&path).ok();

        for i in 0..500u64 {
            assert!(reopened.contains(i));
        }
        assert_eq!(filter.estimate_card(), reopened.estimate_card());
    }

    #[test]
    fn estimate_card_tracks_inserts() {
        let filter = U64BloomFilter::new(10_000, 0.001);

        assert_eq!(filter.estimate_card(), 0);

        for i in 0..1_000u64 {
            filter.insert(i);
        }

        let estimate = filter.estimate_card();
        assert!((800..1_200).contains(&estimate), "estimate was {estimate}");
    }
}
