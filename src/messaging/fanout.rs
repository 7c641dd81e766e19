//! Per-publish peer filter.
//!
//! Peers interested in any matched subscription are inserted once; the full
//! member list is then tested once, which keeps a publish at
//! O(matches + members) instead of O(matches x members). The filter can only
//! over-report, so a positive test costs at worst one redundant frame record.

use bloomfilter::Bloom;

use super::pool::Recycle;
use crate::replication::transport::PeerId;

/// Default number of peers a filter is sized for.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Default target false-positive rate.
pub const DEFAULT_FP_RATE: f64 = 0.01;

pub struct FanoutFilter {
    bloom: Bloom<PeerId>,
    inserted: usize,
}

impl FanoutFilter {
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(capacity.max(1), fp_rate),
            inserted: 0,
        }
    }

    pub fn insert(&mut self, peer: &PeerId) {
        self.bloom.set(peer);
        self.inserted += 1;
    }

    /// May return true for a peer never inserted; never false for one that was.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.inserted > 0 && self.bloom.check(peer)
    }

    /// Insert calls since the last reset, duplicates included.
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    pub fn bits(&self) -> u64 {
        self.bloom.number_of_bits()
    }

    pub fn hash_functions(&self) -> u32 {
        self.bloom.number_of_hash_functions()
    }
}

impl Default for FanoutFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_FP_RATE)
    }
}

impl Recycle for FanoutFilter {
    fn recycle(&mut self) {
        self.bloom.clear();
        self.inserted = 0;
    }
}
