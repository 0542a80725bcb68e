use super::envelope::Envelope;
use std::collections::{BTreeMap, VecDeque};

/// Running totals of the overflow store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecondaryStats {
    /// Envelopes ever buffered.
    pub received: u64,
    /// Envelopes lost to the per-key bound or to TTL expiry.
    pub dropped: u64,
    /// Envelopes currently buffered across all keys.
    pub total: usize,
}

/// Per-key bounded FIFO for envelopes that found no subscriber.
#[derive(Debug, Clone)]
pub struct SecondaryStore {
    buckets: BTreeMap<String, VecDeque<Envelope>>,
    max_per_key: usize,
    stats: SecondaryStats,
}

impl SecondaryStore {
    pub fn new(max_per_key: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            max_per_key: max_per_key.max(1),
            stats: SecondaryStats::default(),
        }
    }

    /// Buffer `envelope` under its key, returning the oldest entry of that key
    /// when the bound forced an eviction.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let bucket = self.buckets.entry(envelope.id.clone()).or_default();
        let evicted = if bucket.len() >= self.max_per_key {
            bucket.pop_front()
        } else {
            None
        };
        bucket.push_back(envelope);

        self.stats.received += 1;
        self.stats.total += 1;
        if evicted.is_some() {
            self.stats.dropped += 1;
            self.stats.total -= 1;
        }
        evicted
    }

    /// Remove and return every envelope buffered under `id`, oldest first.
    pub fn take(&mut self, id: &str) -> Vec<Envelope> {
        let drained: Vec<Envelope> = self
            .buckets
            .remove(id)
            .map(Vec::from)
            .unwrap_or_default();
        self.stats.total -= drained.len();
        drained
    }

    /// Remove and return every buffered envelope, bucket by bucket.
    pub fn take_all(&mut self) -> Vec<Envelope> {
        let buckets = std::mem::take(&mut self.buckets);
        let drained: Vec<Envelope> = buckets.into_values().flatten().collect();
        self.stats.total = 0;
        drained
    }

    /// Remove every envelope enqueued at or before `cutoff` (epoch ms).
    pub fn evict_enqueued_before(&mut self, cutoff: u64) -> Vec<Envelope> {
        let mut expired = Vec::new();
        for bucket in self.buckets.values_mut() {
            let mut kept = VecDeque::with_capacity(bucket.len());
            for envelope in bucket.drain(..) {
                if envelope.enqueued_at <= cutoff {
                    expired.push(envelope);
                } else {
                    kept.push_back(envelope);
                }
            }
            *bucket = kept;
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());

        let count = expired.len();
        self.stats.total -= count;
        self.stats.dropped += count as u64;
        expired
    }

    pub fn len_for(&self, id: &str) -> usize {
        self.buckets.get(id).map_or(0, VecDeque::len)
    }

    pub fn bucket(&self, id: &str) -> Vec<Envelope> {
        self.buckets
            .get(id)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_entries_for(&self, id: &str) -> bool {
        self.len_for(id) > 0
    }

    pub fn len(&self) -> usize {
        self.stats.total
    }

    pub fn is_empty(&self) -> bool {
        self.stats.total == 0
    }

    pub fn max_per_key(&self) -> usize {
        self.max_per_key
    }

    pub fn stats(&self) -> SecondaryStats {
        self.stats
    }
}
