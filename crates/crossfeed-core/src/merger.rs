//! Non-streaming ORDER BY merge
//!
//! Some cross-partition orderings cannot be produced by a streaming k-way
//! merge. Instead every partition's rows are offered to this structure, which
//! keeps only the best row per grouping key. Memory is proportional to the
//! number of distinct keys, not to the number of rows scanned.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::hash::Hash;

type Comparator<V> = Box<dyn Fn(&V, &V) -> Ordering + Send + Sync>;

/// Keyed replace-or-keep map driven by an injected comparator
///
/// `compare(existing, candidate) == Ordering::Less` means the candidate
/// supersedes the existing value. The merger assumes no ordering of its own.
///
/// Updates to one key are atomic; updates to different keys only contend
/// when they hash to the same shard.
pub struct NonStreamingOrderByMerger<K, V> {
    entries: DashMap<K, V>,
    compare: Comparator<V>,
}

impl<K, V> NonStreamingOrderByMerger<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(compare: impl Fn(&V, &V) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            entries: DashMap::new(),
            compare: Box::new(compare),
        }
    }

    /// Offer `value` for `key`, keeping whichever value the comparator prefers
    ///
    /// Returns true if `value` was stored.
    pub fn set(&self, key: K, value: V) -> bool {
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
            Entry::Occupied(mut slot) => {
                if (self.compare)(slot.get(), &value) == Ordering::Less {
                    slot.insert(value);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current best value for `key`
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Number of distinct keys held
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every best value, in no particular order
    ///
    /// Results are handed off once: a second call returns an empty vector.
    pub fn drain_all(&self) -> Vec<V> {
        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|(_, value)| value))
            .collect()
    }

    /// Drain and order best-first under the merger's comparator
    pub fn drain_sorted(&self) -> Vec<V> {
        let mut values = self.drain_all();
        values.sort_by(|a, b| (self.compare)(b, a));
        values
    }
}
