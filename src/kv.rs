//! Bucket-hashed keyed map.
//!
//! The foundation for every lookup table in the engine: 64-bit keys hashed
//! into a fixed set of buckets, each guarded by its own short-hold mutex so
//! concurrent capture and restore workers touching different keys do not
//! serialize. Insertion rejects duplicates, `pop` removes an arbitrary
//! element (used by drain loops), and iteration is snapshotless: callers
//! must guarantee no bucket is mutated while they iterate. A [`SlsSet`] is
//! the same structure with unit values.

use parking_lot::Mutex;

use crate::error::{Result, SlsError};

/// Default bucket count. Tunable at construction; must be a power of two.
pub const SLSKV_BUCKETS: usize = 16;

struct Bucket<V> {
    pairs: Mutex<Vec<(u64, V)>>,
}

impl<V> Default for Bucket<V> {
    fn default() -> Self {
        Self {
            pairs: Mutex::new(Vec::new()),
        }
    }
}

/// A `u64 → V` map with per-bucket locking.
pub struct SlsTable<V> {
    buckets: Box<[Bucket<V>]>,
    mask: u64,
}

impl<V> Default for SlsTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SlsTable<V> {
    pub fn new() -> Self {
        Self::with_buckets(SLSKV_BUCKETS)
    }

    /// Create a table with `nbuckets` buckets. `nbuckets` must be a power
    /// of two.
    pub fn with_buckets(nbuckets: usize) -> Self {
        assert!(nbuckets.is_power_of_two(), "bucket count must be a power of two");
        let buckets = (0..nbuckets).map(|_| Bucket::default()).collect();
        Self {
            buckets,
            mask: (nbuckets - 1) as u64,
        }
    }

    fn bucket(&self, key: u64) -> &Bucket<V> {
        &self.buckets[(key & self.mask) as usize]
    }

    /// Insert a new pair. Fails with `Invalid` if the key is present.
    pub fn add(&self, key: u64, value: V) -> Result<()> {
        let mut pairs = self.bucket(key).pairs.lock();
        if pairs.iter().any(|(k, _)| *k == key) {
            return Err(SlsError::invalid(format!("key {key:#x} already present")));
        }
        pairs.push((key, value));
        Ok(())
    }

    /// Remove one match for `key`, if any.
    pub fn del(&self, key: u64) {
        let mut pairs = self.bucket(key).pairs.lock();
        if let Some(pos) = pairs.iter().position(|(k, _)| *k == key) {
            pairs.swap_remove(pos);
        }
    }

    /// Remove and return one match for `key`.
    pub fn take(&self, key: u64) -> Option<V> {
        let mut pairs = self.bucket(key).pairs.lock();
        let pos = pairs.iter().position(|(k, _)| *k == key)?;
        Some(pairs.swap_remove(pos).1)
    }

    /// Remove an arbitrary element. Returns `None` when the table is empty.
    pub fn pop(&self) -> Option<(u64, V)> {
        for bucket in self.buckets.iter() {
            let mut pairs = bucket.pairs.lock();
            if let Some(pair) = pairs.pop() {
                return Some(pair);
            }
        }
        None
    }

    pub fn contains(&self, key: u64) -> bool {
        self.bucket(key).pairs.lock().iter().any(|(k, _)| *k == key)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.pairs.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.pairs.lock().is_empty())
    }

    /// Visit every pair. Buckets are locked one at a time; the callback
    /// must not touch the table.
    pub fn for_each(&self, mut f: impl FnMut(u64, &V)) {
        for bucket in self.buckets.iter() {
            for (k, v) in bucket.pairs.lock().iter() {
                f(*k, v);
            }
        }
    }

    /// Snapshot of the current keys, bucket order.
    pub fn keys(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            out.extend(bucket.pairs.lock().iter().map(|(k, _)| *k));
        }
        out
    }
}

impl<V: Clone> SlsTable<V> {
    /// Look up the value for `key`.
    pub fn find(&self, key: u64) -> Option<V> {
        self.bucket(key)
            .pairs
            .lock()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }

    /// Snapshot of the current pairs, bucket order.
    pub fn entries(&self) -> Vec<(u64, V)> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            out.extend(bucket.pairs.lock().iter().cloned());
        }
        out
    }
}

/// A set of 64-bit keys built on the same buckets.
pub type SlsSet = SlsTable<()>;

impl SlsSet {
    /// Insert a key, failing on duplicates.
    pub fn insert(&self, key: u64) -> Result<()> {
        self.add(key, ())
    }

    /// Remove and return an arbitrary key.
    pub fn pop_key(&self) -> Option<u64> {
        self.pop().map(|(k, ())| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn add_find_del() {
        let t: SlsTable<u64> = SlsTable::new();
        t.add(1, 100).unwrap();
        t.add(17, 200).unwrap();
        assert_eq!(t.find(1), Some(100));
        assert_eq!(t.find(17), Some(200));
        assert!(t.add(1, 300).is_err());
        t.del(1);
        assert_eq!(t.find(1), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn pop_drains() {
        let t: SlsTable<u64> = SlsTable::new();
        for k in 0..64 {
            t.add(k, k * 2).unwrap();
        }
        let mut seen = 0;
        while let Some((k, v)) = t.pop() {
            assert_eq!(v, k * 2);
            seen += 1;
        }
        assert_eq!(seen, 64);
        assert!(t.is_empty());
    }

    #[test]
    fn set_semantics() {
        let s = SlsSet::new();
        s.insert(42).unwrap();
        assert!(s.contains(42));
        assert!(s.insert(42).is_err());
        assert_eq!(s.pop_key(), Some(42));
        assert_eq!(s.pop_key(), None);
    }

    proptest! {
        #[test]
        fn matches_reference_map(ops in prop::collection::vec((any::<u16>(), any::<u64>(), any::<bool>()), 0..200)) {
            use std::collections::HashMap;
            let t: SlsTable<u64> = SlsTable::new();
            let mut reference: HashMap<u64, u64> = HashMap::new();
            for (key, value, insert) in ops {
                let key = key as u64;
                if insert {
                    let added = t.add(key, value).is_ok();
                    prop_assert_eq!(added, !reference.contains_key(&key));
                    reference.entry(key).or_insert(value);
                } else {
                    t.del(key);
                    reference.remove(&key);
                }
                prop_assert_eq!(t.find(key), reference.get(&key).copied());
            }
            prop_assert_eq!(t.len(), reference.len());
        }
    }
}
