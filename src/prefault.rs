//! Prefault tracking.
//!
//! I/O completions report which `(object, page-range)` pairs are present
//! in the backend; prefault and lazy restore consult this to decide what
//! to page in eagerly and what can wait for a fault.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::host::vm::Pindex;
use crate::record::SlsId;

#[derive(Default)]
pub struct PrefaultTable {
    ranges: Mutex<FxHashMap<SlsId, Vec<(Pindex, u64)>>>,
}

impl PrefaultTable {
    /// Record that `count` pages starting at `pindex` of `objid` are now
    /// present in the backend.
    pub fn notify(&self, objid: SlsId, pindex: Pindex, count: u64) {
        if count == 0 {
            return;
        }
        let mut ranges = self.ranges.lock();
        let entry = ranges.entry(objid).or_default();
        // Merge with the previous range when contiguous; completions
        // arrive mostly in ascending order.
        if let Some(last) = entry.last_mut() {
            if last.0 + last.1 == pindex {
                last.1 += count;
                return;
            }
        }
        entry.push((pindex, count));
    }

    /// Present ranges of an object, ascending.
    pub fn resident(&self, objid: SlsId) -> Vec<(Pindex, u64)> {
        let mut out = self
            .ranges
            .lock()
            .get(&objid)
            .cloned()
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    pub fn contains(&self, objid: SlsId, pindex: Pindex) -> bool {
        self.resident(objid)
            .iter()
            .any(|&(start, count)| start <= pindex && pindex < start + count)
    }

    pub fn forget(&self, objid: SlsId) {
        self.ranges.lock().remove(&objid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_contiguous_ranges() {
        let t = PrefaultTable::default();
        t.notify(1, 0, 4);
        t.notify(1, 4, 2);
        t.notify(1, 10, 1);
        assert_eq!(t.resident(1), vec![(0, 6), (10, 1)]);
        assert!(t.contains(1, 5));
        assert!(!t.contains(1, 8));
        t.forget(1);
        assert!(t.resident(1).is_empty());
    }
}
