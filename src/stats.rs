//! Engine counters.
//!
//! Plain atomics bumped on the hot paths and snapshotted by tools and
//! tests. Leak checks in the test suite compare object counts against these
//! after teardown.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SlsStats {
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub pages_grabbed: AtomicU64,
    pub io_initiated: AtomicU64,
    pub ckpt_attempted: AtomicU64,
    pub ckpt_done: AtomicU64,
    pub memsnap_attempted: AtomicU64,
    pub memsnap_done: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub pages_grabbed: u64,
    pub io_initiated: u64,
    pub ckpt_attempted: u64,
    pub ckpt_done: u64,
    pub memsnap_attempted: u64,
    pub memsnap_done: u64,
}

impl SlsStats {
    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_pages(&self, n: u64) {
        self.pages_grabbed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_io(&self) {
        self.io_initiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            pages_grabbed: self.pages_grabbed.load(Ordering::Relaxed),
            io_initiated: self.io_initiated.load(Ordering::Relaxed),
            ckpt_attempted: self.ckpt_attempted.load(Ordering::Relaxed),
            ckpt_done: self.ckpt_done.load(Ordering::Relaxed),
            memsnap_attempted: self.memsnap_attempted.load(Ordering::Relaxed),
            memsnap_done: self.memsnap_done.load(Ordering::Relaxed),
        }
    }
}
