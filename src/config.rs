//! Engine tunables.
//!
//! Mirrors the knobs the original exposes through sysctls. Values are read
//! once at module initialization from the environment (a `.env` file is
//! honored via `dotenvy`), with compiled-in defaults matching the hosts the
//! engine was tuned on.

use crate::host::vm::PAGE_SIZE;

/// Runtime-tunable engine parameters.
#[derive(Debug, Clone)]
pub struct SlsConfig {
    /// Maximum bytes per buffered I/O when grouping contiguous dirty pages.
    /// Must be a multiple of the page size.
    pub contig_limit: usize,
    /// Dispatch page writeback through the shared task queue instead of
    /// writing synchronously on the checkpointing task.
    pub async_slos: bool,
    /// Sync file-system-backed targets at the end of a pass.
    pub vfs_sync: bool,
    /// Discard all backend I/O. Testing only.
    pub drop_io: bool,
    /// Write-protect shadowed entries page by page (`true`) or unmap the
    /// whole range (`false`).
    pub objprotect: bool,
    /// Number of writeback worker tasks servicing the table task queue.
    pub wb_workers: usize,
}

impl Default for SlsConfig {
    fn default() -> Self {
        Self {
            contig_limit: 64 * PAGE_SIZE,
            async_slos: true,
            vfs_sync: false,
            drop_io: false,
            objprotect: true,
            wb_workers: 2,
        }
    }
}

impl SlsConfig {
    /// Load the configuration from the environment, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Some(v) = env_usize("SLS_CONTIG_LIMIT") {
            cfg.contig_limit = v.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        }
        if let Some(v) = env_bool("SLS_ASYNC_SLOS") {
            cfg.async_slos = v;
        }
        if let Some(v) = env_bool("SLS_VFS_SYNC") {
            cfg.vfs_sync = v;
        }
        if let Some(v) = env_bool("SLS_DROP_IO") {
            cfg.drop_io = v;
        }
        if let Some(v) = env_bool("SLS_OBJPROTECT") {
            cfg.objprotect = v;
        }
        if let Some(v) = env_usize("SLS_WB_WORKERS") {
            cfg.wb_workers = v.clamp(1, 64);
        }

        cfg
    }

    /// Buffer cap expressed in pages.
    pub fn contig_pages(&self) -> u64 {
        (self.contig_limit / PAGE_SIZE) as u64
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
