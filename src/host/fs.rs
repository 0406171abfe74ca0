//! Modeled VFS: vnodes resolvable by path, plus backing-store inodes.
//!
//! Two ways to anchor a vnode, matching how capture identifies them: a
//! full path in the host namespace, or an inode number in the partition's
//! own backing store (for files that live inside the engine's store and
//! may not have a host path at all).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::pts::Tty;
use super::socket::Socket;
use super::vm::alloc_addr;
use crate::error::{Result, SlsError};

/// Device paths that may appear in a checkpoint. Everything else fails the
/// `supported` hook.
pub const ACCEPTED_DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/hpet0",
    "/dev/random",
    "/dev/urandom",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
    Fifo,
    CharDev,
    Socket,
}

pub struct Vnode {
    pub addr: u64,
    pub ino: u64,
    pub kind: VnodeKind,
    path: Mutex<Option<String>>,
    /// File contents for regular vnodes.
    pub data: Mutex<Vec<u8>>,
    pub usecount: AtomicU32,
    /// Tty behind a /dev/pts device vnode.
    tty: Mutex<Weak<Tty>>,
    /// Unix socket bound to this vnode, if any.
    bound_socket: Mutex<Weak<Socket>>,
    /// Whether the vnode is anchored in the partition's backing store
    /// rather than the host namespace.
    pub store_backed: bool,
}

impl std::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vnode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .field("path", &*self.path.lock())
            .finish()
    }
}

impl Vnode {
    fn new(ino: u64, kind: VnodeKind, path: Option<String>, store_backed: bool) -> Arc<Self> {
        Arc::new(Self {
            addr: alloc_addr(),
            ino,
            kind,
            path: Mutex::new(path),
            data: Mutex::new(Vec::new()),
            usecount: AtomicU32::new(0),
            tty: Mutex::new(Weak::new()),
            bound_socket: Mutex::new(Weak::new()),
            store_backed,
        })
    }

    /// Full path, if the vnode is still linked in the namespace.
    pub fn fullpath(&self) -> Option<String> {
        self.path.lock().clone()
    }

    pub fn vref(&self) {
        self.usecount.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vrele(&self) {
        let prev = self.usecount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "vrele without a reference");
    }

    pub fn is_tty(&self) -> bool {
        self.kind == VnodeKind::CharDev && self.tty.lock().strong_count() > 0
    }

    pub fn tty(&self) -> Option<Arc<Tty>> {
        self.tty.lock().upgrade()
    }

    pub fn set_tty(&self, tty: &Arc<Tty>) {
        *self.tty.lock() = Arc::downgrade(tty);
    }

    pub fn bound_socket(&self) -> Option<Arc<Socket>> {
        self.bound_socket.lock().upgrade()
    }

    pub fn bind_socket(&self, so: &Arc<Socket>) {
        *self.bound_socket.lock() = Arc::downgrade(so);
    }

    /// Whether capture can identify this vnode by name (or store inode).
    pub fn ckpt_by_name(&self) -> bool {
        match self.kind {
            VnodeKind::Regular | VnodeKind::Fifo | VnodeKind::Directory | VnodeKind::Socket => true,
            VnodeKind::CharDev => !self.is_tty(),
        }
    }

    /// Whether the device is on the restore allow-list.
    pub fn accepted_device(&self) -> bool {
        match self.fullpath() {
            Some(p) => ACCEPTED_DEVICES.contains(&p.as_str()),
            None => false,
        }
    }
}

/// The host namespace plus the backing-store inode table.
pub struct Vfs {
    by_path: Mutex<FxHashMap<String, Arc<Vnode>>>,
    by_ino: Mutex<FxHashMap<u64, Arc<Vnode>>>,
    next_ino: AtomicU64,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        let vfs = Self {
            by_path: Mutex::new(FxHashMap::default()),
            by_ino: Mutex::new(FxHashMap::default()),
            next_ino: AtomicU64::new(2),
        };
        // Namespace roots and the device allow-list are always present.
        vfs.must_create("/", VnodeKind::Directory);
        vfs.must_create("/tmp", VnodeKind::Directory);
        for dev in ACCEPTED_DEVICES {
            vfs.must_create(dev, VnodeKind::CharDev);
        }
        vfs
    }

    fn must_create(&self, path: &str, kind: VnodeKind) -> Arc<Vnode> {
        self.create(path, kind)
            .unwrap_or_else(|_| panic!("seeding vnode {path}"))
    }

    /// Create a vnode linked at `path`.
    pub fn create(&self, path: &str, kind: VnodeKind) -> Result<Arc<Vnode>> {
        let mut by_path = self.by_path.lock();
        if by_path.contains_key(path) {
            return Err(SlsError::invalid(format!("path {path} exists")));
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let vp = Vnode::new(ino, kind, Some(path.to_string()), false);
        by_path.insert(path.to_string(), vp.clone());
        self.by_ino.lock().insert(ino, vp.clone());
        Ok(vp)
    }

    /// Create an unnamed vnode anchored in the backing store.
    pub fn create_store_backed(&self, kind: VnodeKind) -> Arc<Vnode> {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let vp = Vnode::new(ino, kind, None, true);
        self.by_ino.lock().insert(ino, vp.clone());
        vp
    }

    /// Namespace lookup.
    pub fn lookup(&self, path: &str) -> Result<Arc<Vnode>> {
        self.by_path
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| SlsError::gone(format!("no vnode at {path}")))
    }

    pub fn lookup_or_create(&self, path: &str, kind: VnodeKind) -> Result<Arc<Vnode>> {
        if let Ok(vp) = self.lookup(path) {
            return Ok(vp);
        }
        self.create(path, kind)
    }

    /// Backing-store lookup by inode number.
    pub fn vget(&self, ino: u64) -> Result<Arc<Vnode>> {
        self.by_ino
            .lock()
            .get(&ino)
            .cloned()
            .ok_or_else(|| SlsError::gone(format!("no inode {ino:#x}")))
    }

    /// Unlink a path; the vnode survives while referenced but loses its
    /// name.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let vp = self
            .by_path
            .lock()
            .remove(path)
            .ok_or_else(|| SlsError::gone(format!("no vnode at {path}")))?;
        *vp.path.lock() = None;
        Ok(())
    }
}
