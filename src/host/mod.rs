//! The modeled host: the collaborators the engine consumes.
//!
//! The spec treats the kernel's process, VM, and VFS primitives as
//! external; this module is their in-crate provider. It is deliberately a
//! model: enough state and enough of the real transition rules (CoW
//! faults, boundary stops, pgrp/session leadership, port binding) for the
//! engine's semantics to be exercised and asserted end-to-end.

pub mod file;
pub mod fs;
pub mod kqueue;
pub mod pipe;
pub mod process;
pub mod pts;
pub mod shm;
pub mod socket;
pub mod vm;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Result, SlsError};
use file::FdTable;
use fs::Vfs;
use process::{Pgrp, Process, Session};
use shm::{PosixShmTable, SysvShm};
use socket::PortTable;

/// A complete modeled host.
pub struct Host {
    pub vfs: Vfs,
    pub ports: PortTable,
    pub posix_shm: PosixShmTable,
    pub sysv_shm: SysvShm,
    procs: Mutex<FxHashMap<u64, Arc<Process>>>,
    next_pid: AtomicU64,
    /// The session/pgrp the restore coordinator runs in; restored
    /// non-daemon processes inherit it.
    init_pgrp: Arc<Pgrp>,
    init_session: Arc<Session>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        let session = Session::new(1);
        let pgrp = Pgrp::new(1, session.clone());
        let vfs = Vfs::new();
        // The session every restore coordinator runs in has a controlling
        // terminal; dangling tty descriptors are rewired to it.
        if let Ok((tty, _slave)) = pts::pts_alloc(&vfs) {
            *session.tty.lock() = Some(tty);
        }
        Self {
            vfs,
            ports: PortTable::default(),
            posix_shm: PosixShmTable::default(),
            sysv_shm: SysvShm::default(),
            procs: Mutex::new(FxHashMap::default()),
            next_pid: AtomicU64::new(100),
            init_pgrp: pgrp,
            init_session: session,
        }
    }

    pub fn init_pgrp(&self) -> Arc<Pgrp> {
        self.init_pgrp.clone()
    }

    pub fn init_session(&self) -> Arc<Session> {
        self.init_session.clone()
    }

    fn default_fdtable(&self) -> Result<FdTable> {
        let root = self.vfs.lookup("/")?;
        Ok(FdTable::new(root.clone(), root))
    }

    /// Spawn a live process in its own session and pgrp, the shape a
    /// workload launched from a shell has.
    pub fn spawn(&self, comm: &str) -> Result<Arc<Process>> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let fdtable = self.default_fdtable()?;
        let session = Session::new(pid);
        let pgrp = Pgrp::new(pid, session);
        let p = Process::new(pid, comm, fdtable, pgrp);
        let text = self
            .vfs
            .lookup_or_create(&format!("/bin/{comm}"), fs::VnodeKind::Regular)?;
        text.vref();
        *p.textvp.lock() = Some(text);
        self.procs.lock().insert(pid, p.clone());
        Ok(p)
    }

    /// Fork a child of `parent` that shares nothing but the relations.
    pub fn fork(&self, parent: &Arc<Process>, comm: &str) -> Result<Arc<Process>> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let fdtable = self.default_fdtable()?;
        let p = Process::new(pid, comm, fdtable, parent.pgrp());
        *p.textvp.lock() = parent.textvp.lock().clone();
        if let Some(vp) = p.textvp.lock().as_ref() {
            vp.vref();
        }
        p.reparent(parent);
        self.procs.lock().insert(pid, p.clone());
        Ok(p)
    }

    /// Fork an empty restore target: fresh address space, empty fd table,
    /// the coordinator's pgrp, not yet scheduled.
    pub fn fork_restored(&self, comm: &str) -> Result<Arc<Process>> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let fdtable = self.default_fdtable()?;
        let p = Process::new(pid, comm, fdtable, self.init_pgrp.clone());
        p.threads.lock().clear();
        self.procs.lock().insert(pid, p.clone());
        Ok(p)
    }

    /// `pget` shape: look up a live process.
    pub fn pget(&self, pid: u64) -> Result<Arc<Process>> {
        self.procs
            .lock()
            .get(&pid)
            .cloned()
            .ok_or_else(|| SlsError::gone(format!("no process {pid}")))
    }

    pub fn proc_count(&self) -> usize {
        self.procs.lock().len()
    }

    /// Tear a process down, releasing its address space.
    pub fn reap(&self, pid: u64) {
        let p = self.procs.lock().remove(&pid);
        if let Some(p) = p {
            p.set_exiting();
            p.vmspace().release();
        }
    }
}
