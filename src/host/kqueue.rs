//! Modeled kqueues and knotes.
//!
//! A kqueue owns its knotes and an active queue; each knote carries the
//! identifier/filter pair plus the status, flag, and data words that must
//! round-trip through a checkpoint. Knotes in flux (mid state transition)
//! are rejected by capture.

use std::sync::Arc;

use parking_lot::Mutex;

use super::vm::alloc_addr;

/// Filter identifiers, host numbering.
pub const EVFILT_READ: i16 = -1;
pub const EVFILT_WRITE: i16 = -2;
pub const EVFILT_TIMER: i16 = -7;

/// Knote status bits.
pub const KN_ACTIVE: u32 = 0x01;
pub const KN_QUEUED: u32 = 0x02;
pub const KN_DISABLED: u32 = 0x04;
pub const KN_DETACHED: u32 = 0x08;
pub const KN_MARKER: u32 = 0x20;

/// Event flag bits.
pub const EV_ADD: u16 = 0x0001;
pub const EV_DISABLE: u16 = 0x0008;
pub const EV_ENABLE: u16 = 0x0004;
pub const EV_ERROR: u16 = 0x4000;
pub const EV_EOF: u16 = 0x8000;

pub const ECONNRESET_DATA: i64 = 54;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Knote {
    pub addr: u64,
    pub ident: u64,
    pub filter: i16,
    pub flags: u16,
    pub fflags: u32,
    pub data: i64,
    pub status: u32,
    pub sfflags: u32,
    pub sdata: i64,
    pub influx: bool,
}

pub struct Kqueue {
    pub addr: u64,
    /// PID of the process whose file table owns this kqueue; fixed up when
    /// the descriptor is installed during restore.
    pub owner: Mutex<Option<u64>>,
    knotes: Mutex<Vec<Knote>>,
}

impl std::fmt::Debug for Kqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kqueue")
            .field("addr", &self.addr)
            .field("knotes", &self.knotes.lock().len())
            .finish()
    }
}

impl Kqueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            addr: alloc_addr(),
            owner: Mutex::new(None),
            knotes: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, pid: u64) {
        *self.owner.lock() = Some(pid);
    }

    pub fn detach(&self) {
        *self.owner.lock() = None;
    }

    /// Register a knote as `kevent(EV_ADD)` would: replaces an existing
    /// (ident, filter) registration.
    pub fn register(&self, ident: u64, filter: i16, flags: u16, fflags: u32, data: i64) {
        let mut knotes = self.knotes.lock();
        if let Some(kn) = knotes
            .iter_mut()
            .find(|kn| kn.ident == ident && kn.filter == filter)
        {
            kn.flags = flags;
            kn.sfflags = fflags;
            kn.sdata = data;
            if flags & EV_DISABLE != 0 {
                kn.status |= KN_DISABLED;
            }
            if flags & EV_ENABLE != 0 {
                kn.status &= !KN_DISABLED;
            }
            return;
        }
        let mut status = 0;
        if flags & EV_DISABLE != 0 {
            status |= KN_DISABLED;
        }
        knotes.push(Knote {
            addr: alloc_addr(),
            ident,
            filter,
            flags,
            fflags,
            data,
            status,
            sfflags: fflags,
            sdata: data,
            influx: false,
        });
    }

    pub fn knotes(&self) -> Vec<Knote> {
        self.knotes.lock().clone()
    }

    /// Patch a registered knote's saved fields directly, bypassing the
    /// change-notification path. Restore uses this after the disabled
    /// registration.
    pub fn patch(&self, ident: u64, filter: i16, f: impl FnOnce(&mut Knote)) -> bool {
        let mut knotes = self.knotes.lock();
        match knotes
            .iter_mut()
            .find(|kn| kn.ident == ident && kn.filter == filter)
        {
            Some(kn) => {
                f(kn);
                true
            }
            None => false,
        }
    }

    /// Put a knote on the active queue without waking the kqueue.
    pub fn enqueue(&self, ident: u64, filter: i16) {
        self.patch(ident, filter, |kn| {
            kn.status |= KN_ACTIVE | KN_QUEUED;
        });
    }

    /// Active (queued) knotes, capture order.
    pub fn pending(&self) -> Vec<Knote> {
        self.knotes
            .lock()
            .iter()
            .filter(|kn| kn.status & KN_QUEUED != 0)
            .cloned()
            .collect()
    }

    /// Knotes watching descriptor `ident`.
    pub fn knotes_for(&self, ident: u64) -> Vec<Knote> {
        self.knotes
            .lock()
            .iter()
            .filter(|kn| kn.ident == ident)
            .cloned()
            .collect()
    }
}
