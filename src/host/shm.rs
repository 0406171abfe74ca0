//! Modeled shared memory: POSIX shm objects and the SysV segment array.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::vm::{ObjKind, VmObject, alloc_addr};
use crate::error::{Result, SlsError};

/// Fixed number of SysV segment slots, the `shmalloced` of the host.
pub const SHM_SLOTS: usize = 64;

/// Segment-mode bit marking an allocated slot.
pub const SHMSEG_ALLOCATED: u16 = 0x0800;
pub const ACCESSPERMS: u16 = 0o777;

/// A POSIX shared-memory object (the `shmfd`).
pub struct PosixShm {
    pub addr: u64,
    pub mode: u16,
    pub path: Option<String>,
    object: Mutex<Arc<VmObject>>,
}

impl std::fmt::Debug for PosixShm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixShm")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl PosixShm {
    pub fn object(&self) -> Arc<VmObject> {
        self.object.lock().clone()
    }

    /// Swap the backing object, releasing the old one's reference. Restore
    /// uses this to point an already-created segment at restored pages.
    pub fn swap_object(&self, obj: Arc<VmObject>) {
        obj.reference();
        let old = std::mem::replace(&mut *self.object.lock(), obj);
        old.deallocate();
    }

    /// Replace the slot without touching reference counts, for callers
    /// that already transferred the segment's reference (shadowing).
    pub fn set_object_raw(&self, obj: Arc<VmObject>) {
        *self.object.lock() = obj;
    }
}

/// Registry of named POSIX segments plus anonymous ones by address.
#[derive(Default)]
pub struct PosixShmTable {
    named: Mutex<FxHashMap<String, Arc<PosixShm>>>,
}

impl PosixShmTable {
    /// `shm_open(O_CREAT | O_EXCL)`: fails if the name exists.
    pub fn create_excl(&self, path: Option<&str>, mode: u16, size_pages: u64) -> Result<Arc<PosixShm>> {
        let obj = VmObject::alloc(ObjKind::Swap, size_pages);
        let shm = Arc::new(PosixShm {
            addr: alloc_addr(),
            mode,
            path: path.map(str::to_string),
            object: Mutex::new(obj),
        });
        if let Some(p) = path {
            let mut named = self.named.lock();
            if named.contains_key(p) {
                return Err(SlsError::invalid(format!("shm path {p} exists")));
            }
            named.insert(p.to_string(), shm.clone());
        }
        Ok(shm)
    }

    /// Plain `shm_open` of an existing named segment.
    pub fn open(&self, path: &str) -> Result<Arc<PosixShm>> {
        self.named
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| SlsError::gone(format!("no shm at {path}")))
    }
}

/// One allocated SysV segment.
#[derive(Clone)]
pub struct SysvSegment {
    pub key: u32,
    pub segsz: u64,
    pub mode: u16,
    pub seq: u16,
    pub object: Arc<VmObject>,
}

/// The host-wide SysV segment array. Slots restore to their exact original
/// indices.
pub struct SysvShm {
    addr: u64,
    segs: Mutex<Vec<Option<SysvSegment>>>,
}

impl Default for SysvShm {
    fn default() -> Self {
        Self {
            addr: alloc_addr(),
            segs: Mutex::new(vec![None; SHM_SLOTS]),
        }
    }
}

impl SysvShm {
    /// Identity of the segment array, the SLS-ID of the shared record.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// `shmget`-shape allocation into the first free slot.
    pub fn alloc(&self, key: u32, segsz: u64, mode: u16) -> Result<usize> {
        let pages = segsz.div_ceil(super::vm::PAGE_SIZE as u64);
        let mut segs = self.segs.lock();
        let slot = segs
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| SlsError::nomem("sysv segment slots exhausted"))?;
        segs[slot] = Some(SysvSegment {
            key,
            segsz,
            mode: (mode & ACCESSPERMS) | SHMSEG_ALLOCATED,
            seq: 1,
            object: VmObject::alloc(ObjKind::Swap, pages),
        });
        Ok(slot)
    }

    /// Install a restored segment at the exact slot it occupied at capture
    /// time. The slot must be free.
    pub fn install(&self, slot: usize, seg: SysvSegment) -> Result<()> {
        let mut segs = self.segs.lock();
        if slot >= segs.len() {
            return Err(SlsError::invalid(format!("sysv segment index {slot} out of range")));
        }
        if segs[slot].is_some() {
            return Err(SlsError::invalid(format!("sysv segment {slot} already allocated")));
        }
        segs[slot] = Some(seg);
        Ok(())
    }

    pub fn get(&self, slot: usize) -> Option<SysvSegment> {
        self.segs.lock().get(slot).and_then(Clone::clone)
    }

    /// `shmctl(IPC_RMID)` shape: free a slot, dropping the segment's
    /// object reference.
    pub fn remove(&self, slot: usize) -> Result<()> {
        let seg = self
            .segs
            .lock()
            .get_mut(slot)
            .ok_or_else(|| SlsError::invalid(format!("sysv segment index {slot} out of range")))?
            .take()
            .ok_or_else(|| SlsError::invalid(format!("sysv segment {slot} not allocated")))?;
        seg.object.deallocate();
        Ok(())
    }

    /// Snapshot of allocated slots, ascending index.
    pub fn allocated(&self) -> Vec<(usize, SysvSegment)> {
        self.segs
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.clone().map(|seg| (i, seg)))
            .collect()
    }

    /// Replace a segment's object (after shadowing).
    pub fn replace_object(&self, slot: usize, obj: Arc<VmObject>) {
        let mut segs = self.segs.lock();
        if let Some(Some(seg)) = segs.get_mut(slot) {
            seg.object = obj;
        }
    }
}
