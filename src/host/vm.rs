//! Modeled virtual memory: objects, shadow chains, spaces, and entries.
//!
//! This is the host-side collaborator the CoW engine manipulates. Objects
//! carry a logical reference count with `vm_object`-style transfer rules
//! (an `Arc` only keeps the memory alive; the logical count is what the
//! collapse discipline reasons about), a backing chain for copy-on-write,
//! resident pages keyed by page index, and the `in_sls` / `one_mapping`
//! hints the shadowing pass reads and writes.
//!
//! Writes from a modeled process go through [`VmSpace::write`], which acts
//! as the fault handler: the first store to a page whose entry points at a
//! fresh shadow copies the ancestor page into the shadow before mutating
//! it. That ordering is what keeps pages frozen under a completed pass
//! immutable while the process keeps running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, SlsError};

/// Host page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Page index inside an object.
pub type Pindex = u64;

static NEXT_ADDR: AtomicU64 = AtomicU64::new(0x1000);

/// Hand out a unique host-object address. Shared by every modeled entity
/// that needs a capture-time SLS-ID.
pub fn alloc_addr() -> u64 {
    NEXT_ADDR.fetch_add(8, Ordering::Relaxed)
}

/// Object backing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    /// Anonymous, never paged out.
    Default,
    /// Anonymous with swap backing.
    Swap,
    /// Backed by a vnode (file mapping).
    Vnode,
    /// Physical/shared-page object.
    Phys,
    /// Device mapping.
    Device,
}

impl ObjKind {
    pub fn tag(self) -> u16 {
        match self {
            ObjKind::Default => 0,
            ObjKind::Swap => 1,
            ObjKind::Vnode => 2,
            ObjKind::Phys => 3,
            ObjKind::Device => 4,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            0 => ObjKind::Default,
            1 => ObjKind::Swap,
            2 => ObjKind::Vnode,
            3 => ObjKind::Phys,
            4 => ObjKind::Device,
            _ => return None,
        })
    }
}

/// A resident page and its pager state.
struct PageSlot {
    data: Box<[u8]>,
    swap_in_progress: bool,
}

pub(crate) struct VmObjectInner {
    /// Unique ID, inherited by shadows so recursive dumps resolve.
    pub objid: u64,
    pub kind: ObjKind,
    /// Size in pages.
    pub size: u64,
    /// Logical reference count.
    pub refs: u32,
    pub backing: Option<Arc<VmObject>>,
    pub backing_offset: u64,
    pub shadow_count: u32,
    /// Set once the capture holds a stake in the object.
    pub in_sls: bool,
    pub one_mapping: bool,
    /// Backing vnode for vnode-backed objects.
    pub vnode: Option<Arc<super::fs::Vnode>>,
    pages: BTreeMap<Pindex, PageSlot>,
    /// Paging-in-progress count.
    pub pip: u32,
}

/// A modeled VM object.
pub struct VmObject {
    /// Stable host address; the capture-time identity of this object.
    pub addr: u64,
    inner: Mutex<VmObjectInner>,
    /// Woken when a swap-in-progress flag clears or `pip` drops.
    pager_wait: Notify,
}

impl std::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VmObject")
            .field("addr", &self.addr)
            .field("objid", &inner.objid)
            .field("kind", &inner.kind)
            .field("size", &inner.size)
            .field("refs", &inner.refs)
            .field("shadow_count", &inner.shadow_count)
            .field("in_sls", &inner.in_sls)
            .finish()
    }
}

impl VmObject {
    /// Allocate a fresh object with one logical reference.
    pub fn alloc(kind: ObjKind, size_pages: u64) -> Arc<Self> {
        let addr = alloc_addr();
        Arc::new(Self {
            addr,
            inner: Mutex::new(VmObjectInner {
                objid: addr,
                kind,
                size: size_pages,
                refs: 1,
                backing: None,
                backing_offset: 0,
                shadow_count: 0,
                in_sls: false,
                one_mapping: true,
                vnode: None,
                pages: BTreeMap::new(),
                pip: 0,
            }),
            pager_wait: Notify::new(),
        })
    }

    /// Allocate a vnode-backed object.
    pub fn alloc_vnode(size_pages: u64, vnode: &Arc<super::fs::Vnode>) -> Arc<Self> {
        let obj = Self::alloc(ObjKind::Vnode, size_pages);
        obj.inner.lock().vnode = Some(vnode.clone());
        obj
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind(), ObjKind::Default | ObjKind::Swap)
    }

    pub fn kind(&self) -> ObjKind {
        self.inner.lock().kind
    }

    pub fn objid(&self) -> u64 {
        self.inner.lock().objid
    }

    pub fn set_objid(&self, objid: u64) {
        self.inner.lock().objid = objid;
    }

    pub fn size_pages(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn refs(&self) -> u32 {
        self.inner.lock().refs
    }

    pub fn shadow_count(&self) -> u32 {
        self.inner.lock().shadow_count
    }

    pub fn in_sls(&self) -> bool {
        self.inner.lock().in_sls
    }

    pub fn set_in_sls(&self, v: bool) {
        self.inner.lock().in_sls = v;
    }

    pub fn clear_one_mapping(&self) {
        self.inner.lock().one_mapping = false;
    }

    pub fn backing(&self) -> Option<Arc<VmObject>> {
        self.inner.lock().backing.clone()
    }

    pub fn backing_offset(&self) -> u64 {
        self.inner.lock().backing_offset
    }

    pub fn vnode(&self) -> Option<Arc<super::fs::Vnode>> {
        self.inner.lock().vnode.clone()
    }

    pub fn vnode_addr(&self) -> u64 {
        self.inner.lock().vnode.as_ref().map_or(0, |vp| vp.addr)
    }

    /// Take a logical reference.
    pub fn reference(&self) {
        self.inner.lock().refs += 1;
    }

    /// Drop a logical reference. When the last one goes away the object
    /// releases its stake in its backer.
    pub fn deallocate(self: &Arc<Self>) {
        let backing = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.refs > 0, "deallocating object with zero refs");
            inner.refs -= 1;
            if inner.refs > 0 {
                return;
            }
            inner.pages.clear();
            let backing = inner.backing.take();
            if let Some(ref b) = backing {
                b.inner.lock().shadow_count -= 1;
            }
            backing
        };
        if let Some(b) = backing {
            b.deallocate();
        }
    }

    /// `vm_object_shadow` semantics: create a copy-on-write child the same
    /// size as `self`, donating the caller's reference to the chain link.
    /// The new shadow holds one reference owned by the caller; `self`'s
    /// shadow count grows by one.
    pub fn shadow(self: &Arc<Self>) -> Arc<VmObject> {
        let (size, kind) = {
            let mut inner = self.inner.lock();
            inner.shadow_count += 1;
            (inner.size, inner.kind)
        };
        let child = VmObject::alloc(
            if kind == ObjKind::Swap { ObjKind::Swap } else { ObjKind::Default },
            size,
        );
        {
            let mut ci = child.inner.lock();
            ci.backing = Some(self.clone());
            ci.backing_offset = 0;
        }
        child
    }

    /// Link an already-created object under `source` at `offset`, used by
    /// restore to rebuild chains recorded in the artifact.
    pub fn force_shadow(self: &Arc<Self>, source: &Arc<VmObject>, offset: u64) {
        source.inner.lock().shadow_count += 1;
        let mut inner = self.inner.lock();
        inner.backing = Some(source.clone());
        inner.backing_offset = offset;
    }

    /// Insert (or overwrite) a resident page.
    pub fn page_insert(&self, pindex: Pindex, data: &[u8]) {
        debug_assert!(data.len() <= PAGE_SIZE);
        let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
        page[..data.len()].copy_from_slice(data);
        self.inner.lock().pages.insert(
            pindex,
            PageSlot { data: page, swap_in_progress: false },
        );
    }

    /// Copy of a resident page, without consulting the backing chain.
    pub fn page_lookup(&self, pindex: Pindex) -> Option<Box<[u8]>> {
        self.inner.lock().pages.get(&pindex).map(|s| s.data.clone())
    }

    pub fn page_remove(&self, pindex: Pindex) {
        self.inner.lock().pages.remove(&pindex);
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Indices of resident pages at or after `from`, ascending.
    pub fn resident_from(&self, from: Pindex) -> Vec<Pindex> {
        self.inner
            .lock()
            .pages
            .range(from..)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Indices resident anywhere in the backing chain at or after `from`,
    /// ascending and deduplicated.
    pub fn chain_resident_from(self: &Arc<Self>, from: Pindex) -> Vec<Pindex> {
        let mut out = std::collections::BTreeSet::new();
        let mut cur = self.clone();
        let mut shift = 0u64;
        loop {
            let next = {
                let inner = cur.inner.lock();
                for (&p, _) in inner.pages.range(..) {
                    if p >= shift && p - shift >= from {
                        out.insert(p - shift);
                    }
                }
                shift += inner.backing_offset / PAGE_SIZE as u64;
                inner.backing.clone()
            };
            match next {
                Some(b) => cur = b,
                None => break,
            }
        }
        out.into_iter().collect()
    }

    /// Read through the backing chain. Returns a zero page if nothing in
    /// the chain is resident.
    pub fn chain_read(self: &Arc<Self>, pindex: Pindex) -> Box<[u8]> {
        let mut cur = self.clone();
        let mut idx = pindex;
        loop {
            let next = {
                let inner = cur.inner.lock();
                if let Some(slot) = inner.pages.get(&idx) {
                    return slot.data.clone();
                }
                idx += inner.backing_offset / PAGE_SIZE as u64;
                inner.backing.clone()
            };
            match next {
                Some(b) => cur = b,
                None => return vec![0u8; PAGE_SIZE].into_boxed_slice(),
            }
        }
    }

    /// Whether any object in the chain has the page resident.
    pub fn chain_resident(self: &Arc<Self>, pindex: Pindex) -> bool {
        let mut cur = self.clone();
        let mut idx = pindex;
        loop {
            let next = {
                let inner = cur.inner.lock();
                if inner.pages.contains_key(&idx) {
                    return true;
                }
                idx += inner.backing_offset / PAGE_SIZE as u64;
                inner.backing.clone()
            };
            match next {
                Some(b) => cur = b,
                None => return false,
            }
        }
    }

    /// Mark a run of pages swap-in-progress and bump paging-in-progress.
    /// Pages under this flag are immutable from the capturing side until
    /// [`Self::complete_io`] clears it.
    pub fn begin_io(&self, pages: &[Pindex]) {
        let mut inner = self.inner.lock();
        inner.pip += 1;
        for p in pages {
            if let Some(slot) = inner.pages.get_mut(p) {
                slot.swap_in_progress = true;
            }
        }
    }

    /// Grab busy pages for a read: allocate any that are absent, flag the
    /// whole run swap-in-progress, and bump paging-in-progress. The pager
    /// fills them with [`Self::page_fill`] and retires the run with
    /// [`Self::complete_io`].
    pub fn grab_busy(&self, pages: &[Pindex]) {
        let mut inner = self.inner.lock();
        inner.pip += 1;
        for p in pages {
            inner
                .pages
                .entry(*p)
                .or_insert_with(|| PageSlot {
                    data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
                    swap_in_progress: false,
                })
                .swap_in_progress = true;
        }
    }

    /// Fill a grabbed page with read data, leaving its busy flag for
    /// [`Self::complete_io`] to clear.
    pub fn page_fill(&self, pindex: Pindex, data: &[u8]) {
        debug_assert!(data.len() <= PAGE_SIZE);
        let mut inner = self.inner.lock();
        let Some(slot) = inner.pages.get_mut(&pindex) else {
            debug_assert!(false, "filling a page that was never grabbed");
            return;
        };
        slot.data[..data.len()].copy_from_slice(data);
        slot.data[data.len()..].fill(0);
    }

    /// Clear the in-progress flags and wake any waiter.
    pub fn complete_io(&self, pages: &[Pindex]) {
        {
            let mut inner = self.inner.lock();
            for p in pages {
                if let Some(slot) = inner.pages.get_mut(p) {
                    slot.swap_in_progress = false;
                }
            }
            debug_assert!(inner.pip > 0);
            inner.pip -= 1;
        }
        self.pager_wait.notify_waiters();
    }

    pub fn page_in_progress(&self, pindex: Pindex) -> bool {
        self.inner
            .lock()
            .pages
            .get(&pindex)
            .is_some_and(|s| s.swap_in_progress)
    }

    /// Sleep until the page's swap-in-progress flag clears.
    pub async fn wait_page(&self, pindex: Pindex) {
        loop {
            let notified = self.pager_wait.notified();
            if !self.page_in_progress(pindex) {
                return;
            }
            notified.await;
        }
    }

    /// Sleep until all paging in progress drains.
    pub async fn wait_pip(&self) {
        loop {
            let notified = self.pager_wait.notified();
            if self.inner.lock().pip == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Map-entry eflags bits the engine inspects.
pub const MAP_ENTRY_COW: u32 = 0x1;
pub const MAP_ENTRY_NEEDS_COPY: u32 = 0x2;
pub const MAP_ENTRY_GUARD: u32 = 0x4;

/// Protection bits.
pub const PROT_READ: u8 = 0x1;
pub const PROT_WRITE: u8 = 0x2;
pub const PROT_EXEC: u8 = 0x4;

/// A single mapping inside a [`VmSpace`].
#[derive(Clone)]
pub struct VmEntry {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub eflags: u32,
    pub protection: u8,
    pub max_protection: u8,
    pub inheritance: u8,
    pub object: Option<Arc<VmObject>>,
}

impl VmEntry {
    pub fn span_pages(&self) -> u64 {
        (self.end - self.start) / PAGE_SIZE as u64
    }

    /// Page index inside the backing object for a virtual address.
    pub fn pindex_of(&self, vaddr: u64) -> Pindex {
        (vaddr - self.start + self.offset) / PAGE_SIZE as u64
    }
}

/// Per-process address space metadata plus the map itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmSpaceMeta {
    pub swrss: u64,
    pub tsize: u64,
    pub dsize: u64,
    pub ssize: u64,
    pub taddr: u64,
    pub daddr: u64,
    pub maxsaddr: u64,
}

pub struct VmSpace {
    pub meta: Mutex<VmSpaceMeta>,
    entries: Mutex<Vec<VmEntry>>,
}

impl Default for VmSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl VmSpace {
    pub fn new() -> Self {
        Self {
            meta: Mutex::new(VmSpaceMeta::default()),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Insert a mapping in address order.
    pub fn insert(&self, entry: VmEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .any(|e| e.start < entry.end && entry.start < e.end)
        {
            return Err(SlsError::invalid(format!(
                "mapping {:#x}..{:#x} overlaps an existing entry",
                entry.start, entry.end
            )));
        }
        let pos = entries
            .iter()
            .position(|e| e.start > entry.start)
            .unwrap_or(entries.len());
        entries.insert(pos, entry);
        Ok(())
    }

    /// Map a fresh anonymous object at `start`.
    pub fn mmap_anon(&self, start: u64, len: u64, protection: u8) -> Result<Arc<VmObject>> {
        debug_assert!(len % PAGE_SIZE as u64 == 0);
        let obj = VmObject::alloc(ObjKind::Default, len / PAGE_SIZE as u64);
        self.insert(VmEntry {
            start,
            end: start + len,
            offset: 0,
            eflags: 0,
            protection,
            max_protection: PROT_READ | PROT_WRITE | PROT_EXEC,
            inheritance: 0,
            object: Some(obj.clone()),
        })?;
        Ok(obj)
    }

    /// Snapshot of the entries, address order.
    pub fn entries(&self) -> Vec<VmEntry> {
        self.entries.lock().clone()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Find the entry containing `vaddr`.
    pub fn lookup(&self, vaddr: u64) -> Option<VmEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.start <= vaddr && vaddr < e.end)
            .cloned()
    }

    /// Redirect the entry containing `vaddr` to a different object. Used
    /// by the shadowing pass after write protection.
    pub fn replace_object(&self, vaddr: u64, object: Arc<VmObject>) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.iter_mut().find(|e| e.start <= vaddr && vaddr < e.end) {
            e.object = Some(object);
        }
    }

    pub fn set_eflags(&self, vaddr: u64, eflags: u32) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.iter_mut().find(|e| e.start <= vaddr && vaddr < e.end) {
            e.eflags = eflags;
        }
    }

    /// Store bytes at `vaddr`, faulting pages into the entry's top object
    /// as needed (copying from the backing chain on first touch).
    pub fn write(&self, vaddr: u64, data: &[u8]) -> Result<()> {
        let mut addr = vaddr;
        let mut remaining = data;
        while !remaining.is_empty() {
            let entry = self
                .lookup(addr)
                .ok_or_else(|| SlsError::invalid(format!("no mapping at {addr:#x}")))?;
            if entry.protection & PROT_WRITE == 0 {
                return Err(SlsError::invalid(format!("mapping at {addr:#x} is read-only")));
            }
            let obj = entry
                .object
                .clone()
                .ok_or_else(|| SlsError::invalid("write to guard entry"))?;

            let pindex = entry.pindex_of(addr);
            let poff = (addr - entry.start + entry.offset) as usize % PAGE_SIZE;
            let take = remaining.len().min(PAGE_SIZE - poff).min((entry.end - addr) as usize);

            // Fault: populate the top object before mutating.
            let mut page = match obj.page_lookup(pindex) {
                Some(p) => p,
                None => obj.chain_read(pindex),
            };
            page[poff..poff + take].copy_from_slice(&remaining[..take]);
            obj.page_insert(pindex, &page);

            addr += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    /// Read bytes at `vaddr` through the backing chains.
    pub fn read(&self, vaddr: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut addr = vaddr;
        while out.len() < len {
            let entry = self
                .lookup(addr)
                .ok_or_else(|| SlsError::invalid(format!("no mapping at {addr:#x}")))?;
            let obj = entry
                .object
                .clone()
                .ok_or_else(|| SlsError::invalid("read from guard entry"))?;
            let pindex = entry.pindex_of(addr);
            let poff = (addr - entry.start + entry.offset) as usize % PAGE_SIZE;
            let take = (len - out.len()).min(PAGE_SIZE - poff).min((entry.end - addr) as usize);
            let page = obj.chain_read(pindex);
            out.extend_from_slice(&page[poff..poff + take]);
            addr += take as u64;
        }
        Ok(out)
    }

    /// Release every entry's object reference. Called when a space is
    /// replaced during restore or its process exits.
    pub fn release(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for e in entries {
            if let Some(obj) = e.object {
                obj.deallocate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_inherits_nothing_but_reads_through() {
        let parent = VmObject::alloc(ObjKind::Default, 4);
        parent.page_insert(0, b"parent page");
        let child = parent.shadow();
        assert_eq!(child.resident_count(), 0);
        assert_eq!(&child.chain_read(0)[..11], b"parent page");
        assert_eq!(parent.shadow_count(), 1);
    }

    #[test]
    fn deallocate_releases_chain_stake() {
        let parent = VmObject::alloc(ObjKind::Default, 1);
        let child = parent.shadow();
        assert_eq!(parent.refs(), 1);
        assert_eq!(parent.shadow_count(), 1);
        child.deallocate();
        assert_eq!(parent.shadow_count(), 0);
        assert_eq!(parent.refs(), 0);
    }

    #[test]
    fn write_faults_into_top_object() {
        let space = VmSpace::new();
        let obj = space.mmap_anon(0x10000, 4 * PAGE_SIZE as u64, PROT_READ | PROT_WRITE).unwrap();
        space.write(0x10000, b"Aurora").unwrap();

        let shadow = obj.shadow();
        space.replace_object(0x10000, shadow.clone());

        // Mutation lands in the shadow; the original page stays frozen.
        space.write(0x10000, b"Borealis").unwrap();
        assert_eq!(&obj.chain_read(0)[..6], b"Aurora");
        assert_eq!(&shadow.chain_read(0)[..8], b"Borealis");
        assert_eq!(space.read(0x10000, 8).unwrap(), b"Borealis");
    }

    #[test]
    fn unshadowed_pages_read_through() {
        let space = VmSpace::new();
        let obj = space.mmap_anon(0x10000, 2 * PAGE_SIZE as u64, PROT_READ | PROT_WRITE).unwrap();
        space.write(0x10000 + PAGE_SIZE as u64, b"second").unwrap();
        let shadow = obj.shadow();
        space.replace_object(0x10000, shadow);
        assert_eq!(space.read(0x10000 + PAGE_SIZE as u64, 6).unwrap(), b"second");
    }
}
