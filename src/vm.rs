//! Copy-on-write memory capture.
//!
//! One pass takes a reference on every anonymous object directly mapped by
//! the captured processes and slides a shadow between the object and the
//! map entry. The entry's reference to the original is transferred to the
//! shadow, and the capture keeps its own stake, so with `O` the original,
//! `S` the shadow and `E` the entry we go from
//!
//! ```text
//! [O (1)] - E          to          [O (2)] - [S (1)] - E
//!                                     |
//!                                    SLS
//! ```
//!
//! Collapsing a pass removes the capture's stake; the delta variant lives
//! in [`crate::partition::CkptData::collapse`].
//!
//! Write protection must come before the entry is redirected: a page still
//! visible through the shadow chain must not be dirtied once the pass has
//! decided to dump it. In the model the processes are held at the boundary
//! for the whole shadow phase, which is what freezes their stores; the
//! pmap flip itself has no separate effect here.

use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::host::process::Process;
use crate::host::vm::{MAP_ENTRY_COW, MAP_ENTRY_NEEDS_COPY, PROT_WRITE, VmEntry, VmObject};
use crate::kv::SlsTable;
use crate::partition::{CkptData, ShadowEntry};

/// Transfer a map reference between objects.
pub fn reftransfer(src: &Arc<VmObject>, dst: &Arc<VmObject>) {
    dst.reference();
    src.deallocate();
}

/// Write-protect (or unmap) the pages of a shadowed entry.
///
/// The captured process is stopped at the boundary, so there is no store
/// to race with; the assert is the invariant the kernel's pmap flip
/// enforces for us.
fn entry_protect(p: &Process, entry: &VmEntry) {
    debug_assert!(
        p.is_stopped(),
        "shadowing an entry of a running process"
    );
    let _ = entry;
}

/// Shadow `slot`'s object, keeping the original for the capture.
///
/// Takes the capture's reference on the original, creates an exactly
/// aligned shadow that inherits the original's unique ID, marks the
/// original as in-SLS, and records the pair.
pub fn object_shadow(sckpt: &CkptData, slot: &mut Arc<VmObject>) -> Result<()> {
    let obj = slot.clone();
    obj.reference();

    let shadow = obj.shadow();
    shadow.set_objid(obj.objid());
    obj.set_in_sls(true);
    debug_assert!(!shadow.in_sls(), "shadow entered the SLS");

    trace!(obj = obj.addr, shadow = shadow.addr, "shadow pair");
    if let Err(e) = sckpt.shadow_table.add(
        obj.addr,
        ShadowEntry {
            obj: obj.clone(),
            shadow: Some(shadow.clone()),
        },
    ) {
        shadow.deallocate();
        return Err(e);
    }

    *slot = shadow;
    Ok(())
}

/// Apply the shadowing discipline to one map entry.
pub fn entry_shadow(
    p: &Arc<Process>,
    sckpt: &CkptData,
    entry: &VmEntry,
    is_fullckpt: bool,
) -> Result<()> {
    let Some(obj) = entry.object.clone() else {
        return Ok(());
    };
    // Non-anonymous objects are captured by reference only.
    if !obj.is_anonymous() {
        return Ok(());
    }

    let space = p.vmspace();

    if let Some(found) = sckpt.shadow_table.find(obj.addr) {
        debug_assert!(obj.in_sls(), "object in table is not in the SLS");
        match found.shadow {
            None => {
                // An ancestor already recorded for this pass is mapped
                // directly. That is only safe if nothing can write to it
                // through this entry: either the mapping is read-only,
                // the entry is already CoW, or the object has no shadows.
                debug_assert!(
                    obj.shadow_count() == 0
                        || entry.protection & PROT_WRITE == 0
                        || entry.eflags & (MAP_ENTRY_COW | MAP_ENTRY_NEEDS_COPY) != 0,
                    "directly accessible writable object {:#x} has {} shadows",
                    obj.addr,
                    obj.shadow_count()
                );
                Ok(())
            }
            Some(shadow) => {
                // Already shadowed through another entry (or a fork peer):
                // protect, redirect, and move the entry's reference over.
                entry_protect(p, entry);
                space.replace_object(entry.start, shadow.clone());
                shadow.clear_one_mapping();
                reftransfer(&obj, &shadow);
                Ok(())
            }
        }
    } else {
        entry_protect(p, entry);
        let mut slot = obj.clone();
        object_shadow(sckpt, &mut slot)?;
        space.replace_object(entry.start, slot);

        // Walk the backing chain toward the leaves, holding every
        // anonymous ancestor this pass has not seen yet (all of them for
        // a full pass). These entries have no shadows of their own.
        let mut cur = obj.backing();
        while let Some(anc) = cur {
            if !anc.is_anonymous() {
                break;
            }
            if !is_fullckpt && anc.in_sls() {
                break;
            }
            anc.reference();
            anc.set_in_sls(true);
            trace!(obj = anc.addr, "ancestor hold");
            if sckpt
                .shadow_table
                .add(
                    anc.addr,
                    ShadowEntry {
                        obj: anc.clone(),
                        shadow: None,
                    },
                )
                .is_err()
            {
                // Already recorded through another chain.
                anc.deallocate();
                break;
            }
            cur = anc.backing();
        }
        Ok(())
    }
}

/// Shadow every writable anonymous mapping of one process.
fn proc_shadow(p: &Arc<Process>, sckpt: &CkptData, is_fullckpt: bool) -> Result<()> {
    for entry in p.vmspace().entries() {
        entry_shadow(p, sckpt, &entry, is_fullckpt)?;
    }
    Ok(())
}

/// Shadow the address spaces of every process in the working set.
pub fn procset_shadow(
    procset: &[Arc<Process>],
    sckpt: &CkptData,
    is_fullckpt: bool,
) -> Result<()> {
    for p in procset {
        proc_shadow(p, sckpt, is_fullckpt)?;
    }
    Ok(())
}

/// Merge a freshly captured shadow table into the resident one.
///
/// Each new pair either replaces the entry of an ancestor that is already
/// present (the ancestor's key now maps to the newest shadow and the
/// middle object loses its reference) or is appended as-is.
pub fn objtable_collapse_new(
    objtable: &SlsTable<ShadowEntry>,
    newtable: &SlsTable<ShadowEntry>,
) {
    while let Some((_, entry)) = newtable.pop() {
        let ShadowEntry { obj, shadow } = entry;

        let mut ancestor = obj.backing();
        let mut fixed = false;
        while let Some(anc) = ancestor {
            if let Some(old) = objtable.take(anc.addr) {
                debug_assert!(shadow.is_some(), "found shadow with no children");
                let rekeyed = ShadowEntry {
                    obj: old.obj,
                    shadow: shadow.clone(),
                };
                let added = objtable.add(anc.addr, rekeyed).is_ok();
                debug_assert!(added, "reinserting parent into table failed");
                obj.deallocate();
                fixed = true;
                break;
            }
            ancestor = anc.backing();
        }
        if fixed {
            continue;
        }

        // Not reachable from anything resident: move the pair (and its
        // reference) over wholesale.
        if objtable
            .add(obj.addr, ShadowEntry { obj: obj.clone(), shadow })
            .is_err()
        {
            obj.deallocate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::host::vm::{PAGE_SIZE, PROT_READ};
    use crate::partition::{Mode, SlsAttr, Target};

    fn sckpt() -> Arc<CkptData> {
        CkptData::new(SlsAttr::new(Target::Memory, Mode::Full))
    }

    #[tokio::test]
    async fn entry_shadow_freezes_the_original() {
        let host = Host::new();
        let p = host.spawn("worker").unwrap();
        let space = p.vmspace();
        let obj = space
            .mmap_anon(0x1000_0000, 4 * PAGE_SIZE as u64, PROT_READ | PROT_WRITE)
            .unwrap();
        p.write_mem(0x1000_0000, b"Aurora").unwrap();

        let data = sckpt();
        p.boundary_stop();
        let entry = space.lookup(0x1000_0000).unwrap();
        entry_shadow(&p, &data, &entry, false).unwrap();
        p.boundary_end();

        // The entry now points at the shadow; the original keeps the
        // frozen bytes while new stores land in the shadow.
        let mapped = space.lookup(0x1000_0000).unwrap().object.unwrap();
        assert_ne!(mapped.addr, obj.addr);
        assert_eq!(mapped.objid(), obj.objid());
        assert!(obj.in_sls());
        p.write_mem(0x1000_0000, b"mutated").unwrap();
        assert_eq!(&obj.chain_read(0)[..6], b"Aurora");
        assert_eq!(p.read_mem(0x1000_0000, 7).unwrap(), b"mutated");

        // Original refs: capture stake + shadow's backing link.
        assert_eq!(obj.refs(), 2);
        data.collapse(None);
        assert_eq!(obj.refs(), 1);
    }

    #[tokio::test]
    async fn second_pass_reuses_recorded_ancestors() {
        let host = Host::new();
        let p = host.spawn("worker").unwrap();
        let space = p.vmspace();
        space
            .mmap_anon(0x1000_0000, PAGE_SIZE as u64, PROT_READ | PROT_WRITE)
            .unwrap();
        p.write_mem(0x1000_0000, b"one").unwrap();

        let first = sckpt();
        p.boundary_stop();
        procset_shadow(&[p.clone()], &first, false).unwrap();
        p.boundary_end();

        // No mutation in between: the second pass shadows the first
        // pass's shadow and finds the old original already in the SLS.
        let second = sckpt();
        p.boundary_stop();
        procset_shadow(&[p.clone()], &second, false).unwrap();
        p.boundary_end();

        assert_eq!(first.shadow_table.len(), 1);
        assert_eq!(second.shadow_table.len(), 1);

        // Delta collapse telescopes the chain.
        first.collapse(Some(&second));
        assert_eq!(second.shadow_table.len(), 1);
        let survivor = second.shadow_table.entries().pop().unwrap().1;
        assert!(survivor.shadow.is_some());
    }
}
