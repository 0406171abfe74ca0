//! Address-space records: the vmspace header and its map entries.
//!
//! Capture walks the map in address order, checkpointing every object
//! reachable through each entry's backing chain as a side effect, then
//! appends one entry record per mapping. Restore builds a brand new space
//! and reconstructs each entry against the restore-time object table.

use std::sync::Arc;

use crate::error::{Result, SlsError};
use crate::host::process::Process;
use crate::host::vm::{ObjKind, PROT_WRITE, VmEntry, VmSpace, VmSpaceMeta};
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;
use crate::vmobject;

/// Parsed form of one map-entry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEntryInfo {
    pub slsid: SlsId,
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub eflags: u32,
    pub protection: u8,
    pub max_protection: u8,
    pub inheritance: u8,
    /// Object ID, 0 for guard entries.
    pub obj: SlsId,
    pub obj_kind: Option<ObjKind>,
    pub vnode: SlsId,
}

impl VmEntryInfo {
    fn encode(&self, w: &mut RecWriter) {
        w.put_u32(RecordType::VmEntry.magic());
        w.put_u64(self.slsid);
        w.put_u64(self.start);
        w.put_u64(self.end);
        w.put_u64(self.offset);
        w.put_u32(self.eflags);
        w.put_u16(self.protection as u16);
        w.put_u16(self.max_protection as u16);
        w.put_u16(self.inheritance as u16);
        w.put_u64(self.obj);
        w.put_u16(self.obj_kind.map_or(u16::MAX, ObjKind::tag));
        w.put_u64(self.vnode);
    }

    fn decode(r: &mut RecReader<'_>) -> Result<Self> {
        r.expect_magic(RecordType::VmEntry)?;
        let slsid = r.get_u64()?;
        let start = r.get_u64()?;
        let end = r.get_u64()?;
        let offset = r.get_u64()?;
        let eflags = r.get_u32()?;
        let protection = r.get_u16()? as u8;
        let max_protection = r.get_u16()? as u8;
        let inheritance = r.get_u16()? as u8;
        let obj = r.get_u64()?;
        let kind_tag = r.get_u16()?;
        let obj_kind = if kind_tag == u16::MAX {
            None
        } else {
            Some(
                ObjKind::from_tag(kind_tag)
                    .ok_or_else(|| SlsError::protocol("unknown entry object kind"))?,
            )
        };
        let vnode = r.get_u64()?;
        Ok(Self {
            slsid,
            start,
            end,
            offset,
            eflags,
            protection,
            max_protection,
            inheritance,
            obj,
            obj_kind,
            vnode,
        })
    }
}

/// Serialize the vmspace of `p` into `w` and checkpoint every reachable
/// object into `sckpt`.
pub fn vmspace_checkpoint(p: &Arc<Process>, w: &mut RecWriter, sckpt: &CkptData) -> Result<()> {
    let space = p.vmspace();
    let meta = *space.meta.lock();
    let entries = space.entries();

    w.put_u32(RecordType::VmSpace.magic());
    w.put_u64(meta.swrss);
    w.put_u64(meta.tsize);
    w.put_u64(meta.dsize);
    w.put_u64(meta.ssize);
    w.put_u64(meta.taddr);
    w.put_u64(meta.daddr);
    w.put_u64(meta.maxsaddr);
    w.put_u64(entries.len() as u64);

    // Objects first, ancestors included.
    for entry in &entries {
        let mut obj = entry.object.clone();
        while let Some(o) = obj {
            vmobject::vmobj_checkpoint(&o, sckpt)?;
            obj = o.backing();
        }
    }

    for entry in &entries {
        let info = match &entry.object {
            Some(obj) => VmEntryInfo {
                slsid: entry.start,
                start: entry.start,
                end: entry.end,
                offset: entry.offset,
                eflags: entry.eflags,
                protection: entry.protection,
                max_protection: entry.max_protection,
                inheritance: entry.inheritance,
                obj: obj.objid(),
                obj_kind: Some(obj.kind()),
                vnode: obj.vnode_addr(),
            },
            None => VmEntryInfo {
                slsid: entry.start,
                start: entry.start,
                end: entry.end,
                offset: entry.offset,
                eflags: entry.eflags,
                protection: entry.protection,
                max_protection: entry.max_protection,
                inheritance: entry.inheritance,
                obj: 0,
                obj_kind: None,
                vnode: 0,
            },
        };
        info.encode(w);
    }

    Ok(())
}

fn restore_entry(
    space: &VmSpace,
    info: &VmEntryInfo,
    restdata: &RestoreData,
) -> Result<()> {
    let object = match (info.obj, info.obj_kind) {
        (0, _) | (_, None) => None,
        // Device mappings come back as guard-like entries; the
        // allow-listed devices carry no mappable state.
        (_, Some(ObjKind::Device)) => None,
        (objid, Some(_)) => {
            let obj = restdata
                .objtable
                .find(objid)
                .flatten()
                .ok_or_else(|| SlsError::invalid(format!("entry object {objid:#x} missing")))?;
            obj.reference();

            // Precopy: pull every chain-resident page into the mapped
            // object so the process faults on nothing.
            if restdata.precopy
                && info.protection & PROT_WRITE != 0
                && obj.backing().is_some()
            {
                let mut anc = obj.backing();
                while let Some(a) = anc {
                    for pindex in a.resident_from(0) {
                        if obj.page_lookup(pindex).is_none() {
                            obj.page_insert(pindex, &obj.chain_read(pindex));
                        }
                    }
                    anc = a.backing();
                }
            }
            Some(obj)
        }
    };

    space.insert(VmEntry {
        start: info.start,
        end: info.end,
        offset: info.offset,
        eflags: info.eflags,
        protection: info.protection,
        max_protection: info.max_protection,
        inheritance: info.inheritance,
        object,
    })
}

/// Rebuild the address space of `p` from the record section at `r`.
pub fn vmspace_restore(p: &Arc<Process>, r: &mut RecReader<'_>, restdata: &RestoreData) -> Result<()> {
    r.expect_magic(RecordType::VmSpace)?;
    let meta = VmSpaceMeta {
        swrss: r.get_u64()?,
        tsize: r.get_u64()?,
        dsize: r.get_u64()?,
        ssize: r.get_u64()?,
        taddr: r.get_u64()?,
        daddr: r.get_u64()?,
        maxsaddr: r.get_u64()?,
    };
    let nentries = r.get_u64()?;

    let space = Arc::new(VmSpace::new());
    *space.meta.lock() = meta;

    for _ in 0..nentries {
        let info = VmEntryInfo::decode(r)?;
        restore_entry(&space, &info, restdata)?;
    }

    p.replace_vmspace(space);
    Ok(())
}
