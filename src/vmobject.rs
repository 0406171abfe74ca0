//! VM-object records: capture and two-pass reconstruction.
//!
//! A captured object records its size, type, the nearest ancestor outside
//! the SLS (shadow chains inherit the unique ID, so that is the first
//! backer whose ID differs), and the vnode for file-backed mappings.
//! Restore first creates or finds every object, then links the recorded
//! backer relationships in a second pass, once all ends exist.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SlsError};
use crate::host::vm::{ObjKind, VmObject};
use crate::kv::SlsTable;
use crate::partition::{CkptData, Target};
use crate::record::{Record, RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;

/// Parsed form of a VM-object record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmObjInfo {
    pub slsid: SlsId,
    pub size: u64,
    pub kind: ObjKind,
    pub backer: SlsId,
    pub backer_off: u64,
    pub vnode: SlsId,
}

impl VmObjInfo {
    pub fn decode(rec: &Record) -> Result<Self> {
        let mut r = rec.reader()?;
        Self::decode_body(&mut r)
    }

    pub fn decode_body(r: &mut RecReader<'_>) -> Result<Self> {
        let slsid = r.get_u64()?;
        let size = r.get_u64()?;
        let kind = ObjKind::from_tag(r.get_u16()?)
            .ok_or_else(|| SlsError::protocol("unknown vm object kind"))?;
        let backer = r.get_u64()?;
        let backer_off = r.get_u64()?;
        let vnode = r.get_u64()?;
        Ok(Self {
            slsid,
            size,
            kind,
            backer,
            backer_off,
            vnode,
        })
    }

    pub fn encode(&self) -> RecWriter {
        let mut w = RecWriter::new(RecordType::VmObject);
        w.put_u64(self.slsid);
        w.put_u64(self.size);
        w.put_u16(self.kind.tag());
        w.put_u64(self.backer);
        w.put_u64(self.backer_off);
        w.put_u64(self.vnode);
        w
    }
}

/// Capture the metadata of one object. Idempotent per object ID.
pub fn vmobj_checkpoint(obj: &Arc<VmObject>, sckpt: &CkptData) -> Result<()> {
    let objid = obj.objid();
    if sckpt.has_record(objid) {
        return Ok(());
    }
    // In-memory checkpoints keep anonymous objects live; only the record
    // table for non-anonymous ones is needed.
    if sckpt.attr.target == Target::Memory && obj.is_anonymous() {
        return Ok(());
    }

    // Walk past same-ID shadows to the first ancestor that is not ours.
    let mut cur = obj.clone();
    let mut backer = obj.backing();
    while let Some(b) = backer.clone() {
        if b.objid() == cur.objid() {
            cur = b.clone();
            backer = b.backing();
        } else {
            break;
        }
    }

    let mut info = VmObjInfo {
        slsid: objid,
        size: obj.size_pages(),
        kind: obj.kind(),
        backer: backer.as_ref().map_or(0, |b| b.objid()),
        backer_off: backer.as_ref().map_or(0, |_| obj.backing_offset()),
        vnode: 0,
    };
    debug_assert!(
        info.kind != ObjKind::Device || info.backer == 0,
        "device object has a backer"
    );

    if obj.kind() == ObjKind::Vnode {
        let vp = obj
            .vnode()
            .ok_or_else(|| SlsError::invalid("vnode-backed object without a vnode"))?;
        sckpt.vnode_hold(&vp);
        info.vnode = vp.addr;
    }

    debug!(objid, kind = ?info.kind, backer = info.backer, "object record");
    sckpt.add_record(info.encode().seal(objid, RecordType::VmObject))?;
    if obj.is_anonymous() {
        sckpt.data_objs.add(objid, obj.clone())?;
    }
    Ok(())
}

/// Capture and shadow an object backing a POSIX or SysV segment. The
/// caller's slot ends up pointing at the shadow, like a map entry would.
pub fn vmobj_checkpoint_shm(slot: &mut Arc<VmObject>, sckpt: &CkptData) -> Result<()> {
    let obj = slot.clone();
    if let Some(found) = sckpt.shadow_table.find(obj.addr) {
        let shadow = found
            .shadow
            .ok_or_else(|| SlsError::invalid("shared object in SLS without a shadow"))?;
        shadow.clear_one_mapping();
        crate::vm::reftransfer(&obj, &shadow);
        *slot = shadow;
        return Ok(());
    }

    vmobj_checkpoint(&obj, sckpt)?;
    crate::vm::object_shadow(sckpt, slot)?;
    Ok(())
}

/// Rebuild every object referenced by the record table.
pub fn vmobj_restore_all(
    rectable: &SlsTable<Arc<Record>>,
    restdata: &RestoreData,
) -> Result<()> {
    // First pass: create or find all objects.
    for (slsid, rec) in rectable.entries() {
        if rec.rtype() != RecordType::VmObject {
            continue;
        }
        let info = VmObjInfo::decode(&rec)?;
        debug_assert_eq!(info.slsid, slsid);
        restore_one(&info, restdata)?;
    }

    // Second pass: link objects to their recorded backers.
    for (_, rec) in rectable.entries() {
        if rec.rtype() != RecordType::VmObject {
            continue;
        }
        let info = VmObjInfo::decode(&rec)?;
        if info.backer == 0 {
            continue;
        }
        let object = restdata
            .objtable
            .find(info.slsid)
            .flatten()
            .ok_or_else(|| SlsError::invalid(format!("object {:#x} not restored", info.slsid)))?;
        let parent = restdata
            .objtable
            .find(info.backer)
            .flatten()
            .ok_or_else(|| SlsError::invalid(format!("backer {:#x} not restored", info.backer)))?;
        parent.reference();
        object.force_shadow(&parent, info.backer_off);
    }

    Ok(())
}

fn restore_one(info: &VmObjInfo, restdata: &RestoreData) -> Result<()> {
    match info.kind {
        ObjKind::Default | ObjKind::Swap => {
            // Anonymous objects come from the backend read (pages and
            // all) or from the resident checkpoint's shadows; nothing to
            // create if one is already in place.
            if restdata.objtable.contains(info.slsid) {
                return Ok(());
            }
            let obj = VmObject::alloc(info.kind, info.size);
            obj.set_objid(info.slsid);
            restdata.objtable.add(info.slsid, Some(obj))?;
            Ok(())
        }
        ObjKind::Vnode => {
            let vp = restdata.vntable.find(info.vnode).ok_or_else(|| {
                SlsError::invalid(format!("vnode {:#x} for mapping not restored", info.vnode))
            })?;
            let obj = VmObject::alloc_vnode(info.size, &vp);
            obj.set_objid(info.slsid);
            restdata.objtable.add(info.slsid, Some(obj))?;
            Ok(())
        }
        // Device mappings are never shadowed and carry no pages.
        ObjKind::Device => restdata.objtable.add(info.slsid, None),
        ObjKind::Phys => {
            let obj = VmObject::alloc(ObjKind::Phys, info.size);
            obj.set_objid(info.slsid);
            restdata.objtable.add(info.slsid, Some(obj))
        }
    }
}
