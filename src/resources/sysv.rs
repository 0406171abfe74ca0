//! SysV shared-memory capture and restoration.
//!
//! The whole segment array is walked; every allocated segment lands in a
//! single record (key, size, permissions, sequence number, slot index,
//! backing object ID), and the objects are shadowed like any anonymous
//! memory. Restore requires the original slot indices to be free and
//! reinstalls each segment exactly where it was.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SlsError};
use crate::host::Host;
use crate::host::shm::{ACCESSPERMS, SHMSEG_ALLOCATED, SysvSegment};
use crate::partition::CkptData;
use crate::record::{RecWriter, Record, RecordType};
use crate::rest::RestoreData;
use crate::vmobject;

/// Capture every allocated SysV segment. No record is produced when the
/// array is empty.
pub fn sysv_checkpoint(host: &Host, sckpt: &CkptData) -> Result<()> {
    let allocated = host.sysv_shm.allocated();
    if allocated.is_empty() {
        return Ok(());
    }
    debug!(segments = allocated.len(), "capturing sysv shared memory");

    let mut w = RecWriter::new(RecordType::SysvShm);
    w.put_u64(allocated.len() as u64);
    for (slot, seg) in allocated {
        let mut obj = seg.object.clone();
        let objid = obj.objid();
        vmobject::vmobj_checkpoint_shm(&mut obj, sckpt)?;
        host.sysv_shm.replace_object(slot, obj);

        w.put_u32(RecordType::SysvShm.magic());
        w.put_u64(objid);
        w.put_u32(seg.key);
        w.put_u64(seg.segsz);
        w.put_u16(seg.mode);
        w.put_u16(seg.seq);
        w.put_u64(slot as u64);
    }

    sckpt.add_record(w.seal(host.sysv_shm.addr(), RecordType::SysvShm))?;
    Ok(())
}

/// Reinstall every segment of a SysV record at its original index.
pub fn sysv_restore(rec: &Arc<Record>, restdata: &RestoreData) -> Result<()> {
    let mut r = rec.reader()?;
    let count = r.get_u64()?;
    for _ in 0..count {
        r.expect_magic(RecordType::SysvShm)?;
        let objid = r.get_u64()?;
        let key = r.get_u32()?;
        let segsz = r.get_u64()?;
        let mode = r.get_u16()?;
        let seq = r.get_u16()?;
        let slot = r.get_u64()? as usize;

        let obj = restdata
            .objtable
            .find(objid)
            .flatten()
            .ok_or_else(|| SlsError::invalid("sysv segment object not restored"))?;
        obj.reference();

        restdata.host.sysv_shm.install(
            slot,
            SysvSegment {
                key,
                segsz,
                mode: (mode & ACCESSPERMS) | SHMSEG_ALLOCATED,
                seq,
                object: obj,
            },
        )?;
        debug!(slot, key, "restored sysv segment");
    }
    Ok(())
}
