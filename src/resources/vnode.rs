//! Vnode-backed descriptors and vnode records.
//!
//! Regular files, FIFOs, and directories are captured by full path when
//! the VFS still knows one, or by backing-store inode number when they
//! are anchored in the partition's own store. Device vnodes pass only if
//! they are on the allow-list. Slave ptys come through here too, but are
//! recorded as pty cross-references since pts device names are
//! interchangeable across boots.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SlsError};
use crate::host::file::{File, FileBacking, FileKind};
use crate::host::fs::{Vnode, VnodeKind};
use crate::host::process::Process;
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, Record, RecordType, SlsId};
use crate::rest::RestoreData;

use super::{FileInfo, SlsFileOps};

pub(crate) struct VnodeOps;

impl SlsFileOps for VnodeOps {
    fn supported(&self, file: &File) -> bool {
        let Some(vp) = file.vnode() else {
            return false;
        };
        match vp.kind {
            VnodeKind::Fifo => true,
            // Slave pty descriptors are handled through the pts records.
            VnodeKind::CharDev => vp.is_tty() || vp.accepted_device(),
            VnodeKind::Regular => true,
            VnodeKind::Directory => true,
            VnodeKind::Socket => false,
        }
    }

    fn slsid(&self, file: &File) -> SlsId {
        // Ttys are keyed by the slave device so the master side can find
        // the same record; more than one file may reference a vnode, so
        // regular files are keyed by the open file itself.
        match file.vnode() {
            Some(vp) if vp.is_tty() => vp.addr,
            _ => file.addr,
        }
    }

    fn checkpoint(
        &self,
        _p: &Arc<Process>,
        file: &Arc<File>,
        info: &mut FileInfo,
        w: &mut RecWriter,
        sckpt: &CkptData,
    ) -> Result<()> {
        let vp = file
            .vnode()
            .ok_or_else(|| SlsError::invalid("vnode descriptor without a vnode"))?;

        if vp.ckpt_by_name() {
            sckpt.vnode_hold(&vp);
            info.backer = vp.addr;
            return Ok(());
        }

        if !vp.is_tty() {
            return Err(SlsError::Unsupported { kind: "device vnode" });
        }

        // The slave side of a pty: record the cross-reference; all real
        // state lives in the master's record.
        info.kind = FileKind::Pts;
        super::pts::pts_slave_checkpoint(&vp, w)
    }

    fn restore(
        &self,
        info: &FileInfo,
        _r: &mut RecReader<'_>,
        restdata: &RestoreData,
    ) -> Result<Option<Arc<File>>> {
        let Some(vp) = restdata.vntable.find(info.backer) else {
            if restdata.ignore_unlinked {
                debug!(backer = info.backer, "dropping descriptor of unlinked file");
                return Ok(None);
            }
            return Err(SlsError::gone(format!(
                "vnode {:#x} was not restored",
                info.backer
            )));
        };
        Ok(Some(File::new(FileBacking::Vnode(vp), info.flags)))
    }
}

/// Serialize every vnode this checkpoint holds into records. Done after
/// the processes resume: path lookups are not worth extending the stop
/// for.
pub fn vnode_serialize(sckpt: &CkptData) -> Result<()> {
    for (_, vp) in sckpt.vntable.entries() {
        if sckpt.has_record(vp.addr) {
            continue;
        }
        let rec = vnode_record(&vp, sckpt.attr.ignore_unlinked())?;
        sckpt.add_record(rec)?;
    }
    Ok(())
}

fn vnode_record(vp: &Arc<Vnode>, allow_unlinked: bool) -> Result<Arc<Record>> {
    let mut w = RecWriter::new(RecordType::Vnode);
    w.put_u64(vp.addr);
    w.put_u16(vp.kind.tag_for_record());

    if vp.store_backed {
        // Anchored in our own store: the inode number survives.
        w.put_bool(false);
        w.put_u64(vp.ino);
    } else {
        match vp.fullpath() {
            Some(path) => {
                w.put_bool(true);
                w.put_str(&path);
            }
            None if allow_unlinked => {
                w.put_bool(false);
                w.put_u64(0);
            }
            None => {
                return Err(SlsError::invalid(format!(
                    "vnode {:#x} is unlinked and not in the store",
                    vp.addr
                )));
            }
        }
    }
    Ok(w.seal(vp.addr, RecordType::Vnode))
}

/// Revive one vnode record into the restore-time vnode table.
pub fn vnode_record_restore(rec: &Arc<Record>, restdata: &RestoreData) -> Result<()> {
    // Cached restores hold the checkpoint-time vnodes directly; those
    // take precedence over record-driven lookups.
    if restdata.vntable.contains(rec.id()) {
        return Ok(());
    }
    let mut r = rec.reader()?;
    let slsid = r.get_u64()?;
    let kind_tag = r.get_u16()?;
    let has_path = r.get_bool()?;

    let vp = if has_path {
        let path = r.get_str()?;
        let kind = VnodeKind::from_record_tag(kind_tag)
            .ok_or_else(|| SlsError::protocol("unknown vnode kind"))?;
        restdata.host.vfs.lookup_or_create(&path, kind)?
    } else {
        let ino = r.get_u64()?;
        if ino == 0 {
            // Captured unlinked under ignore-unlinked: nothing to revive.
            debug!(slsid, "skipping unlinked vnode record");
            return Ok(());
        }
        restdata.host.vfs.vget(ino)?
    };

    vp.vref();
    restdata.vntable.add(slsid, vp)?;
    Ok(())
}

impl VnodeKind {
    fn tag_for_record(self) -> u16 {
        match self {
            VnodeKind::Regular => 0,
            VnodeKind::Directory => 1,
            VnodeKind::Fifo => 2,
            VnodeKind::CharDev => 3,
            VnodeKind::Socket => 4,
        }
    }

    fn from_record_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            0 => VnodeKind::Regular,
            1 => VnodeKind::Directory,
            2 => VnodeKind::Fifo,
            3 => VnodeKind::CharDev,
            4 => VnodeKind::Socket,
            _ => return None,
        })
    }
}
