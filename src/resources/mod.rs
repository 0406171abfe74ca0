//! Per-kind resource capture and restoration.
//!
//! Every descriptor kind plugs into a small dispatch table with four
//! hooks: `supported` filters what a checkpoint can carry, `slsid` picks
//! the identity under which the resource deduplicates (peers of a pipe or
//! pty deliberately cross-reference each other), `checkpoint` serializes
//! the backing state, and `restore` revives it against the restore-time
//! tables. Unsupported descriptors are skipped (and logged) at capture;
//! a kind the restore path does not recognize is fatal.

pub mod kqueue;
pub mod pipe;
pub mod posixshm;
pub mod pts;
pub mod socket;
pub mod sysv;
pub mod vnode;

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SlsError};
use crate::host::file::{File, FileBacking, FileKind};
use crate::host::process::Process;
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;

/// Generic open-file state common to every kind.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub slsid: SlsId,
    pub kind: FileKind,
    pub flags: u32,
    pub offset: u64,
    /// SLS-ID of the backing entity (vnode, kqueue, ...), kind-specific.
    pub backer: SlsId,
}

impl FileInfo {
    fn encode(&self, w: &mut RecWriter) {
        w.put_u64(self.slsid);
        w.put_u16(self.kind.tag());
        w.put_u32(self.flags);
        w.put_u64(self.offset);
        w.put_u64(self.backer);
    }

    fn decode(r: &mut RecReader<'_>) -> Result<Self> {
        let slsid = r.get_u64()?;
        let kind = FileKind::from_tag(r.get_u16()?)
            .ok_or_else(|| SlsError::Unsupported { kind: "unknown descriptor" })?;
        let flags = r.get_u32()?;
        let offset = r.get_u64()?;
        let backer = r.get_u64()?;
        Ok(Self {
            slsid,
            kind,
            flags,
            offset,
            backer,
        })
    }
}

/// The four hooks a descriptor kind implements.
pub(crate) trait SlsFileOps: Send + Sync {
    fn supported(&self, file: &File) -> bool;

    fn slsid(&self, file: &File) -> SlsId;

    fn checkpoint(
        &self,
        p: &Arc<Process>,
        file: &Arc<File>,
        info: &mut FileInfo,
        w: &mut RecWriter,
        sckpt: &CkptData,
    ) -> Result<()>;

    fn restore(
        &self,
        info: &FileInfo,
        r: &mut RecReader<'_>,
        restdata: &RestoreData,
    ) -> Result<Option<Arc<File>>>;
}

fn ops_for(kind: FileKind) -> &'static dyn SlsFileOps {
    match kind {
        FileKind::Vnode | FileKind::Fifo => &vnode::VnodeOps,
        FileKind::Pipe => &pipe::PipeOps,
        FileKind::Socket => &socket::SocketOps,
        FileKind::Kqueue => &kqueue::KqueueOps,
        FileKind::Pts => &pts::PtsOps,
        FileKind::Shm => &posixshm::PosixShmOps,
    }
}

/// Capture one open file, deduplicating by its SLS-ID. Returns the ID the
/// descriptor table should reference.
pub fn slsfile_checkpoint(
    p: &Arc<Process>,
    file: &Arc<File>,
    sckpt: &CkptData,
) -> Result<SlsId> {
    let ops = ops_for(file.kind());
    let slsid = ops.slsid(file);

    // Peers share records: if this ID is in, the caller just references
    // it.
    if sckpt.has_record(slsid) {
        return Ok(slsid);
    }

    let mut info = FileInfo {
        slsid,
        kind: file.kind(),
        flags: file.get_flags(),
        offset: file.get_offset(),
        backer: 0,
    };
    let mut payload = RecWriter::raw();
    ops.checkpoint(p, file, &mut info, &mut payload, sckpt)?;

    let mut w = RecWriter::new(RecordType::File);
    info.encode(&mut w);
    w.put_raw(&payload.into_inner());
    sckpt.add_record(w.seal(slsid, RecordType::File))?;
    Ok(slsid)
}

/// Revive one file record into the restore-time file table.
pub fn slsfile_restore(rec: &Arc<crate::record::Record>, restdata: &RestoreData) -> Result<()> {
    let mut r = rec.reader()?;
    let info = FileInfo::decode(&mut r)?;
    let ops = ops_for(info.kind);

    if let Some(fp) = ops.restore(&info, &mut r, restdata)? {
        fp.set_flags(info.flags);
        // No lseek needed: setting the offset on the fresh handle is
        // equivalent and cannot fail halfway.
        fp.set_offset(info.offset);
        restdata.fptable.add(info.slsid, fp)?;
    }
    Ok(())
}

/// Capture a process' descriptor table: directories, umask, then one
/// `(fd, SLS-ID)` pair per used and supported descriptor.
pub fn filedesc_checkpoint(p: &Arc<Process>, sckpt: &CkptData, w: &mut RecWriter) -> Result<()> {
    let (cdir, rdir, cmask, entries) = {
        let fdtable = p.fdtable.lock();
        (
            fdtable.cdir.clone(),
            fdtable.rdir.clone(),
            fdtable.cmask,
            fdtable.entries(),
        )
    };

    sckpt.vnode_hold(&cdir);
    sckpt.vnode_hold(&rdir);

    let mut pairs = Vec::new();
    for (fd, file) in entries {
        let ops = ops_for(file.kind());
        if !ops.supported(&file) {
            debug!(pid = p.pid, fd, kind = ?file.kind(), "skipping unsupported descriptor");
            continue;
        }
        let slsid = slsfile_checkpoint(p, &file, sckpt)?;
        pairs.push((fd, slsid));
    }

    w.put_u32(RecordType::FileDesc.magic());
    w.put_u64(cdir.addr);
    w.put_u64(rdir.addr);
    w.put_u16(cmask);
    w.put_u64(pairs.len() as u64);
    for (fd, slsid) in pairs {
        w.put_u32(fd);
        w.put_u64(slsid);
    }
    Ok(())
}

/// Rebuild a process' descriptor table, installing every file at its
/// exact original index.
pub fn filedesc_restore(
    p: &Arc<Process>,
    r: &mut RecReader<'_>,
    restdata: &RestoreData,
) -> Result<()> {
    r.expect_magic(RecordType::FileDesc)?;
    let cdir_id = r.get_u64()?;
    let rdir_id = r.get_u64()?;
    let cmask = r.get_u16()?;
    let npairs = r.get_u64()?;

    let cdir = restdata
        .vntable
        .find(cdir_id)
        .ok_or_else(|| SlsError::invalid("working directory not restored"))?;
    let rdir = restdata
        .vntable
        .find(rdir_id)
        .ok_or_else(|| SlsError::invalid("root directory not restored"))?;

    let mut fdtable = crate::host::file::FdTable::new(cdir, rdir);
    fdtable.cmask = cmask;

    for _ in 0..npairs {
        let fd = r.get_u32()?;
        let slsid = r.get_u64()?;
        let Some(fp) = restdata.fptable.find(slsid) else {
            if restdata.ignore_unlinked {
                debug!(fd, "descriptor lost to an unlinked file");
                continue;
            }
            return Err(SlsError::invalid(format!(
                "no restored file for fd {fd} (id {slsid:#x})"
            )));
        };
        fdtable.install_at(fd, fp.clone())?;

        // Kqueues carry a back-pointer to the table that owns them; fix
        // it at install time so knote registration targets this process.
        if let FileBacking::Kqueue(kq) = &fp.backing {
            kq.attach(p.pid);
        }
    }

    *p.fdtable.lock() = fdtable;
    Ok(())
}
