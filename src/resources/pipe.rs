//! Pipe capture and restoration.
//!
//! Each end is keyed by the kernel pipe identifier rather than the open
//! file, and carries its peer's identifier, its direction, and the
//! buffered bytes inline. Restoring whichever end shows up first creates
//! the whole pair and registers the peer; the other end's record then
//! finds itself already present and only refills its buffer.

use std::sync::Arc;

use crate::error::{Result, SlsError};
use crate::host::file::{File, FileBacking};
use crate::host::pipe::Pipe;
use crate::host::process::Process;
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;

use super::{FileInfo, SlsFileOps};

pub(crate) struct PipeOps;

fn pipe_of(file: &File) -> Result<Arc<Pipe>> {
    match &file.backing {
        FileBacking::Pipe(pipe) => Ok(pipe.clone()),
        _ => Err(SlsError::invalid("pipe descriptor without a pipe")),
    }
}

impl SlsFileOps for PipeOps {
    fn supported(&self, _file: &File) -> bool {
        true
    }

    fn slsid(&self, file: &File) -> SlsId {
        pipe_of(file).map(|p| p.addr).unwrap_or(0)
    }

    fn checkpoint(
        &self,
        _p: &Arc<Process>,
        file: &Arc<File>,
        info: &mut FileInfo,
        w: &mut RecWriter,
        _sckpt: &CkptData,
    ) -> Result<()> {
        let pipe = pipe_of(file)?;
        info.backer = pipe.addr;

        // The peer's identifier is recorded whether or not that end is
        // still open; if it is, its own record shows up separately.
        let peer = pipe
            .peer()
            .ok_or_else(|| SlsError::gone("pipe peer closed during capture"))?;

        let buf = pipe.buf.lock().clone();
        w.put_u32(RecordType::Pipe.magic());
        w.put_u64(pipe.addr);
        w.put_u64(peer.addr);
        w.put_bool(pipe.write_end);
        w.put_u32(buf.r#in);
        w.put_u32(buf.out);
        w.put_bytes(&buf.data);
        Ok(())
    }

    fn restore(
        &self,
        info: &FileInfo,
        r: &mut RecReader<'_>,
        restdata: &RestoreData,
    ) -> Result<Option<Arc<File>>> {
        r.expect_magic(RecordType::Pipe)?;
        let slsid = r.get_u64()?;
        let peer_id = r.get_u64()?;
        let write_end = r.get_bool()?;
        let r#in = r.get_u32()?;
        let out = r.get_u32()?;
        let data = r.get_bytes()?;
        debug_assert_eq!(slsid, info.slsid);

        // Restoring the first end brought this one back already: only the
        // buffered state of this end is ours to fill in.
        if let Some(existing) = restdata.fptable.find(slsid) {
            let pipe = pipe_of(&existing)?;
            pipe.restore_buf(data, r#in, out)?;
            return Ok(None);
        }

        let (rd, wr) = Pipe::pair();
        let (local, peer) = if write_end { (wr, rd) } else { (rd, wr) };
        local.restore_buf(data, r#in, out)?;

        let peer_fp = File::new(FileBacking::Pipe(peer), info.flags);
        restdata.fptable.add(peer_id, peer_fp)?;

        Ok(Some(File::new(FileBacking::Pipe(local), info.flags)))
    }
}
