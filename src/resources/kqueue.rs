//! Kqueue capture and restoration.
//!
//! A kqueue record is a header plus one flat sub-record per knote that is
//! not in flux. Restore runs in two phases: the kqueue itself comes back
//! with the files, but its knotes wait until the whole descriptor table
//! exists, since each one targets an fd. Registration goes in disabled
//! (`EV_ADD | EV_DISABLE`), the saved flag/data words are patched in
//! directly, and knotes that were on the active list are requeued by hand
//! so no wakeup fires. Knotes watching connected sockets that could not
//! come back get a synthetic EOF.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, SlsError};
use crate::host::file::{File, FileBacking};
use crate::host::kqueue::{
    ECONNRESET_DATA, EV_ADD, EV_DISABLE, EV_ERROR, KN_ACTIVE, KN_DETACHED, KN_MARKER, KN_QUEUED,
    Kqueue,
};
use crate::host::process::Process;
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;

use super::{FileInfo, SlsFileOps};

/// Saved state of one knote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnoteInfo {
    pub slsid: SlsId,
    pub ident: u64,
    pub filter: i16,
    pub flags: u16,
    pub fflags: u32,
    pub data: i64,
    pub status: u32,
    pub sfflags: u32,
    pub sdata: i64,
}

pub(crate) struct KqueueOps;

fn kq_of(file: &File) -> Result<Arc<Kqueue>> {
    match &file.backing {
        FileBacking::Kqueue(kq) => Ok(kq.clone()),
        _ => Err(SlsError::invalid("kqueue descriptor without a kqueue")),
    }
}

impl SlsFileOps for KqueueOps {
    fn supported(&self, _file: &File) -> bool {
        true
    }

    fn slsid(&self, file: &File) -> SlsId {
        file.addr
    }

    fn checkpoint(
        &self,
        _p: &Arc<Process>,
        file: &Arc<File>,
        info: &mut FileInfo,
        w: &mut RecWriter,
        _sckpt: &CkptData,
    ) -> Result<()> {
        let kq = kq_of(file)?;
        info.backer = kq.addr;

        w.put_u32(RecordType::Kqueue.magic());
        w.put_u64(kq.addr);

        let knotes = kq.knotes();
        let mut kept = Vec::new();
        for kn in &knotes {
            // In-flux knotes are mid-transition and cannot be captured.
            if kn.influx {
                return Err(SlsError::busy(format!(
                    "knote ({:#x}, {}) in flux",
                    kn.ident, kn.filter
                )));
            }
            if kn.status & (KN_MARKER | KN_DETACHED) != 0 {
                continue;
            }
            kept.push(kn);
        }

        w.put_u64(kept.len() as u64);
        for kn in kept {
            w.put_u32(RecordType::Knote.magic());
            w.put_u64(kn.addr);
            w.put_u64(kn.ident);
            w.put_u16(kn.filter as u16);
            w.put_u16(kn.flags);
            w.put_u32(kn.fflags);
            w.put_i64(kn.data);
            w.put_u32(kn.status);
            w.put_u32(kn.sfflags);
            w.put_i64(kn.sdata);
        }
        Ok(())
    }

    fn restore(
        &self,
        info: &FileInfo,
        r: &mut RecReader<'_>,
        restdata: &RestoreData,
    ) -> Result<Option<Arc<File>>> {
        r.expect_magic(RecordType::Kqueue)?;
        let kq_id = r.get_u64()?;
        let nknotes = r.get_u64()?;

        let mut knotes = Vec::with_capacity(nknotes as usize);
        for _ in 0..nknotes {
            r.expect_magic(RecordType::Knote)?;
            knotes.push(KnoteInfo {
                slsid: r.get_u64()?,
                ident: r.get_u64()?,
                filter: r.get_u16()? as i16,
                flags: r.get_u16()?,
                fflags: r.get_u32()?,
                data: r.get_i64()?,
                status: r.get_u32()?,
                sfflags: r.get_u32()?,
                sdata: r.get_i64()?,
            });
        }

        // The kqueue is created outside any file table; installation into
        // the right one fixes the back-pointer. The knotes wait in the
        // side table until every fd of the owning process exists.
        debug_assert_eq!(kq_id, info.backer);
        let kq = Kqueue::new();
        kq.detach();
        restdata.kevtable.add(kq.addr, Arc::new(knotes))?;

        Ok(Some(File::new(FileBacking::Kqueue(kq), info.flags)))
    }
}

/// Phase two: re-register the saved knotes of every kqueue descriptor of
/// `p`, now that the whole table is in place.
pub fn knotes_restore_all(p: &Arc<Process>, restdata: &RestoreData) -> Result<()> {
    let entries = p.fdtable.lock().entries();
    for (fd, file) in &entries {
        let FileBacking::Kqueue(kq) = &file.backing else {
            continue;
        };
        // Every kqueue has a set, even an empty one.
        let knotes = restdata
            .kevtable
            .find(kq.addr)
            .ok_or_else(|| SlsError::invalid(format!("kqueue at fd {fd} has no saved knotes")))?;
        restore_knotes(kq, &knotes);
    }

    // Synthetic EOF for watchers of connected sockets that did not come
    // back: placeholders are inet streams that are neither listening nor
    // connected after restore. Enqueue an error knote carrying ECONNRESET.
    use crate::host::socket::{SockFamily, SockType};
    for (fd, file) in &entries {
        let FileBacking::Socket(so) = &file.backing else {
            continue;
        };
        let dead = so.family == SockFamily::Inet
            && so.stype == SockType::Stream
            && !so.is_listening()
            && !so.is_connected_inet();
        if !dead {
            continue;
        }
        for (_, kq_file) in &entries {
            if let FileBacking::Kqueue(kq) = &kq_file.backing {
                for kn in kq.knotes_for(*fd as u64) {
                    kq.patch(kn.ident, kn.filter, |kn| {
                        kn.flags |= EV_ERROR;
                        kn.data = ECONNRESET_DATA;
                        kn.status |= KN_ACTIVE | KN_QUEUED;
                    });
                    debug!(fd, "knote marked EOF for dead connection");
                }
            }
        }
    }
    Ok(())
}

fn restore_knotes(kq: &Arc<Kqueue>, knotes: &[KnoteInfo]) {
    for kn in knotes {
        // Insert disabled so nothing triggers mid-restore; the saved
        // action flags come back in the direct patch below.
        kq.register(kn.ident, kn.filter, EV_ADD | EV_DISABLE, kn.sfflags, kn.sdata);

        let patched = kq.patch(kn.ident, kn.filter, |live| {
            live.status = kn.status;
            live.flags = kn.flags;
            live.fflags = kn.fflags;
            live.data = kn.data;
            live.sfflags = kn.sfflags;
            live.sdata = kn.sdata;
        });
        if !patched {
            // Some identifiers (sockets that were not revived) have no
            // knote to patch; best effort, like the original.
            warn!(ident = kn.ident, filter = kn.filter, "missing knote after registration");
            continue;
        }

        if kn.status & KN_QUEUED != 0 {
            kq.enqueue(kn.ident, kn.filter);
        }
    }
}
