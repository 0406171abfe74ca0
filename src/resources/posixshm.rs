//! POSIX shared memory capture and restoration.
//!
//! The segment metadata is tiny, so multiple descriptors over the same
//! segment can each carry it; only the first restore creates anything.
//! Restore tries create-exclusive first and swaps the restored object in;
//! losing the race to another process in the partition means the segment
//! exists with the right pages already, so the existing one is opened.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SlsError};
use crate::host::file::{File, FileBacking};
use crate::host::process::Process;
use crate::host::shm::PosixShm;
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;
use crate::vmobject;

use super::{FileInfo, SlsFileOps};

pub(crate) struct PosixShmOps;

fn shm_of(file: &File) -> Result<Arc<PosixShm>> {
    match &file.backing {
        FileBacking::Shm(shm) => Ok(shm.clone()),
        _ => Err(SlsError::invalid("shm descriptor without a segment")),
    }
}

impl SlsFileOps for PosixShmOps {
    fn supported(&self, _file: &File) -> bool {
        true
    }

    fn slsid(&self, file: &File) -> SlsId {
        shm_of(file).map(|shm| shm.addr).unwrap_or(0)
    }

    fn checkpoint(
        &self,
        _p: &Arc<Process>,
        file: &Arc<File>,
        info: &mut FileInfo,
        w: &mut RecWriter,
        sckpt: &CkptData,
    ) -> Result<()> {
        let shm = shm_of(file)?;
        info.backer = shm.addr;

        // Shadow the backing object like any anonymous memory. The
        // segment's reference rides along into the shadow, so the slot is
        // replaced without touching counts.
        let mut obj = shm.object();
        let objid = obj.objid();
        vmobject::vmobj_checkpoint_shm(&mut obj, sckpt)?;
        shm.set_object_raw(obj);
        w.put_u32(RecordType::PosixShm.magic());
        w.put_u64(shm.addr);
        w.put_u16(shm.mode);
        w.put_opt_str(shm.path.as_deref());
        w.put_u64(objid);
        Ok(())
    }

    fn restore(
        &self,
        info: &FileInfo,
        r: &mut RecReader<'_>,
        restdata: &RestoreData,
    ) -> Result<Option<Arc<File>>> {
        r.expect_magic(RecordType::PosixShm)?;
        let slsid = r.get_u64()?;
        let mode = r.get_u16()?;
        let path = r.get_opt_str()?;
        let objid = r.get_u64()?;
        debug_assert_eq!(slsid, info.slsid);

        let obj = restdata
            .objtable
            .find(objid)
            .flatten()
            .ok_or_else(|| SlsError::invalid("shm backing object not restored"))?;

        let shm = match restdata
            .host
            .posix_shm
            .create_excl(path.as_deref(), mode, obj.size_pages())
        {
            Ok(shm) => {
                // Fresh segment: point it at the restored pages.
                shm.swap_object(obj);
                shm
            }
            Err(_) => {
                let path = path.as_deref().ok_or_else(|| {
                    SlsError::invalid("anonymous shm segment collided")
                })?;
                debug!(path, "shm segment already restored by a peer");
                restdata.host.posix_shm.open(path)?
            }
        };

        Ok(Some(File::new(FileBacking::Shm(shm), info.flags)))
    }
}
