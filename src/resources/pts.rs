//! Pseudo-terminal capture and restoration.
//!
//! Master and slave cross-reference each other: the master record holds
//! the tty state (termios, window size, flags, both queues inline) while
//! the slave record is only the back-pointer. Restoring either side first
//! allocates a fresh pty, reopens the slave by its constructed device
//! path, refills the queues, and registers the peer; the other record is
//! then recognized as already present.

use std::sync::Arc;

use crate::error::{Result, SlsError};
use crate::host::file::{File, FileBacking};
use crate::host::fs::Vnode;
use crate::host::process::Process;
use crate::host::pts::{Termios, Tty, Winsize, pts_alloc};
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;

use super::{FileInfo, SlsFileOps};

pub(crate) struct PtsOps;

fn tty_of(file: &File) -> Result<Arc<Tty>> {
    match &file.backing {
        FileBacking::PtsMaster(tty) => Ok(tty.clone()),
        _ => Err(SlsError::invalid("pts descriptor without a tty")),
    }
}

fn put_termios(w: &mut RecWriter, t: &Termios) {
    w.put_u32(t.iflag);
    w.put_u32(t.oflag);
    w.put_u32(t.cflag);
    w.put_u32(t.lflag);
    w.put_bytes(&t.cc);
    w.put_u32(t.ispeed);
    w.put_u32(t.ospeed);
}

fn get_termios(r: &mut RecReader<'_>) -> Result<Termios> {
    let iflag = r.get_u32()?;
    let oflag = r.get_u32()?;
    let cflag = r.get_u32()?;
    let lflag = r.get_u32()?;
    let cc_bytes = r.get_bytes()?;
    let mut cc = [0u8; 20];
    if cc_bytes.len() != cc.len() {
        return Err(SlsError::protocol("termios control characters truncated"));
    }
    cc.copy_from_slice(cc_bytes);
    Ok(Termios {
        iflag,
        oflag,
        cflag,
        lflag,
        cc,
        ispeed: r.get_u32()?,
        ospeed: r.get_u32()?,
    })
}

/// The slave side: just the cross-reference, written from the vnode path.
pub(crate) fn pts_slave_checkpoint(vp: &Arc<Vnode>, w: &mut RecWriter) -> Result<()> {
    let tty = vp
        .tty()
        .ok_or_else(|| SlsError::gone("slave pty lost its master"))?;
    w.put_u32(RecordType::Pts.magic());
    w.put_u64(vp.addr);
    w.put_bool(false);
    w.put_u64(tty.addr);
    Ok(())
}

fn restore_tty_state(tty: &Arc<Tty>, r: &mut RecReader<'_>) -> Result<()> {
    use std::sync::atomic::Ordering;
    let _drainwait = r.get_u32()?;
    *tty.termios.lock() = get_termios(r)?;
    *tty.termios_init_in.lock() = get_termios(r)?;
    *tty.termios_init_out.lock() = get_termios(r)?;
    let row = r.get_u16()?;
    let col = r.get_u16()?;
    *tty.winsize.lock() = Winsize { row, col };
    tty.flags.store(r.get_u32()?, Ordering::Relaxed);
    *tty.inq.lock() = r.get_bytes()?.to_vec();
    *tty.outq.lock() = r.get_bytes()?.to_vec();
    Ok(())
}

impl SlsFileOps for PtsOps {
    fn supported(&self, _file: &File) -> bool {
        true
    }

    fn slsid(&self, file: &File) -> SlsId {
        tty_of(file).map(|tty| tty.addr).unwrap_or(0)
    }

    fn checkpoint(
        &self,
        _p: &Arc<Process>,
        file: &Arc<File>,
        info: &mut FileInfo,
        w: &mut RecWriter,
        _sckpt: &CkptData,
    ) -> Result<()> {
        let tty = tty_of(file)?;
        info.backer = tty.addr;

        let slave = tty
            .slave_vnode()
            .ok_or_else(|| SlsError::gone("master pty lost its slave device"))?;

        use std::sync::atomic::Ordering;
        w.put_u32(RecordType::Pts.magic());
        w.put_u64(tty.addr);
        w.put_bool(true);
        w.put_u64(slave.addr);
        w.put_u32(tty.drainwait);
        put_termios(w, &tty.termios.lock());
        put_termios(w, &tty.termios_init_in.lock());
        put_termios(w, &tty.termios_init_out.lock());
        let ws = *tty.winsize.lock();
        w.put_u16(ws.row);
        w.put_u16(ws.col);
        w.put_u32(tty.flags.load(Ordering::Relaxed));
        w.put_bytes(&tty.inq.lock());
        w.put_bytes(&tty.outq.lock());
        Ok(())
    }

    fn restore(
        &self,
        info: &FileInfo,
        r: &mut RecReader<'_>,
        restdata: &RestoreData,
    ) -> Result<Option<Arc<File>>> {
        r.expect_magic(RecordType::Pts)?;
        let slsid = r.get_u64()?;
        let is_master = r.get_bool()?;
        let peer_id = r.get_u64()?;
        debug_assert_eq!(slsid, info.slsid);

        // The peer restored the pair already; if we are the master side
        // the tty state still only exists in this record, so apply it to
        // the existing tty before bowing out.
        if let Some(existing) = restdata.fptable.find(slsid) {
            if is_master {
                let tty = tty_of(&existing)?;
                restore_tty_state(&tty, r)?;
            }
            return Ok(None);
        }

        let (tty, slave_vp) = pts_alloc(&restdata.host.vfs)?;
        if is_master {
            restore_tty_state(&tty, r)?;
        }

        // Reopen the slave by its constructed path, as userspace would.
        let slave_path = format!("{}{}", crate::host::pts::DEVFS_ROOT, tty.devname);
        let opened = restdata.host.vfs.lookup(&slave_path)?;
        debug_assert!(Arc::ptr_eq(&opened, &slave_vp));

        let master_fp = File::new(FileBacking::PtsMaster(tty), info.flags);
        let slave_fp = File::new(FileBacking::Vnode(slave_vp), info.flags);

        let (local, peer) = if is_master {
            (master_fp, slave_fp)
        } else {
            (slave_fp, master_fp)
        };
        restdata.fptable.add(peer_id, peer)?;
        Ok(Some(local))
    }
}
