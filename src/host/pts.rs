//! Modeled pseudo-terminals.
//!
//! One tty per pair: the master side holds the tty directly, the slave
//! side is a character-device vnode under `/dev/pts/` whose device points
//! back at the tty. Input and output queues, termios, and the window size
//! are the state capture dumps inline.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::fs::{Vfs, Vnode, VnodeKind};
use super::vm::alloc_addr;
use crate::error::Result;

pub const DEVFS_ROOT: &str = "/dev/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Termios {
    pub iflag: u32,
    pub oflag: u32,
    pub cflag: u32,
    pub lflag: u32,
    pub cc: [u8; 20],
    pub ispeed: u32,
    pub ospeed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Winsize {
    pub row: u16,
    pub col: u16,
}

pub struct Tty {
    pub addr: u64,
    pub index: u32,
    /// Device name relative to /dev, e.g. `pts/3`.
    pub devname: String,
    pub drainwait: u32,
    pub termios: Mutex<Termios>,
    pub termios_init_in: Mutex<Termios>,
    pub termios_init_out: Mutex<Termios>,
    pub winsize: Mutex<Winsize>,
    pub flags: AtomicU32,
    pub inq: Mutex<Vec<u8>>,
    pub outq: Mutex<Vec<u8>>,
    /// The slave device vnode under /dev/pts.
    slave: Mutex<Weak<Vnode>>,
    /// Master side dropped; slave descriptors pointing here are dangling.
    gone: AtomicBool,
}

impl std::fmt::Debug for Tty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tty")
            .field("devname", &self.devname)
            .field("gone", &self.gone.load(Ordering::Relaxed))
            .finish()
    }
}

impl Tty {
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Relaxed)
    }

    pub fn set_gone(&self) {
        self.gone.store(true, Ordering::Relaxed);
    }

    pub fn slave_vnode(&self) -> Option<Arc<Vnode>> {
        self.slave.lock().upgrade()
    }
}

static NEXT_PTS: AtomicU32 = AtomicU32::new(0);

/// Allocate a fresh pty: returns the tty (master side state) and the slave
/// device vnode linked at `/dev/pts/<n>`.
pub fn pts_alloc(vfs: &Vfs) -> Result<(Arc<Tty>, Arc<Vnode>)> {
    let index = NEXT_PTS.fetch_add(1, Ordering::Relaxed);
    let devname = format!("pts/{index}");
    let tty = Arc::new(Tty {
        addr: alloc_addr(),
        index,
        devname: devname.clone(),
        drainwait: 0,
        termios: Mutex::new(Termios::default()),
        termios_init_in: Mutex::new(Termios::default()),
        termios_init_out: Mutex::new(Termios::default()),
        winsize: Mutex::new(Winsize::default()),
        flags: AtomicU32::new(0),
        inq: Mutex::new(Vec::new()),
        outq: Mutex::new(Vec::new()),
        slave: Mutex::new(Weak::new()),
        gone: AtomicBool::new(false),
    });
    let slave = vfs.lookup_or_create(&format!("{DEVFS_ROOT}{devname}"), VnodeKind::CharDev)?;
    slave.set_tty(&tty);
    *tty.slave.lock() = Arc::downgrade(&slave);
    Ok((tty, slave))
}
