//! Modeled open-file descriptions and per-process descriptor tables.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::fs::{Vnode, VnodeKind};
use super::kqueue::Kqueue;
use super::pipe::Pipe;
use super::pts::Tty;
use super::shm::PosixShm;
use super::socket::Socket;
use super::vm::alloc_addr;
use crate::error::{Result, SlsError};

/// What an open file refers to.
#[derive(Clone)]
pub enum FileBacking {
    Vnode(Arc<Vnode>),
    Pipe(Arc<Pipe>),
    Socket(Arc<Socket>),
    Kqueue(Arc<Kqueue>),
    /// Master side of a pty. The slave side is a `Vnode` of the pts device.
    PtsMaster(Arc<Tty>),
    Shm(Arc<PosixShm>),
}

/// Descriptor kind as the dispatch table sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Vnode,
    Fifo,
    Pipe,
    Socket,
    Kqueue,
    Pts,
    Shm,
}

impl FileKind {
    pub fn tag(self) -> u16 {
        match self {
            FileKind::Vnode => 1,
            FileKind::Fifo => 2,
            FileKind::Pipe => 3,
            FileKind::Socket => 4,
            FileKind::Kqueue => 5,
            FileKind::Pts => 6,
            FileKind::Shm => 7,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => FileKind::Vnode,
            2 => FileKind::Fifo,
            3 => FileKind::Pipe,
            4 => FileKind::Socket,
            5 => FileKind::Kqueue,
            6 => FileKind::Pts,
            7 => FileKind::Shm,
            _ => return None,
        })
    }
}

/// Open-file flags the engine round-trips.
pub const O_NONBLOCK: u32 = 0x0004;
pub const O_CLOEXEC: u32 = 0x0010_0000;
pub const O_ASYNC: u32 = 0x0040;

pub struct File {
    pub addr: u64,
    pub backing: FileBacking,
    pub flags: AtomicU32,
    pub offset: AtomicU64,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("addr", &self.addr)
            .field("kind", &self.kind())
            .field("offset", &self.offset.load(Ordering::Relaxed))
            .finish()
    }
}

impl File {
    pub fn new(backing: FileBacking, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            addr: alloc_addr(),
            backing,
            flags: AtomicU32::new(flags),
            offset: AtomicU64::new(0),
        })
    }

    pub fn kind(&self) -> FileKind {
        match &self.backing {
            FileBacking::Vnode(vp) if vp.kind == VnodeKind::Fifo => FileKind::Fifo,
            FileBacking::Vnode(_) => FileKind::Vnode,
            FileBacking::Pipe(_) => FileKind::Pipe,
            FileBacking::Socket(_) => FileKind::Socket,
            FileBacking::Kqueue(_) => FileKind::Kqueue,
            FileBacking::PtsMaster(_) => FileKind::Pts,
            FileBacking::Shm(_) => FileKind::Shm,
        }
    }

    pub fn vnode(&self) -> Option<Arc<Vnode>> {
        match &self.backing {
            FileBacking::Vnode(vp) => Some(vp.clone()),
            _ => None,
        }
    }

    pub fn get_flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    pub fn get_offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, off: u64) {
        self.offset.store(off, Ordering::Relaxed);
    }

    /// Whether this descriptor points at the slave side of a pty.
    pub fn is_tty_slave(&self) -> bool {
        self.vnode().is_some_and(|vp| vp.is_tty())
    }
}

/// A per-process descriptor table.
pub struct FdTable {
    pub cdir: Arc<Vnode>,
    pub rdir: Arc<Vnode>,
    pub cmask: u16,
    files: BTreeMap<u32, Arc<File>>,
}

impl FdTable {
    pub fn new(cdir: Arc<Vnode>, rdir: Arc<Vnode>) -> Self {
        Self {
            cdir,
            rdir,
            cmask: 0o022,
            files: BTreeMap::new(),
        }
    }

    /// Install at the lowest free descriptor.
    pub fn alloc(&mut self, file: Arc<File>) -> u32 {
        let mut fd = 0;
        while self.files.contains_key(&fd) {
            fd += 1;
        }
        self.files.insert(fd, file);
        fd
    }

    /// Install at an exact descriptor; restore places files back where
    /// they were.
    pub fn install_at(&mut self, fd: u32, file: Arc<File>) -> Result<()> {
        if self.files.contains_key(&fd) {
            return Err(SlsError::invalid(format!("fd {fd} already in use")));
        }
        self.files.insert(fd, file);
        Ok(())
    }

    pub fn get(&self, fd: u32) -> Option<Arc<File>> {
        self.files.get(&fd).cloned()
    }

    pub fn close(&mut self, fd: u32) -> Option<Arc<File>> {
        self.files.remove(&fd)
    }

    /// Replace the file at `fd`, returning the old one.
    pub fn replace(&mut self, fd: u32, file: Arc<File>) -> Option<Arc<File>> {
        self.files.insert(fd, file)
    }

    /// Snapshot of used descriptors, ascending.
    pub fn entries(&self) -> Vec<(u32, Arc<File>)> {
        self.files.iter().map(|(fd, f)| (*fd, f.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
