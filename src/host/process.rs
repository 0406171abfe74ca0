//! Modeled processes: threads with register state, signal actions, and
//! the session/process-group tree.
//!
//! Threads carry the register files and trap bookkeeping the capture path
//! serializes; the process carries the relations (parent, pgrp, session)
//! restore has to rebuild in leader-first order.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::file::FdTable;
use super::fs::Vnode;
use super::vm::{VmSpace, alloc_addr};

pub const NSIG: usize = 32;
pub const MAXCOMLEN: usize = 19;

/// General-purpose register file, x86-64 layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

/// Floating-point state, stored as the raw save area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpRegisters(pub [u64; 16]);

impl Default for FpRegisters {
    fn default() -> Self {
        Self([0; 16])
    }
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub tid: u64,
    pub regs: Registers,
    pub fpregs: FpRegisters,
    pub sigmask: u64,
    pub oldsigmask: u64,
    pub fs_base: u64,
    pub tf_trapno: u32,
    pub tf_err: u64,
    /// Syscall return slot, populated by the Metropolis fixup.
    pub retval: u64,
}

impl Thread {
    pub fn new(tid: u64) -> Self {
        Self {
            tid,
            regs: Registers::default(),
            fpregs: FpRegisters::default(),
            sigmask: 0,
            oldsigmask: 0,
            fs_base: 0,
            tf_trapno: 0,
            tf_err: 0,
            retval: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u32,
    pub mask: u64,
}

/// The signal-action table, copied wholesale across a checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct Sigacts {
    pub actions: [SigAction; NSIG],
}

impl Default for Sigacts {
    fn default() -> Self {
        Self {
            actions: [SigAction::default(); NSIG],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    /// Held at the kernel-user boundary by a checkpoint or restore.
    BoundaryStopped,
    /// Stopped by SIGSTOP (restore-stopped option).
    SigStopped,
    Exiting,
    Zombie,
}

pub struct Session {
    pub addr: u64,
    pub sid: u64,
    pub tty: Mutex<Option<Arc<super::pts::Tty>>>,
}

impl Session {
    pub fn new(sid: u64) -> Arc<Self> {
        Arc::new(Self {
            addr: alloc_addr(),
            sid,
            tty: Mutex::new(None),
        })
    }
}

pub struct Pgrp {
    pub addr: u64,
    pub pgid: u64,
    pub session: Mutex<Arc<Session>>,
}

impl Pgrp {
    pub fn new(pgid: u64, session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            addr: alloc_addr(),
            pgid,
            session: Mutex::new(session),
        })
    }
}

pub struct Process {
    pub addr: u64,
    pub pid: u64,
    pub comm: Mutex<String>,
    pub threads: Mutex<Vec<Thread>>,
    pub vmspace: Mutex<Arc<VmSpace>>,
    pub fdtable: Mutex<FdTable>,
    pub sigacts: Mutex<Sigacts>,
    pub textvp: Mutex<Option<Arc<Vnode>>>,
    pub state: Mutex<ProcState>,
    parent: Mutex<Weak<Process>>,
    pgrp: Mutex<Arc<Pgrp>>,
    children: Mutex<Vec<Weak<Process>>>,
    /// OID of the partition this process belongs to, 0 if none.
    pub auroid: AtomicU64,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("comm", &*self.comm.lock())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Process {
    pub(super) fn new(pid: u64, comm: &str, fdtable: FdTable, pgrp: Arc<Pgrp>) -> Arc<Self> {
        Arc::new(Self {
            addr: alloc_addr(),
            pid,
            comm: Mutex::new(comm.to_string()),
            threads: Mutex::new(vec![Thread::new(pid * 100_000)]),
            vmspace: Mutex::new(Arc::new(VmSpace::new())),
            fdtable: Mutex::new(fdtable),
            sigacts: Mutex::new(Sigacts::default()),
            textvp: Mutex::new(None),
            state: Mutex::new(ProcState::Alive),
            parent: Mutex::new(Weak::new()),
            pgrp: Mutex::new(pgrp),
            children: Mutex::new(Vec::new()),
            auroid: AtomicU64::new(0),
        })
    }

    pub fn vmspace(&self) -> Arc<VmSpace> {
        self.vmspace.lock().clone()
    }

    /// Swap in a freshly built address space, releasing the old one's
    /// object references.
    pub fn replace_vmspace(&self, space: Arc<VmSpace>) {
        let old = std::mem::replace(&mut *self.vmspace.lock(), space);
        old.release();
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub fn reparent(self: &Arc<Self>, new_parent: &Arc<Process>) {
        *self.parent.lock() = Arc::downgrade(new_parent);
        new_parent.children.lock().push(Arc::downgrade(self));
    }

    pub fn children(&self) -> Vec<Arc<Process>> {
        self.children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn pgrp(&self) -> Arc<Pgrp> {
        self.pgrp.lock().clone()
    }

    pub fn session(&self) -> Arc<Session> {
        self.pgrp.lock().session.lock().clone()
    }

    pub fn pgid(&self) -> u64 {
        self.pgrp.lock().pgid
    }

    pub fn sid(&self) -> u64 {
        self.session().sid
    }

    pub fn is_session_leader(&self) -> bool {
        self.sid() == self.pid
    }

    /// `enterpgrp` shape: become leader of a fresh pgrp, optionally also
    /// of a fresh session.
    pub fn enter_pgrp(self: &Arc<Self>, new_session: bool) -> (Arc<Pgrp>, Arc<Session>) {
        let session = if new_session {
            Session::new(self.pid)
        } else {
            self.session()
        };
        let pgrp = Pgrp::new(self.pid, session.clone());
        *self.pgrp.lock() = pgrp.clone();
        (pgrp, session)
    }

    /// Join an existing pgrp.
    pub fn join_pgrp(&self, pgrp: &Arc<Pgrp>) {
        *self.pgrp.lock() = pgrp.clone();
    }

    /// Move this pgrp (which we lead) into an existing session.
    pub fn attach_session(&self, session: &Arc<Session>) {
        *self.pgrp.lock().session.lock() = session.clone();
    }

    pub fn state(&self) -> ProcState {
        *self.state.lock()
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ProcState::Alive | ProcState::BoundaryStopped | ProcState::SigStopped
        )
    }

    pub fn is_exiting(&self) -> bool {
        matches!(self.state(), ProcState::Exiting | ProcState::Zombie)
    }

    /// Force all threads to the kernel-user boundary.
    pub fn boundary_stop(&self) {
        let mut state = self.state.lock();
        if *state == ProcState::Alive {
            *state = ProcState::BoundaryStopped;
        }
    }

    /// Release the boundary.
    pub fn boundary_end(&self) {
        let mut state = self.state.lock();
        if *state == ProcState::BoundaryStopped {
            *state = ProcState::Alive;
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(
            self.state(),
            ProcState::BoundaryStopped | ProcState::SigStopped
        )
    }

    pub fn sigstop(&self) {
        *self.state.lock() = ProcState::SigStopped;
    }

    pub fn set_exiting(&self) {
        *self.state.lock() = ProcState::Exiting;
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Write an anonymous mapping through the process' address space, as a
    /// store from userspace would.
    pub fn write_mem(&self, vaddr: u64, data: &[u8]) -> crate::error::Result<()> {
        self.vmspace().write(vaddr, data)
    }

    pub fn read_mem(&self, vaddr: u64, len: usize) -> crate::error::Result<Vec<u8>> {
        self.vmspace().read(vaddr, len)
    }
}
