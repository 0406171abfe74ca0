//! Process and thread records; session and process-group reconstruction.
//!
//! One record per process holds, in order, the vmspace section, the
//! process section (IDs, relations, name, signal actions), the thread
//! sections, and the descriptor-table section. Relations that point
//! outside the captured set are recorded as *self* so restore knows to
//! inherit from the restoring environment instead of synthesizing.
//!
//! Restore is two-phase around a barrier: leaders create their pgrp or
//! session first, then everyone waits in a single loop for the session,
//! group, and parent they need. Doing all three waits in one loop is what
//! prevents ordering deadlocks between interdependent processes.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SlsError};
use crate::host::process::{
    FpRegisters, MAXCOMLEN, Process, Registers, SigAction, Sigacts, Thread,
};
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;

/// Parsed process section.
#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub slsid: SlsId,
    pub pid: u64,
    pub nthreads: u64,
    /// Parent's SLS-ID; our own if the parent is outside the capture.
    pub pptr: SlsId,
    /// Session ID; 0 when the leader is outside the capture and the
    /// process migrates into the restorer's session.
    pub sid: u64,
    pub pgid: u64,
    /// Whether the pgrp leader is captured and will create the group.
    pub pgrpwait: bool,
    pub textvp: SlsId,
    pub comm: String,
    pub sigacts: Sigacts,
}

/// Liveness gate for capture.
fn proc_alive(p: &Process) -> bool {
    !p.is_exiting()
}

fn put_sigacts(w: &mut RecWriter, sigacts: &Sigacts) {
    for sa in &sigacts.actions {
        w.put_u64(sa.handler);
        w.put_u32(sa.flags);
        w.put_u64(sa.mask);
    }
}

fn get_sigacts(r: &mut RecReader<'_>) -> Result<Sigacts> {
    let mut sigacts = Sigacts::default();
    for sa in &mut sigacts.actions {
        *sa = SigAction {
            handler: r.get_u64()?,
            flags: r.get_u32()?,
            mask: r.get_u64()?,
        };
    }
    Ok(sigacts)
}

fn thread_checkpoint(td: &Thread, w: &mut RecWriter) {
    w.put_u32(RecordType::Thread.magic());
    w.put_u64(td.tid);
    let r = &td.regs;
    for v in [
        r.rax, r.rbx, r.rcx, r.rdx, r.rsi, r.rdi, r.rbp, r.rsp, r.r8, r.r9, r.r10, r.r11, r.r12,
        r.r13, r.r14, r.r15, r.rip, r.rflags, r.cs, r.ss,
    ] {
        w.put_u64(v);
    }
    for v in td.fpregs.0 {
        w.put_u64(v);
    }
    w.put_u64(td.sigmask);
    w.put_u64(td.oldsigmask);
    w.put_u64(td.fs_base);
    w.put_u32(td.tf_trapno);
    w.put_u64(td.tf_err);
}

fn thread_restore(r: &mut RecReader<'_>) -> Result<Thread> {
    r.expect_magic(RecordType::Thread)?;
    let tid = r.get_u64()?;
    let mut gp = [0u64; 20];
    for v in &mut gp {
        *v = r.get_u64()?;
    }
    let mut fp = [0u64; 16];
    for v in &mut fp {
        *v = r.get_u64()?;
    }
    let mut td = Thread::new(tid);
    td.regs = Registers {
        rax: gp[0],
        rbx: gp[1],
        rcx: gp[2],
        rdx: gp[3],
        rsi: gp[4],
        rdi: gp[5],
        rbp: gp[6],
        rsp: gp[7],
        r8: gp[8],
        r9: gp[9],
        r10: gp[10],
        r11: gp[11],
        r12: gp[12],
        r13: gp[13],
        r14: gp[14],
        r15: gp[15],
        rip: gp[16],
        rflags: gp[17],
        cs: gp[18],
        ss: gp[19],
    };
    td.fpregs = FpRegisters(fp);
    td.sigmask = r.get_u64()?;
    td.oldsigmask = r.get_u64()?;
    td.fs_base = r.get_u64()?;
    td.tf_trapno = r.get_u32()?;
    td.tf_err = r.get_u64()?;
    Ok(td)
}

/// Serialize the process section and every thread of `p` into `w`.
pub fn proc_checkpoint(
    p: &Arc<Process>,
    procset: &[Arc<Process>],
    w: &mut RecWriter,
    sckpt: &CkptData,
) -> Result<()> {
    if !proc_alive(p) {
        return Err(SlsError::gone(format!("process {} is exiting", p.pid)));
    }

    let in_set = |pid: u64| procset.iter().any(|q| q.pid == pid);

    // Relations outside the set are recorded as self / absent so restore
    // inherits instead of waiting for a process that will never come.
    let pptr = match p.parent() {
        Some(parent) if procset.iter().any(|q| Arc::ptr_eq(q, &parent)) => parent.addr,
        _ => p.addr,
    };
    let sid = if in_set(p.sid()) { p.sid() } else { 0 };
    let pgid = p.pgid();
    let pgrpwait = in_set(pgid);

    let textvp = p
        .textvp
        .lock()
        .clone()
        .ok_or_else(|| SlsError::invalid(format!("process {} has no text vnode", p.pid)))?;
    sckpt.vnode_hold(&textvp);

    let threads = p.threads.lock().clone();
    let mut comm = p.comm.lock().clone();
    comm.truncate(MAXCOMLEN);

    w.put_u32(RecordType::Proc.magic());
    w.put_u64(p.addr);
    w.put_u64(p.pid);
    w.put_u64(threads.len() as u64);
    w.put_u64(pptr);
    w.put_u64(sid);
    w.put_u64(pgid);
    w.put_bool(pgrpwait);
    w.put_u64(textvp.addr);
    w.put_str(&comm);
    put_sigacts(w, &p.sigacts.lock());

    for td in &threads {
        thread_checkpoint(td, w);
    }

    Ok(())
}

/// Parse the process section.
pub fn proc_decode(r: &mut RecReader<'_>) -> Result<ProcInfo> {
    r.expect_magic(RecordType::Proc)?;
    let slsid = r.get_u64()?;
    let pid = r.get_u64()?;
    let nthreads = r.get_u64()?;
    let pptr = r.get_u64()?;
    let sid = r.get_u64()?;
    let pgid = r.get_u64()?;
    let pgrpwait = r.get_bool()?;
    let textvp = r.get_u64()?;
    let comm = r.get_str()?;
    let sigacts = get_sigacts(r)?;
    Ok(ProcInfo {
        slsid,
        pid,
        nthreads,
        pptr,
        sid,
        pgid,
        pgrpwait,
        textvp,
        comm,
        sigacts,
    })
}

/// Create our pgrp/session if we led one, then wait for everything we
/// depend on and join it.
async fn proc_relations(
    p: &Arc<Process>,
    info: &ProcInfo,
    daemon: bool,
    restdata: &RestoreData,
) -> Result<()> {
    let mut pgrpwait = info.pgrpwait;

    if info.pid == info.sid {
        // Session (and group) leader. Leaders must create their own
        // session; everyone else joins after the barrier.
        debug_assert_eq!(info.sid, info.pgid, "session leader leads a foreign pgrp");
        let (pgrp, session) = p.enter_pgrp(true);
        restdata.sesstable.add(info.sid, session)?;
        restdata.pgidtable.add(info.pgid, pgrp)?;
        debug!(pid = info.pid, "restored session leader");
    } else if info.pid == info.pgid {
        // Group leader without a session.
        let pgrp = if daemon {
            let (pgrp, _) = p.enter_pgrp(false);
            pgrp
        } else {
            // Staying in the restorer's group keeps the process
            // reachable from the caller's terminal for signals.
            pgrpwait = false;
            p.pgrp()
        };
        restdata.pgidtable.add(info.pgid, pgrp)?;
        debug!(pid = info.pid, "restored group leader");
    }

    restdata.proc_broadcast();

    // One combined wait for pgrp, session, and parent: checking them in
    // separate loops can deadlock across processes.
    restdata
        .proc_wait(|| {
            if info.pid != info.pgid
                && pgrpwait
                && !restdata.pgidtable.contains(info.pgid)
            {
                return false;
            }
            if info.pid != info.sid
                && info.sid != 0
                && !restdata.sesstable.contains(info.sid)
            {
                return false;
            }
            if info.slsid != info.pptr && !restdata.proctable.contains(info.pptr) {
                return false;
            }
            true
        })
        .await;

    if info.pid != info.pgid && pgrpwait {
        let pgrp = restdata
            .pgidtable
            .find(info.pgid)
            .ok_or_else(|| SlsError::invalid("restored pgrp vanished"))?;
        p.join_pgrp(&pgrp);
    } else if info.pid != info.sid && info.pid == info.pgid && info.sid != 0 {
        let session = restdata
            .sesstable
            .find(info.sid)
            .ok_or_else(|| SlsError::invalid("restored session vanished"))?;
        p.attach_session(&session);
    }

    // Reparent to the restored parent if it exists; otherwise the process
    // stays under the restore coordinator.
    if info.slsid != info.pptr {
        let parent = restdata
            .proctable
            .find(info.pptr)
            .ok_or_else(|| SlsError::invalid("restored parent vanished"))?;
        p.reparent(&parent);
        debug!(pid = info.pid, parent = parent.pid, "reparented");
    }

    Ok(())
}

/// Restore the process section onto `p`: relations, signal actions, name,
/// and text vnode. Threads are restored separately by the caller.
pub async fn proc_restore(
    p: &Arc<Process>,
    info: &ProcInfo,
    daemon: bool,
    restdata: &RestoreData,
) -> Result<()> {
    proc_relations(p, info, daemon, restdata).await?;

    *p.sigacts.lock() = info.sigacts;

    let textvp = restdata
        .vntable
        .find(info.textvp)
        .ok_or_else(|| SlsError::invalid("text vnode not restored"))?;
    textvp.vref();
    let old = p.textvp.lock().replace(textvp);
    if let Some(old) = old {
        old.vrele();
    }
    *p.comm.lock() = info.comm.clone();

    Ok(())
}

/// Parse and install the thread sections.
pub fn threads_restore(p: &Arc<Process>, nthreads: u64, r: &mut RecReader<'_>) -> Result<()> {
    let mut threads = Vec::with_capacity(nthreads as usize);
    for _ in 0..nthreads {
        threads.push(thread_restore(r)?);
    }
    *p.threads.lock() = threads;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_state_round_trips() {
        let mut td = Thread::new(42);
        td.regs.rip = 0xdead_beef;
        td.regs.rsp = 0x7fff_0000;
        td.fpregs = FpRegisters([7; 16]);
        td.sigmask = 0x10;
        td.fs_base = 0x1234;
        td.tf_trapno = 3;
        td.tf_err = 14;

        let mut w = RecWriter::raw();
        thread_checkpoint(&td, &mut w);
        let buf = w.into_inner();
        let mut r = RecReader::new(&buf);
        let back = thread_restore(&mut r).unwrap();
        assert_eq!(back.tid, 42);
        assert_eq!(back.regs, td.regs);
        assert_eq!(back.fpregs, td.fpregs);
        assert_eq!(back.sigmask, 0x10);
        assert_eq!(back.tf_trapno, 3);
        assert_eq!(back.tf_err, 14);
    }

    #[test]
    fn sigacts_round_trip() {
        let mut sigacts = Sigacts::default();
        sigacts.actions[9] = SigAction {
            handler: 0x4000,
            flags: 0x2,
            mask: 0xff,
        };
        let mut w = RecWriter::raw();
        put_sigacts(&mut w, &sigacts);
        let buf = w.into_inner();
        let mut r = RecReader::new(&buf);
        let back = get_sigacts(&mut r).unwrap();
        assert_eq!(back.actions[9], sigacts.actions[9]);
        assert_eq!(back.actions[0], SigAction::default());
    }
}
