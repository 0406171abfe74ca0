//! Restore orchestration.
//!
//! The coordinator brings in a record table (from a backend or from the
//! resident checkpoint), rebuilds the object graph and the open files,
//! then forks one worker per process record. Workers share a
//! [`RestoreData`] context and synchronize twice: once so leaders can
//! create sessions and process groups before joiners look them up, and
//! once after the coordinator has released the unused master terminals so
//! every worker can rewire dangling tty descriptors.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::config::SlsConfig;
use crate::error::{Result, SlsError};
use crate::host::Host;
use crate::host::file::{File, FileBacking, FileKind};
use crate::host::process::Process;
use crate::host::vm::VmObject;
use crate::io::ErrorSlot;
use crate::kv::SlsTable;
use crate::partition::{CkptData, Metropolis, PartState, Partition, Target};
use crate::proc;
use crate::record::{RecReader, Record, RecordType};
use crate::resources;
use crate::vmobject;
use crate::vmspace;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Context shared by the restore coordinator and every forked worker.
pub struct RestoreData {
    pub slsp: Arc<Partition>,
    pub host: Arc<Host>,
    pub metr: Metropolis,
    pub precopy: bool,
    pub ignore_unlinked: bool,

    /// Restored VM objects by SLS-ID (`None` marks device mappings).
    pub objtable: SlsTable<Option<Arc<VmObject>>>,
    /// Restored processes by their capture-time SLS-ID.
    pub proctable: SlsTable<Arc<Process>>,
    /// Restored open files by SLS-ID.
    pub fptable: SlsTable<Arc<File>>,
    /// Saved knote lists keyed by kqueue SLS-ID.
    pub kevtable: SlsTable<Arc<Vec<resources::kqueue::KnoteInfo>>>,
    /// Old pgid → restored pgrp.
    pub pgidtable: SlsTable<Arc<crate::host::process::Pgrp>>,
    /// Old sid → restored session.
    pub sesstable: SlsTable<Arc<crate::host::process::Session>>,
    /// Buffered socket data by sockbuf SLS-ID.
    pub mbuftable: SlsTable<Vec<u8>>,
    /// Restored vnodes by SLS-ID, one held reference each.
    pub vntable: SlsTable<Arc<crate::host::fs::Vnode>>,
    /// Registry of live processes, shared with the module.
    pub procs_reg: Arc<SlsTable<u64>>,

    pub error: ErrorSlot,

    proctds: Mutex<i64>,
    proc_notify: Notify,
}

impl RestoreData {
    fn new(
        slsp: Arc<Partition>,
        host: Arc<Host>,
        procs_reg: Arc<SlsTable<u64>>,
    ) -> Arc<Self> {
        let metr = *slsp.metr.lock();
        let precopy = slsp.attr.precopy();
        let ignore_unlinked = slsp.attr.ignore_unlinked();
        Arc::new(Self {
            slsp,
            host,
            metr,
            precopy,
            ignore_unlinked,
            objtable: SlsTable::new(),
            proctable: SlsTable::new(),
            fptable: SlsTable::new(),
            kevtable: SlsTable::new(),
            pgidtable: SlsTable::new(),
            sesstable: SlsTable::new(),
            mbuftable: SlsTable::new(),
            vntable: SlsTable::new(),
            procs_reg,
            error: ErrorSlot::default(),
            proctds: Mutex::new(0),
            proc_notify: Notify::new(),
        })
    }

    /// Wake everyone blocked on the restore tables.
    pub fn proc_broadcast(&self) {
        self.proc_notify.notify_waiters();
    }

    /// Sleep until `pred` holds; re-checked on every broadcast.
    pub async fn proc_wait(&self, pred: impl Fn() -> bool) {
        loop {
            let notified = self.proc_notify.notified();
            if pred() {
                return;
            }
            notified.await;
        }
    }

    fn fork_begin(&self) {
        *self.proctds.lock() += 1;
    }

    fn child_done(&self) {
        let mut n = self.proctds.lock();
        debug_assert!(*n > 0, "barrier underflow");
        *n -= 1;
        if *n == 0 {
            drop(n);
            self.proc_broadcast();
        }
    }

    async fn wait_children(&self) {
        self.proc_wait(|| *self.proctds.lock() <= 0).await;
    }

    fn release_children(&self) {
        *self.proctds.lock() = -1;
        self.proc_broadcast();
    }

    async fn wait_release(&self) {
        self.proc_wait(|| *self.proctds.lock() < 0).await;
    }
}

impl Drop for RestoreData {
    fn drop(&mut self) {
        while let Some((_, vp)) = self.vntable.pop() {
            vp.vrele();
        }
        while let Some((_, obj)) = self.objtable.pop() {
            if let Some(obj) = obj {
                obj.deallocate();
            }
        }
    }
}

/// Shadow the resident checkpoint's objects so restoring does not consume
/// the artifact: processes map fresh shadows, the frozen pages stay put.
///
/// The table keys the deepest object of each chain, but after collapses
/// the newest frozen pages sit at the live shadow's immediate backer, so
/// that is what a restore must read through. Entries held without a
/// shadow (plain ancestors, received objects) are shadowed directly.
fn ckptshadow(restdata: &RestoreData, sckpt: &CkptData) -> Result<()> {
    for (_, entry) in sckpt.shadow_table.entries() {
        let target = match &entry.shadow {
            Some(live) => live.backing().unwrap_or_else(|| entry.obj.clone()),
            None => entry.obj.clone(),
        };
        target.reference();
        let shadow = target.shadow();
        if restdata
            .objtable
            .add(target.objid(), Some(shadow.clone()))
            .is_err()
        {
            warn!(objid = target.objid(), "object shadowed twice for restore");
            shadow.deallocate();
            return Err(SlsError::invalid("duplicate object in resident checkpoint"));
        }
    }
    Ok(())
}

/// Release the coordinator's references to restored master terminals.
/// Masters nobody installed become gone, which is what lets workers
/// detect dangling slave descriptors in the fixup pass.
fn tty_release(restdata: &RestoreData) {
    let keys = restdata.fptable.keys();
    for key in keys {
        let Some(file) = restdata.fptable.find(key) else {
            continue;
        };
        if file.kind() != FileKind::Pts {
            continue;
        }
        restdata.fptable.del(key);
        // Ours was the last reference: the pty was restored but never
        // installed into any process.
        if Arc::strong_count(&file) == 1 {
            if let FileBacking::PtsMaster(tty) = &file.backing {
                debug!(devname = %tty.devname, "dropping unused restored pty");
                tty.set_gone();
            }
        }
    }
}

/// Replace descriptors whose master side is gone with the restoring
/// session's controlling terminal.
fn tty_fixup(p: &Arc<Process>, restdata: &RestoreData) -> Result<()> {
    let console = restdata
        .host
        .init_session()
        .tty
        .lock()
        .clone()
        .ok_or_else(|| SlsError::invalid("restoring session has no terminal"))?;
    let console_vp = console
        .slave_vnode()
        .ok_or_else(|| SlsError::invalid("console has no slave device"))?;

    let mut fdtable = p.fdtable.lock();
    let entries = fdtable.entries();
    for (fd, file) in entries {
        let dangling = match &file.backing {
            FileBacking::Vnode(vp) => vp.tty().is_some_and(|t| t.is_gone()),
            FileBacking::PtsMaster(tty) => tty.is_gone(),
            _ => false,
        };
        if dangling {
            let replacement = File::new(FileBacking::Vnode(console_vp.clone()), file.get_flags());
            fdtable.replace(fd, replacement);
        }
    }
    Ok(())
}

/// Splice the accepted socket back into the process captured mid-accept
/// and point the calling thread's return slot at the new descriptor.
fn metr_fixup(p: &Arc<Process>, info: &proc::ProcInfo, restdata: &RestoreData) -> Result<()> {
    if restdata.metr.proc_slsid == 0 || info.slsid != restdata.metr.proc_slsid {
        return Ok(());
    }
    let Some(sockfp) = restdata.slsp.metr_sockfp.lock().take() else {
        return Ok(());
    };
    let fd = p.fdtable.lock().alloc(sockfp);
    let mut threads = p.threads.lock();
    for td in threads.iter_mut() {
        if td.tid == restdata.metr.tid {
            td.retval = fd as u64;
        }
    }
    debug!(pid = p.pid, fd, "spliced accepted socket");
    Ok(())
}

async fn restore_proc_inner(
    restdata: &Arc<RestoreData>,
    p: &Arc<Process>,
    rec: &Arc<Record>,
    daemon: bool,
) -> Result<proc::ProcInfo> {
    p.boundary_stop();
    p.auroid
        .store(restdata.slsp.oid, std::sync::atomic::Ordering::Relaxed);
    let _ = restdata.procs_reg.add(p.pid, restdata.slsp.oid);
    let _ = restdata.slsp.proc_attach(p.pid);

    let mut r = RecReader::new(rec.data());

    vmspace::vmspace_restore(p, &mut r, restdata)?;

    let info = proc::proc_decode(&mut r)?;
    restdata.proctable.add(info.slsid, p.clone())?;
    restdata.proc_broadcast();

    proc::proc_restore(p, &info, daemon, restdata).await?;
    proc::threads_restore(p, info.nthreads, &mut r)?;

    resources::filedesc_restore(p, &mut r, restdata)?;
    resources::kqueue::knotes_restore_all(p, restdata)?;

    metr_fixup(p, &info, restdata)?;

    Ok(info)
}

async fn restore_proc_task(
    restdata: Arc<RestoreData>,
    rec: Arc<Record>,
    daemon: bool,
    rest_stopped: bool,
) {
    let p = match restdata.host.fork_restored("restored") {
        Ok(p) => p,
        Err(e) => {
            restdata.error.set(e);
            restdata.child_done();
            return;
        }
    };

    match restore_proc_inner(&restdata, &p, &rec, daemon).await {
        Ok(_) => {
            restdata.child_done();
            // Second barrier: the coordinator has to drop unused master
            // terminals before anyone can tell which slaves dangle.
            restdata.wait_release().await;

            if let Err(e) = tty_fixup(&p, &restdata) {
                warn!(pid = p.pid, error = %e, "tty fixup failed");
            }

            p.boundary_end();
            if rest_stopped {
                p.sigstop();
            }
        }
        Err(e) => {
            // The worker exits with the error; the barrier still counts
            // it as done so the coordinator is not wedged.
            warn!(pid = p.pid, error = %e, "process restore failed");
            p.boundary_end();
            restdata.error.set(e);
            restdata.host.reap(p.pid);
            restdata.child_done();
        }
    }
}

/// Restore a partition.
#[instrument(skip_all, fields(oid = slsp.oid))]
pub(crate) async fn sls_rest(
    host: &Arc<Host>,
    procs_reg: &Arc<SlsTable<u64>>,
    backend: Option<Arc<dyn crate::backend::Backend>>,
    _config: &SlsConfig,
    slsp: Arc<Partition>,
    daemon: bool,
    rest_stopped: bool,
) -> Result<()> {
    let restdata = RestoreData::new(slsp.clone(), host.clone(), procs_reg.clone());

    slsp.set_state(PartState::Available, PartState::Restoring, true)
        .await?;

    let result = sls_rest_inner(&restdata, backend, &slsp, daemon, rest_stopped).await;

    // Whether we got to fork anything or not, run the two-phase release
    // so any worker that did start can finish.
    restdata.wait_children().await;
    tty_release(&restdata);
    restdata.release_children();

    let state_ok = slsp
        .set_state(PartState::Restoring, PartState::Available, false)
        .await;
    debug_assert!(state_ok.is_ok(), "partition left restoring state");

    result.and(restdata.error.check())
}

async fn sls_rest_inner(
    restdata: &Arc<RestoreData>,
    backend: Option<Arc<dyn crate::backend::Backend>>,
    slsp: &Arc<Partition>,
    daemon: bool,
    rest_stopped: bool,
) -> Result<()> {
    if !slsp.restorable() {
        return Err(SlsError::invalid("partition is not restorable"));
    }

    // Bring in the records.
    let rectable: SlsTable<Arc<Record>> = SlsTable::new();
    if slsp.rest_from_mem() || slsp.attr.target == Target::SockRecv {
        let sckpt = slsp
            .sckpt()
            .ok_or_else(|| SlsError::invalid("no resident checkpoint to restore"))?;
        for (id, rec) in sckpt.rectable.entries() {
            rectable.add(id, rec)?;
        }
        // The artifact survives the restore: map shadows, not originals.
        ckptshadow(restdata, &sckpt)?;
        // The checkpoint's held vnodes stand in for vnode records; a
        // received checkpoint carries vnode records instead.
        for (id, vp) in sckpt.vntable.entries() {
            vp.vref();
            restdata.vntable.add(id, vp)?;
        }
        for (_, rec) in rectable.entries() {
            if rec.rtype() == RecordType::Vnode {
                resources::vnode::vnode_record_restore(&rec, restdata)?;
            }
        }
    } else {
        let backend =
            backend.ok_or_else(|| SlsError::invalid("partition target has no backend"))?;
        let restored = backend.read_ckpt(slsp).await?;
        while let Some((id, rec)) = restored.rectable.pop() {
            rectable.add(id, rec)?;
        }
        while let Some((id, obj)) = restored.objtable.pop() {
            restdata.objtable.add(id, obj)?;
        }
        // Vnodes first: object and file restoration resolve against them.
        for (_, rec) in rectable.entries() {
            if rec.rtype() == RecordType::Vnode {
                resources::vnode::vnode_record_restore(&rec, restdata)?;
            }
        }
    }

    vmobject::vmobj_restore_all(&rectable, restdata)?;

    // A backend may hand the table over while page-ins it pipelined are
    // still settling; sleep on each object's paging-in-progress count
    // before anything maps it.
    for (_, obj) in restdata.objtable.entries() {
        if let Some(obj) = obj {
            obj.wait_pip().await;
        }
    }

    // Buffered socket data, before the sockets that may reference it.
    for (_, rec) in rectable.entries() {
        if rec.rtype() == RecordType::Mbuf {
            let mut r = rec.reader()?;
            let sbid = r.get_u64()?;
            let data = r.get_bytes()?.to_vec();
            restdata.mbuftable.add(sbid, data)?;
        }
    }

    for (_, rec) in rectable.entries() {
        if rec.rtype() == RecordType::File {
            resources::slsfile_restore(&rec, restdata)?;
        }
    }

    for (_, rec) in rectable.entries() {
        if rec.rtype() == RecordType::SysvShm {
            resources::sysv::sysv_restore(&rec, restdata)?;
        }
    }

    // One worker per process record.
    let mut workers = Vec::new();
    for (_, rec) in rectable.entries() {
        if rec.rtype() != RecordType::Proc {
            continue;
        }
        restdata.fork_begin();
        workers.push(tokio::spawn(restore_proc_task(
            restdata.clone(),
            rec,
            daemon,
            rest_stopped,
        )));
    }
    debug!(workers = workers.len(), "forked restore workers");

    Ok(())
}
