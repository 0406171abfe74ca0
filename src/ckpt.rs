//! The checkpoint pass and its daemon.
//!
//! One iteration: take the partition into `Checkpointing`, gather the
//! live processes (recursing into new children if asked), stop them at
//! the boundary, reserve an epoch ticket, capture SysV memory and every
//! process' metadata, shadow all anonymous memory, release the processes,
//! hand the records to the backend, advance the epoch, and compact. The
//! stop → shadow → release window is the only pause the workload sees.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::backend::Backend;
use crate::error::{Result, SlsError};
use crate::host::Host;
use crate::host::process::Process;
use crate::kv::SlsTable;
use crate::partition::{CkptData, Mode, PartState, Partition, Target};
use crate::proc;
use crate::record::{RecWriter, RecordType};
use crate::resources;
use crate::stats::SlsStats;
use crate::vm;
use crate::vmobject;
use crate::vmspace;

/// Everything a pass needs from the module.
pub(crate) struct CkptCtx {
    pub host: Arc<Host>,
    pub procs_reg: Arc<SlsTable<u64>>,
    pub backend: Option<Arc<dyn Backend>>,
    pub stats: Arc<SlsStats>,
    pub taskq: Arc<crate::io::TaskQueue>,
    pub exiting: Arc<std::sync::atomic::AtomicBool>,
}

/// Stop every gathered process at the kernel-user boundary. The caller
/// (if among them) has already single-threaded itself.
fn ckpt_stop(procset: &[Arc<Process>], pcaller: Option<u64>) {
    for p in procset {
        if Some(p.pid) == pcaller {
            continue;
        }
        p.boundary_stop();
    }
}

/// Release the boundary.
fn ckpt_cont(procset: &[Arc<Process>], pcaller: Option<u64>) {
    for p in procset {
        if Some(p.pid) == pcaller {
            continue;
        }
        p.boundary_end();
    }
}

/// Collect the partition's live processes. Dead PIDs are detached on the
/// way. With `recurse`, the working set is stopped and re-swept until no
/// new live children appear.
fn ckpt_gather(
    ctx: &CkptCtx,
    slsp: &Arc<Partition>,
    pcaller: Option<u64>,
    recurse: bool,
) -> Result<Vec<Arc<Process>>> {
    let mut procset: Vec<Arc<Process>> = Vec::new();

    for pid in slsp.procs.keys() {
        match ctx.host.pget(pid) {
            Ok(p) if !p.is_exiting() => procset.push(p),
            _ => {
                debug!(pid, "detaching dead process");
                slsp.proc_detach(pid);
                ctx.procs_reg.del(pid);
            }
        }
    }

    if slsp.is_empty() || procset.is_empty() {
        return Err(SlsError::invalid("no processes left to checkpoint"));
    }

    if recurse {
        // Children checkpointed this way are not entered into the
        // partition permanently; they only ride along with this pass.
        loop {
            ckpt_stop(&procset, pcaller);
            let mut new_procs = 0;
            let mut found = Vec::new();
            for p in &procset {
                for child in p.children() {
                    let known = procset.iter().chain(found.iter()).any(|q| q.pid == child.pid);
                    if !known && !child.is_exiting() {
                        found.push(child);
                        new_procs += 1;
                    }
                }
            }
            procset.extend(found);
            if new_procs == 0 {
                break;
            }
        }
    }

    Ok(procset)
}

/// Capture all the metadata of one process into a single record.
fn ckpt_metadata(
    p: &Arc<Process>,
    procset: &[Arc<Process>],
    sckpt: &Arc<CkptData>,
) -> Result<()> {
    if p.is_exiting() {
        return Err(SlsError::gone(format!("process {} is exiting", p.pid)));
    }

    let mut w = RecWriter::raw();
    vmspace::vmspace_checkpoint(p, &mut w, sckpt)?;
    proc::proc_checkpoint(p, procset, &mut w, sckpt)?;
    // Last: the descriptor table shares the record rather than owning one.
    resources::filedesc_checkpoint(p, sckpt, &mut w)?;

    sckpt.add_record(crate::record::Record::sealed(
        p.addr,
        RecordType::Proc,
        w.into_inner(),
    ))
}

/// Serialize and hand the checkpoint to the backend.
async fn ckpt_initio(
    ctx: &CkptCtx,
    slsp: &Arc<Partition>,
    sckpt: &Arc<CkptData>,
) -> Result<()> {
    if slsp.attr.target == Target::Memory {
        return Ok(());
    }

    // Vnode serialization is deferred to here, after the processes have
    // resumed; path lookups on hundreds of vnodes are not worth stretching
    // the stop window.
    resources::vnode::vnode_serialize(sckpt)?;
    sckpt.build_serialized();

    let backend = ctx
        .backend
        .clone()
        .ok_or_else(|| SlsError::invalid("partition target has no backend"))?;
    backend.write_ckpt(slsp, sckpt).await?;

    // File-system-backed targets drain outstanding writeback before the
    // epoch is allowed to advance.
    if matches!(slsp.attr.target, Target::Slos | Target::FileTree) {
        ctx.taskq.drain().await;
    }
    Ok(())
}

/// Fold the pass into the partition: memory targets and delta mode keep a
/// resident checkpoint and telescope the old shadows into it; full disk
/// passes drop their shadows outright.
pub(crate) fn ckpt_compact(slsp: &Arc<Partition>, sckpt: Arc<CkptData>) {
    if slsp.attr.target == Target::Memory || slsp.attr.mode == Mode::Delta {
        let old = slsp.set_sckpt(Some(sckpt.clone()));
        if let Some(old) = old {
            old.collapse(Some(&sckpt));
        }
        return;
    }

    debug_assert!(slsp.attr.mode == Mode::Full, "unexpected mode");
    debug_assert!(slsp.sckpt().is_none(), "full disk checkpoint has resident data");
    drop(sckpt);
}

/// One checkpoint of the gathered process set. The processes are already
/// stopped; they are released as soon as the shadows exist.
#[instrument(skip_all, fields(oid = slsp.oid, ticket))]
async fn sls_ckpt(
    ctx: &CkptCtx,
    procset: &[Arc<Process>],
    pcaller: Option<u64>,
    slsp: &Arc<Partition>,
    ticket: u64,
) -> Result<()> {
    slsp.metr.lock().proc_slsid = 0;

    let sckpt = CkptData::new(slsp.attr);

    let capture = async {
        resources::sysv::sysv_checkpoint(&ctx.host, &sckpt)?;

        for p in procset {
            p.auroid.store(slsp.oid, Ordering::Relaxed);
            let _ = ctx.procs_reg.add(p.pid, slsp.oid);
            ckpt_metadata(p, procset, &sckpt)?;
        }

        vm::procset_shadow(procset, &sckpt, slsp.is_full_ckpt())
    };

    if let Err(e) = capture.await {
        // Abort: undo the object tree modifications, release everyone,
        // and retire the ticket so later passes are not wedged.
        ckpt_cont(procset, pcaller);
        drop(sckpt);
        slsp.epoch_advance(ticket).await;
        if slsp.attr.period_ms == 0 {
            slsp.signal(Err(e.clone()));
        }
        return Err(e);
    }

    for p in procset {
        debug_assert!(Some(p.pid) == pcaller || p.is_stopped(), "process not stopped");
    }

    // The pause is over; everything left runs against frozen shadows.
    ckpt_cont(procset, pcaller);
    if slsp.attr.period_ms == 0 {
        slsp.signal(Ok(()));
    }

    if !slsp.attr.no_ckpt() || (slsp.attr.mode == Mode::Delta && slsp.sckpt().is_some()) {
        if let Err(e) = ckpt_initio(ctx, slsp, &sckpt).await {
            warn!(error = %e, "checkpoint i/o failed");
            slsp.epoch_advance(ticket).await;
            return Err(e);
        }
    }

    slsp.epoch_advance(ticket).await;

    // Collapse before making the partition available again so region
    // snapshots cannot see a half-merged table.
    ckpt_compact(slsp, sckpt);

    let state = slsp
        .set_state(PartState::Checkpointing, PartState::Available, false)
        .await;
    debug_assert!(state.is_ok(), "partition left checkpointing state");

    debug!("checkpointed partition once");
    Ok(())
}

/// The per-partition checkpoint daemon: one-shot or periodic.
pub(crate) async fn checkpointd(
    ctx: CkptCtx,
    slsp: Arc<Partition>,
    pcaller: Option<u64>,
    recurse: bool,
    nextepoch: Arc<parking_lot::Mutex<Option<u64>>>,
) {
    let period = slsp.attr.period_ms;

    loop {
        let start = Instant::now();
        ctx.stats.ckpt_attempted.fetch_add(1, Ordering::Relaxed);

        // Wait for the partition; a sleeping transition only fails once
        // the partition detaches, which ends the daemon.
        if slsp
            .set_state(PartState::Available, PartState::Checkpointing, true)
            .await
            .is_err()
        {
            debug!("partition detached, daemon exiting");
            if period == 0 {
                slsp.signal(Err(SlsError::invalid("partition is detached")));
            }
            break;
        }

        if ctx.exiting.load(Ordering::Relaxed) {
            let _ = slsp
                .set_state(PartState::Checkpointing, PartState::Available, false)
                .await;
            if period == 0 {
                slsp.signal(Err(SlsError::busy("module is exiting")));
            }
            break;
        }

        let procset = match ckpt_gather(&ctx, &slsp, pcaller, recurse) {
            Ok(set) => set,
            Err(e) => {
                let _ = slsp
                    .set_state(PartState::Checkpointing, PartState::Available, false)
                    .await;
                slsp.signal(Err(e));
                break;
            }
        };

        ckpt_stop(&procset, pcaller);

        let ticket = slsp.epoch_preadvance();
        *nextepoch.lock() = Some(ticket);

        match sls_ckpt(&ctx, &procset, pcaller, &slsp, ticket).await {
            Ok(()) => {
                ctx.stats.ckpt_done.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "checkpoint failed");
                // sls_ckpt advanced or will never advance; make sure the
                // ticket is not left dangling for later passes.
                let _ = slsp
                    .set_state(PartState::Checkpointing, PartState::Available, false)
                    .await;
                if !e.is_transient() {
                    break;
                }
            }
        }

        if period == 0 {
            break;
        }

        let elapsed = start.elapsed();
        let budget = Duration::from_millis(period);
        if elapsed < budget {
            tokio::time::sleep(budget - elapsed).await;
        }
    }
}

/// Region-scoped snapshot: capture one caller-specified anonymous entry,
/// dump it (asynchronously if asked), and advance the epoch through the
/// same ticket protocol full passes use.
#[instrument(skip_all, fields(oid = slsp.oid, addr))]
pub(crate) async fn ckpt_dataregion(
    ctx: CkptCtx,
    slsp: Arc<Partition>,
    p: Arc<Process>,
    addr: u64,
) -> Result<u64> {
    // Region snapshots refine an existing checkpoint.
    if (slsp.attr.target == Target::Memory || slsp.attr.mode == Mode::Delta)
        && slsp.sckpt().is_none()
    {
        return Err(SlsError::invalid("no checkpoint to snapshot against"));
    }

    slsp.set_state(PartState::Available, PartState::Checkpointing, true)
        .await
        .map_err(|_| SlsError::invalid("partition is detached"))?;

    let result = dataregion_capture(&ctx, &slsp, &p, addr).await;
    let (sckpt, ticket) = match result {
        Ok(pair) => pair,
        Err(e) => {
            let state = slsp
                .set_state(PartState::Checkpointing, PartState::Available, false)
                .await;
            debug_assert!(state.is_ok());
            return Err(e);
        }
    };

    let stats = ctx.stats.clone();
    let backend = ctx.backend.clone();
    let slsp2 = slsp.clone();
    let dump = async move {
        stats.memsnap_attempted.fetch_add(1, Ordering::Relaxed);
        if slsp2.attr.target == Target::Slos {
            if let Some(backend) = backend {
                if let Err(e) = backend.write_data(&slsp2, &sckpt).await {
                    warn!(error = %e, "region dump failed");
                }
            }
        }

        // Fold into the resident checkpoint before the partition becomes
        // available, or drop the shadows for full disk targets.
        if slsp2.attr.target == Target::Memory || slsp2.attr.mode == Mode::Delta {
            if let Some(resident) = slsp2.sckpt() {
                resident.absorb(sckpt);
            }
        } else {
            drop(sckpt);
        }

        slsp2.epoch_advance(ticket).await;
        let state = slsp2
            .set_state(PartState::Checkpointing, PartState::Available, false)
            .await;
        debug_assert!(state.is_ok());
        stats.memsnap_done.fetch_add(1, Ordering::Relaxed);
    };

    if slsp.attr.async_snap() {
        ctx.taskq.spawn(dump);
    } else {
        dump.await;
    }

    Ok(ticket)
}

async fn dataregion_capture(
    _ctx: &CkptCtx,
    slsp: &Arc<Partition>,
    p: &Arc<Process>,
    addr: u64,
) -> Result<(Arc<CkptData>, u64)> {
    if !slsp.has_proc(p.pid) {
        return Err(SlsError::invalid("process is not in the partition"));
    }

    let sckpt = CkptData::new(slsp.attr);

    p.boundary_stop();
    let capture = (|| {
        let space = p.vmspace();
        let entry = space
            .lookup(addr)
            .ok_or_else(|| SlsError::invalid("no mapping at the requested address"))?;
        // Requests must be aligned to a map entry.
        if entry.start != addr {
            return Err(SlsError::invalid("address is not the start of a mapping"));
        }
        let obj = entry
            .object
            .clone()
            .ok_or_else(|| SlsError::invalid("guard entries cannot be snapshot"))?;
        if !obj.is_anonymous() {
            return Err(SlsError::invalid("only anonymous memory can be snapshot"));
        }
        // Shared objects cannot be privately shadowed out of one entry.
        if obj.refs() > 1 {
            return Err(SlsError::invalid("region object is shared"));
        }

        vmobject::vmobj_checkpoint(&obj, &sckpt)?;
        vm::entry_shadow(p, &sckpt, &entry, slsp.is_full_ckpt())
    })();

    match capture {
        Ok(()) => {
            let ticket = slsp.epoch_preadvance();
            p.boundary_end();
            Ok((sckpt, ticket))
        }
        Err(e) => {
            p.boundary_end();
            Err(e)
        }
    }
}
