//! Global module state and the control surface.
//!
//! One [`SlsModule`] owns the partition table, the process-to-partition
//! map, the backends, and the shared task queue. Every entry point bumps
//! an in-progress counter; teardown flips the exiting flag, waits for the
//! counter to drain, and detaches every partition. No per-operation
//! locks, one clean shutdown protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::backend::store::{ObjStore, SlosBackend};
use crate::backend::{Backend, filetree::FileTreeBackend, stream};
use crate::ckpt::{self, CkptCtx};
use crate::config::SlsConfig;
use crate::error::{Result, SlsError};
use crate::host::Host;
use crate::host::file::File;
use crate::io::TaskQueue;
use crate::kv::SlsTable;
use crate::partition::{
    Metropolis, Mode, OID_MAX, OID_MIN, PartBacking, PartState, Partition, SlsAttr, Target,
};
use crate::prefault::PrefaultTable;
use crate::rest;
use crate::stats::{SlsStats, StatsSnapshot};

/// The engine. Create one inside a tokio runtime.
pub struct SlsModule {
    pub host: Arc<Host>,
    config: SlsConfig,
    stats: Arc<SlsStats>,
    prefault: Arc<PrefaultTable>,
    store: Arc<ObjStore>,
    taskq: Arc<TaskQueue>,

    parts: SlsTable<Arc<Partition>>,
    /// PID → OID for every process in some partition.
    procs: Arc<SlsTable<u64>>,
    backends: SlsTable<Arc<dyn Backend>>,

    exiting: Arc<AtomicBool>,
    inprog: AtomicU64,
    exitcv: Notify,
}

impl SlsModule {
    pub fn new(config: SlsConfig) -> Arc<Self> {
        Self::with_store(config, Arc::new(ObjStore::default()))
    }

    /// Build the module over an existing object store, the shape a reboot
    /// against a persistent store has.
    pub fn with_store(config: SlsConfig, store: Arc<ObjStore>) -> Arc<Self> {
        let taskq = Arc::new(TaskQueue::start(config.wb_workers));
        Arc::new(Self {
            host: Arc::new(Host::new()),
            config,
            stats: Arc::new(SlsStats::default()),
            prefault: Arc::new(PrefaultTable::default()),
            store,
            taskq,
            parts: SlsTable::new(),
            procs: Arc::new(SlsTable::new()),
            backends: SlsTable::new(),
            exiting: Arc::new(AtomicBool::new(false)),
            inprog: AtomicU64::new(0),
            exitcv: Notify::new(),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(SlsConfig::from_env())
    }

    /// Re-register the partitions a previous incarnation exported into
    /// the store. Returns the imported OIDs.
    pub async fn import(&self) -> Result<Vec<u64>> {
        let _op = self.startop()?;
        let backend = SlosBackend::new(
            self.store.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.prefault.clone(),
            self.taskq.clone(),
        );
        let mut oids = Vec::new();
        for serial in backend.import().await? {
            if self.parts.contains(serial.oid) {
                continue;
            }
            let slsp = Partition::new(serial.oid, serial.attr, serial.backing.clone());
            slsp.adopt_epoch(serial.epoch);
            *slsp.metr.lock() = serial.metr;
            if let Some(backend) = self.backend_for(&serial.attr) {
                backend.partadd(&slsp).await?;
                self.backends.add(serial.oid, backend)?;
            }
            self.parts.add(serial.oid, slsp)?;
            oids.push(serial.oid);
        }
        info!(count = oids.len(), "partitions imported");
        Ok(oids)
    }

    /// Guard global module state for the duration of one operation.
    fn startop(&self) -> Result<OpGuard<'_>> {
        if self.exiting.load(Ordering::Relaxed) {
            return Err(SlsError::busy("module is exiting"));
        }
        self.inprog.fetch_add(1, Ordering::Relaxed);
        Ok(OpGuard { module: self })
    }

    fn find(&self, oid: u64) -> Result<Arc<Partition>> {
        self.parts
            .find(oid)
            .ok_or_else(|| SlsError::invalid(format!("no partition {oid}")))
    }

    fn backend_for(&self, attr: &SlsAttr) -> Option<Arc<dyn Backend>> {
        match attr.target {
            Target::Memory => None,
            Target::Slos => Some(SlosBackend::new(
                self.store.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.prefault.clone(),
                self.taskq.clone(),
            )),
            Target::FileTree => Some(FileTreeBackend::new(
                self.config.clone(),
                self.stats.clone(),
                self.prefault.clone(),
            )),
            Target::SockSend => Some(stream::SendBackend::new(
                self.config.clone(),
                self.stats.clone(),
                self.prefault.clone(),
            )),
            Target::SockRecv => Some(stream::RecvBackend::new()),
        }
    }

    fn ckpt_ctx(&self, oid: u64) -> CkptCtx {
        CkptCtx {
            host: self.host.clone(),
            procs_reg: self.procs.clone(),
            backend: self.backends.find(oid),
            stats: self.stats.clone(),
            taskq: self.taskq.clone(),
            exiting: self.exiting.clone(),
        }
    }

    /// Register a partition. `backing` carries the directory or peer
    /// address for targets that need one.
    #[instrument(skip(self, backing))]
    pub async fn partadd(&self, oid: u64, mut attr: SlsAttr, backing: PartBacking) -> Result<()> {
        let _op = self.startop()?;

        if !(OID_MIN..=OID_MAX).contains(&oid) {
            return Err(SlsError::invalid(format!("oid {oid} out of range")));
        }
        if attr.amplification == 0 {
            return Err(SlsError::invalid("amplification must be at least 1"));
        }
        // Only full checkpoints make sense when the target is memory.
        if attr.target == Target::Memory {
            attr.mode = Mode::Full;
        }
        if self.parts.contains(oid) {
            return Err(SlsError::invalid(format!("partition {oid} exists")));
        }

        let slsp = Partition::new(oid, attr, backing);
        if let Some(backend) = self.backend_for(&attr) {
            backend.setup().await?;
            backend.partadd(&slsp).await?;
            self.backends.add(oid, backend)?;
        }
        self.parts.add(oid, slsp)?;
        info!(oid, "partition registered");
        Ok(())
    }

    /// Detach a partition. Sticky: in-flight daemons observe the state
    /// and exit.
    #[instrument(skip(self))]
    pub async fn partdel(&self, oid: u64) -> Result<()> {
        let _op = self.startop()?;
        let slsp = self.find(oid)?;

        // Wait for any running operation; a benign race with another
        // partdel leaves the partition already detached.
        if slsp
            .set_state(PartState::Available, PartState::Detached, true)
            .await
            .is_err()
        {
            debug_assert_eq!(slsp.state(), PartState::Detached);
        }

        // Remove the processes from the module map and drop the resident
        // checkpoint; its shadows collapse with no successor.
        while let Some(pid) = slsp.procs.pop_key() {
            self.procs.del(pid);
        }
        slsp.set_sckpt(None);

        self.parts.del(oid);
        self.backends.del(oid);
        info!(oid, "partition detached");
        Ok(())
    }

    /// Add a process to a partition.
    pub fn attach(&self, oid: u64, pid: u64) -> Result<()> {
        let _op = self.startop()?;
        if pid == 0 {
            return Err(SlsError::invalid("cannot attach the kernel"));
        }
        if self.procs.contains(pid) {
            return Err(SlsError::invalid(format!("pid {pid} is already in a partition")));
        }
        let slsp = self.find(oid)?;
        let p = self.host.pget(pid)?;

        self.procs.add(pid, oid)?;
        slsp.proc_attach(pid)?;
        p.auroid.store(oid, Ordering::Relaxed);
        debug!(oid, pid, "process attached");
        Ok(())
    }

    /// Whether `pid` belongs to a partition, and which.
    pub fn insls(&self, pid: u64) -> (u64, bool) {
        match self.procs.find(pid) {
            Some(oid) => (oid, true),
            None => (0, false),
        }
    }

    /// Checkpoint a partition: one-shot blocks and returns the epoch
    /// ticket; periodic starts the daemon and returns `None`.
    #[instrument(skip(self))]
    pub async fn checkpoint(&self, oid: u64, recurse: bool) -> Result<Option<u64>> {
        self.checkpoint_with_caller(oid, recurse, None).await
    }

    pub(crate) async fn checkpoint_with_caller(
        &self,
        oid: u64,
        recurse: bool,
        pcaller: Option<u64>,
    ) -> Result<Option<u64>> {
        let _op = self.startop()?;
        let slsp = self.find(oid)?;
        let ctx = self.ckpt_ctx(oid);
        let nextepoch = Arc::new(Mutex::new(None));

        // A caller inside the partition would deadlock against the
        // daemon's stop; it single-threads itself instead and the daemon
        // leaves it alone.
        let oneshot = slsp.attr.period_ms == 0;
        if oneshot {
            if let Some(pid) = pcaller {
                self.host.pget(pid)?.boundary_stop();
            }
        }

        tokio::spawn(ckpt::checkpointd(
            ctx,
            slsp.clone(),
            pcaller,
            recurse,
            nextepoch.clone(),
        ));

        if !oneshot {
            return Ok(None);
        }

        let result = slsp.waitfor().await;
        if let Some(pid) = pcaller {
            if let Ok(p) = self.host.pget(pid) {
                p.boundary_end();
            }
        }
        result?;
        Ok(*nextepoch.lock())
    }

    /// Restore a partition, blocking until every process is back.
    #[instrument(skip(self))]
    pub async fn restore(&self, oid: u64, daemon: bool, rest_stopped: bool) -> Result<()> {
        let _op = self.startop()?;
        let slsp = self.find(oid)?;

        if slsp.attr.target == Target::Memory && slsp.sckpt().is_none() {
            return Err(SlsError::invalid("no in-memory checkpoint to restore"));
        }

        let host = self.host.clone();
        let procs = self.procs.clone();
        let backend = self.backends.find(oid);
        let config = self.config.clone();
        let slsp2 = slsp.clone();
        tokio::spawn(async move {
            let result =
                rest::sls_rest(&host, &procs, backend, &config, slsp2.clone(), daemon, rest_stopped)
                    .await;
            slsp2.signal(result);
        });

        slsp.waitfor().await
    }

    /// Wait for (or query) the durability of an epoch.
    pub async fn epoch_wait(&self, oid: u64, epoch: u64, sync: bool) -> Result<bool> {
        let _op = self.startop()?;
        let slsp = self.find(oid)?;
        Ok(slsp.epoch_wait(epoch, sync).await)
    }

    /// Region-scoped snapshot of the mapping at `addr` in `pid`.
    #[instrument(skip(self))]
    pub async fn memsnap(&self, oid: u64, pid: u64, addr: u64) -> Result<u64> {
        let _op = self.startop()?;
        let slsp = self.find(oid)?;
        let p = self.host.pget(pid)?;
        ckpt::ckpt_dataregion(self.ckpt_ctx(oid), slsp, p, addr).await
    }

    /// Record the Metropolis slots at the moment of a captured `accept()`
    /// and run the accompanying recursive checkpoint. The process exits
    /// once captured, as the real interposed call would make it.
    #[instrument(skip(self, sockfp))]
    pub async fn metropolis_register(
        &self,
        oid: u64,
        pid: u64,
        tid: u64,
        sockfp: Arc<File>,
    ) -> Result<()> {
        {
            let _op = self.startop()?;
            let p = self.host.pget(pid)?;
            if !self.procs.contains(pid) {
                self.procs.add(pid, oid)?;
                self.find(oid)?.proc_attach(pid)?;
                p.auroid.store(oid, Ordering::Relaxed);
            }
        }

        self.checkpoint_with_caller(oid, true, Some(pid)).await?;

        let slsp = self.find(oid)?;
        {
            let p = self.host.pget(pid)?;
            let mut metr = slsp.metr.lock();
            metr.proc_slsid = p.addr;
            metr.tid = tid;
            metr.sockid = match &sockfp.backing {
                crate::host::file::FileBacking::Socket(so) => so.addr,
                _ => return Err(SlsError::invalid("metropolis fd is not a socket")),
            };
        }

        // The captured process exits; it lives on only in the artifact.
        self.host.reap(pid);
        self.procs.del(pid);
        slsp.proc_detach(pid);
        Ok(())
    }

    /// Hand the restore path a freshly accepted connection for the
    /// Metropolis splice.
    pub fn set_metr_sock(&self, oid: u64, sockfp: Arc<File>) -> Result<()> {
        let slsp = self.find(oid)?;
        *slsp.metr_sockfp.lock() = Some(sockfp);
        Ok(())
    }

    pub fn metropolis(&self, oid: u64) -> Result<Metropolis> {
        Ok(*self.find(oid)?.metr.lock())
    }

    pub fn epoch(&self, oid: u64) -> Result<u64> {
        Ok(self.find(oid)?.epoch())
    }

    pub fn partition(&self, oid: u64) -> Result<Arc<Partition>> {
        self.find(oid)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<ObjStore> {
        &self.store
    }

    /// Tear the module down: refuse new operations, wait for in-flight
    /// ones, export the partition set, detach everything.
    #[instrument(skip(self))]
    pub async fn teardown(&self) -> Result<()> {
        self.exiting.store(true, Ordering::Relaxed);

        // Wait for every in-flight operation to drain; teardown never
        // force-cancels.
        loop {
            let notified = self.exitcv.notified();
            if self.inprog.load(Ordering::Relaxed) == 0 {
                break;
            }
            notified.await;
        }
        self.taskq.drain().await;

        // Export the whole partition set through every backend in play;
        // backends sharing storage simply rewrite the same set.
        let serials: Vec<_> = self
            .parts
            .entries()
            .into_iter()
            .map(|(_, slsp)| slsp.serial())
            .collect();
        for (oid, _) in self.parts.entries() {
            if let Some(backend) = self.backends.find(oid) {
                if let Err(e) = backend.export(&serials).await {
                    tracing::warn!(oid, error = %e, "partition export failed");
                }
                let _ = backend.teardown().await;
            }
        }

        while let Some((oid, slsp)) = self.parts.pop() {
            // Wait for any pass still running; teardown never cancels.
            if slsp
                .set_state(PartState::Available, PartState::Detached, true)
                .await
                .is_err()
            {
                debug_assert_eq!(slsp.state(), PartState::Detached);
            }
            while let Some(pid) = slsp.procs.pop_key() {
                self.procs.del(pid);
            }
            slsp.set_sckpt(None);
            self.backends.del(oid);
        }
        info!("module torn down");
        Ok(())
    }
}

struct OpGuard<'a> {
    module: &'a SlsModule,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let prev = self.module.inprog.fetch_sub(1, Ordering::Relaxed);
        if prev == 1 {
            self.module.exitcv.notify_waiters();
        }
    }
}
