//! Page I/O pipeline and the table task queue.
//!
//! Writeback walks an object's resident pages and groups maximal runs of
//! logically contiguous pages into buffers capped at `contig_limit`.
//! Every page in a buffer is flagged swap-in-progress before the backend
//! sees it; completion clears the flags, wakes faulting waiters, drops the
//! object's paging-in-progress count, and tells the prefault tracker which
//! range is now present in the backend.
//!
//! Reading is symmetric: [`fetch_object`] walks the backend's extents,
//! grabs busy pages for each run (capped at the same `contig_limit`),
//! submits the read, and retires the run through the completion path.
//! [`page_in`] is the fault-shaped entry: given `(object, pindex,
//! want-before, want-after)` it clips the window to one buffer and brings
//! those pages in. Both block behind any page another reader already has
//! in flight, which is what makes concurrent grabs of the same object
//! safe.
//!
//! The task queue is the asynchronous half: backends hand it work items
//! that carry a shared error slot, and a pass drains it before declaring
//! an epoch durable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{Result, SlsError};
use crate::host::vm::{PAGE_SIZE, Pindex, VmObject};
use crate::prefault::PrefaultTable;
use crate::record::SlsId;
use crate::stats::SlsStats;

/// Where page buffers go: the backend's data sink for one object.
#[async_trait]
pub trait PageSink: Send {
    /// Write `data` (whole pages) starting at page `pindex` of the
    /// object's data region.
    async fn write_pages(&mut self, objid: SlsId, pindex: Pindex, data: &[u8]) -> Result<()>;
}

/// One buffered write: a maximal contiguous run of resident pages.
struct WriteRun {
    start: Pindex,
    idxs: Vec<Pindex>,
}

fn collect_runs(obj: &Arc<VmObject>, max_pages: u64, full: bool) -> Vec<WriteRun> {
    let mut runs = Vec::new();
    let mut next = 0;
    loop {
        let resident = if full {
            obj.chain_resident_from(next)
        } else {
            obj.resident_from(next)
        };
        let Some(&first) = resident.first() else {
            break;
        };
        let mut idxs = vec![first];
        for &p in resident.iter().skip(1) {
            if p != idxs.last().unwrap() + 1 || idxs.len() as u64 >= max_pages {
                break;
            }
            idxs.push(p);
        }
        next = idxs.last().unwrap() + 1;
        runs.push(WriteRun { start: first, idxs });
    }
    runs
}

/// Dump the pages of a frozen object through `sink`. A full dump walks
/// the backing chain so the artifact stands alone; a delta dump takes
/// only the object's own resident pages, layering over what the backend
/// already holds.
pub async fn dump_object(
    objid: SlsId,
    obj: &Arc<VmObject>,
    contig_pages: u64,
    full: bool,
    sink: &mut dyn PageSink,
    stats: &SlsStats,
    prefault: &PrefaultTable,
) -> Result<()> {
    for run in collect_runs(obj, contig_pages, full) {
        obj.begin_io(&run.idxs);

        let mut buf = Vec::with_capacity(run.idxs.len() * PAGE_SIZE);
        for &p in &run.idxs {
            if full {
                buf.extend_from_slice(&obj.chain_read(p));
            } else {
                match obj.page_lookup(p) {
                    Some(page) => buf.extend_from_slice(&page),
                    None => buf.extend_from_slice(&[0u8; PAGE_SIZE]),
                }
            }
        }

        let res = sink.write_pages(objid, run.start, &buf).await;

        // Completion side: clear the flags and wake waiters whether the
        // write worked or not, then account and notify on success.
        obj.complete_io(&run.idxs);
        res?;

        stats.add_io();
        stats.add_written(buf.len() as u64);
        stats.add_pages(run.idxs.len() as u64);
        prefault.notify(objid, run.start, run.idxs.len() as u64);
    }
    Ok(())
}

/// Where page buffers come from: the backend's data source for one
/// object.
#[async_trait]
pub trait PageSource: Send {
    /// The next run of pages the backend holds at or after `from`, as
    /// `(first page, count)`; `None` once past the last extent.
    async fn next_extent(&mut self, objid: SlsId, from: Pindex) -> Result<Option<(Pindex, u64)>>;

    /// Read `count` whole pages starting at `pindex` of the object's
    /// data region. Holes come back zero-filled.
    async fn read_pages(&mut self, objid: SlsId, pindex: Pindex, count: u64) -> Result<Vec<u8>>;
}

/// Grab the still-absent pages of a window, blocking behind any page a
/// concurrent reader has in flight. Returns the grabbed indices.
async fn grab_window(obj: &Arc<VmObject>, start: Pindex, count: u64) -> Vec<Pindex> {
    let mut idxs = Vec::with_capacity(count as usize);
    for p in start..start + count {
        obj.wait_page(p).await;
        if obj.page_lookup(p).is_none() {
            idxs.push(p);
        }
    }
    if !idxs.is_empty() {
        obj.grab_busy(&idxs);
    }
    idxs
}

/// Fill grabbed pages from a read buffer and retire the run. All-zero
/// pages are dropped when `prune_zero` is set; file systems round
/// allocations to their own block size, and a zeroed page would shadow
/// real ancestor data.
fn fill_window(
    obj: &Arc<VmObject>,
    start: Pindex,
    idxs: &[Pindex],
    data: &[u8],
    prune_zero: bool,
    stats: &SlsStats,
) {
    for &p in idxs {
        let off = ((p - start) as usize) * PAGE_SIZE;
        let chunk = data.get(off..off + PAGE_SIZE).unwrap_or(&[]);
        if prune_zero && chunk.iter().all(|&b| b == 0) {
            obj.page_remove(p);
        } else {
            obj.page_fill(p, chunk);
            stats.add_read(PAGE_SIZE as u64);
        }
    }
    stats.add_io();
    obj.complete_io(idxs);
}

/// Bring every page a backend holds for an object into memory, one
/// buffered read per contiguous run.
pub async fn fetch_object(
    objid: SlsId,
    obj: &Arc<VmObject>,
    contig_pages: u64,
    prune_zero: bool,
    source: &mut dyn PageSource,
    stats: &SlsStats,
) -> Result<()> {
    let mut from = 0;
    while let Some((start, count)) = source.next_extent(objid, from).await? {
        let mut off = start;
        let mut left = count;
        while left > 0 {
            let take = left.min(contig_pages.max(1));
            let idxs = grab_window(obj, off, take).await;
            if !idxs.is_empty() {
                match source.read_pages(objid, off, take).await {
                    Ok(data) => fill_window(obj, off, &idxs, &data, prune_zero, stats),
                    Err(e) => {
                        // Completion still runs so waiters are not wedged
                        // behind a failed read.
                        obj.complete_io(&idxs);
                        return Err(e);
                    }
                }
            }
            off += take;
            left -= take;
        }
        from = start + count;
    }
    Ok(())
}

/// Fault-shaped page-in: produce the page at `pindex` plus as much of the
/// wanted before/after window as fits in one buffer. Sleeps on the page
/// if another reader already has it in flight.
pub async fn page_in(
    objid: SlsId,
    obj: &Arc<VmObject>,
    pindex: Pindex,
    want_before: u64,
    want_after: u64,
    contig_pages: u64,
    source: &mut dyn PageSource,
    stats: &SlsStats,
) -> Result<()> {
    obj.wait_page(pindex).await;
    if obj.page_lookup(pindex).is_some() {
        return Ok(());
    }

    let (start, count) = clip_readahead(
        pindex,
        want_before,
        want_after,
        contig_pages.max(1),
        obj.size_pages(),
    );
    let idxs = grab_window(obj, start, count).await;
    if idxs.is_empty() {
        return Ok(());
    }
    match source.read_pages(objid, start, count).await {
        Ok(data) => {
            fill_window(obj, start, &idxs, &data, true, stats);
            Ok(())
        }
        Err(e) => {
            obj.complete_io(&idxs);
            Err(e)
        }
    }
}

/// Clip a read-ahead request so the whole transfer fits in one buffer.
/// Returns the first page to read and the count, honoring the wanted
/// before/after window around `pindex`.
pub fn clip_readahead(
    pindex: Pindex,
    want_before: u64,
    want_after: u64,
    max_pages: u64,
    obj_size: u64,
) -> (Pindex, u64) {
    debug_assert!(max_pages >= 1);
    let before = want_before.min(pindex).min(max_pages - 1);
    let start = pindex - before;
    let after = want_after.min(max_pages - 1 - before);
    let end = (pindex + after + 1).min(obj_size.max(pindex + 1));
    (start, end - start)
}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Shared error slot for asynchronous work items. The first failure
/// sticks and is surfaced when the caller drains the queue or waits on
/// the epoch.
#[derive(Clone, Default)]
pub struct ErrorSlot(Arc<Mutex<Option<SlsError>>>);

impl ErrorSlot {
    pub fn set(&self, err: SlsError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<SlsError> {
        self.0.lock().take()
    }

    pub fn check(&self) -> Result<()> {
        match self.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct TaskQueueState {
    outstanding: Mutex<u64>,
    drained: Notify,
}

/// The shared background work queue.
pub struct TaskQueue {
    tx: flume::Sender<Job>,
    state: Arc<TaskQueueState>,
}

impl TaskQueue {
    /// Start `workers` tasks servicing the queue.
    pub fn start(workers: usize) -> Self {
        let (tx, rx) = flume::unbounded::<Job>();
        let state = Arc::new(TaskQueueState {
            outstanding: Mutex::new(0),
            drained: Notify::new(),
        });
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok(job) = rx.recv_async().await {
                    job.await;
                    let mut n = state.outstanding.lock();
                    *n -= 1;
                    if *n == 0 {
                        drop(n);
                        state.drained.notify_waiters();
                    }
                }
            });
        }
        Self { tx, state }
    }

    /// Enqueue a work item.
    pub fn spawn(&self, job: impl Future<Output = ()> + Send + 'static) {
        *self.state.outstanding.lock() += 1;
        if self.tx.send(Box::pin(job)).is_err() {
            warn!("task queue is shut down, dropping work item");
            let mut n = self.state.outstanding.lock();
            *n -= 1;
        }
    }

    /// Wait until every queued item has run.
    pub async fn drain(&self) {
        loop {
            let notified = self.state.drained.notified();
            if *self.state.outstanding.lock() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::vm::ObjKind;

    struct CollectSink(Vec<(Pindex, usize)>);

    #[async_trait]
    impl PageSink for CollectSink {
        async fn write_pages(&mut self, _objid: SlsId, pindex: Pindex, data: &[u8]) -> Result<()> {
            self.0.push((pindex, data.len() / PAGE_SIZE));
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_respect_contig_limit() {
        let obj = VmObject::alloc(ObjKind::Default, 64);
        for p in [0u64, 1, 2, 3, 10, 11, 40] {
            obj.page_insert(p, b"x");
        }
        let stats = SlsStats::default();
        let prefault = PrefaultTable::default();
        let mut sink = CollectSink(Vec::new());
        dump_object(7, &obj, 2, false, &mut sink, &stats, &prefault)
            .await
            .unwrap();
        assert_eq!(sink.0, vec![(0, 2), (2, 2), (10, 2), (40, 1)]);
        assert_eq!(stats.snapshot().pages_grabbed, 7);
        // Completion ran for every buffer.
        assert!(!obj.page_in_progress(0));
        assert!(!obj.page_in_progress(40));
    }

    /// A source over fixed extents that records the run shape of every
    /// read it serves.
    struct ExtentSource {
        extents: Vec<(Pindex, u64)>,
        reads: Vec<(Pindex, u64)>,
    }

    #[async_trait]
    impl PageSource for ExtentSource {
        async fn next_extent(
            &mut self,
            _objid: SlsId,
            from: Pindex,
        ) -> Result<Option<(Pindex, u64)>> {
            Ok(self
                .extents
                .iter()
                .copied()
                .find(|&(start, count)| start + count > from)
                .map(|(start, count)| {
                    let first = start.max(from);
                    (first, start + count - first)
                }))
        }

        async fn read_pages(&mut self, _objid: SlsId, pindex: Pindex, count: u64) -> Result<Vec<u8>> {
            self.reads.push((pindex, count));
            let mut data = vec![0u8; (count as usize) * PAGE_SIZE];
            for i in 0..count {
                // Page 9 stays all-zero to exercise pruning.
                if pindex + i != 9 {
                    data[(i as usize) * PAGE_SIZE] = (pindex + i) as u8 + 1;
                }
            }
            Ok(data)
        }
    }

    #[tokio::test]
    async fn fetch_reads_runs_and_prunes_zero_pages() {
        let obj = VmObject::alloc(ObjKind::Default, 64);
        let stats = SlsStats::default();
        let mut source = ExtentSource {
            extents: vec![(0, 3), (8, 2)],
            reads: Vec::new(),
        };
        fetch_object(7, &obj, 2, true, &mut source, &stats).await.unwrap();

        // Runs capped at two pages each.
        assert_eq!(source.reads, vec![(0, 2), (2, 1), (8, 2)]);
        assert_eq!(obj.resident_count(), 4);
        assert_eq!(obj.page_lookup(2).unwrap()[0], 3);
        // The all-zero page was pruned, and nothing is left in progress.
        assert!(obj.page_lookup(9).is_none());
        for p in 0..10 {
            assert!(!obj.page_in_progress(p));
        }
    }

    #[tokio::test]
    async fn page_in_clips_and_skips_resident() {
        let obj = VmObject::alloc(ObjKind::Default, 32);
        let stats = SlsStats::default();
        let mut source = ExtentSource {
            extents: vec![(0, 32)],
            reads: Vec::new(),
        };

        // The window around page 10 is clipped to one buffer.
        page_in(7, &obj, 10, 2, 8, 4, &mut source, &stats).await.unwrap();
        assert_eq!(source.reads, vec![(8, 4)]);
        assert!(obj.page_lookup(10).is_some());

        // A second fault on a now-resident page does no I/O.
        page_in(7, &obj, 10, 2, 8, 4, &mut source, &stats).await.unwrap();
        assert_eq!(source.reads.len(), 1);
    }

    #[tokio::test]
    async fn grab_blocks_behind_a_page_in_flight() {
        let obj = VmObject::alloc(ObjKind::Default, 4);
        obj.page_insert(0, b"busy");
        obj.begin_io(&[0]);

        let obj2 = obj.clone();
        let waiter = tokio::spawn(async move {
            obj2.wait_page(0).await;
            obj2.page_lookup(0).is_some()
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        obj.complete_io(&[0]);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn readahead_is_clipped() {
        // Window fits: read 2 before and 3 after.
        assert_eq!(clip_readahead(10, 2, 3, 16, 100), (8, 6));
        // Capped by the buffer size.
        assert_eq!(clip_readahead(10, 8, 8, 4, 100), (7, 4));
        // Start of object clamps the read-behind.
        assert_eq!(clip_readahead(1, 4, 0, 16, 100), (0, 2));
        // End of object clamps the read-ahead.
        assert_eq!(clip_readahead(98, 0, 8, 16, 100), (98, 2));
    }

    #[tokio::test]
    async fn task_queue_drains_and_reports_errors() {
        let q = TaskQueue::start(2);
        let slot = ErrorSlot::default();
        for i in 0..8 {
            let slot = slot.clone();
            q.spawn(async move {
                if i == 5 {
                    slot.set(SlsError::gone("worker 5"));
                }
            });
        }
        q.drain().await;
        assert!(slot.check().is_err());
        assert!(slot.check().is_ok());
    }
}
