//! The local object store backend.
//!
//! Records become inode-like objects keyed by SLS-ID in a sparse block
//! store. Data records put their metadata at logical block 0 and page `p`
//! at block `p + 1`; seek-data/seek-hole walk the sparse extents back out.
//! A manifest object per partition lists the record IDs of its latest
//! checkpoint, and a reserved inode carries the exported partition set.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

use crate::config::SlsConfig;
use crate::error::{Result, SlsError};
use crate::host::vm::{PAGE_SIZE, Pindex, VmObject};
use crate::io::{self, ErrorSlot, PageSink};
use crate::partition::{CkptData, Partition, PartitionSerial, Target};
use crate::prefault::PrefaultTable;
use crate::record::{Record, RecordType, SlsId};
use crate::stats::SlsStats;

use super::{Backend, RestoredCkpt};

/// Inode reserved for the exported partition set, outside both the OID
/// range and the address space record IDs come from.
const PARTS_INO: u64 = u64::MAX;

#[derive(Default)]
struct StoreNode {
    rtype: u64,
    /// Logical block 0: the metadata header.
    meta: Vec<u8>,
    /// Page blocks, keyed by logical block number (pindex + 1).
    blocks: BTreeMap<u64, Box<[u8]>>,
}

/// Sparse, inode-keyed object store with seek-hole/seek-data semantics.
#[derive(Default)]
pub struct ObjStore {
    nodes: Mutex<FxHashMap<u64, StoreNode>>,
}

impl ObjStore {
    /// Ensure an inode exists.
    pub fn svpalloc(&self, ino: u64) {
        self.nodes.lock().entry(ino).or_default();
    }

    pub fn iremove(&self, ino: u64) {
        self.nodes.lock().remove(&ino);
    }

    pub fn exists(&self, ino: u64) -> bool {
        self.nodes.lock().contains_key(&ino)
    }

    /// Record type and metadata length, the record's stat.
    pub fn rstat(&self, ino: u64) -> Result<(u64, u64)> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(&ino)
            .ok_or_else(|| SlsError::gone(format!("no store node {ino:#x}")))?;
        Ok((node.rtype, node.meta.len() as u64))
    }

    /// Overwrite the metadata header.
    pub fn write_meta(&self, ino: u64, rtype: u64, meta: &[u8]) {
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(ino).or_default();
        node.rtype = rtype;
        node.meta = meta.to_vec();
    }

    pub fn read_meta(&self, ino: u64) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(&ino)
            .ok_or_else(|| SlsError::gone(format!("no store node {ino:#x}")))?;
        Ok(node.meta.clone())
    }

    pub fn write_block(&self, ino: u64, blkno: u64, data: &[u8]) {
        debug_assert!(data.len() <= PAGE_SIZE);
        let mut block = vec![0u8; PAGE_SIZE].into_boxed_slice();
        block[..data.len()].copy_from_slice(data);
        self.nodes
            .lock()
            .entry(ino)
            .or_default()
            .blocks
            .insert(blkno, block);
    }

    pub fn read_block(&self, ino: u64, blkno: u64) -> Option<Box<[u8]>> {
        self.nodes
            .lock()
            .get(&ino)
            .and_then(|n| n.blocks.get(&blkno).cloned())
    }

    /// First block at or after `from` that holds data.
    pub fn seek_data(&self, ino: u64, from: u64) -> Option<u64> {
        self.nodes
            .lock()
            .get(&ino)
            .and_then(|n| n.blocks.range(from..).next().map(|(b, _)| *b))
    }

    /// First block at or after `from` that is a hole.
    pub fn seek_hole(&self, ino: u64, from: u64) -> u64 {
        let nodes = self.nodes.lock();
        let Some(node) = nodes.get(&ino) else {
            return from;
        };
        let mut blk = from;
        while node.blocks.contains_key(&blk) {
            blk += 1;
        }
        blk
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }
}

struct StoreSink {
    store: Arc<ObjStore>,
    drop_io: bool,
}

#[async_trait]
impl PageSink for StoreSink {
    async fn write_pages(&mut self, objid: SlsId, pindex: Pindex, data: &[u8]) -> Result<()> {
        if self.drop_io {
            return Ok(());
        }
        for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            self.store.write_block(objid, pindex + 1 + i as u64, chunk);
        }
        Ok(())
    }
}

/// Read-side counterpart of [`StoreSink`]: extents come from the sparse
/// block map via seek-data/seek-hole, shifted by one block for the
/// metadata header.
struct StoreSource {
    store: Arc<ObjStore>,
}

#[async_trait]
impl io::PageSource for StoreSource {
    async fn next_extent(&mut self, objid: SlsId, from: Pindex) -> Result<Option<(Pindex, u64)>> {
        let Some(start_blk) = self.store.seek_data(objid, from + 1) else {
            return Ok(None);
        };
        let end_blk = self.store.seek_hole(objid, start_blk);
        Ok(Some((start_blk - 1, end_blk - start_blk)))
    }

    async fn read_pages(&mut self, objid: SlsId, pindex: Pindex, count: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; (count as usize) * PAGE_SIZE];
        for i in 0..count {
            if let Some(block) = self.store.read_block(objid, pindex + 1 + i) {
                let off = (i as usize) * PAGE_SIZE;
                data[off..off + PAGE_SIZE].copy_from_slice(&block);
            }
        }
        Ok(data)
    }
}

/// The local-store backend proper.
pub struct SlosBackend {
    store: Arc<ObjStore>,
    config: SlsConfig,
    stats: Arc<SlsStats>,
    prefault: Arc<PrefaultTable>,
    taskq: Arc<crate::io::TaskQueue>,
}

impl SlosBackend {
    pub fn new(
        store: Arc<ObjStore>,
        config: SlsConfig,
        stats: Arc<SlsStats>,
        prefault: Arc<PrefaultTable>,
        taskq: Arc<crate::io::TaskQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            stats,
            prefault,
            taskq,
        })
    }

    async fn write_record(&self, rec: &Record, sckpt: &CkptData) -> Result<()> {
        self.store.svpalloc(rec.id());
        self.store
            .write_meta(rec.id(), rec.rtype().tag(), rec.data());
        if !rec.rtype().is_data() {
            return Ok(());
        }

        // Data records: walk the frozen object's resident pages into the
        // sparse blocks.
        let Some(obj) = sckpt.data_objs.find(rec.id()) else {
            // Non-anonymous data never carries pages.
            return Ok(());
        };
        let mut sink = StoreSink {
            store: self.store.clone(),
            drop_io: self.config.drop_io,
        };
        io::dump_object(
            rec.id(),
            &obj,
            self.config.contig_pages(),
            sckpt.attr.mode == crate::partition::Mode::Full,
            &mut sink,
            &self.stats,
            &self.prefault,
        )
        .await
    }

    /// Schedule the eager page read for one object: through the task
    /// queue when asynchronous I/O is on (the read pass drains it before
    /// returning), inline otherwise.
    async fn read_object(&self, ino: u64, obj: &Arc<VmObject>, errors: &ErrorSlot) -> Result<()> {
        let contig = self.config.contig_pages();
        if self.config.async_slos {
            let store = self.store.clone();
            let stats = self.stats.clone();
            let obj = obj.clone();
            let errors = errors.clone();
            self.taskq.spawn(async move {
                let mut source = StoreSource { store };
                if let Err(e) =
                    io::fetch_object(ino, &obj, contig, false, &mut source, &stats).await
                {
                    errors.set(e);
                }
            });
            return Ok(());
        }
        let mut source = StoreSource {
            store: self.store.clone(),
        };
        io::fetch_object(ino, obj, contig, false, &mut source, &self.stats).await
    }

    /// Lazy restore with prefaulting: fault in only the ranges the
    /// tracker knows were touched, one clipped window at a time.
    async fn read_prefault(&self, ino: u64, obj: &Arc<VmObject>) -> Result<()> {
        let contig = self.config.contig_pages();
        let mut source = StoreSource {
            store: self.store.clone(),
        };
        for (start, count) in self.prefault.resident(ino) {
            let mut pindex = start;
            while pindex < start + count {
                io::page_in(
                    ino,
                    obj,
                    pindex,
                    0,
                    start + count - pindex - 1,
                    contig,
                    &mut source,
                    &self.stats,
                )
                .await?;
                pindex += contig.max(1);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for SlosBackend {
    fn target(&self) -> Target {
        Target::Slos
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    async fn import(&self) -> Result<Vec<PartitionSerial>> {
        if !self.store.exists(PARTS_INO) {
            return Ok(Vec::new());
        }
        let raw = self.store.read_meta(PARTS_INO)?;
        serde_json::from_slice(&raw)
            .map_err(|e| SlsError::protocol(format!("partition set corrupt: {e}")))
    }

    async fn export(&self, parts: &[PartitionSerial]) -> Result<()> {
        let raw = serde_json::to_vec(parts)
            .map_err(|e| SlsError::invalid(format!("partition set unserializable: {e}")))?;
        self.store.svpalloc(PARTS_INO);
        self.store
            .write_meta(PARTS_INO, RecordType::Manifest.tag(), &raw);
        Ok(())
    }

    async fn partadd(&self, slsp: &Arc<Partition>) -> Result<()> {
        self.store.svpalloc(slsp.oid);
        Ok(())
    }

    async fn setepoch(&self, oid: u64, epoch: u64) -> Result<()> {
        // The manifest is rewritten whole per checkpoint; the epoch rides
        // in the exported partition set.
        debug!(oid, epoch, "durable epoch");
        Ok(())
    }

    #[instrument(skip_all, fields(oid = slsp.oid))]
    async fn write_ckpt(&self, slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()> {
        let mut manifest_ids = Vec::new();
        for (id, rec) in sckpt.rectable.entries() {
            self.write_record(&rec, sckpt).await?;
            manifest_ids.push(id);
        }

        let mut manifest = Vec::with_capacity(manifest_ids.len() * 8);
        for id in &manifest_ids {
            manifest.extend_from_slice(&id.to_le_bytes());
        }
        self.store.svpalloc(slsp.oid);
        self.store
            .write_meta(slsp.oid, RecordType::Manifest.tag(), &manifest);
        debug!(records = manifest_ids.len(), "checkpoint stored");
        Ok(())
    }

    async fn write_data(&self, _slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()> {
        for (_, rec) in sckpt.rectable.entries() {
            debug_assert!(rec.rtype().is_data(), "region snapshot with metadata records");
            self.write_record(&rec, sckpt).await?;
        }
        Ok(())
    }

    async fn read_ckpt(&self, slsp: &Arc<Partition>) -> Result<RestoredCkpt> {
        let out = RestoredCkpt::default();
        let errors = ErrorSlot::default();

        let manifest = self.store.read_meta(slsp.oid)?;
        if manifest.len() % 8 != 0 {
            return Err(SlsError::protocol("manifest length not id-aligned"));
        }
        let lazy = slsp.attr.lazy_rest();

        for chunk in manifest.chunks_exact(8) {
            let id = u64::from_le_bytes(chunk.try_into().unwrap());
            let (tag, _len) = self.store.rstat(id)?;
            let rtype = RecordType::from_tag(tag)
                .ok_or_else(|| SlsError::protocol(format!("record {id:#x} has bad type")))?;
            let meta = self.store.read_meta(id)?;
            let rec = Record::sealed(id, rtype, meta);

            if rtype.is_data() {
                let (slsid, size, kind) = super::vmobj_header(rec.data())?;
                debug_assert_eq!(slsid, id);
                if matches!(
                    kind,
                    crate::host::vm::ObjKind::Default | crate::host::vm::ObjKind::Swap
                ) {
                    let obj = VmObject::alloc(kind, size);
                    obj.set_objid(id);
                    if !lazy {
                        self.read_object(id, &obj, &errors).await?;
                    } else if slsp.attr.prefault() {
                        self.read_prefault(id, &obj).await?;
                    }
                    out.objtable.add(id, Some(obj))?;
                }
            }
            out.rectable.add(id, rec)?;
        }

        // Page-ins dispatched through the task queue pipeline across
        // records; drain them before handing the table out and surface
        // the first failure.
        self.taskq.drain().await;
        errors.check()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_extents() {
        let store = ObjStore::default();
        store.svpalloc(7);
        store.write_block(7, 1, b"a");
        store.write_block(7, 2, b"b");
        store.write_block(7, 5, b"c");

        assert_eq!(store.seek_data(7, 0), Some(1));
        assert_eq!(store.seek_hole(7, 1), 3);
        assert_eq!(store.seek_data(7, 3), Some(5));
        assert_eq!(store.seek_hole(7, 5), 6);
        assert_eq!(store.seek_data(7, 6), None);
    }

    #[test]
    fn rstat_tracks_meta() {
        let store = ObjStore::default();
        store.write_meta(9, RecordType::Proc.tag(), b"metadata");
        let (tag, len) = store.rstat(9).unwrap();
        assert_eq!(tag, RecordType::Proc.tag());
        assert_eq!(len, 8);
    }
}
