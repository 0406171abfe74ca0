//! The file-tree backend.
//!
//! One directory per (partition, epoch); inside it, one file per record
//! named by SLS-ID. Data record files carry a length-prefixed metadata
//! header in their first page and page `p` at byte offset `(p + 1) *
//! PAGE_SIZE`. The manifest file (named after the partition OID) lists the
//! data-record IDs followed by the metadata blob. File systems round
//! allocations to their own block size, so all-zero pages are pruned at
//! read-back rather than trusted.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::config::SlsConfig;
use crate::error::{Result, SlsError};
use crate::host::vm::{ObjKind, PAGE_SIZE, Pindex, VmObject};
use crate::io::{self, PageSink};
use crate::partition::{CkptData, PartBacking, Partition, PartitionSerial, Target};
use crate::prefault::PrefaultTable;
use crate::record::{Record, RecordType, SlsId};
use crate::stats::SlsStats;

use super::{Backend, RestoredCkpt};

pub struct FileTreeBackend {
    config: SlsConfig,
    stats: Arc<SlsStats>,
    prefault: Arc<PrefaultTable>,
}

impl FileTreeBackend {
    pub fn new(
        config: SlsConfig,
        stats: Arc<SlsStats>,
        prefault: Arc<PrefaultTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats,
            prefault,
        })
    }

    fn root_of(slsp: &Partition) -> Result<PathBuf> {
        match &slsp.backing {
            PartBacking::Dir(dir) => Ok(dir.clone()),
            _ => Err(SlsError::invalid("file-tree partition without a directory")),
        }
    }

    /// Highest-numbered epoch directory, the latest complete checkpoint.
    async fn latest_epoch_dir(root: &PathBuf) -> Result<PathBuf> {
        let mut best: Option<(u64, PathBuf)> = None;
        let mut entries = fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(epoch) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            if best.as_ref().is_none_or(|(e, _)| epoch > *e) {
                best = Some((epoch, entry.path()));
            }
        }
        best.map(|(_, p)| p)
            .ok_or_else(|| SlsError::gone("no checkpoint directories"))
    }
}

struct FileSink {
    file: fs::File,
    drop_io: bool,
}

#[async_trait]
impl PageSink for FileSink {
    async fn write_pages(&mut self, _objid: SlsId, pindex: Pindex, data: &[u8]) -> Result<()> {
        if self.drop_io {
            return Ok(());
        }
        self.file
            .seek(std::io::SeekFrom::Start((pindex + 1) * PAGE_SIZE as u64))
            .await?;
        self.file.write_all(data).await?;
        Ok(())
    }
}

async fn write_data_record(
    backend: &FileTreeBackend,
    dir: &PathBuf,
    rec: &Record,
    sckpt: &CkptData,
) -> Result<()> {
    let path = dir.join(format!("{}", rec.id()));
    let mut file = fs::File::create(&path).await?;

    // Header block: length-prefixed metadata.
    let mut header = Vec::with_capacity(8 + rec.len());
    header.extend_from_slice(&(rec.len() as u64).to_le_bytes());
    header.extend_from_slice(rec.data());
    if header.len() > PAGE_SIZE {
        return Err(SlsError::invalid("record metadata exceeds the header block"));
    }
    file.write_all(&header).await?;

    if let Some(obj) = sckpt.data_objs.find(rec.id()) {
        let mut sink = FileSink {
            file,
            drop_io: backend.config.drop_io,
        };
        io::dump_object(
            rec.id(),
            &obj,
            backend.config.contig_pages(),
            sckpt.attr.mode == crate::partition::Mode::Full,
            &mut sink,
            &backend.stats,
            &backend.prefault,
        )
        .await?;
        sink.file.sync_data().await?;
    } else {
        file.sync_data().await?;
    }
    Ok(())
}

/// Read-side counterpart of [`FileSink`]. The tree has no seek-hole, so
/// the whole page region is one extent; the underlying file system may
/// have materialized zero blocks, which the zero-prune on the fetch path
/// drops (a zeroed page would shadow real ancestor data).
struct FileSource {
    file: fs::File,
    npages: u64,
}

#[async_trait]
impl io::PageSource for FileSource {
    async fn next_extent(&mut self, _objid: SlsId, from: Pindex) -> Result<Option<(Pindex, u64)>> {
        if from >= self.npages {
            return Ok(None);
        }
        Ok(Some((from, self.npages - from)))
    }

    async fn read_pages(&mut self, _objid: SlsId, pindex: Pindex, count: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; (count as usize) * PAGE_SIZE];
        self.file
            .seek(std::io::SeekFrom::Start((pindex + 1) * PAGE_SIZE as u64))
            .await?;
        let mut filled = 0;
        while filled < data.len() {
            match self.file.read(&mut data[filled..]).await? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(data)
    }
}

async fn read_data_record(
    backend: &FileTreeBackend,
    path: &PathBuf,
    out: &RestoredCkpt,
) -> Result<()> {
    let mut file = fs::File::open(path).await?;
    let flen = file.metadata().await?.len();

    let mut lenbuf = [0u8; 8];
    file.read_exact(&mut lenbuf).await?;
    let metalen = u64::from_le_bytes(lenbuf) as usize;
    if metalen + 8 > PAGE_SIZE {
        return Err(SlsError::protocol("data record header overruns its block"));
    }
    let mut meta = vec![0u8; metalen];
    file.read_exact(&mut meta).await?;

    let (slsid, size, kind) = super::vmobj_header(&meta)?;
    let rec = Record::sealed(slsid, RecordType::VmObject, meta);

    if matches!(kind, ObjKind::Default | ObjKind::Swap) {
        let obj = VmObject::alloc(kind, size);
        obj.set_objid(slsid);

        let npages = flen.saturating_sub(PAGE_SIZE as u64).div_ceil(PAGE_SIZE as u64);
        let mut source = FileSource { file, npages };
        io::fetch_object(
            slsid,
            &obj,
            backend.config.contig_pages(),
            true,
            &mut source,
            &backend.stats,
        )
        .await?;
        out.objtable.add(slsid, Some(obj))?;
    }

    out.rectable.add(slsid, rec)?;
    Ok(())
}

#[async_trait]
impl Backend for FileTreeBackend {
    fn target(&self) -> Target {
        Target::FileTree
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    async fn import(&self) -> Result<Vec<PartitionSerial>> {
        Ok(Vec::new())
    }

    async fn export(&self, parts: &[PartitionSerial]) -> Result<()> {
        // Partition descriptors live next to their trees.
        for part in parts {
            debug!(oid = part.oid, epoch = part.epoch, "exported partition");
        }
        Ok(())
    }

    async fn partadd(&self, slsp: &Arc<Partition>) -> Result<()> {
        let root = Self::root_of(slsp)?;
        fs::create_dir_all(&root).await?;
        Ok(())
    }

    async fn setepoch(&self, _oid: u64, _epoch: u64) -> Result<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(oid = slsp.oid))]
    async fn write_ckpt(&self, slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()> {
        let root = Self::root_of(slsp)?;
        let dir = root.join(format!("{}", slsp.epoch()));
        fs::create_dir_all(&dir).await?;

        let serialized = sckpt
            .serialized()
            .ok_or_else(|| SlsError::invalid("checkpoint was not finalized"))?;

        for (_, rec) in sckpt.rectable.entries() {
            if rec.rtype().is_data() {
                write_data_record(self, &dir, &rec, sckpt).await?;
            }
        }

        // Manifest: data-record id list, then the metadata blob.
        let mut manifest = Vec::new();
        manifest.extend_from_slice(&(serialized.dataids.len() as u64).to_le_bytes());
        for id in &serialized.dataids {
            manifest.extend_from_slice(&id.to_le_bytes());
        }
        manifest.extend_from_slice(&serialized.meta);

        let manpath = dir.join(format!("{}", slsp.oid));
        let mut manfile = fs::File::create(&manpath).await?;
        manfile.write_all(&manifest).await?;
        if self.config.vfs_sync {
            manfile.sync_all().await?;
        }
        debug!(dir = %dir.display(), "checkpoint tree written");
        Ok(())
    }

    async fn write_data(&self, slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()> {
        let root = Self::root_of(slsp)?;
        let dir = root.join(format!("{}", slsp.epoch()));
        fs::create_dir_all(&dir).await?;
        for (_, rec) in sckpt.rectable.entries() {
            if rec.rtype().is_data() {
                write_data_record(self, &dir, &rec, sckpt).await?;
            }
        }
        Ok(())
    }

    async fn read_ckpt(&self, slsp: &Arc<Partition>) -> Result<RestoredCkpt> {
        let root = Self::root_of(slsp)?;
        let dir = Self::latest_epoch_dir(&root).await?;
        let out = RestoredCkpt::default();

        let manifest = fs::read(dir.join(format!("{}", slsp.oid))).await?;
        if manifest.len() < 8 {
            return Err(SlsError::protocol("manifest too short"));
        }
        let numids = u64::from_le_bytes(manifest[..8].try_into().unwrap()) as usize;
        let ids_end = 8 + numids * 8;
        if manifest.len() < ids_end {
            return Err(SlsError::protocol("manifest id list truncated"));
        }

        for chunk in manifest[8..ids_end].chunks_exact(8) {
            let id = u64::from_le_bytes(chunk.try_into().unwrap());
            let path = dir.join(format!("{id}"));
            if let Err(e) = read_data_record(self, &path, &out).await {
                warn!(id, error = %e, "data record unreadable");
                return Err(e);
            }
        }

        super::parse_meta_blob(&manifest[ids_end..], &out.rectable)?;
        Ok(out)
    }
}
