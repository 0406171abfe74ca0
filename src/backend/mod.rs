//! Persistence backends.
//!
//! A backend virtualizes where checkpoints go and come from behind a
//! fixed operation set: lifecycle (`setup`/`teardown`), partition-set
//! durability (`import`/`export`), per-partition registration
//! (`partadd`), the durable epoch watermark (`setepoch`), and the actual
//! record traffic (`write_ckpt`/`read_ckpt`). The known backends are the
//! local object store, a directory tree, and a streaming network peer.

pub mod filetree;
pub mod store;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, SlsError};
use crate::host::vm::VmObject;
use crate::kv::SlsTable;
use crate::partition::{CkptData, Partition, PartitionSerial, Target};
use crate::record::{Record, RecordType, SlsId};

/// What a backend hands back for a restore: the record table plus any VM
/// objects it already reconstructed while reading data records.
#[derive(Default)]
pub struct RestoredCkpt {
    pub rectable: SlsTable<Arc<Record>>,
    pub objtable: SlsTable<Option<Arc<VmObject>>>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn target(&self) -> Target;

    async fn setup(&self) -> Result<()>;

    async fn teardown(&self) -> Result<()>;

    /// Load the partition set persisted by a previous incarnation.
    async fn import(&self) -> Result<Vec<PartitionSerial>>;

    /// Persist the partition set at shutdown.
    async fn export(&self, parts: &[PartitionSerial]) -> Result<()>;

    /// A partition using this backend was registered.
    async fn partadd(&self, slsp: &Arc<Partition>) -> Result<()>;

    /// Persist the most recent durable epoch of a partition.
    async fn setepoch(&self, oid: u64, epoch: u64) -> Result<()>;

    /// Serialize a finalized checkpoint.
    async fn write_ckpt(&self, slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()>;

    /// Write only the data records of a checkpoint (region snapshots).
    async fn write_data(&self, slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()>;

    /// Produce the record table of the most recent checkpoint.
    async fn read_ckpt(&self, slsp: &Arc<Partition>) -> Result<RestoredCkpt>;
}

/// Parse a metadata blob (`[id][tag][len][bytes]` repeated) into records.
pub fn parse_meta_blob(buf: &[u8], rectable: &SlsTable<Arc<Record>>) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        if off + 24 > buf.len() {
            return Err(SlsError::protocol("metadata blob truncated"));
        }
        let id = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let tag = u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap());
        let len = u64::from_le_bytes(buf[off + 16..off + 24].try_into().unwrap()) as usize;
        off += 24;
        if off + len > buf.len() {
            return Err(SlsError::protocol("metadata record overruns blob"));
        }
        let rtype = RecordType::from_tag(tag)
            .ok_or_else(|| SlsError::protocol(format!("unknown record tag {tag:#x}")))?;
        let rec = Record::sealed(id, rtype, buf[off..off + len].to_vec());
        rectable.add(id, rec)?;
        off += len;
    }
    Ok(())
}

/// Decode the identity/size/kind header out of raw VM-object record
/// bytes.
pub(crate) fn vmobj_header(buf: &[u8]) -> Result<(SlsId, u64, crate::host::vm::ObjKind)> {
    let mut r = crate::record::RecReader::new(buf);
    r.expect_magic(RecordType::VmObject)?;
    let info = crate::vmobject::VmObjInfo::decode_body(&mut r)?;
    Ok((info.slsid, info.size, info.kind))
}
