//! Streaming send/receive backends.
//!
//! A checkpoint travels as a single TCP stream of typed frames. Each
//! frame is `[u32 length][u32 tag][payload]`; the explicit length prefix
//! decouples the wire format from any on-host struct size. A sender emits
//! `REGISTER`, then per checkpoint `CKPTSTART → N × (RECMETA [+ N ×
//! RECPAGES]) → CKPTDONE`, and `DONE` when the stream retires. The
//! receive side reconstitutes a checkpoint-data container and installs it
//! as the partition's resident checkpoint, exactly as if a local pass had
//! produced it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, instrument, warn};

use crate::config::SlsConfig;
use crate::error::{Result, SlsError};
use crate::host::vm::{ObjKind, PAGE_SIZE, Pindex, VmObject};
use crate::io::{self, PageSink};
use crate::partition::{
    CkptData, PartBacking, Partition, PartitionSerial, ShadowEntry, Target,
};
use crate::prefault::PrefaultTable;
use crate::record::{Record, RecordType, SlsId};
use crate::stats::SlsStats;

use super::{Backend, RestoredCkpt};

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME: u32 = 64 << 20;

const TAG_REGISTER: u32 = 0;
const TAG_CKPTSTART: u32 = 1;
const TAG_RECMETA: u32 = 2;
const TAG_RECPAGES: u32 = 3;
const TAG_CKPTDONE: u32 = 4;
const TAG_DONE: u32 = 5;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlsMsg {
    Register { oid: u64 },
    CkptStart { epoch: u64 },
    RecMeta {
        uuid: SlsId,
        rectype: u64,
        totalsize: u64,
        meta: Vec<u8>,
    },
    RecPages { offset: u64, data: Vec<u8> },
    CkptDone,
    Done,
}

impl SlsMsg {
    fn tag(&self) -> u32 {
        match self {
            SlsMsg::Register { .. } => TAG_REGISTER,
            SlsMsg::CkptStart { .. } => TAG_CKPTSTART,
            SlsMsg::RecMeta { .. } => TAG_RECMETA,
            SlsMsg::RecPages { .. } => TAG_RECPAGES,
            SlsMsg::CkptDone => TAG_CKPTDONE,
            SlsMsg::Done => TAG_DONE,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            SlsMsg::Register { oid } => out.extend_from_slice(&oid.to_le_bytes()),
            SlsMsg::CkptStart { epoch } => out.extend_from_slice(&epoch.to_le_bytes()),
            SlsMsg::RecMeta {
                uuid,
                rectype,
                totalsize,
                meta,
            } => {
                out.extend_from_slice(&uuid.to_le_bytes());
                out.extend_from_slice(&rectype.to_le_bytes());
                out.extend_from_slice(&totalsize.to_le_bytes());
                out.extend_from_slice(meta);
            }
            SlsMsg::RecPages { offset, data } => {
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(data);
            }
            SlsMsg::CkptDone | SlsMsg::Done => {}
        }
        out
    }
}

/// Send one frame.
pub async fn write_msg<S>(stream: &mut S, msg: &SlsMsg) -> Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let payload = msg.payload();
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(&msg.tag().to_le_bytes()).await?;
    stream.write_all(&payload).await?;
    Ok(())
}

fn le_u64(buf: &[u8], off: usize) -> Result<u64> {
    buf.get(off..off + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| SlsError::protocol("frame payload truncated"))
}

/// Receive one frame; `None` at a clean end of stream.
pub async fn read_msg<S>(stream: &mut S) -> Result<Option<SlsMsg>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut head = [0u8; 8];
    match stream.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(head[..4].try_into().unwrap());
    let tag = u32::from_le_bytes(head[4..].try_into().unwrap());
    if len > MAX_FRAME {
        return Err(SlsError::protocol(format!("frame of {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;

    let msg = match tag {
        TAG_REGISTER => SlsMsg::Register {
            oid: le_u64(&payload, 0)?,
        },
        TAG_CKPTSTART => SlsMsg::CkptStart {
            epoch: le_u64(&payload, 0)?,
        },
        TAG_RECMETA => SlsMsg::RecMeta {
            uuid: le_u64(&payload, 0)?,
            rectype: le_u64(&payload, 8)?,
            totalsize: le_u64(&payload, 16)?,
            meta: payload.get(24..).map(<[u8]>::to_vec).ok_or_else(|| {
                SlsError::protocol("recmeta frame truncated")
            })?,
        },
        TAG_RECPAGES => SlsMsg::RecPages {
            offset: le_u64(&payload, 0)?,
            data: payload.get(8..).map(<[u8]>::to_vec).ok_or_else(|| {
                SlsError::protocol("recpages frame truncated")
            })?,
        },
        TAG_CKPTDONE => SlsMsg::CkptDone,
        TAG_DONE => SlsMsg::Done,
        other => {
            return Err(SlsError::protocol(format!("unknown frame tag {other}")));
        }
    };
    Ok(Some(msg))
}

struct StreamSink<'a> {
    stream: &'a mut TcpStream,
}

#[async_trait]
impl PageSink for StreamSink<'_> {
    async fn write_pages(&mut self, _objid: SlsId, pindex: Pindex, data: &[u8]) -> Result<()> {
        write_msg(
            self.stream,
            &SlsMsg::RecPages {
                offset: (pindex + 1) * PAGE_SIZE as u64,
                data: data.to_vec(),
            },
        )
        .await
    }
}

fn peer_of(slsp: &Partition) -> Result<SocketAddr> {
    match &slsp.backing {
        PartBacking::Peer(addr) => Ok(*addr),
        _ => Err(SlsError::invalid("streaming partition without a peer")),
    }
}

/// The sending backend: each checkpoint is pushed to the peer.
pub struct SendBackend {
    config: SlsConfig,
    stats: Arc<SlsStats>,
    prefault: Arc<PrefaultTable>,
}

impl SendBackend {
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
}

#[async_trait]
impl Backend for SendBackend {
    fn target(&self) -> Target {
        Target::SockSend
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

    async fn export(&self, _parts: &[PartitionSerial]) -> Result<()> {
        Ok(())
    }

    async fn partadd(&self, slsp: &Arc<Partition>) -> Result<()> {
        peer_of(slsp).map(|_| ())
    }

    async fn setepoch(&self, _oid: u64, _epoch: u64) -> Result<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(oid = slsp.oid))]
    async fn write_ckpt(&self, slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()> {
        let addr = peer_of(slsp)?;
        let mut stream = TcpStream::connect(addr).await?;

        write_msg(&mut stream, &SlsMsg::Register { oid: slsp.oid }).await?;
        write_msg(&mut stream, &SlsMsg::CkptStart { epoch: slsp.epoch() }).await?;

        let serialized = sckpt
            .serialized()
            .ok_or_else(|| SlsError::invalid("checkpoint was not finalized"))?;

        // Data records, pages trailing each announcement.
        for (id, rec) in sckpt.rectable.entries() {
            if !rec.rtype().is_data() {
                continue;
            }
            let obj = sckpt.data_objs.find(id);
            let totalpages = obj.as_ref().map_or(1, |o| o.size_pages() + 1);
            write_msg(
                &mut stream,
                &SlsMsg::RecMeta {
                    uuid: id,
                    rectype: rec.rtype().tag(),
                    totalsize: (totalpages + 1) * PAGE_SIZE as u64,
                    meta: rec.data().to_vec(),
                },
            )
            .await?;

            if let Some(obj) = obj {
                if !self.config.drop_io {
                    let mut sink = StreamSink { stream: &mut stream };
                    io::dump_object(
                        id,
                        &obj,
                        self.config.contig_pages(),
                        sckpt.attr.mode == crate::partition::Mode::Full,
                        &mut sink,
                        &self.stats,
                        &self.prefault,
                    )
                    .await?;
                }
            }
        }

        // Manifest: id list plus the metadata blob, under the partition's
        // own OID.
        let mut manifest = Vec::new();
        manifest.extend_from_slice(&(serialized.dataids.len() as u64).to_le_bytes());
        for id in &serialized.dataids {
            manifest.extend_from_slice(&id.to_le_bytes());
        }
        manifest.extend_from_slice(&serialized.meta);
        let manifest_len = manifest.len() as u64;
        write_msg(
            &mut stream,
            &SlsMsg::RecMeta {
                uuid: slsp.oid,
                rectype: RecordType::Manifest.tag(),
                totalsize: manifest_len,
                meta: manifest,
            },
        )
        .await?;

        write_msg(&mut stream, &SlsMsg::CkptDone).await?;
        write_msg(&mut stream, &SlsMsg::Done).await?;
        stream.flush().await?;
        debug!("checkpoint streamed");
        Ok(())
    }

    async fn write_data(&self, slsp: &Arc<Partition>, sckpt: &Arc<CkptData>) -> Result<()> {
        self.write_ckpt(slsp, sckpt).await
    }

    async fn read_ckpt(&self, _slsp: &Arc<Partition>) -> Result<RestoredCkpt> {
        Err(SlsError::invalid("send target cannot restore"))
    }
}

/// The receiving backend: a listener reconstitutes streamed checkpoints
/// into the partition's resident checkpoint data.
pub struct RecvBackend;

impl RecvBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    async fn handle_conn(slsp: Arc<Partition>, mut stream: TcpStream) -> Result<()> {
        let mut cur: Option<Arc<CkptData>> = None;
        let mut cur_obj: Option<Arc<VmObject>> = None;

        while let Some(msg) = read_msg(&mut stream).await? {
            match msg {
                SlsMsg::Register { oid } => {
                    if oid != slsp.oid {
                        return Err(SlsError::protocol(format!(
                            "peer registered for partition {oid}, this is {}",
                            slsp.oid
                        )));
                    }
                }
                SlsMsg::CkptStart { epoch } => {
                    debug!(epoch, "incoming checkpoint");
                    cur = Some(CkptData::new(slsp.attr));
                    cur_obj = None;
                }
                SlsMsg::RecMeta {
                    uuid,
                    rectype,
                    meta,
                    ..
                } => {
                    let sckpt = cur
                        .as_ref()
                        .ok_or_else(|| SlsError::protocol("record before CKPTSTART"))?;
                    cur_obj = None;

                    if uuid == slsp.oid {
                        // The manifest: skip the id list, keep the blob.
                        let numids = le_u64(&meta, 0)? as usize;
                        let blob = meta
                            .get(8 + numids * 8..)
                            .ok_or_else(|| SlsError::protocol("manifest id list truncated"))?;
                        super::parse_meta_blob(blob, &sckpt.rectable)?;
                        continue;
                    }

                    let rtype = RecordType::from_tag(rectype)
                        .ok_or_else(|| SlsError::protocol("unknown record type on wire"))?;
                    let rec = Record::sealed(uuid, rtype, meta);

                    if rtype.is_data() {
                        let (slsid, size, kind) = super::vmobj_header(rec.data())?;
                        if matches!(kind, ObjKind::Default | ObjKind::Swap) {
                            let obj = VmObject::alloc(kind, size);
                            obj.set_objid(slsid);
                            // Held like a shadow-table ancestor: restores
                            // shadow it, drop collapses it away.
                            sckpt.shadow_table.add(
                                obj.addr,
                                ShadowEntry {
                                    obj: obj.clone(),
                                    shadow: None,
                                },
                            )?;
                            cur_obj = Some(obj);
                        }
                    }
                    sckpt.rectable.add(uuid, rec)?;
                }
                SlsMsg::RecPages { offset, data } => {
                    let obj = cur_obj
                        .as_ref()
                        .ok_or_else(|| SlsError::protocol("pages with no object announced"))?;
                    if offset % PAGE_SIZE as u64 != 0 || offset < PAGE_SIZE as u64 {
                        return Err(SlsError::protocol("misaligned page offset"));
                    }
                    // One buffered page-in per frame: grab busy pages,
                    // fill them, retire through the completion path so
                    // any concurrent grabber blocks until the frame has
                    // landed.
                    let start = offset / PAGE_SIZE as u64 - 1;
                    let npages = data.len().div_ceil(PAGE_SIZE) as u64;
                    let idxs: Vec<Pindex> = (start..start + npages).collect();
                    obj.grab_busy(&idxs);
                    for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
                        obj.page_fill(start + i as u64, chunk);
                    }
                    obj.complete_io(&idxs);
                }
                SlsMsg::CkptDone => {
                    let sckpt = cur
                        .take()
                        .ok_or_else(|| SlsError::protocol("CKPTDONE before CKPTSTART"))?;
                    debug!(records = sckpt.rectable.len(), "checkpoint received");
                    slsp.set_sckpt(Some(sckpt));
                    cur_obj = None;
                }
                SlsMsg::Done => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for RecvBackend {
    fn target(&self) -> Target {
        Target::SockRecv
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

    async fn export(&self, _parts: &[PartitionSerial]) -> Result<()> {
        Ok(())
    }

    async fn partadd(&self, slsp: &Arc<Partition>) -> Result<()> {
        let addr = peer_of(slsp)?;
        let listener = TcpListener::bind(addr).await?;
        let slsp = slsp.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "checkpoint stream connected");
                        let slsp = slsp.clone();
                        tokio::spawn(async move {
                            if let Err(e) = RecvBackend::handle_conn(slsp, stream).await {
                                warn!(error = %e, "checkpoint stream failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, receiver exiting");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn setepoch(&self, _oid: u64, _epoch: u64) -> Result<()> {
        Ok(())
    }

    async fn write_ckpt(&self, _slsp: &Arc<Partition>, _sckpt: &Arc<CkptData>) -> Result<()> {
        Err(SlsError::invalid("receive target cannot checkpoint"))
    }

    async fn write_data(&self, _slsp: &Arc<Partition>, _sckpt: &Arc<CkptData>) -> Result<()> {
        Err(SlsError::invalid("receive target cannot checkpoint"))
    }

    async fn read_ckpt(&self, _slsp: &Arc<Partition>) -> Result<RestoredCkpt> {
        // Restores come from the reconstituted resident checkpoint.
        Err(SlsError::invalid("receive target restores from memory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let msgs = vec![
            SlsMsg::Register { oid: 42 },
            SlsMsg::CkptStart { epoch: 7 },
            SlsMsg::RecMeta {
                uuid: 0x1234,
                rectype: RecordType::VmObject.tag(),
                totalsize: 8192,
                meta: vec![1, 2, 3],
            },
            SlsMsg::RecPages {
                offset: 4096,
                data: vec![9; 4096],
            },
            SlsMsg::CkptDone,
            SlsMsg::Done,
        ];
        for msg in &msgs {
            write_msg(&mut a, msg).await.unwrap();
        }
        drop(a);
        let mut got = Vec::new();
        while let Some(msg) = read_msg(&mut b).await.unwrap() {
            got.push(msg);
        }
        assert_eq!(got, msgs);
    }

    #[tokio::test]
    async fn garbage_tag_is_a_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&4u32.to_le_bytes()).await.unwrap();
        a.write_all(&99u32.to_le_bytes()).await.unwrap();
        a.write_all(&[0; 4]).await.unwrap();
        assert!(matches!(
            read_msg(&mut b).await,
            Err(SlsError::Protocol { .. })
        ));
    }
}
