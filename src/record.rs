//! Typed byte-sequence records and their wire codec.
//!
//! Every captured entity becomes a [`Record`]: an SLS-ID, a type tag, and a
//! byte buffer that is sealed once capture finishes writing it. Payloads
//! begin with the type's little-endian magic; readers verify it and fail
//! with [`SlsError::BadMagic`] on mismatch, so a record can never be parsed
//! as the wrong kind.

use std::sync::Arc;

use crate::error::{Result, SlsError};

/// 64-bit identifier of a captured entity, stable within one artifact.
/// Derived at capture time from the host object's unique address.
pub type SlsId = u64;

pub const SLSPROC_MAGIC: u32 = 0x736c_7301;
pub const SLSTHREAD_MAGIC: u32 = 0x736c_7302;
pub const SLSVMOBJECT_MAGIC: u32 = 0x7aaa_7303;
pub const SLSVMENTRY_MAGIC: u32 = 0x736c_7304;
pub const SLSKQUEUE_MAGIC: u32 = 0x736c_7305;
pub const SLSKNOTE_MAGIC: u32 = 0x736c_7306;
pub const SLSPIPE_MAGIC: u32 = 0x736c_7307;
pub const SLSSOCKET_MAGIC: u32 = 0x736c_7308;
pub const SLSPOSIXSHM_MAGIC: u32 = 0x736c_7309;
pub const SLSVMSPACE_MAGIC: u32 = 0x736c_730a;
pub const SLSSYSVSHM_MAGIC: u32 = 0x736c_730b;
pub const SLSPTS_MAGIC: u32 = 0x736c_730c;
pub const SLSMBUF_MAGIC: u32 = 0x736c_730d;
pub const SLSVNODE_MAGIC: u32 = 0x736c_730e;
pub const SLSMANIFEST_MAGIC: u32 = 0x736c_730f;
pub const SLSFILEDESC_MAGIC: u32 = 0x736c_7233;
pub const SLSFILE_MAGIC: u32 = 0x736c_7234;

/// The kind of entity a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Proc,
    Thread,
    File,
    FileDesc,
    VmSpace,
    VmEntry,
    VmObject,
    Kqueue,
    Knote,
    Pipe,
    Socket,
    PosixShm,
    SysvShm,
    Pts,
    Mbuf,
    Vnode,
    Manifest,
}

impl RecordType {
    pub fn magic(self) -> u32 {
        match self {
            RecordType::Proc => SLSPROC_MAGIC,
            RecordType::Thread => SLSTHREAD_MAGIC,
            RecordType::File => SLSFILE_MAGIC,
            RecordType::FileDesc => SLSFILEDESC_MAGIC,
            RecordType::VmSpace => SLSVMSPACE_MAGIC,
            RecordType::VmEntry => SLSVMENTRY_MAGIC,
            RecordType::VmObject => SLSVMOBJECT_MAGIC,
            RecordType::Kqueue => SLSKQUEUE_MAGIC,
            RecordType::Knote => SLSKNOTE_MAGIC,
            RecordType::Pipe => SLSPIPE_MAGIC,
            RecordType::Socket => SLSSOCKET_MAGIC,
            RecordType::PosixShm => SLSPOSIXSHM_MAGIC,
            RecordType::SysvShm => SLSSYSVSHM_MAGIC,
            RecordType::Pts => SLSPTS_MAGIC,
            RecordType::Mbuf => SLSMBUF_MAGIC,
            RecordType::Vnode => SLSVNODE_MAGIC,
            RecordType::Manifest => SLSMANIFEST_MAGIC,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        Some(match magic {
            SLSPROC_MAGIC => RecordType::Proc,
            SLSTHREAD_MAGIC => RecordType::Thread,
            SLSFILE_MAGIC => RecordType::File,
            SLSFILEDESC_MAGIC => RecordType::FileDesc,
            SLSVMSPACE_MAGIC => RecordType::VmSpace,
            SLSVMENTRY_MAGIC => RecordType::VmEntry,
            SLSVMOBJECT_MAGIC => RecordType::VmObject,
            SLSKQUEUE_MAGIC => RecordType::Kqueue,
            SLSKNOTE_MAGIC => RecordType::Knote,
            SLSPIPE_MAGIC => RecordType::Pipe,
            SLSSOCKET_MAGIC => RecordType::Socket,
            SLSPOSIXSHM_MAGIC => RecordType::PosixShm,
            SLSSYSVSHM_MAGIC => RecordType::SysvShm,
            SLSPTS_MAGIC => RecordType::Pts,
            SLSMBUF_MAGIC => RecordType::Mbuf,
            SLSVNODE_MAGIC => RecordType::Vnode,
            SLSMANIFEST_MAGIC => RecordType::Manifest,
            _ => return None,
        })
    }

    /// Whether records of this type carry page data alongside metadata.
    pub fn is_data(self) -> bool {
        matches!(self, RecordType::VmObject)
    }

    /// Stable numeric tag for backend storage and the wire.
    pub fn tag(self) -> u64 {
        self.magic() as u64
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        u32::try_from(tag).ok().and_then(Self::from_magic)
    }
}

/// A sealed, immutable capture record.
#[derive(Debug)]
pub struct Record {
    id: SlsId,
    rtype: RecordType,
    buf: Vec<u8>,
}

impl Record {
    /// Bundle a finished payload into a record. The payload must begin
    /// with the type's magic (all writers go through [`RecWriter`], which
    /// guarantees it).
    pub fn sealed(id: SlsId, rtype: RecordType, buf: Vec<u8>) -> Arc<Self> {
        debug_assert!(id != 0, "record with SLS-ID 0");
        debug_assert!(!buf.is_empty(), "sealing an empty record");
        Arc::new(Self { id, rtype, buf })
    }

    pub fn id(&self) -> SlsId {
        self.id
    }

    pub fn rtype(&self) -> RecordType {
        self.rtype
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Open a verified reader over the payload.
    pub fn reader(&self) -> Result<RecReader<'_>> {
        let mut r = RecReader::new(&self.buf);
        r.expect_magic(self.rtype)?;
        Ok(r)
    }
}

/// Little-endian payload writer. Starts the buffer with the record magic.
pub struct RecWriter {
    buf: Vec<u8>,
}

impl RecWriter {
    pub fn new(rtype: RecordType) -> Self {
        let mut w = Self { buf: Vec::with_capacity(128) };
        w.put_u32(rtype.magic());
        w
    }

    /// A writer with no leading magic, for sub-sections inside a record.
    pub fn raw() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    /// Length-prefixed byte run.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u64(v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    /// Optional string: presence flag plus payload.
    pub fn put_opt_str(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.put_bool(true);
                self.put_str(s);
            }
            None => self.put_bool(false),
        }
    }

    /// Write a sub-section produced by another writer.
    pub fn put_section(&mut self, section: RecWriter) {
        self.put_bytes(&section.buf);
    }

    /// Append raw bytes with no length prefix; the reader must know the
    /// layout.
    pub fn put_raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Seal this payload into a record.
    pub fn seal(self, id: SlsId, rtype: RecordType) -> Arc<Record> {
        Record::sealed(id, rtype, self.buf)
    }
}

/// Little-endian payload reader.
pub struct RecReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> RecReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn advance(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return Err(SlsError::protocol(format!(
                "record truncated: need {n} bytes at offset {}",
                self.off
            )));
        }
        let out = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(out)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.advance(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.advance(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.advance(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.advance(8)?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.advance(1)?[0] != 0)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u64()? as usize;
        self.advance(len)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SlsError::protocol("record string is not UTF-8"))
    }

    pub fn get_opt_str(&mut self) -> Result<Option<String>> {
        if self.get_bool()? { Ok(Some(self.get_str()?)) } else { Ok(None) }
    }

    /// Read a sub-section and return a reader scoped to it.
    pub fn get_section(&mut self) -> Result<RecReader<'a>> {
        Ok(RecReader::new(self.get_bytes()?))
    }

    /// Verify and consume the leading magic for `rtype`.
    pub fn expect_magic(&mut self, rtype: RecordType) -> Result<()> {
        let found = self.get_u32()?;
        if found != rtype.magic() {
            return Err(SlsError::BadMagic {
                expected: rtype.magic(),
                found,
            });
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn magic_round_trip() {
        for rtype in [
            RecordType::Proc,
            RecordType::VmObject,
            RecordType::Pipe,
            RecordType::Manifest,
        ] {
            assert_eq!(RecordType::from_magic(rtype.magic()), Some(rtype));
            assert_eq!(RecordType::from_tag(rtype.tag()), Some(rtype));
        }
        assert_eq!(RecordType::from_magic(0xdead_beef), None);
    }

    #[test]
    fn reader_rejects_wrong_magic() {
        let w = RecWriter::new(RecordType::Pipe);
        let rec = w.seal(1, RecordType::Pipe);
        let mut r = RecReader::new(rec.data());
        assert!(matches!(
            r.expect_magic(RecordType::Socket),
            Err(SlsError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncation_is_an_error() {
        let mut w = RecWriter::new(RecordType::Vnode);
        w.put_u64(7);
        let rec = w.seal(1, RecordType::Vnode);
        let mut r = rec.reader().unwrap();
        assert_eq!(r.get_u64().unwrap(), 7);
        assert!(r.get_u64().is_err());
    }

    proptest! {
        #[test]
        fn codec_round_trip(a in any::<u64>(), b in any::<u32>(), s in ".*", bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut w = RecWriter::new(RecordType::File);
            w.put_u64(a);
            w.put_u32(b);
            w.put_str(&s);
            w.put_bytes(&bytes);
            w.put_opt_str(None);
            let rec = w.seal(9, RecordType::File);

            let mut r = rec.reader().unwrap();
            prop_assert_eq!(r.get_u64().unwrap(), a);
            prop_assert_eq!(r.get_u32().unwrap(), b);
            prop_assert_eq!(r.get_str().unwrap(), s);
            prop_assert_eq!(r.get_bytes().unwrap(), &bytes[..]);
            prop_assert_eq!(r.get_opt_str().unwrap(), None);
            prop_assert!(r.is_done());
        }
    }
}
