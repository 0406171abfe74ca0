//! Modeled pipes.
//!
//! A pipe pair is two endpoints sharing one ring buffer owned by the write
//! side, mirroring the host structure capture reads: buffered byte count,
//! in/out indices, and the inline data.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::vm::alloc_addr;
use crate::error::{Result, SlsError};

pub const PIPE_SIZE: usize = 65536;

/// Ring-buffer state of a pipe endpoint.
#[derive(Debug, Clone, Default)]
pub struct PipeBuf {
    pub data: Vec<u8>,
    pub r#in: u32,
    pub out: u32,
}

impl PipeBuf {
    pub fn cnt(&self) -> u32 {
        self.data.len() as u32
    }
}

pub struct Pipe {
    pub addr: u64,
    pub write_end: bool,
    peer: Mutex<Weak<Pipe>>,
    pub buf: Mutex<PipeBuf>,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("addr", &self.addr)
            .field("write_end", &self.write_end)
            .field("buffered", &self.buf.lock().cnt())
            .finish()
    }
}

impl Pipe {
    /// Create a connected pair: (read end, write end).
    pub fn pair() -> (Arc<Pipe>, Arc<Pipe>) {
        let rd = Arc::new(Pipe {
            addr: alloc_addr(),
            write_end: false,
            peer: Mutex::new(Weak::new()),
            buf: Mutex::new(PipeBuf::default()),
        });
        let wr = Arc::new(Pipe {
            addr: alloc_addr(),
            write_end: true,
            peer: Mutex::new(Weak::new()),
            buf: Mutex::new(PipeBuf::default()),
        });
        *rd.peer.lock() = Arc::downgrade(&wr);
        *wr.peer.lock() = Arc::downgrade(&rd);
        (rd, wr)
    }

    pub fn peer(&self) -> Option<Arc<Pipe>> {
        self.peer.lock().upgrade()
    }

    /// Write into the pair's shared buffer. The data is readable from the
    /// read end.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.write_end {
            return Err(SlsError::invalid("write to the read end of a pipe"));
        }
        let rd = self
            .peer()
            .ok_or_else(|| SlsError::gone("pipe peer closed"))?;
        let mut buf = rd.buf.lock();
        let room = PIPE_SIZE - buf.data.len();
        let take = data.len().min(room);
        buf.data.extend_from_slice(&data[..take]);
        buf.r#in = buf.r#in.wrapping_add(take as u32);
        Ok(take)
    }

    /// Non-blocking read from the shared buffer.
    pub fn read(&self, len: usize) -> Vec<u8> {
        let mut buf = self.buf.lock();
        let take = len.min(buf.data.len());
        let out = buf.data.drain(..take).collect();
        buf.out = buf.out.wrapping_add(take as u32);
        out
    }

    /// Overwrite the buffered state, used by restore.
    pub fn restore_buf(&self, data: &[u8], r#in: u32, out: u32) -> Result<()> {
        if data.len() > PIPE_SIZE {
            return Err(SlsError::invalid("buffered pipe data exceeds pipe size"));
        }
        let mut buf = self.buf.lock();
        buf.data = data.to_vec();
        buf.r#in = r#in;
        buf.out = out;
        Ok(())
    }
}
