//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use aurora_sls::host::file::{File, FileBacking};
use aurora_sls::host::pipe::Pipe;
use aurora_sls::host::process::Process;
use aurora_sls::host::socket::{SockFamily, SockType, Socket};
use aurora_sls::host::vm::{PAGE_SIZE, PROT_READ, PROT_WRITE};
use aurora_sls::{Mode, PartBacking, SlsAttr, SlsConfig, SlsModule, Target};

pub const MAP_ADDR: u64 = 0x1000_0000;

pub fn module() -> Arc<SlsModule> {
    SlsModule::new(SlsConfig::default())
}

/// A worker with one 4-page anonymous mapping holding `payload` at its
/// start.
pub fn spawn_worker(sls: &SlsModule, payload: &[u8]) -> Arc<Process> {
    let p = sls.host.spawn("worker").expect("spawning worker");
    p.vmspace()
        .mmap_anon(MAP_ADDR, 4 * PAGE_SIZE as u64, PROT_READ | PROT_WRITE)
        .expect("mapping");
    p.write_mem(MAP_ADDR, payload).expect("writing payload");
    p
}

pub async fn partition(sls: &SlsModule, oid: u64, target: Target, mode: Mode) {
    sls.partadd(oid, SlsAttr::new(target, mode), PartBacking::None)
        .await
        .expect("partadd");
}

/// Install a connected pipe between two processes; returns the fds.
pub fn plumb_pipe(writer: &Process, reader: &Process) -> (u32, u32) {
    let (rd, wr) = Pipe::pair();
    let wfd = writer
        .fdtable
        .lock()
        .alloc(File::new(FileBacking::Pipe(wr), 0));
    let rfd = reader
        .fdtable
        .lock()
        .alloc(File::new(FileBacking::Pipe(rd), 0));
    (wfd, rfd)
}

/// A bound, listening IPv4 stream socket installed into `p`.
pub fn plumb_listener(sls: &SlsModule, p: &Process, port: u16, backlog: u32) -> (u32, Arc<Socket>) {
    let so = Socket::new(SockFamily::Inet, SockType::Stream, 6);
    sls.host
        .ports
        .bind(&so, u32::from_be_bytes([127, 0, 0, 1]), port)
        .expect("binding");
    so.listen(backlog);
    let fd = p
        .fdtable
        .lock()
        .alloc(File::new(FileBacking::Socket(so.clone()), 0));
    (fd, so)
}

/// Wait until a partition's pass tail (serialization, epoch advance,
/// compaction) has fully completed. One-shot checkpoints signal their
/// waiter as soon as the processes resume, so tests that inspect durable
/// state settle the partition first.
pub async fn quiesce(sls: &SlsModule, oid: u64) {
    use aurora_sls::partition::PartState;
    let slsp = sls.partition(oid).expect("partition");
    while slsp.state() != PartState::Available {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
}

/// The live processes currently attached to a partition.
pub fn live_procs(sls: &SlsModule, oid: u64) -> Vec<Arc<Process>> {
    let slsp = sls.partition(oid).expect("partition");
    slsp.procs
        .keys()
        .into_iter()
        .filter_map(|pid| sls.host.pget(pid).ok())
        .filter(|p| p.is_alive())
        .collect()
}

/// The single process restored into a partition, after the originals
/// died.
pub fn restored_proc(sls: &SlsModule, oid: u64) -> Arc<Process> {
    let mut live = live_procs(sls, oid);
    assert_eq!(live.len(), 1, "expected exactly one live process");
    live.pop().unwrap()
}
