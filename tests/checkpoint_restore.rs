//! End-to-end checkpoint/restore through the local store.

mod common;

use aurora_sls::host::vm::PAGE_SIZE;
use aurora_sls::{Mode, Target};
use common::MAP_ADDR;

/// A process writes a string into an anonymous mapping and "sleeps"; it
/// is checkpointed, killed, and restored. The restored process sees the
/// same bytes at the same address.
#[tokio::test]
async fn store_round_trip_preserves_memory() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"Aurora");
    let old_pid = p.pid;

    common::partition(&sls, 1000, Target::Slos, Mode::Full).await;
    sls.attach(1000, old_pid).unwrap();

    let epoch_before = sls.epoch(1000).unwrap();
    let ticket = sls.checkpoint(1000, false).await.unwrap().unwrap();
    common::quiesce(&sls, 1000).await;

    // Exactly one epoch advance per successful pass.
    assert_eq!(sls.epoch(1000).unwrap(), epoch_before + 1);
    assert_eq!(sls.epoch(1000).unwrap(), ticket);
    assert!(sls.epoch_wait(1000, ticket, false).await.unwrap());

    // Kill the original and restore from the store.
    drop(p);
    sls.host.reap(old_pid);
    sls.restore(1000, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 1000);
    assert_ne!(restored.pid, old_pid);
    assert_eq!(restored.read_mem(MAP_ADDR, 6).unwrap(), b"Aurora");
    assert_eq!(&*restored.comm.lock(), "worker");
}

/// Register state, signal actions, umask, and descriptor indices survive
/// the round trip.
#[tokio::test]
async fn process_state_survives() {
    use aurora_sls::host::process::SigAction;

    let sls = common::module();
    let p = common::spawn_worker(&sls, b"state");
    let old_pid = p.pid;

    {
        let mut threads = p.threads.lock();
        let td = &mut threads[0];
        td.regs.rip = 0x40_1000;
        td.regs.rsp = 0x7fff_f000;
        td.regs.rdi = 42;
        td.sigmask = 0x0000_4000;
        td.fs_base = 0xdead_0000;
        td.tf_trapno = 3;
    }
    p.sigacts.lock().actions[15] = SigAction {
        handler: 0x40_2000,
        flags: 0x1,
        mask: 0xff,
    };
    p.fdtable.lock().cmask = 0o077;

    common::partition(&sls, 1001, Target::Slos, Mode::Full).await;
    sls.attach(1001, old_pid).unwrap();
    sls.checkpoint(1001, false).await.unwrap();

    drop(p);
    sls.host.reap(old_pid);
    sls.restore(1001, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 1001);
    let threads = restored.threads.lock().clone();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].regs.rip, 0x40_1000);
    assert_eq!(threads[0].regs.rsp, 0x7fff_f000);
    assert_eq!(threads[0].regs.rdi, 42);
    assert_eq!(threads[0].sigmask, 0x0000_4000);
    assert_eq!(threads[0].fs_base, 0xdead_0000);
    assert_eq!(threads[0].tf_trapno, 3);

    assert_eq!(
        restored.sigacts.lock().actions[15],
        SigAction {
            handler: 0x40_2000,
            flags: 0x1,
            mask: 0xff,
        }
    );
    assert_eq!(restored.fdtable.lock().cmask, 0o077);
}

/// Restore-stopped leaves the process stopped, as a debugger would want.
#[tokio::test]
async fn restore_stopped_stops() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"stopme");
    let old_pid = p.pid;

    common::partition(&sls, 1002, Target::Slos, Mode::Full).await;
    sls.attach(1002, old_pid).unwrap();
    sls.checkpoint(1002, false).await.unwrap();

    drop(p);
    sls.host.reap(old_pid);
    sls.restore(1002, false, true).await.unwrap();

    let slsp = sls.partition(1002).unwrap();
    let stopped = slsp
        .procs
        .keys()
        .into_iter()
        .filter_map(|pid| sls.host.pget(pid).ok())
        .any(|p| p.is_stopped());
    assert!(stopped);
}

/// Memory written after the pass never leaks into the artifact: the
/// frozen pages are what come back.
#[tokio::test]
async fn mutation_after_pass_is_not_captured() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"frozen");
    let old_pid = p.pid;

    common::partition(&sls, 1003, Target::Slos, Mode::Full).await;
    sls.attach(1003, old_pid).unwrap();
    sls.checkpoint(1003, false).await.unwrap();

    // The process keeps running and scribbles over the page.
    p.write_mem(MAP_ADDR, b"mutated after the pass").unwrap();
    p.write_mem(MAP_ADDR + PAGE_SIZE as u64, b"second page too").unwrap();

    drop(p);
    sls.host.reap(old_pid);
    sls.restore(1003, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 1003);
    assert_eq!(restored.read_mem(MAP_ADDR, 6).unwrap(), b"frozen");
}
