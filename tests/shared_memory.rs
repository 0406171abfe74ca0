//! Shared-memory capture: SysV segments and POSIX shm.

mod common;

use aurora_sls::host::file::{File, FileBacking};
use aurora_sls::host::shm::SHMSEG_ALLOCATED;
use aurora_sls::{Mode, Target};

/// Every allocated SysV segment is captured and restored to its exact
/// original index, key, permissions, and contents.
#[tokio::test]
async fn sysv_segments_restore_in_place() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"sysv");
    let old_pid = p.pid;

    let slot = sls.host.sysv_shm.alloc(0x1234, 8192, 0o660).unwrap();
    let seg = sls.host.sysv_shm.get(slot).unwrap();
    seg.object.page_insert(0, b"segment zero");
    seg.object.page_insert(1, b"segment one");

    common::partition(&sls, 8000, Target::Slos, Mode::Full).await;
    sls.attach(8000, old_pid).unwrap();
    sls.checkpoint(8000, false).await.unwrap();
    common::quiesce(&sls, 8000).await;

    // The workload dies and the segment is removed; the slot must be
    // free for the restore to claim it.
    drop(p);
    sls.host.reap(old_pid);
    drop(seg);
    sls.host.sysv_shm.remove(slot).unwrap();

    sls.restore(8000, false, false).await.unwrap();

    let seg = sls.host.sysv_shm.get(slot).expect("segment reinstalled");
    assert_eq!(seg.key, 0x1234);
    assert_eq!(seg.segsz, 8192);
    assert_eq!(seg.mode & 0o777, 0o660);
    assert!(seg.mode & SHMSEG_ALLOCATED != 0);
    assert_eq!(&seg.object.chain_read(0)[..12], b"segment zero");
    assert_eq!(&seg.object.chain_read(1)[..11], b"segment one");
}

/// A named POSIX segment still registered at restore time is reused
/// rather than recreated; the descriptor comes back pointing at it.
#[tokio::test]
async fn posix_shm_reopens_on_collision() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"pshm");
    let old_pid = p.pid;

    let shm = sls
        .host
        .posix_shm
        .create_excl(Some("/work.seg"), 0o600, 4)
        .unwrap();
    shm.object().page_insert(0, b"posix payload");
    let fd = p
        .fdtable
        .lock()
        .alloc(File::new(FileBacking::Shm(shm.clone()), 0));

    common::partition(&sls, 8001, Target::Slos, Mode::Full).await;
    sls.attach(8001, old_pid).unwrap();
    sls.checkpoint(8001, false).await.unwrap();

    drop(p);
    sls.host.reap(old_pid);
    sls.restore(8001, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 8001);
    let file = restored.fdtable.lock().get(fd).unwrap();
    let FileBacking::Shm(reshm) = &file.backing else {
        panic!("fd is not a shm segment");
    };

    // The name collided with the still-live segment, so the existing one
    // was opened; its contents read through the checkpoint shadow.
    assert_eq!(reshm.path.as_deref(), Some("/work.seg"));
    assert_eq!(&reshm.object().chain_read(0)[..13], b"posix payload");
}
