//! Memory-target checkpoints: resident artifacts, repeated passes, and
//! restore without consuming the checkpoint.

mod common;

use aurora_sls::{Mode, Target};
use common::MAP_ADDR;

/// Two back-to-back passes with no mutation in between: the second finds
/// every object already in the SLS, record counts match, and the shadow
/// chain depth stays bounded after the collapse.
#[tokio::test]
async fn back_to_back_passes_are_stable() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"steady");

    common::partition(&sls, 2000, Target::Memory, Mode::Full).await;
    sls.attach(2000, p.pid).unwrap();

    sls.checkpoint(2000, false).await.unwrap();
    common::quiesce(&sls, 2000).await;
    let first = sls.partition(2000).unwrap().sckpt().unwrap();
    let first_records = first.rectable.len();
    let first_shadows = first.shadow_table.len();

    sls.checkpoint(2000, false).await.unwrap();
    common::quiesce(&sls, 2000).await;
    let second = sls.partition(2000).unwrap().sckpt().unwrap();

    assert_eq!(second.rectable.len(), first_records);
    // The collapse re-keys the successor's entries by the original
    // objects: no chain growth across passes.
    assert_eq!(second.shadow_table.len(), first_shadows);

    // The resident checkpoint still restores.
    let old_pid = p.pid;
    drop(p);
    sls.host.reap(old_pid);
    sls.restore(2000, false, false).await.unwrap();
    let restored = common::restored_proc(&sls, 2000);
    assert_eq!(restored.read_mem(MAP_ADDR, 6).unwrap(), b"steady");
}

/// Restoring from memory shadows the artifact instead of consuming it:
/// the same checkpoint restores twice, and a restored process scribbling
/// over its memory does not poison the second restore.
#[tokio::test]
async fn artifact_survives_multiple_restores() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"immortal");
    let old_pid = p.pid;

    common::partition(&sls, 2001, Target::Memory, Mode::Full).await;
    sls.attach(2001, old_pid).unwrap();
    sls.checkpoint(2001, false).await.unwrap();

    drop(p);
    sls.host.reap(old_pid);

    sls.restore(2001, false, false).await.unwrap();
    let first = common::restored_proc(&sls, 2001);
    assert_eq!(first.read_mem(MAP_ADDR, 8).unwrap(), b"immortal");
    first.write_mem(MAP_ADDR, b"scribble").unwrap();
    let first_pid = first.pid;
    drop(first);
    sls.host.reap(first_pid);

    sls.restore(2001, false, false).await.unwrap();
    let second = common::restored_proc(&sls, 2001);
    assert_eq!(second.read_mem(MAP_ADDR, 8).unwrap(), b"immortal");
}

/// Mutation between passes lands in the newer checkpoint; restore picks
/// up the latest state.
#[tokio::test]
async fn latest_pass_wins() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"version one");
    let old_pid = p.pid;

    common::partition(&sls, 2002, Target::Memory, Mode::Full).await;
    sls.attach(2002, old_pid).unwrap();

    sls.checkpoint(2002, false).await.unwrap();
    p.write_mem(MAP_ADDR, b"version two").unwrap();
    sls.checkpoint(2002, false).await.unwrap();

    drop(p);
    sls.host.reap(old_pid);
    sls.restore(2002, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 2002);
    assert_eq!(restored.read_mem(MAP_ADDR, 11).unwrap(), b"version two");
}

/// Region snapshots refresh a single mapping of the resident checkpoint
/// and observe the epoch ticket protocol.
#[tokio::test]
async fn memsnap_refreshes_one_region() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"whole");

    common::partition(&sls, 2003, Target::Memory, Mode::Full).await;
    sls.attach(2003, p.pid).unwrap();
    sls.checkpoint(2003, false).await.unwrap();

    p.write_mem(MAP_ADDR, b"patched").unwrap();
    let ticket = sls.memsnap(2003, p.pid, MAP_ADDR).await.unwrap();
    assert!(sls.epoch_wait(2003, ticket, true).await.unwrap());

    let old_pid = p.pid;
    drop(p);
    sls.host.reap(old_pid);
    sls.restore(2003, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 2003);
    assert_eq!(restored.read_mem(MAP_ADDR, 7).unwrap(), b"patched");
}

/// A region snapshot of a shared object is rejected.
#[tokio::test]
async fn memsnap_rejects_shared_objects() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"shared");

    common::partition(&sls, 2004, Target::Memory, Mode::Full).await;
    sls.attach(2004, p.pid).unwrap();
    sls.checkpoint(2004, false).await.unwrap();

    // Take an extra reference on the mapped object, as a second mapping
    // would.
    let obj = p.vmspace().lookup(MAP_ADDR).unwrap().object.unwrap();
    obj.reference();

    let err = sls.memsnap(2004, p.pid, MAP_ADDR).await.unwrap_err();
    assert!(matches!(err, aurora_sls::SlsError::Invalid { .. }));
    obj.deallocate();
}
