//! Partition lifecycle: detach races, periodic daemons, epoch ordering,
//! and module teardown.

mod common;

use std::time::Duration;

use aurora_sls::partition::{PartBacking, PartState};
use aurora_sls::{Mode, SlsAttr, SlsError, Target};

/// A periodic daemon races a detach: the daemon's next transition fails
/// and it exits cleanly, leaving the partition detached for good.
#[tokio::test]
async fn detach_races_a_periodic_daemon() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"periodic");

    sls.partadd(
        6000,
        SlsAttr::new(Target::Memory, Mode::Full).with_period(100),
        PartBacking::None,
    )
    .await
    .unwrap();
    sls.attach(6000, p.pid).unwrap();

    // Start the daemon; it returns immediately for periodic partitions.
    assert_eq!(sls.checkpoint(6000, false).await.unwrap(), None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let slsp = sls.partition(6000).unwrap();
    sls.partdel(6000).await.unwrap();
    assert_eq!(slsp.state(), PartState::Detached);

    // The daemon observes the sticky state and winds down; nothing flips
    // the partition back.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(slsp.state(), PartState::Detached);

    // Detached partitions reject everything.
    assert!(matches!(
        sls.checkpoint(6000, false).await,
        Err(SlsError::Invalid { .. })
    ));
    assert!(matches!(
        sls.attach(6000, p.pid),
        Err(SlsError::Invalid { .. })
    ));
}

/// A periodic daemon actually checkpoints repeatedly: the epoch keeps
/// advancing until the partition detaches.
#[tokio::test]
async fn periodic_daemon_advances_epochs() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"ticker");

    sls.partadd(
        6001,
        SlsAttr::new(Target::Memory, Mode::Full).with_period(20),
        PartBacking::None,
    )
    .await
    .unwrap();
    sls.attach(6001, p.pid).unwrap();

    let before = sls.epoch(6001).unwrap();
    sls.checkpoint(6001, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let after = sls.epoch(6001).unwrap();
    assert!(after >= before + 2, "epoch went {before} -> {after}");

    sls.partdel(6001).await.unwrap();
}

/// Checkpointing an empty partition fails without wedging the state
/// machine.
#[tokio::test]
async fn empty_partition_cannot_checkpoint() {
    let sls = common::module();
    common::partition(&sls, 6002, Target::Memory, Mode::Full).await;

    assert!(sls.checkpoint(6002, false).await.is_err());
    let slsp = sls.partition(6002).unwrap();
    assert_eq!(slsp.state(), PartState::Available);
}

/// Bad OIDs and duplicate registrations are rejected.
#[tokio::test]
async fn partadd_validates() {
    let sls = common::module();
    let attr = SlsAttr::new(Target::Memory, Mode::Full);

    assert!(sls.partadd(0, attr, PartBacking::None).await.is_err());
    assert!(sls.partadd(1 << 32, attr, PartBacking::None).await.is_err());

    sls.partadd(6003, attr, PartBacking::None).await.unwrap();
    assert!(sls.partadd(6003, attr, PartBacking::None).await.is_err());

    let mut zero_amp = attr;
    zero_amp.amplification = 0;
    assert!(sls.partadd(6004, zero_amp, PartBacking::None).await.is_err());
}

/// Partitions with write amplification are not restorable.
#[tokio::test]
async fn amplified_partitions_do_not_restore() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"amped");

    let mut attr = SlsAttr::new(Target::Memory, Mode::Full);
    attr.amplification = 4;
    sls.partadd(6005, attr, PartBacking::None).await.unwrap();
    sls.attach(6005, p.pid).unwrap();
    sls.checkpoint(6005, false).await.unwrap();

    assert!(matches!(
        sls.restore(6005, false, false).await,
        Err(SlsError::Invalid { .. })
    ));
}

/// Process bookkeeping: a pid lives in at most one partition, and
/// `insls` reports membership.
#[tokio::test]
async fn attach_is_exclusive() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"member");

    common::partition(&sls, 6006, Target::Memory, Mode::Full).await;
    common::partition(&sls, 6007, Target::Memory, Mode::Full).await;

    assert_eq!(sls.insls(p.pid), (0, false));
    sls.attach(6006, p.pid).unwrap();
    assert_eq!(sls.insls(p.pid), (6006, true));
    assert!(sls.attach(6007, p.pid).is_err());
    assert!(sls.attach(6006, 0).is_err());
}

/// The partition set exported at teardown is importable by a fresh
/// module over the same store, epoch and attributes intact.
#[tokio::test]
async fn export_import_round_trip() {
    let first = common::module();
    let p = common::spawn_worker(&first, b"persist");

    first
        .partadd(
            6009,
            SlsAttr::new(Target::Slos, Mode::Full),
            PartBacking::None,
        )
        .await
        .unwrap();
    first.attach(6009, p.pid).unwrap();
    first.checkpoint(6009, false).await.unwrap();
    common::quiesce(&first, 6009).await;
    let epoch = first.epoch(6009).unwrap();

    let store = first.store().clone();
    first.teardown().await.unwrap();

    let second = aurora_sls::SlsModule::with_store(
        aurora_sls::SlsConfig::default(),
        store,
    );
    assert_eq!(second.import().await.unwrap(), vec![6009]);
    assert_eq!(second.epoch(6009).unwrap(), epoch);

    // The imported partition restores straight from the same store.
    second.restore(6009, false, false).await.unwrap();
    let restored = common::restored_proc(&second, 6009);
    assert_eq!(
        restored.read_mem(common::MAP_ADDR, 7).unwrap(),
        b"persist"
    );
}

/// Teardown refuses new work, waits for stragglers, and detaches every
/// partition.
#[tokio::test]
async fn teardown_drains_and_detaches() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"done");
    common::partition(&sls, 6008, Target::Memory, Mode::Full).await;
    sls.attach(6008, p.pid).unwrap();
    sls.checkpoint(6008, false).await.unwrap();

    let slsp = sls.partition(6008).unwrap();
    sls.teardown().await.unwrap();

    assert_eq!(slsp.state(), PartState::Detached);
    assert!(matches!(
        sls.checkpoint(6008, false).await,
        Err(SlsError::Busy { .. })
    ));
}
