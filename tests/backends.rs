//! Backend round trips: local store, file tree, and the streaming peer.

mod common;

use std::time::Duration;

use aurora_sls::partition::PartBacking;
use aurora_sls::{Mode, SlsAttr, SlsModule, Target};
use common::MAP_ADDR;

/// The store holds one node per record plus the manifest; every ID the
/// manifest lists resolves, and a second checkpoint replaces the
/// manifest without corrupting it.
#[tokio::test]
async fn store_manifest_is_consistent() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"stored");

    common::partition(&sls, 7000, Target::Slos, Mode::Full).await;
    sls.attach(7000, p.pid).unwrap();
    sls.checkpoint(7000, false).await.unwrap();
    common::quiesce(&sls, 7000).await;

    let manifest = sls.store().read_meta(7000).unwrap();
    assert!(!manifest.is_empty());
    assert_eq!(manifest.len() % 8, 0);
    let first_count = manifest.len() / 8;
    for chunk in manifest.chunks_exact(8) {
        let id = u64::from_le_bytes(chunk.try_into().unwrap());
        sls.store().rstat(id).expect("manifest id resolves");
    }

    // Same workload, same shape: the record count is stable.
    sls.checkpoint(7000, false).await.unwrap();
    common::quiesce(&sls, 7000).await;
    let manifest = sls.store().read_meta(7000).unwrap();
    assert_eq!(manifest.len() / 8, first_count);
}

/// Pages land in sparse blocks: block 0 is metadata, page `p` is block
/// `p + 1`, and seek-data finds the written extent.
#[tokio::test]
async fn store_data_layout() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"layout");
    // Touch a second, discontiguous page.
    p.write_mem(MAP_ADDR + 3 * 4096, b"tail").unwrap();

    common::partition(&sls, 7001, Target::Slos, Mode::Full).await;
    sls.attach(7001, p.pid).unwrap();
    sls.checkpoint(7001, false).await.unwrap();
    common::quiesce(&sls, 7001).await;

    // Find the data record: the one whose node has page blocks.
    let manifest = sls.store().read_meta(7001).unwrap();
    let data_id = manifest
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .find(|&id| sls.store().seek_data(id, 1).is_some())
        .expect("a data record");

    assert_eq!(sls.store().seek_data(data_id, 1), Some(1));
    let block = sls.store().read_block(data_id, 1).unwrap();
    assert_eq!(&block[..6], b"layout");
    // Page 3 sits at block 4, with a hole in between.
    assert_eq!(sls.store().seek_data(data_id, 2), Some(4));
    let block = sls.store().read_block(data_id, 4).unwrap();
    assert_eq!(&block[..4], b"tail");
}

/// Full round trip through a file tree on disk.
#[tokio::test]
async fn filetree_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("part");

    let sls = common::module();
    let p = common::spawn_worker(&sls, b"tree");
    let old_pid = p.pid;

    sls.partadd(
        7002,
        SlsAttr::new(Target::FileTree, Mode::Full),
        PartBacking::Dir(root.clone()),
    )
    .await
    .unwrap();
    sls.attach(7002, old_pid).unwrap();

    let epoch_at_write = sls.partition(7002).unwrap().epoch();
    sls.checkpoint(7002, false).await.unwrap();
    common::quiesce(&sls, 7002).await;

    // One directory per epoch, manifest named after the partition.
    let epoch_dir = root.join(format!("{epoch_at_write}"));
    assert!(epoch_dir.join("7002").is_file());

    drop(p);
    sls.host.reap(old_pid);
    sls.restore(7002, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 7002);
    assert_eq!(restored.read_mem(MAP_ADDR, 4).unwrap(), b"tree");
}

/// A checkpoint streamed to a peer reconstitutes there and restores.
#[tokio::test]
async fn streamed_checkpoint_restores_on_the_peer() {
    // Find a free port for the receiver.
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let receiver = common::module();
    receiver
        .partadd(
            7003,
            SlsAttr::new(Target::SockRecv, Mode::Full),
            PartBacking::Peer(addr),
        )
        .await
        .unwrap();

    let sender: std::sync::Arc<SlsModule> = common::module();
    let p = common::spawn_worker(&sender, b"roaming");
    sender
        .partadd(
            7003,
            SlsAttr::new(Target::SockSend, Mode::Full),
            PartBacking::Peer(addr),
        )
        .await
        .unwrap();
    sender.attach(7003, p.pid).unwrap();
    sender.checkpoint(7003, false).await.unwrap();

    // Wait for the receiver to finish reconstituting.
    let slsp = receiver.partition(7003).unwrap();
    let mut tries = 0;
    while slsp.sckpt().is_none() {
        tries += 1;
        assert!(tries < 100, "checkpoint never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    receiver.restore(7003, false, false).await.unwrap();
    let restored = common::restored_proc(&receiver, 7003);
    assert_eq!(restored.read_mem(MAP_ADDR, 7).unwrap(), b"roaming");
}
