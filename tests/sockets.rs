//! Socket capture: listening IPv4, Unix pairs, and Metropolis rebinds.

mod common;

use std::sync::Arc;

use aurora_sls::host::file::{File, FileBacking};
use aurora_sls::host::socket::{SockFamily, SockType, Socket};
use aurora_sls::{Mode, Target};

fn sock_of(file: &File) -> Arc<Socket> {
    match &file.backing {
        FileBacking::Socket(so) => so.clone(),
        _ => panic!("descriptor is not a socket"),
    }
}

/// A listening socket on port 4242 with backlog 16 is captured and
/// restored; a connect against the restored listener succeeds and the
/// accepted peer lands in its queue.
#[tokio::test]
async fn listener_accepts_after_restore() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"server");
    let (fd, so) = common::plumb_listener(&sls, &p, 4242, 16);

    common::partition(&sls, 4000, Target::Slos, Mode::Full).await;
    sls.attach(4000, p.pid).unwrap();
    sls.checkpoint(4000, false).await.unwrap();

    let pid = p.pid;
    drop((p, so));
    sls.host.reap(pid);

    sls.restore(4000, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 4000);
    let file = restored.fdtable.lock().get(fd).unwrap();
    let so = sock_of(&file);
    assert!(so.is_listening());
    assert_eq!(so.backlog.load(std::sync::atomic::Ordering::Relaxed), 16);

    let peer = sls.host.ports.connect(4242).expect("connecting to restored listener");
    assert_eq!(so.accept_queue.lock().len(), 1);
    assert!(Arc::ptr_eq(&so.accept_queue.lock()[0], &peer));
}

/// A connected Unix stream pair reconnects into an equivalent peer
/// relationship with credentials transferred.
#[tokio::test]
async fn unix_pair_reconnects() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"paired");

    let a = Socket::new(SockFamily::Unix, SockType::Stream, 0);
    let b = Socket::new(SockFamily::Unix, SockType::Stream, 0);
    Socket::connect2(&a, &b).unwrap();
    let afd = p.fdtable.lock().alloc(File::new(FileBacking::Socket(a), 0));
    let bfd = p.fdtable.lock().alloc(File::new(FileBacking::Socket(b), 0));

    common::partition(&sls, 4001, Target::Slos, Mode::Full).await;
    sls.attach(4001, p.pid).unwrap();
    sls.checkpoint(4001, false).await.unwrap();

    let pid = p.pid;
    drop(p);
    sls.host.reap(pid);
    sls.restore(4001, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 4001);
    let fa = sock_of(&restored.fdtable.lock().get(afd).unwrap());
    let fb = sock_of(&restored.fdtable.lock().get(bfd).unwrap());

    assert!(Arc::ptr_eq(&fa.unix_peer().unwrap(), &fb));
    assert!(Arc::ptr_eq(&fb.unix_peer().unwrap(), &fa));
    assert!(fa.un.lock().peercred);
    assert!(fb.un.lock().peercred);
}

/// A bound Unix listener re-binds against the restored vnode, not by
/// name resolution.
#[tokio::test]
async fn unix_listener_rebinds_by_vnode() {
    use aurora_sls::host::fs::VnodeKind;

    let sls = common::module();
    let p = common::spawn_worker(&sls, b"unixd");

    let so = Socket::new(SockFamily::Unix, SockType::Stream, 0);
    let vp = sls.host.vfs.create("/tmp/srv.sock", VnodeKind::Socket).unwrap();
    so.bind_vnode("/tmp/srv.sock", &vp).unwrap();
    so.listen(8);
    let fd = p.fdtable.lock().alloc(File::new(FileBacking::Socket(so), 0));

    common::partition(&sls, 4002, Target::Slos, Mode::Full).await;
    sls.attach(4002, p.pid).unwrap();
    sls.checkpoint(4002, false).await.unwrap();

    let pid = p.pid;
    drop(p);
    sls.host.reap(pid);
    sls.restore(4002, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 4002);
    let so = sock_of(&restored.fdtable.lock().get(fd).unwrap());
    assert!(so.is_listening());
    let bound = so.un.lock().vnode.clone().unwrap();
    assert_eq!(bound.fullpath().as_deref(), Some("/tmp/srv.sock"));
    // The vnode's binding points back at the restored socket.
    assert!(Arc::ptr_eq(&bound.bound_socket().unwrap(), &so));
}

/// Metropolis: captured inside accept(), restored twice. Each restore
/// binds a fresh random port, reports it, and splices the accepted
/// socket into the captured thread.
#[tokio::test]
async fn metropolis_restores_take_random_ports() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"metro");
    let (lfd, _listener) = common::plumb_listener(&sls, &p, 8080, 4);
    let tid = p.threads.lock()[0].tid;
    let sockfp = p.fdtable.lock().get(lfd).unwrap();

    common::partition(&sls, 4003, Target::Slos, Mode::Full).await;
    sls.metropolis_register(4003, p.pid, tid, sockfp)
        .await
        .unwrap();
    drop(p);

    let mut ports = Vec::new();
    for _ in 0..2 {
        // The Metropolis daemon hands each restore a fresh connection.
        let conn = File::new(
            FileBacking::Socket(Socket::new(SockFamily::Inet, SockType::Stream, 6)),
            0,
        );
        sls.set_metr_sock(4003, conn.clone()).unwrap();
        sls.restore(4003, true, false).await.unwrap();

        let port = sls.metropolis(4003).unwrap().port;
        assert!((1024..=65535).contains(&port));
        ports.push(port);

        // The accepted socket went to the thread that was in accept().
        let restored = common::live_procs(&sls, 4003)
            .into_iter()
            .max_by_key(|p| p.pid)
            .unwrap();
        let threads = restored.threads.lock().clone();
        let td = threads.iter().find(|td| td.tid == tid).unwrap();
        let spliced = restored.fdtable.lock().get(td.retval as u32).unwrap();
        assert!(Arc::ptr_eq(&spliced, &conn));
    }
    assert_ne!(ports[0], ports[1], "distinct ports per restore");
}
