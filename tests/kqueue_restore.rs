//! Kqueue capture: knote preservation and the dead-connection EOF patch.

mod common;

use aurora_sls::host::file::{File, FileBacking};
use aurora_sls::host::kqueue::{
    ECONNRESET_DATA, EV_ADD, EV_ERROR, EVFILT_READ, EVFILT_TIMER, KN_QUEUED, Kqueue,
};
use aurora_sls::host::socket::{SS_ISCONNECTED, SockFamily, SockType, Socket};
use aurora_sls::{Mode, Target};

/// Every non-in-flux knote survives with its fields; queued-active
/// knotes come back active.
#[tokio::test]
async fn knotes_round_trip() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"events");

    let (_, rfd) = common::plumb_pipe(&p, &p);

    let kq = Kqueue::new();
    kq.attach(p.pid);
    kq.register(rfd as u64, EVFILT_READ, EV_ADD, 0x10, 0);
    kq.register(99, EVFILT_TIMER, EV_ADD, 0, 5000);
    kq.enqueue(99, EVFILT_TIMER);
    let kfd = p
        .fdtable
        .lock()
        .alloc(File::new(FileBacking::Kqueue(kq), 0));

    common::partition(&sls, 5000, Target::Slos, Mode::Full).await;
    sls.attach(5000, p.pid).unwrap();
    sls.checkpoint(5000, false).await.unwrap();

    let pid = p.pid;
    drop(p);
    sls.host.reap(pid);
    sls.restore(5000, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 5000);
    let kfile = restored.fdtable.lock().get(kfd).unwrap();
    let FileBacking::Kqueue(kq) = &kfile.backing else {
        panic!("fd is not a kqueue");
    };

    let knotes = kq.knotes();
    assert_eq!(knotes.len(), 2);

    let timer = knotes
        .iter()
        .find(|kn| kn.filter == EVFILT_TIMER)
        .expect("timer knote");
    assert_eq!(timer.ident, 99);
    assert_eq!(timer.sdata, 5000);
    assert!(timer.status & KN_QUEUED != 0, "queued knote is active again");

    let read = knotes
        .iter()
        .find(|kn| kn.filter == EVFILT_READ)
        .expect("read knote");
    assert_eq!(read.ident, rfd as u64);
    assert_eq!(read.sfflags, 0x10);
    assert!(read.status & KN_QUEUED == 0);

    // The kqueue's back-pointer was fixed to the restored table.
    assert_eq!(*kq.owner.lock(), Some(restored.pid));
}

/// A knote watching a connected TCP socket that cannot be revived is
/// patched to report EOF with ECONNRESET.
#[tokio::test]
async fn dead_connection_reports_eof() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"netapp");

    // A connected stream socket: captured only as a placeholder.
    let so = Socket::new(SockFamily::Inet, SockType::Stream, 6);
    so.state
        .fetch_or(SS_ISCONNECTED, std::sync::atomic::Ordering::Relaxed);
    {
        let mut inet = so.inet.lock();
        inet.lport = 33000;
        inet.fport = 80;
    }
    let sfd = p.fdtable.lock().alloc(File::new(FileBacking::Socket(so), 0));

    let kq = Kqueue::new();
    kq.attach(p.pid);
    kq.register(sfd as u64, EVFILT_READ, EV_ADD, 0, 0);
    let kfd = p
        .fdtable
        .lock()
        .alloc(File::new(FileBacking::Kqueue(kq), 0));

    common::partition(&sls, 5001, Target::Slos, Mode::Full).await;
    sls.attach(5001, p.pid).unwrap();
    sls.checkpoint(5001, false).await.unwrap();

    let pid = p.pid;
    drop(p);
    sls.host.reap(pid);
    sls.restore(5001, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 5001);

    // The placeholder came back as an unconnected inet socket.
    let sfile = restored.fdtable.lock().get(sfd).unwrap();
    let FileBacking::Socket(so) = &sfile.backing else {
        panic!("fd is not a socket");
    };
    assert!(!so.is_connected_inet());
    assert!(!so.is_listening());

    let kfile = restored.fdtable.lock().get(kfd).unwrap();
    let FileBacking::Kqueue(kq) = &kfile.backing else {
        panic!("fd is not a kqueue");
    };
    let kn = kq
        .knotes_for(sfd as u64)
        .pop()
        .expect("knote on the dead socket");
    assert!(kn.flags & EV_ERROR != 0);
    assert_eq!(kn.data, ECONNRESET_DATA);
    assert!(kn.status & KN_QUEUED != 0);
}
