//! Pipe capture across a parent/child pair.

mod common;

use aurora_sls::host::file::FileBacking;
use aurora_sls::{Mode, Target};

/// Parent writes "ping" into a pipe, the pair is captured before the
/// child reads, both die, both are restored: the child's read returns
/// "ping".
#[tokio::test]
async fn buffered_bytes_cross_the_checkpoint() {
    let sls = common::module();
    let parent = common::spawn_worker(&sls, b"parent");
    let child = sls.host.fork(&parent, "child").unwrap();
    child
        .vmspace()
        .mmap_anon(
            common::MAP_ADDR,
            aurora_sls::host::vm::PAGE_SIZE as u64,
            aurora_sls::host::vm::PROT_READ | aurora_sls::host::vm::PROT_WRITE,
        )
        .unwrap();

    let (wfd, rfd) = common::plumb_pipe(&parent, &child);

    // The write happens before the pass; the read after restore.
    let wfile = parent.fdtable.lock().get(wfd).unwrap();
    let FileBacking::Pipe(wpipe) = &wfile.backing else {
        panic!("not a pipe");
    };
    assert_eq!(wpipe.write(b"ping").unwrap(), 4);

    common::partition(&sls, 3000, Target::Slos, Mode::Full).await;
    sls.attach(3000, parent.pid).unwrap();
    sls.attach(3000, child.pid).unwrap();
    sls.checkpoint(3000, false).await.unwrap();

    let (ppid, cpid) = (parent.pid, child.pid);
    drop((parent, child, wfile));
    sls.host.reap(ppid);
    sls.host.reap(cpid);

    sls.restore(3000, false, false).await.unwrap();

    let live = common::live_procs(&sls, 3000);
    assert_eq!(live.len(), 2);
    let new_child = live
        .iter()
        .find(|p| &*p.comm.lock() == "child")
        .expect("restored child");

    let rfile = new_child.fdtable.lock().get(rfd).unwrap();
    let FileBacking::Pipe(rpipe) = &rfile.backing else {
        panic!("restored fd is not a pipe");
    };
    assert!(!rpipe.write_end);
    assert_eq!(rpipe.read(16), b"ping");
}

/// A pair captured together is restored together: both ends reconnect
/// and the buffered indices round-trip.
#[tokio::test]
async fn pair_reconnects_with_indices() {
    let sls = common::module();
    let p = common::spawn_worker(&sls, b"pipes");

    let (wfd, rfd) = common::plumb_pipe(&p, &p);
    let wfile = p.fdtable.lock().get(wfd).unwrap();
    let FileBacking::Pipe(wpipe) = &wfile.backing else {
        panic!("not a pipe");
    };
    wpipe.write(b"0123456789").unwrap();
    // Drain a few so the in/out indices are nontrivial.
    let rfile = p.fdtable.lock().get(rfd).unwrap();
    let FileBacking::Pipe(rpipe) = &rfile.backing else {
        panic!("not a pipe");
    };
    assert_eq!(rpipe.read(4), b"0123");
    let (old_in, old_out) = {
        let buf = rpipe.buf.lock();
        (buf.r#in, buf.out)
    };

    common::partition(&sls, 3001, Target::Slos, Mode::Full).await;
    sls.attach(3001, p.pid).unwrap();
    sls.checkpoint(3001, false).await.unwrap();

    let pid = p.pid;
    drop((p, wfile, rfile));
    sls.host.reap(pid);
    sls.restore(3001, false, false).await.unwrap();

    let restored = common::restored_proc(&sls, 3001);
    let rfile = restored.fdtable.lock().get(rfd).unwrap();
    let wfile = restored.fdtable.lock().get(wfd).unwrap();

    let FileBacking::Pipe(rpipe) = &rfile.backing else {
        panic!("read end is not a pipe");
    };
    let FileBacking::Pipe(wpipe) = &wfile.backing else {
        panic!("write end is not a pipe");
    };

    // The two fds are opposite ends of one pair.
    assert!(wpipe.write_end);
    assert!(!rpipe.write_end);
    assert!(std::sync::Arc::ptr_eq(
        &rpipe.peer().unwrap(),
        wpipe
    ));

    {
        let buf = rpipe.buf.lock();
        assert_eq!(buf.r#in, old_in);
        assert_eq!(buf.out, old_out);
    }
    assert_eq!(rpipe.read(16), b"456789");
}
