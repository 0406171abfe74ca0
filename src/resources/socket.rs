//! Socket capture and restoration.
//!
//! Unix sockets come back whole: listening sockets re-bind against the
//! checkpoint-time vnode (bypassing name resolution so renames in between
//! cannot redirect the binding), and data sockets are re-created as a
//! connected pair with credentials transferred between stream peers.
//! IPv4 listening sockets re-bind and listen with the captured backlog;
//! in Metropolis mode the listener takes a fresh random port and reports
//! it back. Connected IPv4 sockets cannot be revived and are captured as
//! placeholders that surface EOF through any watching kqueue.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::error::{Result, SlsError};
use crate::host::file::{File, FileBacking};
use crate::host::process::Process;
use crate::host::socket::{
    InetInfo, SO_ACCEPTCONN, SO_RESTORABLE, SS_ASYNC, SS_NBIO, SockFamily, SockType, Socket,
};
use crate::partition::CkptData;
use crate::record::{RecReader, RecWriter, RecordType, SlsId};
use crate::rest::RestoreData;

use super::{FileInfo, SlsFileOps};

const METROPOLIS_RETRIES: u32 = 1000;

pub(crate) struct SocketOps;

fn sock_of(file: &File) -> Result<Arc<Socket>> {
    match &file.backing {
        FileBacking::Socket(so) => Ok(so.clone()),
        _ => Err(SlsError::invalid("socket descriptor without a socket")),
    }
}

impl SlsFileOps for SocketOps {
    fn supported(&self, file: &File) -> bool {
        let Ok(so) = sock_of(file) else {
            return false;
        };
        match so.family {
            SockFamily::Unix => true,
            // Connected IPv4 sockets pass too; they degrade to
            // placeholders at capture.
            SockFamily::Inet => true,
            SockFamily::Unspec => false,
        }
    }

    fn slsid(&self, file: &File) -> SlsId {
        sock_of(file).map(|so| so.addr).unwrap_or(0)
    }

    fn checkpoint(
        &self,
        _p: &Arc<Process>,
        file: &Arc<File>,
        info: &mut FileInfo,
        w: &mut RecWriter,
        sckpt: &CkptData,
    ) -> Result<()> {
        let so = sock_of(file)?;
        info.backer = so.addr;

        use std::sync::atomic::Ordering;
        // A connected IPv4 stream cannot come back; record a placeholder.
        let family = if so.is_connected_inet() && so.stype == SockType::Stream {
            SockFamily::Unspec
        } else {
            so.family
        };

        let inet = *so.inet.lock();
        let (un_path, un_vnode, unpeer, bound) = {
            let un = so.un.lock();
            let bound = match so.family {
                SockFamily::Unix => un.vnode.is_some(),
                SockFamily::Inet => inet.lport != 0,
                SockFamily::Unspec => false,
            };
            if let Some(vp) = &un.vnode {
                sckpt.vnode_hold(vp);
            }
            (
                un.path.clone(),
                un.vnode.as_ref().map_or(0, |vp| vp.addr),
                un.peer.upgrade().map_or(0, |peer| peer.addr),
                bound,
            )
        };

        w.put_u32(RecordType::Socket.magic());
        w.put_u64(so.addr);
        w.put_u16(family.tag());
        w.put_u16(so.stype.tag());
        w.put_u16(so.proto);
        w.put_u32(so.options.load(Ordering::Relaxed));
        w.put_u32(so.state.load(Ordering::Relaxed));
        w.put_u32(so.backlog.load(Ordering::Relaxed));
        w.put_bool(bound);
        w.put_u32(inet.laddr);
        w.put_u16(inet.lport);
        w.put_u32(inet.faddr);
        w.put_u16(inet.fport);
        w.put_opt_str(un_path.as_deref());
        w.put_u64(un_vnode);
        w.put_u64(unpeer);
        Ok(())
    }

    fn restore(
        &self,
        info: &FileInfo,
        r: &mut RecReader<'_>,
        restdata: &RestoreData,
    ) -> Result<Option<Arc<File>>> {
        r.expect_magic(RecordType::Socket)?;
        let slsid = r.get_u64()?;
        let family = SockFamily::from_tag(r.get_u16()?)
            .ok_or_else(|| SlsError::protocol("unknown socket family"))?;
        let stype = SockType::from_tag(r.get_u16()?)
            .ok_or_else(|| SlsError::protocol("unknown socket type"))?;
        let proto = r.get_u16()?;
        let options = r.get_u32()?;
        let state = r.get_u32()?;
        let backlog = r.get_u32()?;
        let bound = r.get_bool()?;
        let inet = InetInfo {
            laddr: r.get_u32()?,
            lport: r.get_u16()?,
            faddr: r.get_u32()?,
            fport: r.get_u16()?,
        };
        let un_path = r.get_opt_str()?;
        let un_vnode = r.get_u64()?;
        let unpeer = r.get_u64()?;

        // A pair restored from the other side already brought us back.
        if restdata.fptable.contains(slsid) {
            return Ok(None);
        }

        // Placeholders become unconnected inet sockets.
        let create_family = if family == SockFamily::Unspec {
            SockFamily::Inet
        } else {
            family
        };
        let so = Socket::new(create_family, stype, proto);

        use std::sync::atomic::Ordering;
        so.options
            .store(options & SO_RESTORABLE, Ordering::Relaxed);
        // Async/non-blocking state is carried on both the socket and the
        // descriptor flags (the latter restored by the common path).
        so.state
            .store(state & (SS_NBIO | SS_ASYNC), Ordering::Relaxed);

        match family {
            SockFamily::Unspec => {}
            SockFamily::Inet => {
                if bound {
                    self::rebind_inet(&so, &inet, slsid, restdata)?;
                }
            }
            SockFamily::Unix => {
                if bound {
                    let vp = restdata.vntable.find(un_vnode).ok_or_else(|| {
                        SlsError::gone("bound socket vnode was not restored")
                    })?;
                    let path = un_path
                        .ok_or_else(|| SlsError::protocol("bound unix socket without a path"))?;
                    so.bind_vnode(&path, &vp)?;
                }
                if unpeer != 0 {
                    let peer = Socket::new(SockFamily::Unix, stype, proto);
                    Socket::connect2(&so, &peer)?;
                    let peer_fp = File::new(FileBacking::Socket(peer), info.flags);
                    restdata.fptable.add(unpeer, peer_fp)?;
                }
            }
        }

        if options & SO_ACCEPTCONN != 0 && family != SockFamily::Unspec {
            debug!(slsid, backlog, "socket back to listening");
            so.listen(backlog);
        }

        Ok(Some(File::new(FileBacking::Socket(so), info.flags)))
    }
}

/// Re-bind a restored IPv4 socket. Metropolis listeners draw a fresh
/// random port and report it; everyone else reclaims the captured one.
fn rebind_inet(
    so: &Arc<Socket>,
    inet: &InetInfo,
    slsid: SlsId,
    restdata: &RestoreData,
) -> Result<()> {
    if restdata.metr.sockid == slsid {
        let mut rng = rand::rng();
        for _ in 0..METROPOLIS_RETRIES {
            let port: u16 = rng.random_range(1024..=65535);
            if restdata.host.ports.bind(so, inet.laddr, port).is_ok() {
                restdata.slsp.metr.lock().port = port;
                debug!(port, "metropolis listener rebound");
                return Ok(());
            }
        }
        return Err(SlsError::busy("no free port for metropolis rebind"));
    }

    restdata.host.ports.bind(so, inet.laddr, inet.lport)
}
