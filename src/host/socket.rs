//! Modeled sockets: Unix (stream/datagram) and IPv4.
//!
//! Carries exactly the state capture consumes: family, type, protocol,
//! options, listening backlog, the local Unix binding (path + vnode) or
//! IPv4 address/port, and the connected peer for paired Unix sockets. The
//! host keeps a bound-port registry so rebinds at restore observe the same
//! address-in-use behavior the real stack gives.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::fs::Vnode;
use super::vm::alloc_addr;
use crate::error::{Result, SlsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockFamily {
    /// Placeholder for sockets that cannot be revived (connected IPv4).
    Unspec,
    Inet,
    Unix,
}

impl SockFamily {
    pub fn tag(self) -> u16 {
        match self {
            SockFamily::Unspec => 0,
            SockFamily::Inet => 2,
            SockFamily::Unix => 1,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            0 => SockFamily::Unspec,
            1 => SockFamily::Unix,
            2 => SockFamily::Inet,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
    SeqPacket,
}

impl SockType {
    pub fn tag(self) -> u16 {
        match self {
            SockType::Stream => 1,
            SockType::Dgram => 2,
            SockType::SeqPacket => 5,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => SockType::Stream,
            2 => SockType::Dgram,
            5 => SockType::SeqPacket,
            _ => return None,
        })
    }
}

/// Socket options that are plain flag sets and therefore restorable.
pub const SO_REUSEADDR: u32 = 0x0004;
pub const SO_KEEPALIVE: u32 = 0x0008;
pub const SO_ACCEPTCONN: u32 = 0x0002;
pub const SO_NOSIGPIPE: u32 = 0x0800;
pub const SO_RESTORABLE: u32 = SO_REUSEADDR | SO_KEEPALIVE | SO_NOSIGPIPE;

/// State bits.
pub const SS_NBIO: u32 = 0x0100;
pub const SS_ASYNC: u32 = 0x0200;
pub const SS_ISCONNECTED: u32 = 0x0002;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InetInfo {
    pub laddr: u32,
    pub lport: u16,
    pub faddr: u32,
    pub fport: u16,
}

#[derive(Default)]
pub struct UnixInfo {
    pub path: Option<String>,
    pub vnode: Option<Arc<Vnode>>,
    pub peer: Weak<Socket>,
    /// Stream peers get each other's credentials on `connect2`.
    pub peercred: bool,
}

pub struct Socket {
    pub addr: u64,
    pub family: SockFamily,
    pub stype: SockType,
    pub proto: u16,
    pub options: AtomicU32,
    pub state: AtomicU32,
    pub listening: AtomicBool,
    pub backlog: AtomicU32,
    pub inet: Mutex<InetInfo>,
    pub un: Mutex<UnixInfo>,
    /// Pending inbound connections on a listening socket.
    pub accept_queue: Mutex<Vec<Arc<Socket>>>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("addr", &self.addr)
            .field("family", &self.family)
            .field("stype", &self.stype)
            .field("listening", &self.listening.load(Ordering::Relaxed))
            .finish()
    }
}

impl Socket {
    pub fn new(family: SockFamily, stype: SockType, proto: u16) -> Arc<Self> {
        Arc::new(Self {
            addr: alloc_addr(),
            family,
            stype,
            proto,
            options: AtomicU32::new(0),
            state: AtomicU32::new(0),
            listening: AtomicBool::new(false),
            backlog: AtomicU32::new(0),
            inet: Mutex::new(InetInfo::default()),
            un: Mutex::new(UnixInfo::default()),
            accept_queue: Mutex::new(Vec::new()),
        })
    }

    pub fn unix_peer(&self) -> Option<Arc<Socket>> {
        if self.family != SockFamily::Unix {
            return None;
        }
        self.un.lock().peer.upgrade()
    }

    /// Bidirectionally connect two Unix sockets (`soconnect2` shape);
    /// stream peers also exchange credentials.
    pub fn connect2(a: &Arc<Socket>, b: &Arc<Socket>) -> Result<()> {
        if a.family != SockFamily::Unix || b.family != SockFamily::Unix {
            return Err(SlsError::invalid("connect2 on non-unix sockets"));
        }
        a.un.lock().peer = Arc::downgrade(b);
        b.un.lock().peer = Arc::downgrade(a);
        if a.stype == SockType::Stream || a.stype == SockType::SeqPacket {
            a.un.lock().peercred = true;
            b.un.lock().peercred = true;
        }
        a.state.fetch_or(SS_ISCONNECTED, Ordering::Relaxed);
        b.state.fetch_or(SS_ISCONNECTED, Ordering::Relaxed);
        Ok(())
    }

    /// Bind a Unix socket directly against an existing vnode, bypassing
    /// name resolution. The restore path uses this so the binding lands on
    /// the checkpoint-time node regardless of the current namespace.
    pub fn bind_vnode(self: &Arc<Self>, path: &str, vp: &Arc<Vnode>) -> Result<()> {
        let mut un = self.un.lock();
        if un.vnode.is_some() {
            return Err(SlsError::invalid("unix socket already bound"));
        }
        vp.vref();
        vp.bind_socket(self);
        un.path = Some(path.to_string());
        un.vnode = Some(vp.clone());
        Ok(())
    }

    pub fn listen(&self, backlog: u32) {
        self.backlog.store(backlog, Ordering::Relaxed);
        self.listening.store(true, Ordering::Relaxed);
        self.options.fetch_or(SO_ACCEPTCONN, Ordering::Relaxed);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    pub fn is_connected_inet(&self) -> bool {
        self.family == SockFamily::Inet
            && !self.is_listening()
            && self.state.load(Ordering::Relaxed) & SS_ISCONNECTED != 0
    }
}

/// Host-wide IPv4 port registry.
#[derive(Default)]
pub struct PortTable {
    bound: Mutex<FxHashMap<u16, Weak<Socket>>>,
}

impl PortTable {
    /// Reserve `port` for `so`. Fails if another live socket holds it.
    pub fn bind(&self, so: &Arc<Socket>, addr: u32, port: u16) -> Result<()> {
        let mut bound = self.bound.lock();
        if let Some(holder) = bound.get(&port) {
            if holder.strong_count() > 0 {
                return Err(SlsError::invalid(format!("port {port} in use")));
            }
        }
        bound.insert(port, Arc::downgrade(so));
        let mut inet = so.inet.lock();
        inet.laddr = addr;
        inet.lport = port;
        Ok(())
    }

    /// Connect to a listening socket on `port`, returning the accepted
    /// peer the listener would hand out.
    pub fn connect(&self, port: u16) -> Result<Arc<Socket>> {
        let listener = {
            let bound = self.bound.lock();
            bound
                .get(&port)
                .and_then(|w| w.upgrade())
                .ok_or_else(|| SlsError::gone(format!("nothing bound on port {port}")))?
        };
        if !listener.is_listening() {
            return Err(SlsError::invalid(format!("port {port} not listening")));
        }
        let accepted = Socket::new(SockFamily::Inet, listener.stype, listener.proto);
        accepted.state.fetch_or(SS_ISCONNECTED, Ordering::Relaxed);
        listener.accept_queue.lock().push(accepted.clone());
        Ok(accepted)
    }

    pub fn port_of(&self, so: &Arc<Socket>) -> Option<u16> {
        let inet = so.inet.lock();
        (inet.lport != 0).then_some(inet.lport)
    }
}
