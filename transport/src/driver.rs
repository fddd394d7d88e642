//! Concrete transport drivers and scheme dispatch.
//!
//! Three drivers share one contract: in-process queue pairs, Unix domain
//! sockets, and TCP with `TCP_NODELAY`. The `ucx` scheme parses but its
//! datapath belongs to the collective plug-in, so the built-in table
//! refuses to dial it.

use crate::wire::{inproc_pair, FramedRx, FramedTx, WirePair};
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use xosc_protocol::{ActorError, Address, ErrorKind, Scheme};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Accepts inbound wires on a bound endpoint.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<WirePair, ActorError>;

    /// The bound address, with ephemeral ports resolved.
    fn local_address(&self) -> Address;
}

/// A transport driver: dials and listens for one scheme family.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, addr: &Address) -> Result<WirePair, ActorError>;
    async fn listen(&self, addr: &Address) -> Result<Box<dyn Acceptor>, ActorError>;
}

fn connect_err(addr: &Address, e: impl std::fmt::Display) -> ActorError {
    ActorError::new(ErrorKind::PeerGone, format!("connect {addr}: {e}"))
}

fn listen_err(addr: &Address, e: impl std::fmt::Display) -> ActorError {
    ActorError::new(ErrorKind::ProtocolError, format!("listen {addr}: {e}"))
}

// ---------------------------------------------------------------------------
// In-process

lazy_static! {
    /// Process-global table of in-process listeners, keyed by endpoint name.
    static ref INPROC_LISTENERS: Mutex<HashMap<String, mpsc::UnboundedSender<WirePair>>> =
        Mutex::new(HashMap::new());
}

/// Same-process driver: paired unbounded queues, no serialization.
pub struct InprocDriver;

struct InprocAcceptor {
    address: Address,
    rx: mpsc::UnboundedReceiver<WirePair>,
}

#[async_trait]
impl Acceptor for InprocAcceptor {
    async fn accept(&mut self) -> Result<WirePair, ActorError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ActorError::new(ErrorKind::PeerGone, "inproc endpoint closed"))
    }

    fn local_address(&self) -> Address {
        self.address.clone()
    }
}

impl Drop for InprocAcceptor {
    fn drop(&mut self) {
        INPROC_LISTENERS.lock().remove(&self.address.host);
    }
}

#[async_trait]
impl Driver for InprocDriver {
    async fn connect(&self, addr: &Address) -> Result<WirePair, ActorError> {
        let listener = INPROC_LISTENERS
            .lock()
            .get(&addr.host)
            .cloned()
            .ok_or_else(|| connect_err(addr, "no such inproc endpoint"))?;
        let (ours, theirs) = inproc_pair();
        listener
            .send(theirs)
            .map_err(|_| connect_err(addr, "inproc endpoint closed"))?;
        Ok(ours)
    }

    async fn listen(&self, addr: &Address) -> Result<Box<dyn Acceptor>, ActorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = INPROC_LISTENERS.lock();
        if listeners.contains_key(&addr.host) {
            return Err(listen_err(addr, "endpoint already bound"));
        }
        listeners.insert(addr.host.clone(), tx);
        Ok(Box::new(InprocAcceptor {
            address: addr.root(),
            rx,
        }))
    }
}

// ---------------------------------------------------------------------------
// TCP

/// Cross-host driver: TCP with Nagle disabled.
pub struct TcpDriver {
    max_envelope_bytes: usize,
}

impl TcpDriver {
    pub fn new(max_envelope_bytes: usize) -> Self {
        Self { max_envelope_bytes }
    }

    fn wrap(&self, stream: TcpStream, addr: &Address) -> Result<WirePair, ActorError> {
        stream.set_nodelay(true).map_err(|e| connect_err(addr, e))?;
        let (read, write) = stream.into_split();
        Ok((
            Box::new(FramedTx::new(write, self.max_envelope_bytes)),
            Box::new(FramedRx::new(read, self.max_envelope_bytes)),
        ))
    }
}

struct TcpAcceptor {
    address: Address,
    listener: TcpListener,
    max_envelope_bytes: usize,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<WirePair, ActorError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| ActorError::new(ErrorKind::PeerGone, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ActorError::new(ErrorKind::PeerGone, e.to_string()))?;
        let (read, write) = stream.into_split();
        Ok((
            Box::new(FramedTx::new(write, self.max_envelope_bytes)),
            Box::new(FramedRx::new(read, self.max_envelope_bytes)),
        ))
    }

    fn local_address(&self) -> Address {
        self.address.clone()
    }
}

#[async_trait]
impl Driver for TcpDriver {
    async fn connect(&self, addr: &Address) -> Result<WirePair, ActorError> {
        let port = addr
            .port
            .ok_or_else(|| connect_err(addr, "missing port"))?;
        let stream = TcpStream::connect((addr.host.as_str(), port))
            .await
            .map_err(|e| connect_err(addr, e))?;
        self.wrap(stream, addr)
    }

    async fn listen(&self, addr: &Address) -> Result<Box<dyn Acceptor>, ActorError> {
        let port = addr.port.ok_or_else(|| listen_err(addr, "missing port"))?;
        let listener = TcpListener::bind((addr.host.as_str(), port))
            .await
            .map_err(|e| listen_err(addr, e))?;
        // Resolve port 0 to the bound ephemeral port.
        let bound = listener.local_addr().map_err(|e| listen_err(addr, e))?;
        let mut address = addr.root();
        address.port = Some(bound.port());
        Ok(Box::new(TcpAcceptor {
            address,
            listener,
            max_envelope_bytes: self.max_envelope_bytes,
        }))
    }
}

// ---------------------------------------------------------------------------
// Unix domain sockets

/// Same-host cross-process driver over Unix domain sockets.
#[cfg(unix)]
pub struct UnixDriver {
    max_envelope_bytes: usize,
}

#[cfg(unix)]
impl UnixDriver {
    pub fn new(max_envelope_bytes: usize) -> Self {
        Self { max_envelope_bytes }
    }
}

#[cfg(unix)]
struct UnixAcceptor {
    address: Address,
    listener: UnixListener,
    max_envelope_bytes: usize,
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(&mut self) -> Result<WirePair, ActorError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| ActorError::new(ErrorKind::PeerGone, e.to_string()))?;
        let (read, write) = stream.into_split();
        Ok((
            Box::new(FramedTx::new(write, self.max_envelope_bytes)),
            Box::new(FramedRx::new(read, self.max_envelope_bytes)),
        ))
    }

    fn local_address(&self) -> Address {
        self.address.clone()
    }
}

#[cfg(unix)]
impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.address.host);
    }
}

#[cfg(unix)]
#[async_trait]
impl Driver for UnixDriver {
    async fn connect(&self, addr: &Address) -> Result<WirePair, ActorError> {
        let stream = UnixStream::connect(&addr.host)
            .await
            .map_err(|e| connect_err(addr, e))?;
        let (read, write) = stream.into_split();
        Ok((
            Box::new(FramedTx::new(write, self.max_envelope_bytes)),
            Box::new(FramedRx::new(read, self.max_envelope_bytes)),
        ))
    }

    async fn listen(&self, addr: &Address) -> Result<Box<dyn Acceptor>, ActorError> {
        // A stale socket file from a crashed predecessor refuses rebinding.
        let _ = std::fs::remove_file(&addr.host);
        let listener = UnixListener::bind(&addr.host).map_err(|e| listen_err(addr, e))?;
        Ok(Box::new(UnixAcceptor {
            address: addr.root(),
            listener,
            max_envelope_bytes: self.max_envelope_bytes,
        }))
    }
}

// ---------------------------------------------------------------------------
// Dispatch

/// Scheme-keyed driver table used by the router.
pub struct DriverTable {
    inproc: InprocDriver,
    tcp: TcpDriver,
    #[cfg(unix)]
    unix: UnixDriver,
}

impl DriverTable {
    pub fn new(max_envelope_bytes: usize) -> Self {
        Self {
            inproc: InprocDriver,
            tcp: TcpDriver::new(max_envelope_bytes),
            #[cfg(unix)]
            unix: UnixDriver::new(max_envelope_bytes),
        }
    }

    /// Select the driver for an address.
    pub fn for_scheme(&self, scheme: Scheme) -> Result<&dyn Driver, ActorError> {
        match scheme {
            Scheme::Inproc => Ok(&self.inproc),
            Scheme::Tcp => Ok(&self.tcp),
            #[cfg(unix)]
            Scheme::Unix => Ok(&self.unix),
            #[cfg(not(unix))]
            Scheme::Unix => Err(ActorError::new(
                ErrorKind::ProtocolError,
                "unix sockets unavailable on this platform",
            )),
            Scheme::Ucx => Err(ActorError::new(
                ErrorKind::ProtocolError,
                "ucx datapath is provided by the collective plug-in",
            )),
        }
    }

    pub async fn connect(&self, addr: &Address) -> Result<WirePair, ActorError> {
        self.for_scheme(addr.scheme)?.connect(addr).await
    }

    pub async fn listen(&self, addr: &Address) -> Result<Box<dyn Acceptor>, ActorError> {
        self.for_scheme(addr.scheme)?.listen(addr).await
    }
}
