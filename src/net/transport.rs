//! Stream transports.
//!
//! Connections and transfer sessions are written once against [`BoxStream`];
//! [`Transport`] is the seam that produces those streams. [`TcpTransport`]
//! is the real network path. [`MemoryLan`] is an in-process network of
//! `tokio::io::duplex` pipes and broadcast beacons that lets several nodes
//! talk to each other inside one test binary.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};

use super::discovery::BeaconChannel;

/// Buffer size of each in-memory pipe direction.
const DUPLEX_BUFFER: usize = 256 * 1024;

/// Beacons retained for slow in-memory receivers.
const BEACON_BACKLOG: usize = 1024;

/// First port handed out by a [`MemoryLan`].
const FIRST_MEMORY_PORT: u16 = 40_000;

/// A bidirectional byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream handed to the connection layer.
pub type BoxStream = Box<dyn ByteStream>;

/// Produces outbound streams and accepts inbound ones.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a stream to `addr`.
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxStream>;

    /// Waits for the next inbound stream.
    async fn accept(&self) -> io::Result<(BoxStream, SocketAddr)>;

    /// Address peers should connect to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// TCP listener plus outbound dialer.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "TCP listener bound");
        Ok(Self { listener })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> io::Result<(BoxStream, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), remote))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

type Incoming = (BoxStream, SocketAddr);

struct LanInner {
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Incoming>>>,
    /// Far ends of connections to black-holed addresses, kept open forever
    swallowed: Mutex<Vec<DuplexStream>>,
    blackholes: Mutex<Vec<SocketAddr>>,
    beacons: broadcast::Sender<(Bytes, SocketAddr)>,
    next_port: AtomicU16,
}

/// An in-process network shared by any number of nodes.
#[derive(Clone)]
pub struct MemoryLan {
    inner: Arc<LanInner>,
}

impl Default for MemoryLan {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLan")
            .field("listeners", &self.inner.listeners.lock().len())
            .finish_non_exhaustive()
    }
}

impl MemoryLan {
    pub fn new() -> Self {
        let (beacons, _) = broadcast::channel(BEACON_BACKLOG);
        Self {
            inner: Arc::new(LanInner {
                listeners: Mutex::new(HashMap::new()),
                swallowed: Mutex::new(Vec::new()),
                blackholes: Mutex::new(Vec::new()),
                beacons,
                next_port: AtomicU16::new(FIRST_MEMORY_PORT),
            }),
        }
    }

    fn allocate(&self, ip: Ipv4Addr) -> SocketAddr {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(IpAddr::V4(ip), port)
    }

    /// Creates a listening transport for a host at `ip`.
    pub fn transport(&self, ip: Ipv4Addr) -> MemoryTransport {
        let local = self.allocate(ip);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().insert(local, tx);
        debug!(addr = %local, "memory listener bound");
        MemoryTransport {
            lan: self.clone(),
            local,
            incoming: AsyncMutex::new(rx),
        }
    }

    /// Creates the beacon channel for a host at `ip`.
    pub fn beacons(&self, ip: Ipv4Addr) -> MemoryBeacons {
        MemoryBeacons {
            lan: self.clone(),
            source: SocketAddr::new(IpAddr::V4(ip), 0),
            rx: AsyncMutex::new(self.inner.beacons.subscribe()),
        }
    }

    /// Makes `addr` accept connections and then never answer.
    pub fn blackhole(&self, addr: SocketAddr) {
        self.inner.blackholes.lock().push(addr);
    }

    /// Puts a raw beacon on the LAN as if sent from `from`.
    pub fn inject_beacon(&self, payload: &[u8], from: SocketAddr) {
        let _ = self
            .inner
            .beacons
            .send((Bytes::copy_from_slice(payload), from));
    }

    fn dial(&self, from: Ipv4Addr, to: SocketAddr) -> io::Result<BoxStream> {
        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);

        if self.inner.blackholes.lock().contains(&to) {
            self.inner.swallowed.lock().push(far);
            return Ok(Box::new(near));
        }

        let listeners = self.inner.listeners.lock();
        let listener = listeners
            .get(&to)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?;
        let remote = self.allocate(from);
        let far: BoxStream = Box::new(far);
        listener
            .send((far, remote))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok(Box::new(near))
    }
}

/// One host's listener on a [`MemoryLan`].
pub struct MemoryTransport {
    lan: MemoryLan,
    local: SocketAddr,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Incoming>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.lan.inner.listeners.lock().remove(&self.local);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxStream> {
        let ip = match self.local.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        self.lan.dial(ip, addr)
    }

    async fn accept(&self) -> io::Result<(BoxStream, SocketAddr)> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// One host's view of the beacon broadcast domain on a [`MemoryLan`].
pub struct MemoryBeacons {
    lan: MemoryLan,
    source: SocketAddr,
    rx: AsyncMutex<broadcast::Receiver<(Bytes, SocketAddr)>>,
}

impl std::fmt::Debug for MemoryBeacons {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBeacons")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BeaconChannel for MemoryBeacons {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.lan.inject_beacon(payload, self.source);
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok((payload, from)) => {
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    return Ok((n, from));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "memory beacon receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "lan closed"));
                }
            }
        }
    }
}
