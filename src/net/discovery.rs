//! Local network discovery over multicast beacons.
//!
//! While advertising, a node periodically announces itself to a multicast
//! group:
//!
//! ```text
//! {"type":"announce","namespace":"filedrop","service":"_filedrop._tcp",
//!  "peer_id":"…","name":"Alice-iPhone","port":52100}
//! ```
//!
//! and sends a single `leave` beacon when it stops. Browsers track every
//! announcing peer in a [`PeerTable`] and report it as lost after an explicit
//! `leave`, or once no announcement has been heard for the configured TTL.
//!
//! Advertising and browsing are independent tasks. Starting either one twice
//! is a no-op, and failures on the beacon channel are reported as
//! [`DiscoveryEvent::Failed`] while the loops keep running.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::identity::{PeerId, PeerIdentity};
use crate::config::DiscoveryConfig;
use crate::error::FileDropError;

/// Largest datagram a browser will read.
pub const MAX_BEACON_LEN: usize = 2048;

/// A datagram-style broadcast domain for beacons.
#[async_trait]
pub trait BeaconChannel: Send + Sync + 'static {
    /// Sends `payload` to every listener on the domain.
    async fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Receives the next datagram and its source address.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// IPv4 multicast beacon channel.
#[derive(Debug)]
pub struct MulticastChannel {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl MulticastChannel {
    /// Binds the group port on all interfaces and joins the group.
    pub async fn bind(group: SocketAddrV4) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).await?;
        socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        info!(group = %group, "joined multicast group");
        Ok(Self { socket, group })
    }
}

#[async_trait]
impl BeaconChannel for MulticastChannel {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.group).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Stand-in used when the real channel could not be opened.
///
/// Every operation fails with the original reason, so the advertise and
/// browse loops surface it as a discovery error instead of the node failing
/// to start.
#[derive(Debug)]
pub struct UnavailableChannel {
    reason: Arc<str>,
}

impl UnavailableChannel {
    pub fn new(reason: impl Into<Arc<str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> io::Error {
        io::Error::new(io::ErrorKind::AddrNotAvailable, self.reason.to_string())
    }
}

#[async_trait]
impl BeaconChannel for UnavailableChannel {
    async fn send(&self, _payload: &[u8]) -> io::Result<()> {
        Err(self.error())
    }

    async fn recv(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(self.error())
    }
}

/// A presence message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Beacon {
    Announce {
        namespace: String,
        service: String,
        peer_id: PeerId,
        name: String,
        port: u16,
    },
    Leave {
        namespace: String,
        peer_id: PeerId,
    },
}

impl Beacon {
    pub fn encode(&self) -> Result<Vec<u8>, FileDropError> {
        serde_json::to_vec(self).map_err(|e| FileDropError::discovery(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Output of the browser.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// First sighting of a peer
    Found {
        identity: PeerIdentity,
        endpoint: SocketAddr,
    },
    /// A known peer changed its name or address
    Updated {
        identity: PeerIdentity,
        endpoint: SocketAddr,
    },
    Lost(PeerIdentity),
    Failed(FileDropError),
}

#[derive(Debug, Clone)]
struct Sighting {
    identity: PeerIdentity,
    endpoint: SocketAddr,
    last_seen: Instant,
}

/// Liveness tracker for announcing peers.
///
/// Pure state: feed it beacons and clock ticks, get discovery events back.
#[derive(Debug)]
pub struct PeerTable {
    own_id: PeerId,
    namespace: String,
    service: String,
    ttl: Duration,
    peers: HashMap<PeerId, Sighting>,
}

impl PeerTable {
    pub fn new(own_id: PeerId, config: &DiscoveryConfig) -> Self {
        Self {
            own_id,
            namespace: config.namespace.clone(),
            service: config.service_type.clone(),
            ttl: config.peer_ttl,
            peers: HashMap::new(),
        }
    }

    /// Applies a beacon received from `from`.
    pub fn observe(&mut self, beacon: Beacon, from: SocketAddr, now: Instant) -> Option<DiscoveryEvent> {
        match beacon {
            Beacon::Announce {
                namespace,
                service,
                peer_id,
                name,
                port,
            } => {
                if namespace != self.namespace || service != self.service || peer_id == self.own_id {
                    return None;
                }
                let endpoint = SocketAddr::new(from.ip(), port);

                if let Some(seen) = self.peers.get_mut(&peer_id) {
                    seen.last_seen = now;
                    if seen.endpoint == endpoint && seen.identity.display_name() == name {
                        return None;
                    }
                    seen.endpoint = endpoint;
                    seen.identity = PeerIdentity::new(peer_id, name);
                    return Some(DiscoveryEvent::Updated {
                        identity: seen.identity.clone(),
                        endpoint,
                    });
                }

                let identity = PeerIdentity::new(peer_id, name);
                self.peers.insert(
                    peer_id,
                    Sighting {
                        identity: identity.clone(),
                        endpoint,
                        last_seen: now,
                    },
                );
                Some(DiscoveryEvent::Found { identity, endpoint })
            }
            Beacon::Leave { namespace, peer_id } => {
                if namespace != self.namespace || peer_id == self.own_id {
                    return None;
                }
                self.peers
                    .remove(&peer_id)
                    .map(|seen| DiscoveryEvent::Lost(seen.identity))
            }
        }
    }

    /// Drops peers not heard from within the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscoveryEvent> {
        let ttl = self.ttl;
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(seen.last_seen) > ttl)
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .map(|seen| DiscoveryEvent::Lost(seen.identity))
            .collect()
    }

    /// Forgets every peer, reporting each as lost.
    pub fn drain(&mut self) -> Vec<DiscoveryEvent> {
        self.peers
            .drain()
            .map(|(_, seen)| DiscoveryEvent::Lost(seen.identity))
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// One restartable background loop.
///
/// A stopped loop keeps its handle so a restart can wait for it to finish
/// its final sends (leave beacon, lost peers) before the new loop begins.
#[derive(Default)]
struct LoopSlot {
    running: Option<CancellationToken>,
    last: Option<JoinHandle<()>>,
}

impl LoopSlot {
    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Spawns `work` once `previous` has finished.
fn spawn_after<F>(previous: Option<JoinHandle<()>>, work: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        work.await;
    })
}

/// Advertiser and browser for one node.
pub struct Discovery {
    identity: PeerIdentity,
    config: DiscoveryConfig,
    channel: Arc<dyn BeaconChannel>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    announce: Arc<[u8]>,
    leave: Arc<[u8]>,
    advertiser: Mutex<LoopSlot>,
    browser: Mutex<LoopSlot>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("identity", &self.identity)
            .field("advertising", &self.is_advertising())
            .field("browsing", &self.is_browsing())
            .finish_non_exhaustive()
    }
}

impl Discovery {
    /// Creates a discovery service announcing `listen_port`.
    ///
    /// Nothing runs until [`start_advertising`](Self::start_advertising) or
    /// [`start_browsing`](Self::start_browsing) is called.
    pub fn new(
        identity: PeerIdentity,
        listen_port: u16,
        config: DiscoveryConfig,
        channel: Arc<dyn BeaconChannel>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<Self, FileDropError> {
        if config.beacon_interval.is_zero() {
            return Err(FileDropError::discovery("beacon interval must be non-zero"));
        }
        let announce = Beacon::Announce {
            namespace: config.namespace.clone(),
            service: config.service_type.clone(),
            peer_id: identity.id(),
            name: identity.display_name().to_string(),
            port: listen_port,
        }
        .encode()?;
        let leave = Beacon::Leave {
            namespace: config.namespace.clone(),
            peer_id: identity.id(),
        }
        .encode()?;

        Ok(Self {
            identity,
            config,
            channel,
            events,
            announce: announce.into(),
            leave: leave.into(),
            advertiser: Mutex::new(LoopSlot::default()),
            browser: Mutex::new(LoopSlot::default()),
            shutdown,
        })
    }

    #[inline]
    pub fn is_advertising(&self) -> bool {
        self.advertiser.lock().is_running()
    }

    #[inline]
    pub fn is_browsing(&self) -> bool {
        self.browser.lock().is_running()
    }

    /// Starts announcing this node. Returns false if already advertising.
    #[instrument(skip(self), fields(peer = %self.identity))]
    pub fn start_advertising(&self) -> bool {
        let mut slot = self.advertiser.lock();
        if slot.is_running() {
            debug!("already advertising");
            return false;
        }
        let token = self.shutdown.child_token();
        slot.running = Some(token.clone());

        let work = advertise_loop(
            self.channel.clone(),
            self.announce.clone(),
            self.leave.clone(),
            self.config.beacon_interval,
            self.events.clone(),
            token,
        );
        slot.last = Some(spawn_after(slot.last.take(), work));
        info!(namespace = %self.config.namespace, "advertising started");
        true
    }

    /// Stops announcing and sends a leave beacon. Returns false if idle.
    #[instrument(skip(self), fields(peer = %self.identity))]
    pub fn stop_advertising(&self) -> bool {
        let stopped = self.advertiser.lock().stop();
        if stopped {
            info!("advertising stopped");
        }
        stopped
    }

    /// Starts listening for other peers. Returns false if already browsing.
    #[instrument(skip(self), fields(peer = %self.identity))]
    pub fn start_browsing(&self) -> bool {
        let mut slot = self.browser.lock();
        if slot.is_running() {
            debug!("already browsing");
            return false;
        }
        let token = self.shutdown.child_token();
        slot.running = Some(token.clone());

        let table = PeerTable::new(self.identity.id(), &self.config);
        let work = browse_loop(
            self.channel.clone(),
            table,
            self.config.beacon_interval,
            self.events.clone(),
            token,
        );
        slot.last = Some(spawn_after(slot.last.take(), work));
        info!(namespace = %self.config.namespace, "browsing started");
        true
    }

    /// Stops browsing; every tracked peer is reported lost.
    #[instrument(skip(self), fields(peer = %self.identity))]
    pub fn stop_browsing(&self) -> bool {
        let stopped = self.browser.lock().stop();
        if stopped {
            info!("browsing stopped");
        }
        stopped
    }
}

/// Reports a failure once per streak of consecutive failures.
struct FailureLatch {
    tripped: bool,
}

impl FailureLatch {
    fn new() -> Self {
        Self { tripped: false }
    }

    fn fail(&mut self, events: &mpsc::UnboundedSender<DiscoveryEvent>, what: &str, err: &io::Error) {
        if !self.tripped {
            self.tripped = true;
            warn!(error = %err, "{what} failed");
            let _ = events.send(DiscoveryEvent::Failed(FileDropError::discovery(format!(
                "{what}: {err}"
            ))));
        }
    }

    fn ok(&mut self) {
        self.tripped = false;
    }
}

async fn advertise_loop(
    channel: Arc<dyn BeaconChannel>,
    announce: Arc<[u8]>,
    leave: Arc<[u8]>,
    interval: Duration,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut latch = FailureLatch::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match channel.send(&announce).await {
                    Ok(()) => latch.ok(),
                    Err(e) => latch.fail(&events, "advertising", &e),
                }
            }
        }
    }

    if let Err(e) = channel.send(&leave).await {
        debug!(error = %e, "failed to send leave beacon");
    }
}

async fn browse_loop(
    channel: Arc<dyn BeaconChannel>,
    mut table: PeerTable,
    sweep_every: Duration,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval(sweep_every);
    let mut latch = FailureLatch::new();
    let mut buf = vec![0u8; MAX_BEACON_LEN];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                for event in table.expire(Instant::now()) {
                    let _ = events.send(event);
                }
            }
            received = channel.recv(&mut buf) => match received {
                Ok((n, from)) => {
                    latch.ok();
                    match Beacon::decode(&buf[..n]) {
                        Ok(beacon) => {
                            if let Some(event) = table.observe(beacon, from, Instant::now()) {
                                debug!(from = %from, ?event, "beacon");
                                let _ = events.send(event);
                            }
                        }
                        Err(e) => debug!(from = %from, error = %e, "ignoring undecodable beacon"),
                    }
                }
                Err(e) => {
                    latch.fail(&events, "browsing", &e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(sweep_every) => {}
                    }
                }
            },
        }
    }

    for event in table.drain() {
        let _ = events.send(event);
    }
}
