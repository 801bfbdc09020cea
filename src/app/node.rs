//! The node: composition root of one FileDrop instance.
//!
//! A [`Node`] wires a transport, a beacon channel, the discovery service and
//! the coordinator together and exposes the operations a presentation layer
//! calls. It is cheap to clone; all clones drive the same instance. Dropping
//! the last clone stops every background task.
//!
//! # Example
//!
//! ```rust,ignore
//! use filedrop::{Node, NodeConfig, NodeEvent};
//!
//! let node = Node::start(NodeConfig::default().with_display_name("Alice-iPhone")).await?;
//! let mut events = node.subscribe();
//!
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::PeerFound(record) = event {
//!         node.connect(record.identity.id()).await?;
//!         node.send_file(record.identity.id(), "photo.jpg").await?;
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use super::coordinator::{accept_loop, Command, Coordinator, Links};
use crate::config::NodeConfig;
use crate::error::FileDropError;
use crate::events::{EventBus, EventStream};
use crate::net::connection::{Connection, ConnectionState};
use crate::net::discovery::{BeaconChannel, Discovery, MulticastChannel, UnavailableChannel};
use crate::net::identity::{PeerId, PeerIdentity};
use crate::net::registry::{PeerRecord, PeerRegistry, PeerState};
use crate::net::session::{SessionContext, TransferHandle, TransferId, TransferProgress, TransferTable};
use crate::net::transport::{TcpTransport, Transport};

/// Floor on how often finished transfers are swept.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a running node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    identity: PeerIdentity,
    local_addr: SocketAddr,
    download_dir: PathBuf,
    registry: Arc<RwLock<PeerRegistry>>,
    events: Arc<EventBus>,
    transfers: TransferTable,
    discovery: Discovery,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.inner.identity)
            .field("local_addr", &self.inner.local_addr)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Starts a node on TCP and UDP multicast.
    ///
    /// If multicast cannot be set up the node still starts; discovery then
    /// reports `DiscoveryFailed` events instead of peers.
    #[instrument(name = "node_start", skip(config), fields(name = %config.display_name))]
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let transport = TcpTransport::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;

        let beacons: Arc<dyn BeaconChannel> =
            match MulticastChannel::bind(config.discovery.multicast_group).await {
                Ok(channel) => Arc::new(channel),
                Err(e) => {
                    warn!(error = %e, group = %config.discovery.multicast_group, "multicast unavailable");
                    Arc::new(UnavailableChannel::new(e.to_string()))
                }
            };

        Self::with_transport(config, Arc::new(transport), beacons).await
    }

    /// Starts a node on caller-supplied transport and beacon channel.
    pub async fn with_transport(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        beacons: Arc<dyn BeaconChannel>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid node configuration")?;
        let identity = PeerIdentity::new(
            config.peer_id.unwrap_or_else(PeerId::random),
            config.display_name.as_str(),
        );
        let local_addr = transport
            .local_addr()
            .context("transport has no local address")?;
        let download_dir = config.transfer.download_dir.clone();
        tokio::fs::create_dir_all(&download_dir)
            .await
            .with_context(|| format!("failed to create download directory {}", download_dir.display()))?;

        let shutdown = CancellationToken::new();
        let events = Arc::new(EventBus::new());
        let transfers = TransferTable::new();
        let registry = Arc::new(RwLock::new(PeerRegistry::new()));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let discovery = Discovery::new(
            identity.clone(),
            local_addr.port(),
            config.discovery.clone(),
            beacons,
            discovery_tx,
            shutdown.clone(),
        )
        .context("failed to prepare discovery beacons")?;

        let links = Links {
            local: identity.clone(),
            namespace: Arc::from(config.discovery.namespace.as_str()),
            transport,
            connect_timeout: config.connect_timeout,
            ctx: SessionContext {
                events: events.clone(),
                transfers: transfers.clone(),
                config: Arc::new(config.transfer.clone()),
            },
            signals: signals_tx,
            commands: commands_tx.clone(),
            shutdown: shutdown.clone(),
        };

        let span = info_span!("node", peer = %identity.id().short());
        let coordinator = Coordinator::new(registry.clone(), events.clone(), links.clone(), config.auto_connect);
        tokio::spawn(
            coordinator
                .run(commands_rx, discovery_rx, signals_rx)
                .instrument(span.clone()),
        );
        tokio::spawn(
            sweep_transfers(
                transfers.clone(),
                config.transfer.finished_retention,
                shutdown.clone(),
            )
            .instrument(span.clone()),
        );
        tokio::spawn(accept_loop(links).instrument(span));

        let node = Self {
            inner: Arc::new(NodeInner {
                identity,
                local_addr,
                download_dir,
                registry,
                events,
                transfers,
                discovery,
                commands: commands_tx,
                shutdown,
            }),
        };

        info!(
            peer = %node.inner.identity,
            addr = %node.inner.local_addr,
            download_dir = %node.inner.download_dir.display(),
            "node started"
        );
        if config.auto_start_discovery {
            node.start_advertising();
            node.start_browsing();
        }
        Ok(node)
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    /// Address peers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    /// Registers an observer; it sees every event emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ==================== Discovery ====================

    /// Returns false if already advertising or shut down.
    pub fn start_advertising(&self) -> bool {
        !self.is_shut_down() && self.inner.discovery.start_advertising()
    }

    pub fn stop_advertising(&self) -> bool {
        self.inner.discovery.stop_advertising()
    }

    /// Returns false if already browsing or shut down.
    pub fn start_browsing(&self) -> bool {
        !self.is_shut_down() && self.inner.discovery.start_browsing()
    }

    pub fn stop_browsing(&self) -> bool {
        self.inner.discovery.stop_browsing()
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.discovery.is_advertising()
    }

    pub fn is_browsing(&self) -> bool {
        self.inner.discovery.is_browsing()
    }

    // ==================== Registry ====================

    /// Snapshot of every known peer.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.registry.read().list(|_| true)
    }

    pub fn peers_in(&self, state: PeerState) -> Vec<PeerRecord> {
        self.inner.registry.read().list(|s| s == state)
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerRecord> {
        self.inner.registry.read().get(id).cloned()
    }

    // ==================== Connections ====================

    /// Connects to a discovered peer, or returns the existing connection.
    ///
    /// Fails with `PeerUnreachable`, `ConnectTimeout` or `Rejected`. There
    /// is no retry.
    #[instrument(skip(self), fields(peer = %peer.short()))]
    pub async fn connect(&self, peer: PeerId) -> Result<Arc<Connection>, FileDropError> {
        self.request(|reply| Command::Connect { peer, reply }).await?
    }

    /// Tears down the connection to `peer`. A no-op without one.
    #[instrument(skip(self), fields(peer = %peer.short()))]
    pub async fn close(&self, peer: PeerId) {
        let _ = self.request(|reply| Command::Close { peer, reply }).await;
    }

    /// The ready connection to `peer`, if any.
    pub async fn connection(&self, peer: PeerId) -> Result<Option<Arc<Connection>>, FileDropError> {
        self.request(|reply| Command::Lookup { peer, reply }).await
    }

    /// Where the connection to `peer` stands, if one was ever attempted.
    pub async fn connection_state(&self, peer: PeerId) -> Result<Option<ConnectionState>, FileDropError> {
        self.request(|reply| Command::State { peer, reply }).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerIdentity>, FileDropError> {
        self.request(|reply| Command::Connected { reply }).await
    }

    // ==================== Transfers ====================

    /// Sends the file at `path` to a connected peer.
    #[instrument(skip(self, path), fields(peer = %peer.short(), path = %path.as_ref().display()))]
    pub async fn send_file(
        &self,
        peer: PeerId,
        path: impl AsRef<Path>,
    ) -> Result<TransferHandle, FileDropError> {
        let conn = self.ready_connection(peer).await?;
        conn.send_file(path).await
    }

    /// Sends `size` bytes from `reader` to a connected peer as `name`.
    pub async fn send_reader<R>(
        &self,
        peer: PeerId,
        name: impl Into<String>,
        size: u64,
        reader: R,
    ) -> Result<TransferHandle, FileDropError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let conn = self.ready_connection(peer).await?;
        conn.send_reader(name, size, reader)
    }

    /// Every transfer this node has run and not yet cleaned up.
    pub fn transfers(&self) -> Vec<TransferProgress> {
        self.inner.transfers.all()
    }

    pub fn transfer(&self, id: TransferId) -> Option<TransferProgress> {
        self.inner.transfers.get(id)
    }

    /// Cancels an active transfer. Returns false if unknown or finished.
    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        self.inner.transfers.cancel(id)
    }

    pub fn cleanup_finished(&self) {
        self.inner.transfers.cleanup_finished();
    }

    // ==================== Lifecycle ====================

    /// Stops discovery, closes every connection and stops all tasks.
    ///
    /// Idempotent. Afterwards operations fail with `Shutdown`.
    pub async fn shutdown(&self) {
        if self.is_shut_down() {
            return;
        }
        self.inner.discovery.stop_advertising();
        self.inner.discovery.stop_browsing();
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
        self.inner.shutdown.cancel();
        info!(peer = %self.inner.identity, "node shut down");
    }

    async fn ready_connection(&self, peer: PeerId) -> Result<Arc<Connection>, FileDropError> {
        self.connection(peer)
            .await?
            .ok_or_else(|| FileDropError::not_connected(peer.short()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, FileDropError> {
        if self.is_shut_down() {
            return Err(FileDropError::Shutdown);
        }
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(reply))
            .map_err(|_| FileDropError::Shutdown)?;
        rx.await.map_err(|_| FileDropError::Shutdown)
    }
}

/// Drops finished transfers once they are older than `retention`.
async fn sweep_transfers(transfers: TransferTable, retention: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval((retention / 2).max(MIN_SWEEP_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = transfers.prune_finished(retention);
                if removed > 0 {
                    debug!(removed, remaining = transfers.len(), "swept finished transfers");
                }
            }
        }
    }
}
