//! Peer connections.
//!
//! A [`Connection`] is one ready byte stream bound to one peer identity. It
//! owns a reader task that decodes frames and feeds the inbound session, an
//! async mutex around the write half for outbound sessions, and a single
//! session slot: one transfer per connection, in either direction.
//!
//! Connections are created by the dial and accept paths after the
//! handshake succeeds:
//!
//! ```text
//! dialer                               acceptor
//!   | -- Hello { namespace, id, name } -> |
//!   | <- Welcome { id, name }           -- |   or Reject { reason }
//! ```
//!
//! [`ConnectionTable`] is the identity-to-connection map. It is owned by the
//! node's coordinator task and decides which attempts may proceed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::{read_message, write_message, Frame, FrameCodec, TransferDescriptor, MAX_HEADER_LEN};
use super::identity::{PeerId, PeerIdentity};
use super::session::{
    receive_stream, send_stream, AbortHandle, SessionContext, SessionRole, SessionState,
    SessionTracker, TransferHandle, TransferId,
};
use super::transport::{BoxStream, Transport};
use crate::error::FileDropError;

/// Time allowed for flushing the write half during teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection to one peer.
///
/// `Connecting` and `Failed` describe an attempt and are reported by
/// [`ConnectionTable::state`]; a [`Connection`] object starts `Ready` and
/// ends `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Handshake messages, exchanged once before any frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Handshake {
    Hello {
        namespace: String,
        peer_id: PeerId,
        name: String,
    },
    Welcome {
        peer_id: PeerId,
        name: String,
    },
    Reject {
        reason: String,
    },
}

/// Opens a stream to `addr` and runs the dialer side of the handshake.
pub(crate) async fn dial(
    transport: &dyn Transport,
    addr: SocketAddr,
    local: &PeerIdentity,
    namespace: &str,
    expected: PeerId,
) -> Result<(BoxStream, PeerIdentity), FileDropError> {
    let mut stream = transport
        .connect(addr)
        .await
        .map_err(|e| FileDropError::unreachable(format!("{addr}: {e}")))?;

    let hello = Handshake::Hello {
        namespace: namespace.to_string(),
        peer_id: local.id(),
        name: local.display_name().to_string(),
    };
    write_message(&mut stream, &hello).await?;

    match read_message(&mut stream, MAX_HEADER_LEN).await? {
        Handshake::Welcome { peer_id, name } if peer_id == expected => {
            Ok((stream, PeerIdentity::new(peer_id, name)))
        }
        Handshake::Welcome { .. } => Err(FileDropError::rejected("identity mismatch")),
        Handshake::Reject { reason } => Err(FileDropError::rejected(reason)),
        Handshake::Hello { .. } => Err(FileDropError::protocol("unexpected hello from acceptor")),
    }
}

/// Reads the dialer's hello. A foreign namespace is rejected on the spot.
pub(crate) async fn read_hello(
    stream: &mut BoxStream,
    namespace: &str,
) -> Result<PeerIdentity, FileDropError> {
    match read_message(stream, MAX_HEADER_LEN).await? {
        Handshake::Hello {
            namespace: theirs,
            peer_id,
            name,
        } => {
            if theirs == namespace {
                Ok(PeerIdentity::new(peer_id, name))
            } else {
                let reason = format!("namespace mismatch: {theirs}");
                reject(stream, &reason).await;
                Err(FileDropError::rejected(reason))
            }
        }
        _ => Err(FileDropError::protocol("expected hello")),
    }
}

pub(crate) async fn welcome(stream: &mut BoxStream, local: &PeerIdentity) -> Result<(), FileDropError> {
    let msg = Handshake::Welcome {
        peer_id: local.id(),
        name: local.display_name().to_string(),
    };
    write_message(stream, &msg).await?;
    Ok(())
}

/// Best effort: the dialer may already be gone.
pub(crate) async fn reject(stream: &mut BoxStream, reason: &str) {
    let msg = Handshake::Reject {
        reason: reason.to_string(),
    };
    if let Err(e) = write_message(stream, &msg).await {
        debug!(error = %e, "failed to deliver reject");
    }
    let _ = stream.shutdown().await;
}

/// Sent to the coordinator when a connection goes down.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionDown {
    pub(crate) peer: PeerIdentity,
    pub(crate) id: ConnectionId,
    pub(crate) reason: FileDropError,
}

#[derive(Debug)]
struct ActiveSession {
    transfer: TransferId,
    role: SessionRole,
    abort: AbortHandle,
}

/// Holds the session slot; releases it on drop.
struct SlotGuard {
    conn: Arc<Connection>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.conn.slot.lock().take();
    }
}

/// Receive session in progress, as seen by the reader task.
struct Inbound {
    body: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

/// A ready connection to one peer.
pub struct Connection {
    id: ConnectionId,
    peer: PeerIdentity,
    direction: Direction,
    remote_addr: SocketAddr,
    state: RwLock<ConnectionState>,
    writer: AsyncMutex<Option<WriteHalf<BoxStream>>>,
    slot: Mutex<Option<ActiveSession>>,
    closed: CancellationToken,
    signals: mpsc::UnboundedSender<ConnectionDown>,
    ctx: SessionContext,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wraps a stream that finished its handshake and starts the reader.
    pub(crate) fn establish(
        stream: BoxStream,
        peer: PeerIdentity,
        direction: Direction,
        remote_addr: SocketAddr,
        ctx: SessionContext,
        signals: mpsc::UnboundedSender<ConnectionDown>,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            direction,
            remote_addr,
            state: RwLock::new(ConnectionState::Ready),
            writer: AsyncMutex::new(Some(writer)),
            slot: Mutex::new(None),
            closed: CancellationToken::new(),
            signals,
            ctx,
        });

        info!(
            conn = %conn.id,
            peer = %conn.peer,
            direction = ?direction,
            remote = %remote_addr,
            "connection ready"
        );
        let span = info_span!("connection", conn = %conn.id, peer = %conn.peer.id().short());
        tokio::spawn(Arc::clone(&conn).read_loop(reader).instrument(span));
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// True while a transfer occupies the session slot.
    pub fn is_busy(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Id and role of the transfer occupying the slot, if any.
    pub fn active_transfer(&self) -> Option<(TransferId, SessionRole)> {
        self.slot
            .lock()
            .as_ref()
            .map(|active| (active.transfer, active.role))
    }

    /// Sends the file at `path`.
    ///
    /// The file is opened and measured before the slot is claimed, so a bad
    /// path fails with `Io` and leaves the connection untouched.
    pub async fn send_file(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<TransferHandle, FileDropError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(FileDropError::io(format!("{} is not a regular file", path.display())));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        self.start_send(
            TransferDescriptor::new(name, metadata.len()),
            file,
            path.to_path_buf(),
        )
    }

    /// Sends `size` bytes from `reader` under the name `name`.
    pub fn send_reader<R>(
        self: &Arc<Self>,
        name: impl Into<String>,
        size: u64,
        reader: R,
    ) -> Result<TransferHandle, FileDropError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let descriptor = TransferDescriptor::new(name, size);
        let path = PathBuf::from(&descriptor.file_name);
        self.start_send(descriptor, reader, path)
    }

    fn start_send<R>(
        self: &Arc<Self>,
        descriptor: TransferDescriptor,
        reader: R,
        source: PathBuf,
    ) -> Result<TransferHandle, FileDropError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (mut tracker, handle, abort, guard) = self.claim(SessionRole::Sender, &descriptor)?;
        let conn = Arc::clone(self);
        let span = info_span!("send", transfer_id = %tracker.id(), peer = %self.peer.id().short());

        tokio::spawn(
            async move {
                let result = {
                    let mut writer = conn.writer.lock().await;
                    match writer.as_mut() {
                        Some(writer) => {
                            send_stream(writer, reader, &descriptor, &mut tracker, &abort, &conn.ctx.config)
                                .await
                        }
                        None => Err(FileDropError::connection_lost("connection is closed")),
                    }
                };

                match result {
                    Ok(()) => {
                        drop(guard);
                        tracker.complete(source);
                    }
                    Err(err) => {
                        // Header is on the wire; the stream position is unknown.
                        if tracker.state().has_begun() {
                            conn.teardown(err.clone());
                        }
                        drop(guard);
                        tracker.fail(err);
                    }
                }
            }
            .instrument(span),
        );
        Ok(handle)
    }

    /// Takes the session slot.
    fn claim(
        self: &Arc<Self>,
        role: SessionRole,
        descriptor: &TransferDescriptor,
    ) -> Result<(SessionTracker, TransferHandle, AbortHandle, SlotGuard), FileDropError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(FileDropError::SessionBusy);
        }
        if self.state() != ConnectionState::Ready {
            return Err(FileDropError::connection_lost("connection is closed"));
        }

        let initial = match role {
            SessionRole::Sender => SessionState::Idle,
            SessionRole::Receiver => SessionState::HeaderAwaited,
        };
        let abort = AbortHandle::new();
        let (tracker, handle) =
            SessionTracker::start(role, self.peer.clone(), descriptor, initial, abort.clone(), &self.ctx);
        *slot = Some(ActiveSession {
            transfer: tracker.id(),
            role,
            abort: abort.clone(),
        });
        drop(slot);

        let guard = SlotGuard {
            conn: Arc::clone(self),
        };
        Ok((tracker, handle, abort, guard))
    }

    /// Starts a receive session for an incoming header.
    fn start_receive(self: &Arc<Self>, descriptor: TransferDescriptor) -> Result<Inbound, FileDropError> {
        let (mut tracker, _handle, abort, guard) = self.claim(SessionRole::Receiver, &descriptor)?;
        let (body, rx) = mpsc::channel(self.ctx.config.body_channel_depth.max(1));
        let conn = Arc::clone(self);
        let span = info_span!("receive", transfer_id = %tracker.id(), peer = %self.peer.id().short());

        let task = tokio::spawn(
            async move {
                match receive_stream(rx, &descriptor, &mut tracker, &abort, &conn.ctx.config).await {
                    Ok(path) => {
                        drop(guard);
                        tracker.complete(path);
                    }
                    Err(err) => {
                        conn.teardown(err.clone());
                        drop(guard);
                        tracker.fail(err);
                    }
                }
            }
            .instrument(span),
        );
        Ok(Inbound { body, task })
    }

    async fn read_loop(self: Arc<Self>, reader: ReadHalf<BoxStream>) {
        let mut frames = FramedRead::new(reader, FrameCodec::new(self.ctx.config.max_frame_len));
        let mut inbound: Option<Inbound> = None;

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return,
                next = frames.next() => next,
            };

            match next {
                None => break FileDropError::connection_lost("peer closed the connection"),
                Some(Err(err)) => break FileDropError::from(err),
                Some(Ok(Frame::Header(descriptor))) => {
                    debug!(file_name = %descriptor.file_name, size = descriptor.file_size, "header received");
                    match self.start_receive(descriptor) {
                        Ok(started) => inbound = Some(started),
                        Err(FileDropError::SessionBusy) => {
                            break FileDropError::protocol("transfer header arrived while a session is active")
                        }
                        Err(err) => break err,
                    }
                }
                Some(Ok(Frame::Body(payload))) => {
                    let Some(active) = inbound.as_ref() else {
                        break FileDropError::protocol("body frame without a header");
                    };
                    let forwarded = tokio::select! {
                        biased;
                        _ = self.closed.cancelled() => return,
                        sent = active.body.send(payload) => sent.is_ok(),
                    };
                    if !forwarded {
                        // Session ended early and has already torn the connection down.
                        if let Some(ended) = inbound.take() {
                            let _ = ended.task.await;
                        }
                        continue;
                    }
                }
            }

            if frames.decoder().is_awaiting_header() {
                if let Some(Inbound { body, mut task }) = inbound.take() {
                    drop(body);
                    tokio::select! {
                        biased;
                        _ = self.closed.cancelled() => return,
                        _ = &mut task => {}
                    }
                }
            }
        };

        self.teardown(reason);
    }

    /// Closes the connection and aborts its session. Idempotent.
    pub(crate) fn teardown(self: &Arc<Self>, reason: FileDropError) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.closed.cancel();

        if let Some(active) = self.slot.lock().as_ref() {
            let lost = match &reason {
                FileDropError::ConnectionLost(_) => reason.clone(),
                other => FileDropError::connection_lost(other.to_string()),
            };
            active.abort.abort(lost);
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(mut writer) = conn.writer.lock().await.take() {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
            }
        });

        match &reason {
            FileDropError::Protocol(_) => warn!(conn = %self.id, peer = %self.peer, reason = %reason, "connection closed"),
            _ => info!(conn = %self.id, peer = %self.peer, reason = %reason, "connection closed"),
        }
        let _ = self.signals.send(ConnectionDown {
            peer: self.peer.clone(),
            id: self.id,
            reason,
        });
    }
}

/// Reply channel of a pending `connect`.
pub(crate) type ConnectReply = oneshot::Sender<Result<Arc<Connection>, FileDropError>>;

/// Outcome of [`ConnectionTable::begin_connect`].
#[derive(Debug)]
pub(crate) enum BeginConnect {
    Ready(Arc<Connection>),
    /// An attempt is already under way; the reply was queued on it
    Joined,
    /// The caller must start a dial
    Dial,
}

/// Rejection reason sent to the higher id when both sides dial at once.
pub(crate) const SIMULTANEOUS_CONNECT: &str = "simultaneous connect";

/// Verdict on an inbound hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    Reject(&'static str),
}

#[derive(Default)]
struct PeerSlot {
    conn: Option<Arc<Connection>>,
    dialing: bool,
    admitting: bool,
    /// Lost a simultaneous connect; waiting for the peer's own dial
    yielding: Option<u64>,
    failed: bool,
    waiters: Vec<ConnectReply>,
}

impl PeerSlot {
    fn live(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref().filter(|c| !c.is_closed())
    }

    fn in_progress(&self) -> bool {
        self.dialing || self.admitting || self.yielding.is_some()
    }

    fn resolve(&mut self, result: Result<Arc<Connection>, FileDropError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Identity-to-connection map plus in-flight attempts.
///
/// Admission is deterministic:
/// - a peer with a live connection is rejected ("already connected")
/// - a second inbound attempt while one is in its handshake is rejected
///   ("duplicate connection attempt")
/// - when both sides dial each other at once, the connection dialed by the
///   lower peer id wins ("simultaneous connect"); the loser keeps its
///   waiters queued until the winner's dial arrives or the wait expires
pub(crate) struct ConnectionTable {
    local: PeerId,
    slots: HashMap<PeerId, PeerSlot>,
    next_yield: u64,
}

impl ConnectionTable {
    pub(crate) fn new(local: PeerId) -> Self {
        Self {
            local,
            slots: HashMap::new(),
            next_yield: 0,
        }
    }

    pub(crate) fn begin_connect(&mut self, peer: PeerId, reply: Option<ConnectReply>) -> BeginConnect {
        let slot = self.slots.entry(peer).or_default();
        if let Some(conn) = slot.live() {
            let conn = Arc::clone(conn);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(Arc::clone(&conn)));
            }
            return BeginConnect::Ready(conn);
        }

        slot.waiters.extend(reply);
        if slot.in_progress() {
            return BeginConnect::Joined;
        }
        slot.dialing = true;
        slot.failed = false;
        BeginConnect::Dial
    }

    pub(crate) fn admit(&mut self, remote: PeerId) -> Admission {
        if remote == self.local {
            return Admission::Reject("cannot connect to self");
        }
        let local = self.local;
        let slot = self.slots.entry(remote).or_default();
        if slot.live().is_some() {
            return Admission::Reject("already connected");
        }
        if slot.admitting {
            return Admission::Reject("duplicate connection attempt");
        }
        if slot.dialing && remote > local {
            return Admission::Reject(SIMULTANEOUS_CONNECT);
        }
        slot.admitting = true;
        Admission::Accept
    }

    /// Records a ready connection. Returns it back if the peer already has one.
    pub(crate) fn established(&mut self, conn: Arc<Connection>) -> Result<(), Arc<Connection>> {
        let slot = self.slots.entry(conn.peer().id()).or_default();
        match conn.direction() {
            Direction::Outbound => slot.dialing = false,
            Direction::Inbound => slot.admitting = false,
        }
        slot.yielding = None;
        if slot.live().is_some() {
            return Err(conn);
        }
        slot.conn = Some(Arc::clone(&conn));
        slot.failed = false;
        slot.resolve(Ok(conn));
        Ok(())
    }

    /// Ends a dial. Returns true if the failure is final for the waiters.
    ///
    /// A dial that lost a simultaneous connect leaves the waiters on the
    /// peer's own attempt: the one being admitted, or the one still on its
    /// way (see [`awaiting_peer`](Self::awaiting_peer)).
    pub(crate) fn dial_failed(&mut self, peer: PeerId, err: &FileDropError) -> bool {
        let lost_race = peer < self.local
            && matches!(err, FileDropError::Rejected(reason) if &**reason == SIMULTANEOUS_CONNECT);
        let Some(slot) = self.slots.get_mut(&peer) else {
            return false;
        };
        slot.dialing = false;
        if slot.live().is_some() || slot.admitting {
            return false;
        }
        if lost_race {
            self.next_yield += 1;
            slot.yielding = Some(self.next_yield);
            return false;
        }
        slot.failed = true;
        slot.resolve(Err(err.clone()));
        true
    }

    /// Ends an inbound handshake that did not produce a connection.
    pub(crate) fn admit_failed(&mut self, peer: PeerId, err: &FileDropError) -> bool {
        let Some(slot) = self.slots.get_mut(&peer) else {
            return false;
        };
        slot.admitting = false;
        slot.yielding = None;
        if slot.live().is_some() || slot.dialing || slot.waiters.is_empty() {
            return false;
        }
        slot.failed = true;
        slot.resolve(Err(err.clone()));
        true
    }

    /// The wait token of a dial that yielded to the peer's own attempt.
    pub(crate) fn awaiting_peer(&self, peer: &PeerId) -> Option<u64> {
        self.slots.get(peer).and_then(|slot| slot.yielding)
    }

    /// Gives up on the peer's attempt if wait `token` is still current and
    /// nothing has arrived. Returns true if the waiters were failed.
    pub(crate) fn peer_dial_expired(&mut self, peer: PeerId, token: u64) -> bool {
        let Some(slot) = self.slots.get_mut(&peer) else {
            return false;
        };
        if slot.yielding != Some(token) {
            return false;
        }
        slot.yielding = None;
        if slot.live().is_some() || slot.dialing || slot.admitting {
            return false;
        }
        slot.failed = true;
        slot.resolve(Err(FileDropError::ConnectTimeout));
        true
    }

    /// Forgets `id` if it is still the peer's current connection.
    pub(crate) fn remove(&mut self, peer: &PeerId, id: ConnectionId) -> Option<Arc<Connection>> {
        let slot = self.slots.get_mut(peer)?;
        if slot.conn.as_ref().map(|c| c.id()) != Some(id) {
            return None;
        }
        let conn = slot.conn.take();
        if !slot.in_progress() && slot.waiters.is_empty() {
            self.slots.remove(peer);
        }
        conn
    }

    pub(crate) fn lookup(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.slots.get(peer).and_then(|slot| slot.live().cloned())
    }

    pub(crate) fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        let slot = self.slots.get(peer)?;
        if let Some(conn) = &slot.conn {
            return Some(conn.state());
        }
        if slot.in_progress() {
            return Some(ConnectionState::Connecting);
        }
        slot.failed.then_some(ConnectionState::Failed)
    }

    pub(crate) fn is_pending(&self, peer: &PeerId) -> bool {
        self.state(peer) == Some(ConnectionState::Connecting)
    }

    pub(crate) fn connected(&self) -> Vec<Arc<Connection>> {
        self.slots
            .values()
            .filter_map(|slot| slot.live().cloned())
            .collect()
    }

    /// Empties the table, failing every waiter with `Shutdown`.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Connection>> {
        let mut conns = Vec::new();
        for (_, mut slot) in self.slots.drain() {
            slot.resolve(Err(FileDropError::Shutdown));
            conns.extend(slot.conn);
        }
        conns
    }
}
