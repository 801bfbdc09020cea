//! The coordinator task.
//!
//! One task owns the write side of the peer registry and the whole
//! [`ConnectionTable`]. Discovery, dial and accept tasks, connection readers
//! and the public [`Node`](super::Node) API never mutate either directly:
//! they send a [`Command`] or an event and the coordinator applies it. Every
//! handler is synchronous, so mutations are applied one at a time in arrival
//! order and a peer can never be marked lost halfway through being marked
//! connected.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::FileDropError;
use crate::events::{EventBus, NodeEvent};
use crate::net::connection::{
    self, Admission, BeginConnect, ConnectReply, Connection, ConnectionDown, ConnectionState,
    ConnectionTable, Direction,
};
use crate::net::discovery::DiscoveryEvent;
use crate::net::identity::{PeerId, PeerIdentity};
use crate::net::registry::{PeerRegistry, PeerState};
use crate::net::session::SessionContext;
use crate::net::transport::{BoxStream, Transport};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Requests handled by the coordinator.
pub(crate) enum Command {
    Connect {
        peer: PeerId,
        reply: ConnectReply,
    },
    Close {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    Lookup {
        peer: PeerId,
        reply: oneshot::Sender<Option<Arc<Connection>>>,
    },
    State {
        peer: PeerId,
        reply: oneshot::Sender<Option<ConnectionState>>,
    },
    Connected {
        reply: oneshot::Sender<Vec<PeerIdentity>>,
    },
    DialFinished {
        peer: PeerId,
        result: Result<Arc<Connection>, FileDropError>,
    },
    /// The wait for a peer's own dial after losing a simultaneous connect ran out
    PeerDialExpired {
        peer: PeerId,
        token: u64,
    },
    InboundHello {
        identity: PeerIdentity,
        reply: oneshot::Sender<Admission>,
    },
    InboundFinished {
        identity: PeerIdentity,
        result: Result<Arc<Connection>, FileDropError>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// What dial and accept tasks need to build connections.
#[derive(Clone)]
pub(crate) struct Links {
    pub(crate) local: PeerIdentity,
    pub(crate) namespace: Arc<str>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connect_timeout: Duration,
    pub(crate) ctx: SessionContext,
    pub(crate) signals: mpsc::UnboundedSender<ConnectionDown>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) struct Coordinator {
    registry: Arc<RwLock<PeerRegistry>>,
    table: ConnectionTable,
    events: Arc<EventBus>,
    links: Links,
    auto_connect: bool,
    /// Peers discovery lost while they were linked; dropped once they disconnect
    lingering: HashSet<PeerId>,
}

impl Coordinator {
    pub(crate) fn new(
        registry: Arc<RwLock<PeerRegistry>>,
        events: Arc<EventBus>,
        links: Links,
        auto_connect: bool,
    ) -> Self {
        Self {
            registry,
            table: ConnectionTable::new(links.local.id()),
            events,
            links,
            auto_connect,
            lingering: HashSet::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
        mut downs: mpsc::UnboundedReceiver<ConnectionDown>,
    ) {
        let shutdown = self.links.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = commands.recv() => {
                    if !self.on_command(command) {
                        return;
                    }
                }
                Some(down) = downs.recv() => self.on_down(down),
                Some(event) = discovery.recv() => self.on_discovery(event),
                else => break,
            }
        }
        self.close_all();
    }

    /// Applies one command. Returns false once the coordinator should stop.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { peer, reply } => self.connect(peer, Some(reply)),
            Command::Close { peer, reply } => {
                self.close(peer);
                let _ = reply.send(());
            }
            Command::Lookup { peer, reply } => {
                let _ = reply.send(self.table.lookup(&peer));
            }
            Command::State { peer, reply } => {
                let _ = reply.send(self.table.state(&peer));
            }
            Command::Connected { reply } => {
                let peers = self
                    .table
                    .connected()
                    .iter()
                    .map(|conn| conn.peer().clone())
                    .collect();
                let _ = reply.send(peers);
            }
            Command::DialFinished { peer, result } => match result {
                Ok(conn) => self.on_established(conn),
                Err(err) => {
                    warn!(peer = %peer.short(), error = %err, "connect failed");
                    if self.table.dial_failed(peer, &err) {
                        self.events.emit(NodeEvent::Error(err));
                    } else if let Some(token) = self.table.awaiting_peer(&peer) {
                        debug!(peer = %peer.short(), "waiting for the peer's own dial");
                        self.expire_peer_dial(peer, token);
                    }
                    self.settle(peer);
                }
            },
            Command::PeerDialExpired { peer, token } => {
                if self.table.peer_dial_expired(peer, token) {
                    warn!(peer = %peer.short(), "peer never completed its dial");
                    self.events.emit(NodeEvent::Error(FileDropError::ConnectTimeout));
                    self.settle(peer);
                }
            }
            Command::InboundHello { identity, reply } => {
                let admission = self.table.admit(identity.id());
                if let Admission::Reject(reason) = admission {
                    info!(peer = %identity, reason, "inbound connection rejected");
                }
                let _ = reply.send(admission);
            }
            Command::InboundFinished { identity, result } => match result {
                Ok(conn) => self.on_established(conn),
                Err(err) => {
                    warn!(peer = %identity, error = %err, "inbound handshake failed");
                    if self.table.admit_failed(identity.id(), &err) {
                        self.events.emit(NodeEvent::Error(err));
                    }
                    self.settle(identity.id());
                }
            },
            Command::Shutdown { reply } => {
                self.close_all();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn connect(&mut self, peer: PeerId, reply: Option<ConnectReply>) {
        let record = self.registry.read().get(&peer).cloned();
        let Some(record) = record else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(FileDropError::unreachable(format!(
                    "unknown peer {}",
                    peer.short()
                ))));
            }
            return;
        };

        match self.table.begin_connect(peer, reply) {
            BeginConnect::Ready(_) => {}
            BeginConnect::Joined => self.mark_connecting(&peer),
            BeginConnect::Dial => match record.endpoint {
                Some(endpoint) => {
                    self.mark_connecting(&peer);
                    self.spawn_dial(record.identity, endpoint);
                }
                None => {
                    let err = FileDropError::unreachable(format!(
                        "no known address for {}",
                        record.identity
                    ));
                    if self.table.dial_failed(peer, &err) {
                        self.events.emit(NodeEvent::Error(err));
                    }
                }
            },
        }
    }

    fn mark_connecting(&mut self, peer: &PeerId) {
        let mut registry = self.registry.write();
        let linked = registry.get(peer).map(|r| r.state.is_linked()).unwrap_or(true);
        if !linked {
            registry.transition(peer, PeerState::Connecting);
        }
    }

    fn spawn_dial(&self, identity: PeerIdentity, endpoint: SocketAddr) {
        let links = self.links.clone();
        let span = info_span!("dial", peer = %identity, %endpoint);
        tokio::spawn(
            async move {
                let attempt = tokio::time::timeout(
                    links.connect_timeout,
                    connection::dial(
                        links.transport.as_ref(),
                        endpoint,
                        &links.local,
                        &links.namespace,
                        identity.id(),
                    ),
                );
                let outcome = tokio::select! {
                    biased;
                    _ = links.shutdown.cancelled() => return,
                    outcome = attempt => outcome,
                };

                let result = match outcome {
                    Ok(Ok((stream, remote))) => Ok(Connection::establish(
                        stream,
                        remote,
                        Direction::Outbound,
                        endpoint,
                        links.ctx.clone(),
                        links.signals.clone(),
                    )),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(FileDropError::ConnectTimeout),
                };
                let _ = links.commands.send(Command::DialFinished {
                    peer: identity.id(),
                    result,
                });
            }
            .instrument(span),
        );
    }

    fn expire_peer_dial(&self, peer: PeerId, token: u64) {
        let commands = self.links.commands.clone();
        let shutdown = self.links.shutdown.clone();
        let wait = self.links.connect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let _ = commands.send(Command::PeerDialExpired { peer, token });
                }
            }
        });
    }

    fn on_established(&mut self, conn: Arc<Connection>) {
        let peer = conn.peer().id();
        if conn.is_closed() {
            let err = FileDropError::connection_lost("connection closed during setup");
            let reported = match conn.direction() {
                Direction::Outbound => self.table.dial_failed(peer, &err),
                Direction::Inbound => self.table.admit_failed(peer, &err),
            };
            if reported {
                self.events.emit(NodeEvent::Error(err));
            }
            self.settle(peer);
            return;
        }

        if let Err(duplicate) = self.table.established(conn) {
            info!(peer = %duplicate.peer(), conn = %duplicate.id(), "dropping duplicate connection");
            duplicate.teardown(FileDropError::rejected("duplicate connection"));
            return;
        }

        let Some(conn) = self.table.lookup(&peer) else {
            return;
        };
        let endpoint = match conn.direction() {
            Direction::Outbound => Some(conn.remote_addr()),
            Direction::Inbound => None,
        };
        let transition =
            self.registry
                .write()
                .upsert(conn.peer().clone(), PeerState::Connected, endpoint);
        if transition.is_some() {
            info!(peer = %conn.peer(), conn = %conn.id(), "peer connected");
            self.events
                .emit(NodeEvent::PeerConnected(conn.peer().clone()));
        }
    }

    /// Puts a peer whose attempt ended without a connection back to rest.
    fn settle(&mut self, peer: PeerId) {
        if self.table.is_pending(&peer) || self.table.lookup(&peer).is_some() {
            return;
        }
        let state = self.registry.read().get(&peer).map(|r| r.state);
        if state != Some(PeerState::Connecting) {
            return;
        }
        if self.lingering.remove(&peer) {
            self.forget(&peer);
        } else {
            self.registry.write().transition(&peer, PeerState::Discovered);
        }
    }

    fn close(&mut self, peer: PeerId) {
        let Some(conn) = self.table.lookup(&peer) else {
            debug!(peer = %peer.short(), "close: no connection");
            return;
        };
        let reason = FileDropError::connection_lost("closed locally");
        conn.teardown(reason.clone());
        if self.table.remove(&peer, conn.id()).is_some() {
            self.disconnected(conn.peer(), &reason);
        }
    }

    fn on_down(&mut self, down: ConnectionDown) {
        if self.table.remove(&down.peer.id(), down.id).is_none() {
            debug!(conn = %down.id, "ignoring stale connection");
            return;
        }
        self.disconnected(&down.peer, &down.reason);
    }

    fn disconnected(&mut self, identity: &PeerIdentity, reason: &FileDropError) {
        let id = identity.id();
        let transition = self
            .registry
            .write()
            .transition(&id, PeerState::Disconnected);
        if transition.is_some() {
            info!(peer = %identity, reason = %reason, "peer disconnected");
            self.events
                .emit(NodeEvent::PeerDisconnected(identity.clone()));
        }
        if matches!(reason, FileDropError::Protocol(_)) {
            self.events.emit(NodeEvent::Error(reason.clone()));
        }
        if self.lingering.remove(&id) {
            self.forget(&id);
        }
    }

    fn forget(&mut self, peer: &PeerId) {
        let removed = self.registry.write().remove(peer);
        if let Some(record) = removed {
            info!(peer = %record.identity, "peer lost");
            self.events.emit(NodeEvent::PeerLost(record.identity));
        }
    }

    fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Found { identity, endpoint }
            | DiscoveryEvent::Updated { identity, endpoint } => {
                let id = identity.id();
                self.lingering.remove(&id);

                let mut registry = self.registry.write();
                let state = match registry.get(&id) {
                    Some(record) if record.state.is_linked() => record.state,
                    _ => PeerState::Discovered,
                };
                let transition = registry.upsert(identity, state, Some(endpoint));
                let record = registry.get(&id).cloned();
                drop(registry);

                let Some(record) = record else {
                    return;
                };
                if transition.is_some() {
                    info!(peer = %record.identity, %endpoint, "peer found");
                    self.events.emit(NodeEvent::PeerFound(record));
                    if self.auto_connect {
                        self.connect(id, None);
                    }
                }
            }
            DiscoveryEvent::Lost(identity) => {
                let id = identity.id();
                let state = self.registry.read().get(&id).map(|r| r.state);
                match state {
                    None => {}
                    Some(state) if state.is_linked() || self.table.lookup(&id).is_some() => {
                        debug!(peer = %identity, "lost peer is still linked");
                        self.lingering.insert(id);
                    }
                    Some(_) => self.forget(&id),
                }
            }
            DiscoveryEvent::Failed(err) => {
                self.events.emit(NodeEvent::Error(err));
            }
        }
    }

    fn close_all(&mut self) {
        let reason = FileDropError::connection_lost("node shutting down");
        for conn in self.table.drain() {
            if conn.is_closed() {
                continue;
            }
            conn.teardown(reason.clone());
            self.disconnected(conn.peer(), &reason);
        }
    }
}

/// Accepts inbound streams until shutdown.
pub(crate) async fn accept_loop(links: Links) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = links.shutdown.cancelled() => break,
            accepted = links.transport.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                let span = info_span!("inbound", %remote);
                tokio::spawn(handle_inbound(links.clone(), stream, remote).instrument(span));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("accept loop stopped");
}

async fn handle_inbound(links: Links, mut stream: BoxStream, remote: SocketAddr) {
    let hello = tokio::select! {
        biased;
        _ = links.shutdown.cancelled() => return,
        hello = tokio::time::timeout(
            links.connect_timeout,
            connection::read_hello(&mut stream, &links.namespace),
        ) => hello,
    };
    let identity = match hello {
        Ok(Ok(identity)) => identity,
        Ok(Err(err)) => {
            debug!(error = %err, "inbound handshake failed");
            return;
        }
        Err(_) => {
            debug!("inbound handshake timed out");
            return;
        }
    };

    let (reply, verdict) = oneshot::channel();
    let asked = links.commands.send(Command::InboundHello {
        identity: identity.clone(),
        reply,
    });
    if asked.is_err() {
        return;
    }
    let Ok(admission) = verdict.await else {
        return;
    };

    if let Admission::Reject(reason) = admission {
        connection::reject(&mut stream, reason).await;
        return;
    }

    let result = match tokio::time::timeout(
        links.connect_timeout,
        connection::welcome(&mut stream, &links.local),
    )
    .await
    {
        Ok(Ok(())) => Ok(Connection::establish(
            stream,
            identity.clone(),
            Direction::Inbound,
            remote,
            links.ctx.clone(),
            links.signals.clone(),
        )),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(FileDropError::ConnectTimeout),
    };
    let _ = links
        .commands
        .send(Command::InboundFinished { identity, result });
}
