//! Observer events.
//!
//! A node publishes everything the presentation layer needs to render on an
//! [`EventBus`]. Any number of observers may [`subscribe`](EventBus::subscribe);
//! each gets its own unbounded queue, and emission is serialized so every
//! observer sees events in the same order.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::FileDropError;
use crate::net::identity::PeerIdentity;
use crate::net::registry::PeerRecord;
use crate::net::session::TransferProgress;

/// Something observers may want to know about.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerFound(PeerRecord),
    PeerLost(PeerIdentity),
    PeerConnected(PeerIdentity),
    PeerDisconnected(PeerIdentity),
    /// A session began, in either direction
    TransferStarted(TransferProgress),
    TransferProgress(TransferProgress),
    /// `path` is the source file when sending, the final file when receiving
    TransferCompleted {
        progress: TransferProgress,
        path: PathBuf,
    },
    TransferFailed {
        progress: TransferProgress,
        error: FileDropError,
    },
    /// Discovery or connection failure not tied to a transfer
    Error(FileDropError),
}

impl NodeEvent {
    /// Short name for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            NodeEvent::PeerFound(_) => "peer-found",
            NodeEvent::PeerLost(_) => "peer-lost",
            NodeEvent::PeerConnected(_) => "peer-connected",
            NodeEvent::PeerDisconnected(_) => "peer-disconnected",
            NodeEvent::TransferStarted(_) => "transfer-started",
            NodeEvent::TransferProgress(_) => "transfer-progress",
            NodeEvent::TransferCompleted { .. } => "transfer-completed",
            NodeEvent::TransferFailed { .. } => "transfer-failed",
            NodeEvent::Error(_) => "error",
        }
    }
}

/// Fan-out of [`NodeEvent`]s to every live subscriber.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NodeEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new observer. It sees events emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream { rx }
    }

    /// Delivers `event` to every subscriber, dropping the ones that hung up.
    pub fn emit(&self, event: NodeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// One observer's view of the bus.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<NodeEvent>,
}

impl EventStream {
    /// Waits for the next event; `None` once the node is gone.
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<NodeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = NodeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<NodeEvent>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
