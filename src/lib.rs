//! FileDrop - local network peer discovery and file transfer
//!
//! A device announces itself on the LAN, finds other devices doing the same,
//! opens a direct stream connection to one of them and sends it a file. There
//! is no server and no persisted state.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`app`]: the [`Node`] composition root and its coordinator task
//! - [`net`]: identity, registry, discovery, transport, connections, codec
//!   and transfer sessions
//! - [`events`]: the observer bus a presentation layer subscribes to
//! - [`config`]: tunables with their defaults
//! - [`error`]: the error type shared by every layer
//!
//! # Example
//!
//! ```rust,ignore
//! use filedrop::{Node, NodeConfig, NodeEvent};
//!
//! let node = Node::start(NodeConfig::default().with_display_name("Bob-Laptop")).await?;
//! let mut events = node.subscribe();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         NodeEvent::TransferProgress(p) => println!("{}: {}%", p.file_name, p.percent()),
//!         NodeEvent::TransferCompleted { path, .. } => println!("saved {}", path.display()),
//!         _ => {}
//!     }
//! }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod net;

pub use app::Node;
pub use config::{DiscoveryConfig, NodeConfig, TransferConfig};
pub use error::{ErrorKind, FileDropError};
pub use events::{EventBus, EventStream, NodeEvent};
pub use net::{
    PeerId, PeerIdentity, PeerRecord, PeerState, TransferHandle, TransferId, TransferProgress,
};
