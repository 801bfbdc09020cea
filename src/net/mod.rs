//! Networking layer for FileDrop
//!
//! This module provides everything below the node:
//!
//! - **Identity**: peer ids and display names
//! - **Registry**: discovered and connected peers and their reachability
//! - **Discovery**: multicast announce/browse with liveness expiry
//! - **Transport**: the stream seam (TCP, or an in-memory LAN for tests)
//! - **Connection**: handshake, admission and per-connection reader task
//! - **Codec**: length-prefixed header and body frames
//! - **Session**: the one-file-per-connection transfer state machine
//!
//! # Wire protocol
//!
//! Every connection starts with a JSON handshake and then carries transfers,
//! one at a time. Each transfer is a header frame followed by body frames
//! until the declared size is reached. See [`codec`] for the frame layout.

pub mod codec;
pub mod connection;
pub mod discovery;
pub mod identity;
pub mod registry;
pub mod session;
pub mod transport;

pub use codec::{Frame, FrameCodec, FrameError, TransferDescriptor};
pub use connection::{Connection, ConnectionId, ConnectionState, Direction};
pub use discovery::{
    Beacon, BeaconChannel, Discovery, DiscoveryEvent, MulticastChannel, PeerTable,
    UnavailableChannel,
};
pub use identity::{PeerId, PeerIdentity};
pub use registry::{PeerRecord, PeerRegistry, PeerState, PeerTransition};
pub use session::{
    sanitize_file_name, AbortHandle, SessionRole, SessionState, TransferHandle, TransferId,
    TransferProgress, TransferTable,
};
pub use transport::{BoxStream, MemoryBeacons, MemoryLan, MemoryTransport, TcpTransport, Transport};
