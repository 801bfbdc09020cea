//! Error types shared by every layer of the crate.
//!
//! Runtime operations return [`FileDropError`]. It is `Clone` so the same
//! failure can be handed to a caller, recorded in a transfer snapshot and
//! broadcast to observers without re-formatting.

use std::sync::Arc;

use thiserror::Error;

use crate::net::codec::FrameError;

/// Result alias for fallible runtime operations.
pub type Result<T, E = FileDropError> = std::result::Result<T, E>;

/// Errors surfaced by discovery, connections and transfer sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileDropError {
    /// The advertiser or browser could not start or keep running
    #[error("discovery failed: {0}")]
    DiscoveryFailed(Arc<str>),

    /// The peer is unknown or its endpoint refused the connection
    #[error("peer unreachable: {0}")]
    PeerUnreachable(Arc<str>),

    /// The connection attempt did not finish within the timeout
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The remote side refused the connection
    #[error("connection rejected: {0}")]
    Rejected(Arc<str>),

    /// The transport failed or closed while in use
    #[error("connection lost: {0}")]
    ConnectionLost(Arc<str>),

    /// A transfer is already active on this connection
    #[error("a transfer is already active on this connection")]
    SessionBusy,

    /// The transfer was cancelled locally
    #[error("transfer cancelled")]
    Cancelled,

    /// No progress was made within the stall timeout
    #[error("transfer stalled")]
    Stalled,

    /// Local file read or write failure
    #[error("i/o error: {0}")]
    Io(Arc<str>),

    /// Malformed frame or length mismatch on the wire
    #[error("protocol error: {0}")]
    Protocol(Arc<str>),

    /// The peer has no ready connection
    #[error("peer not connected: {0}")]
    PeerNotConnected(Arc<str>),

    /// The node has been shut down
    #[error("node has been shut down")]
    Shutdown,
}

/// Fieldless discriminant of [`FileDropError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DiscoveryFailed,
    PeerUnreachable,
    ConnectTimeout,
    Rejected,
    ConnectionLost,
    SessionBusy,
    Cancelled,
    Stalled,
    Io,
    Protocol,
    PeerNotConnected,
    Shutdown,
}

impl FileDropError {
    #[inline]
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::DiscoveryFailed(Arc::from(msg.into()))
    }

    #[inline]
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::PeerUnreachable(Arc::from(msg.into()))
    }

    #[inline]
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(Arc::from(msg.into()))
    }

    #[inline]
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(Arc::from(msg.into()))
    }

    #[inline]
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(Arc::from(msg.into()))
    }

    #[inline]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(Arc::from(msg.into()))
    }

    #[inline]
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::PeerNotConnected(Arc::from(msg.into()))
    }

    /// Returns the variant without its payload.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DiscoveryFailed(_) => ErrorKind::DiscoveryFailed,
            Self::PeerUnreachable(_) => ErrorKind::PeerUnreachable,
            Self::ConnectTimeout => ErrorKind::ConnectTimeout,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::SessionBusy => ErrorKind::SessionBusy,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Stalled => ErrorKind::Stalled,
            Self::Io(_) => ErrorKind::Io,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::PeerNotConnected(_) => ErrorKind::PeerNotConnected,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Maps a stream error into the connection-level vocabulary.
    ///
    /// Once a connection is up, any transport error means the peer is gone.
    pub(crate) fn from_transport(err: &std::io::Error) -> Self {
        Self::connection_lost(err.to_string())
    }
}

impl From<std::io::Error> for FileDropError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<FrameError> for FileDropError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(msg) => Self::ConnectionLost(msg),
            FrameError::Truncated => Self::connection_lost(FrameError::Truncated.to_string()),
            other => Self::protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(FileDropError::Cancelled.to_string(), "transfer cancelled");
        assert_eq!(FileDropError::Stalled.to_string(), "transfer stalled");
        assert_eq!(
            FileDropError::ConnectTimeout.to_string(),
            "connection attempt timed out"
        );

        let err = FileDropError::rejected("already connected");
        assert!(err.to_string().contains("connection rejected"));
        assert!(err.to_string().contains("already connected"));

        let err = FileDropError::not_connected("abc");
        assert!(err.to_string().contains("peer not connected"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(FileDropError::SessionBusy.kind(), ErrorKind::SessionBusy);
        assert_eq!(FileDropError::io("disk full").kind(), ErrorKind::Io);
        assert_eq!(
            FileDropError::connection_lost("reset").kind(),
            ErrorKind::ConnectionLost
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.bin");
        let err: FileDropError = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("missing.bin"));
    }

    #[test]
    fn test_from_frame_error() {
        let err: FileDropError = FrameError::EmptyBody.into();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let err: FileDropError = FrameError::Io(Arc::from("broken pipe")).into();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);

        let err: FileDropError = FrameError::Truncated.into();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    }

    #[test]
    fn test_error_clone_eq() {
        let err = FileDropError::protocol("bad length");
        assert_eq!(err.clone(), err);
    }
}
