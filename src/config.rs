//! Node configuration.
//!
//! Everything here is supplied by the embedding application. The library
//! never reads environment variables or configuration files.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::net::identity::PeerId;

/// Discovery namespace shared by advertiser and browser.
pub const DEFAULT_NAMESPACE: &str = "filedrop";

/// Zero-configuration service type for the stream transport.
pub const DEFAULT_SERVICE_TYPE: &str = "_filedrop._tcp";

/// Display name used when the application does not set one.
pub const DEFAULT_DISPLAY_NAME: &str = "FileDrop Device";

/// Administratively scoped multicast group used for beacons.
pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 70, 68), 47474);

/// Interval between presence announcements.
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(1);

/// A peer unseen for this long is considered lost.
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(5);

/// Bound on an outbound connect plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum gap between frames before a transfer is declared stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest body frame payload (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Body frames buffered between a connection's reader and its receive session.
pub const DEFAULT_BODY_CHANNEL_DEPTH: usize = 4;

/// How long a finished transfer stays visible in the transfer table.
pub const DEFAULT_FINISHED_RETENTION: Duration = Duration::from_secs(60);

/// Largest frame the u32 length prefix can describe.
pub const MAX_WIRE_FRAME_LEN: usize = u32::MAX as usize;

/// Subdirectory of the user's downloads folder that receives files.
const DOWNLOAD_SUBDIR: &str = "FileDrop";

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Peers advertising under another namespace are ignored
    pub namespace: String,
    /// Service type carried in every announcement
    pub service_type: String,
    /// Multicast group and port for beacons
    pub multicast_group: SocketAddrV4,
    pub beacon_interval: Duration,
    pub peer_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            multicast_group: DEFAULT_MULTICAST_GROUP,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            peer_ttl: DEFAULT_PEER_TTL,
        }
    }
}

/// Transfer session settings.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Where received files land
    pub download_dir: PathBuf,
    pub max_frame_len: usize,
    pub stall_timeout: Duration,
    pub body_channel_depth: usize,
    /// Finished transfers older than this are swept from the table
    pub finished_retention: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            body_channel_depth: DEFAULT_BODY_CHANNEL_DEPTH,
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }
}

/// Top-level configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Fixed identity; a random one is generated when `None`
    pub peer_id: Option<PeerId>,
    pub display_name: String,
    /// Address the stream listener binds to
    pub listen_addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Connect to every newly discovered peer
    pub auto_connect: bool,
    /// Start advertising and browsing as soon as the node is up
    pub auto_start_discovery: bool,
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_connect: false,
            auto_start_discovery: true,
            discovery: DiscoveryConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_peer_id(mut self, id: PeerId) -> Self {
        self.peer_id = Some(id);
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transfer.download_dir = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.transfer.stall_timeout = timeout;
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn with_auto_start_discovery(mut self, enabled: bool) -> Self {
        self.auto_start_discovery = enabled;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.discovery.namespace = namespace.into();
        self
    }

    pub fn with_beacon_timing(mut self, interval: Duration, ttl: Duration) -> Self {
        self.discovery.beacon_interval = interval;
        self.discovery.peer_ttl = ttl;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.transfer.max_frame_len = len;
        self
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.transfer.finished_retention = retention;
        self
    }

    /// Rejects settings no node can run with.
    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        self.transfer.validate()?;
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be non-zero");
        }
        Ok(())
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.beacon_interval.is_zero() {
            bail!("beacon interval must be non-zero");
        }
        if self.peer_ttl <= self.beacon_interval {
            bail!(
                "peer TTL ({:?}) must exceed the beacon interval ({:?})",
                self.peer_ttl,
                self.beacon_interval
            );
        }
        Ok(())
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WIRE_FRAME_LEN).contains(&self.max_frame_len) {
            bail!(
                "max frame length {} outside 1..={MAX_WIRE_FRAME_LEN}",
                self.max_frame_len
            );
        }
        if self.stall_timeout.is_zero() {
            bail!("stall timeout must be non-zero");
        }
        if self.body_channel_depth == 0 {
            bail!("body channel depth must be non-zero");
        }
        Ok(())
    }
}

/// Downloads folder, then `~/Downloads`, then the working directory.
fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DOWNLOAD_SUBDIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_default() {
        let config = NodeConfig::default();
        assert!(config.peer_id.is_none());
        assert_eq!(config.display_name, DEFAULT_DISPLAY_NAME);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(!config.auto_connect);
        assert!(config.auto_start_discovery);
        assert_eq!(config.listen_addr.port(), 0);
    }

    #[test]
    fn test_discovery_config_default() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.namespace, "filedrop");
        assert_eq!(config.service_type, "_filedrop._tcp");
        assert!(config.multicast_group.ip().is_multicast());
        assert!(config.peer_ttl > config.beacon_interval);
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.max_frame_len, 1024 * 1024);
        assert_eq!(config.stall_timeout, Duration::from_secs(30));
        assert!(config.download_dir.ends_with(DOWNLOAD_SUBDIR));
    }

    #[test]
    fn test_builder_methods() {
        let id = PeerId::random();
        let config = NodeConfig::default()
            .with_display_name("Alice-iPhone")
            .with_peer_id(id)
            .with_download_dir("/tmp/drop")
            .with_connect_timeout(Duration::from_millis(200))
            .with_auto_connect(true)
            .with_namespace("other");

        assert_eq!(config.display_name, "Alice-iPhone");
        assert_eq!(config.peer_id, Some(id));
        assert_eq!(config.transfer.download_dir, PathBuf::from("/tmp/drop"));
        assert_eq!(config.connect_timeout, Duration::from_millis(200));
        assert!(config.auto_connect);
        assert_eq!(config.discovery.namespace, "other");
    }

    // ==================== Validation Tests ====================

    mod validation_tests {
        use super::*;

        #[test]
        fn test_defaults_are_valid() {
            NodeConfig::default().validate().unwrap();
        }

        #[test]
        fn test_zero_beacon_interval_rejected() {
            let config = NodeConfig::default().with_beacon_timing(Duration::ZERO, Duration::from_secs(1));
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("beacon interval"));
        }

        #[test]
        fn test_ttl_must_outlive_interval() {
            let config = NodeConfig::default()
                .with_beacon_timing(Duration::from_secs(1), Duration::from_secs(1));
            assert!(config.validate().is_err());

            let config = NodeConfig::default().with_beacon_timing(Duration::from_millis(50), Duration::ZERO);
            assert!(config.validate().is_err());
        }

        #[test]
        fn test_frame_length_bounds() {
            assert!(NodeConfig::default().with_max_frame_len(0).validate().is_err());
            assert!(NodeConfig::default().with_max_frame_len(1).validate().is_ok());
            assert!(NodeConfig::default()
                .with_max_frame_len(MAX_WIRE_FRAME_LEN)
                .validate()
                .is_ok());
            if let Some(too_big) = MAX_WIRE_FRAME_LEN.checked_add(1) {
                assert!(NodeConfig::default().with_max_frame_len(too_big).validate().is_err());
            }
        }

        #[test]
        fn test_zero_timeouts_rejected() {
            assert!(NodeConfig::default()
                .with_connect_timeout(Duration::ZERO)
                .validate()
                .is_err());
            assert!(NodeConfig::default()
                .with_stall_timeout(Duration::ZERO)
                .validate()
                .is_err());
        }

        #[test]
        fn test_zero_retention_is_allowed() {
            let config = NodeConfig::default().with_finished_retention(Duration::ZERO);
            config.validate().unwrap();
            assert_eq!(config.transfer.finished_retention, Duration::ZERO);
        }
    }
}
