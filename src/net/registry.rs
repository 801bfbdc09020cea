//! Peer registry.
//!
//! Pure bookkeeping: an id-keyed map of [`PeerRecord`]s with no I/O. The
//! coordinator is the only writer; it pushes updates here and turns the
//! returned [`PeerTransition`]s into observer events. Upserts that do not
//! change a peer's state return `None`, so repeated discovery of the same
//! peer never produces duplicate notifications.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::identity::{PeerId, PeerIdentity};

/// Reachability state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

impl PeerState {
    /// Returns true while a connection exists or is being established.
    #[inline]
    pub fn is_linked(&self) -> bool {
        matches!(self, PeerState::Connecting | PeerState::Connected)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Discovered => "discovered",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A registry entry.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    pub state: PeerState,
    /// Last known address of the peer's stream listener
    pub endpoint: Option<SocketAddr>,
    /// When `state` last changed
    pub last_changed: Instant,
}

/// A change produced by [`PeerRegistry::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTransition {
    pub identity: PeerIdentity,
    /// `None` when the record was created by this upsert
    pub from: Option<PeerState>,
    pub to: PeerState,
}

/// Id-keyed peer table.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a peer.
    ///
    /// The stored identity is replaced so renamed peers show their new name.
    /// An `endpoint` of `None` keeps whatever address was already known.
    /// Returns a transition only when the record is new or its state changed.
    pub fn upsert(
        &mut self,
        identity: PeerIdentity,
        state: PeerState,
        endpoint: Option<SocketAddr>,
    ) -> Option<PeerTransition> {
        let now = Instant::now();
        match self.peers.get_mut(&identity.id()) {
            Some(record) => {
                record.identity = identity.clone();
                if endpoint.is_some() {
                    record.endpoint = endpoint;
                }
                if record.state == state {
                    return None;
                }
                let from = record.state;
                record.state = state;
                record.last_changed = now;
                Some(PeerTransition {
                    identity,
                    from: Some(from),
                    to: state,
                })
            }
            None => {
                self.peers.insert(
                    identity.id(),
                    PeerRecord {
                        identity: identity.clone(),
                        state,
                        endpoint,
                        last_changed: now,
                    },
                );
                Some(PeerTransition {
                    identity,
                    from: None,
                    to: state,
                })
            }
        }
    }

    /// Moves an existing peer to `state`; unknown peers are left alone.
    pub fn transition(&mut self, id: &PeerId, state: PeerState) -> Option<PeerTransition> {
        let identity = self.peers.get(id)?.identity.clone();
        self.upsert(identity, state, None)
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    #[inline]
    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Returns every record whose state satisfies `filter`.
    pub fn list<F>(&self, filter: F) -> Vec<PeerRecord>
    where
        F: Fn(PeerState) -> bool,
    {
        self.peers
            .values()
            .filter(|record| filter(record.state))
            .cloned()
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), port)
    }

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::new(PeerId::random(), name)
    }

    mod upsert_tests {
        use super::*;

        #[test]
        fn test_insert_reports_creation() {
            let mut registry = PeerRegistry::new();
            let alice = peer("Alice-iPhone");

            let change = registry
                .upsert(alice.clone(), PeerState::Discovered, Some(test_addr(7000)))
                .expect("new peer is a transition");
            assert_eq!(change.from, None);
            assert_eq!(change.to, PeerState::Discovered);
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.get(&alice.id()).unwrap().endpoint, Some(test_addr(7000)));
        }

        #[test]
        fn test_same_state_is_silent() {
            let mut registry = PeerRegistry::new();
            let alice = peer("Alice-iPhone");

            registry.upsert(alice.clone(), PeerState::Discovered, None);
            assert!(registry
                .upsert(alice.clone(), PeerState::Discovered, None)
                .is_none());
            assert!(registry
                .upsert(alice, PeerState::Discovered, Some(test_addr(1)))
                .is_none());
            assert_eq!(registry.len(), 1);
        }

        #[test]
        fn test_state_change_reports_from_and_to() {
            let mut registry = PeerRegistry::new();
            let alice = peer("Alice-iPhone");

            registry.upsert(alice.clone(), PeerState::Discovered, None);
            let change = registry
                .upsert(alice.clone(), PeerState::Connecting, None)
                .unwrap();
            assert_eq!(change.from, Some(PeerState::Discovered));
            assert_eq!(change.to, PeerState::Connecting);
            assert_eq!(registry.get(&alice.id()).unwrap().state, PeerState::Connecting);
        }

        #[test]
        fn test_none_endpoint_keeps_existing() {
            let mut registry = PeerRegistry::new();
            let alice = peer("Alice-iPhone");

            registry.upsert(alice.clone(), PeerState::Discovered, Some(test_addr(7000)));
            registry.upsert(alice.clone(), PeerState::Connected, None);
            assert_eq!(registry.get(&alice.id()).unwrap().endpoint, Some(test_addr(7000)));
        }

        #[test]
        fn test_rename_updates_identity() {
            let mut registry = PeerRegistry::new();
            let id = PeerId::random();

            registry.upsert(PeerIdentity::new(id, "old"), PeerState::Discovered, None);
            registry.upsert(PeerIdentity::new(id, "new"), PeerState::Discovered, None);
            assert_eq!(registry.get(&id).unwrap().identity.display_name(), "new");
        }

        #[test]
        fn test_rediscovery_after_disconnect() {
            let mut registry = PeerRegistry::new();
            let alice = peer("Alice-iPhone");

            registry.upsert(alice.clone(), PeerState::Connected, None);
            registry.upsert(alice.clone(), PeerState::Disconnected, None);
            let change = registry.upsert(alice, PeerState::Discovered, None).unwrap();
            assert_eq!(change.from, Some(PeerState::Disconnected));
        }
    }

    mod query_tests {
        use super::*;

        #[test]
        fn test_remove_then_get_is_absent() {
            let mut registry = PeerRegistry::new();
            let alice = peer("Alice-iPhone");

            registry.upsert(alice.clone(), PeerState::Discovered, None);
            assert!(registry.remove(&alice.id()).is_some());
            assert!(registry.get(&alice.id()).is_none());
            assert!(registry.remove(&alice.id()).is_none());
            assert!(registry.is_empty());
        }

        #[test]
        fn test_list_filters_by_state() {
            let mut registry = PeerRegistry::new();
            registry.upsert(peer("a"), PeerState::Discovered, None);
            registry.upsert(peer("b"), PeerState::Connected, None);
            registry.upsert(peer("c"), PeerState::Connected, None);

            assert_eq!(registry.list(|_| true).len(), 3);
            assert_eq!(registry.list(|s| s == PeerState::Connected).len(), 2);
            assert_eq!(registry.list(|s| s == PeerState::Connecting).len(), 0);
        }

        #[test]
        fn test_transition_unknown_peer_is_noop() {
            let mut registry = PeerRegistry::new();
            assert!(registry
                .transition(&PeerId::random(), PeerState::Disconnected)
                .is_none());
            assert!(registry.is_empty());
        }

        #[test]
        fn test_list_never_has_duplicates_under_churn() {
            let mut registry = PeerRegistry::new();
            let peers: Vec<_> = (0..8).map(|i| peer(&format!("peer-{i}"))).collect();
            let states = [
                PeerState::Discovered,
                PeerState::Connecting,
                PeerState::Connected,
                PeerState::Disconnected,
            ];

            for round in 0..64usize {
                let p = &peers[round % peers.len()];
                if round % 5 == 0 {
                    registry.remove(&p.id());
                } else {
                    registry.upsert(p.clone(), states[round % states.len()], None);
                }

                let listed = registry.list(|_| true);
                let unique: HashSet<_> = listed.iter().map(|r| r.identity.id()).collect();
                assert_eq!(unique.len(), listed.len());
            }
        }
    }

    #[test]
    fn test_peer_state_is_linked() {
        assert!(PeerState::Connecting.is_linked());
        assert!(PeerState::Connected.is_linked());
        assert!(!PeerState::Discovered.is_linked());
        assert!(!PeerState::Disconnected.is_linked());
        assert_eq!(PeerState::Connected.to_string(), "connected");
    }
}
