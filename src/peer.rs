//! # Peer Records
//!
//! A [`Peer`] is the local view of another librarian: its identifier, a
//! human-readable name, its dial address, the [`Connector`] that produces
//! RPC clients for it, and running response-time statistics.
//!
//! Two peers are the same peer iff their identifiers are equal; name and
//! address are advisory metadata. Peers are shared as `Arc<Peer>` across
//! concurrent operations — the record itself is read-mostly, while the stats
//! sit behind their own lock and the connector serializes access to its
//! client internally.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::id::Id;
use crate::messages::PeerAddress;
use crate::protocols::Connector;

/// Weight of the newest sample in the response-time moving average.
const RTT_EWMA_ALPHA: f64 = 0.25;

/// The local record of a remote peer.
pub struct Peer {
    id: Id,
    name: String,
    host: String,
    port: u16,
    connector: Arc<dyn Connector>,
    stats: Mutex<ResponseStats>,
}

impl Peer {
    pub fn new(
        id: Id,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port,
            connector,
            stats: Mutex::new(ResponseStats::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// The wire form of this peer's address, as sent in responses.
    pub fn address(&self) -> PeerAddress {
        PeerAddress {
            peer_id: self.id,
            peer_name: self.name.clone(),
            ip: self.host.clone(),
            port: self.port,
        }
    }

    /// Record a successful query round-trip.
    pub fn record_response(&self, rtt: Duration) {
        self.stats
            .lock()
            .expect("peer stats lock poisoned")
            .record_response(rtt);
    }

    /// Record a failed query.
    pub fn record_error(&self) {
        self.stats
            .lock()
            .expect("peer stats lock poisoned")
            .record_error();
    }

    pub fn stats(&self) -> ResponseStats {
        *self.stats.lock().expect("peer stats lock poisoned")
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &format_args!("{}:{}", self.host, self.port))
            .finish_non_exhaustive()
    }
}

/// Running liveness statistics for a peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseStats {
    n_responses: u64,
    n_errors: u64,
    rtt_ewma: Option<Duration>,
    last_response: Option<Instant>,
}

impl ResponseStats {
    fn record_response(&mut self, rtt: Duration) {
        self.n_responses += 1;
        self.last_response = Some(Instant::now());
        self.rtt_ewma = Some(match self.rtt_ewma {
            None => rtt,
            Some(prev) => prev.mul_f64(1.0 - RTT_EWMA_ALPHA) + rtt.mul_f64(RTT_EWMA_ALPHA),
        });
    }

    fn record_error(&mut self) {
        self.n_errors += 1;
    }

    pub fn n_responses(&self) -> u64 {
        self.n_responses
    }

    pub fn n_errors(&self) -> u64 {
        self.n_errors
    }

    pub fn rtt_ewma(&self) -> Option<Duration> {
        self.rtt_ewma
    }

    pub fn last_response(&self) -> Option<Instant> {
        self.last_response
    }
}

/// Constructs peer records from wire addresses.
///
/// The engines never dial anything themselves; when a response names a new
/// peer, the fromer decides how the corresponding [`Peer`] (and its
/// connector) comes into being. Tests hand the engines a map-backed fromer
/// returning pre-built peers.
pub trait Fromer: Send + Sync {
    fn from_address(&self, address: &PeerAddress) -> Arc<Peer>;
}

/// Production fromer: builds each peer around a connector produced by the
/// supplied factory (where a transport layer would attach).
pub struct ConnectorFromer {
    factory: Box<dyn Fn(&PeerAddress) -> Arc<dyn Connector> + Send + Sync>,
}

impl ConnectorFromer {
    pub fn new(factory: impl Fn(&PeerAddress) -> Arc<dyn Connector> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
        }
    }
}

impl Fromer for ConnectorFromer {
    fn from_address(&self, address: &PeerAddress) -> Arc<Peer> {
        let connector = (self.factory)(address);
        Arc::new(Peer::new(
            address.peer_id,
            address.peer_name.clone(),
            address.ip.clone(),
            address.port,
            connector,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{FinderRpc, IntroducerRpc};
    use anyhow::anyhow;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[derive(Debug)]
    struct StubConnector;

    impl Connector for StubConnector {
        fn finder(&self) -> anyhow::Result<Arc<dyn FinderRpc>> {
            Err(anyhow!("stub"))
        }

        fn introducer(&self) -> anyhow::Result<Arc<dyn IntroducerRpc>> {
            Err(anyhow!("stub"))
        }
    }

    fn test_peer(rng: &mut StdRng, name: &str) -> Peer {
        Peer::new(
            Id::pseudo_random(rng),
            name,
            "localhost",
            20100,
            Arc::new(StubConnector),
        )
    }

    #[test]
    fn equality_and_hash_are_by_id_only() {
        use std::collections::HashSet;

        let mut rng = StdRng::seed_from_u64(0);
        let peer = test_peer(&mut rng, "original");
        let same_id = Peer::new(
            peer.id(),
            "renamed",
            "elsewhere",
            30200,
            Arc::new(StubConnector),
        );
        let other = test_peer(&mut rng, "original");

        assert_eq!(peer, same_id);
        assert_ne!(peer, other);

        let mut set = HashSet::new();
        set.insert(peer);
        assert!(!set.insert(same_id));
    }

    #[test]
    fn address_round_trips_through_wire_form() {
        let mut rng = StdRng::seed_from_u64(1);
        let peer = test_peer(&mut rng, "peer-001");
        let address = peer.address();

        assert_eq!(address.peer_id, peer.id());
        assert_eq!(address.peer_name, "peer-001");
        assert_eq!(address.ip, "localhost");
        assert_eq!(address.port, 20100);
    }

    #[test]
    fn stats_track_responses_and_errors() {
        let mut rng = StdRng::seed_from_u64(2);
        let peer = test_peer(&mut rng, "peer-002");
        assert_eq!(peer.stats().n_responses(), 0);
        assert!(peer.stats().rtt_ewma().is_none());

        peer.record_response(Duration::from_millis(40));
        peer.record_response(Duration::from_millis(80));
        peer.record_error();

        let stats = peer.stats();
        assert_eq!(stats.n_responses(), 2);
        assert_eq!(stats.n_errors(), 1);
        assert!(stats.last_response().is_some());

        let ewma = stats.rtt_ewma().unwrap();
        assert!(ewma > Duration::from_millis(40));
        assert!(ewma < Duration::from_millis(80));
    }

    #[test]
    fn connector_fromer_builds_peers_from_addresses() {
        let mut rng = StdRng::seed_from_u64(3);
        let fromer = ConnectorFromer::new(|_| Arc::new(StubConnector) as Arc<dyn Connector>);

        let address = PeerAddress {
            peer_id: Id::pseudo_random(&mut rng),
            peer_name: "peer-003".to_string(),
            ip: "10.0.0.3".to_string(),
            port: 20103,
        };
        let peer = fromer.from_address(&address);

        assert_eq!(peer.id(), address.peer_id);
        assert_eq!(peer.address(), address);
        assert!(peer.connector().finder().is_err());
    }
}
