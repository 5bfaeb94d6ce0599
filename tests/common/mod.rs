//! Shared harness for engine integration tests: a deterministic in-memory
//! peer universe with connector-backed RPC doubles, plus the factory and
//! processor doubles the failure scenarios inject.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rand::rngs::StdRng;

use libri::id::Id;
use libri::messages::{
    Document, FindRequest, FindResponse, IntroduceRequest, IntroduceResponse, PeerAddress,
    ResponseMetadata,
};
use libri::peer::{Fromer, Peer};
use libri::protocols::{
    Connector, FinderCreator, FinderRpc, IntroducerCreator, IntroducerRpc,
};

/// Connector that refuses everything; for peers that are only ever
/// addressed, never dialed.
pub struct StubConnector;

impl Connector for StubConnector {
    fn finder(&self) -> Result<Arc<dyn FinderRpc>> {
        Err(anyhow!("no transport bound"))
    }

    fn introducer(&self) -> Result<Arc<dyn IntroducerRpc>> {
        Err(anyhow!("no transport bound"))
    }
}

/// Fromer returning pre-built universe peers by identifier, so responses
/// resolve to peers whose connectors keep working.
pub struct MapFromer {
    peers: HashMap<Id, Arc<Peer>>,
}

impl MapFromer {
    pub fn new(peers: &[Arc<Peer>]) -> Self {
        Self {
            peers: peers.iter().map(|p| (p.id(), Arc::clone(p))).collect(),
        }
    }
}

impl Fromer for MapFromer {
    fn from_address(&self, address: &PeerAddress) -> Arc<Peer> {
        self.peers
            .get(&address.peer_id)
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(Peer::new(
                    address.peer_id,
                    address.peer_name.clone(),
                    address.ip.clone(),
                    address.port,
                    Arc::new(StubConnector),
                ))
            })
    }
}

// ----------------------------------------------------------------------
// Search universe
// ----------------------------------------------------------------------

/// Find client double: answers with the universe members closest to the
/// requested key, or with the held document when the key matches.
struct UniverseFinderRpc {
    universe: Arc<Vec<PeerAddress>>,
    held: Option<Document>,
}

#[async_trait]
impl FinderRpc for UniverseFinderRpc {
    async fn find(&self, request: FindRequest, _token: String) -> Result<FindResponse> {
        let metadata = ResponseMetadata {
            request_id: request.metadata.request_id,
            pub_key: vec![],
        };

        if let Some(held) = &self.held
            && held.key() == request.key
        {
            return Ok(FindResponse {
                metadata,
                peers: vec![],
                value: Some(held.clone()),
            });
        }

        let mut members: Vec<&PeerAddress> = self.universe.iter().collect();
        members.sort_by_key(|a| request.key.distance(&a.peer_id));
        Ok(FindResponse {
            metadata,
            peers: members
                .into_iter()
                .take(request.num_peers as usize)
                .cloned()
                .collect(),
            value: None,
        })
    }
}

struct SearchUniverseConnector {
    universe: Arc<Vec<PeerAddress>>,
    held: Option<Document>,
}

impl Connector for SearchUniverseConnector {
    fn finder(&self) -> Result<Arc<dyn FinderRpc>> {
        Ok(Arc::new(UniverseFinderRpc {
            universe: Arc::clone(&self.universe),
            held: self.held.clone(),
        }))
    }

    fn introducer(&self) -> Result<Arc<dyn IntroducerRpc>> {
        Err(anyhow!("introduce not offered by this double"))
    }
}

/// Build `n` peers whose connectors answer Find queries from a shared view
/// of the whole universe. `holder` optionally places a document on one peer.
pub fn new_search_universe(
    rng: &mut StdRng,
    n: usize,
    holder: Option<(usize, Document)>,
) -> Vec<Arc<Peer>> {
    let addresses: Arc<Vec<PeerAddress>> = Arc::new(
        (0..n)
            .map(|i| PeerAddress {
                peer_id: Id::pseudo_random(rng),
                peer_name: format!("peer-{i:03}"),
                ip: "localhost".to_string(),
                port: 20100 + i as u16,
            })
            .collect(),
    );
    addresses
        .iter()
        .enumerate()
        .map(|(i, address)| {
            let held = holder
                .as_ref()
                .filter(|(holder_idx, _)| *holder_idx == i)
                .map(|(_, doc)| doc.clone());
            Arc::new(Peer::new(
                address.peer_id,
                address.peer_name.clone(),
                address.ip.clone(),
                address.port,
                Arc::new(SearchUniverseConnector {
                    universe: Arc::clone(&addresses),
                    held,
                }),
            ))
        })
        .collect()
}

// ----------------------------------------------------------------------
// Introduce universe
// ----------------------------------------------------------------------

/// Introduce client double: answers as its peer with a window of the
/// universe following that peer's position, spreading acquaintance around
/// the ring.
struct UniverseIntroducerRpc {
    self_address: PeerAddress,
    universe: Arc<Vec<PeerAddress>>,
    position: usize,
}

#[async_trait]
impl IntroducerRpc for UniverseIntroducerRpc {
    async fn introduce(
        &self,
        request: IntroduceRequest,
        _token: String,
    ) -> Result<IntroduceResponse> {
        let n = self.universe.len();
        let peers = (1..=request.num_peers as usize)
            .map(|offset| self.universe[(self.position + offset) % n].clone())
            .collect();
        Ok(IntroduceResponse {
            metadata: ResponseMetadata {
                request_id: request.metadata.request_id,
                pub_key: vec![],
            },
            self_address: self.self_address.clone(),
            peers,
        })
    }
}

struct IntroduceUniverseConnector {
    self_address: PeerAddress,
    universe: Arc<Vec<PeerAddress>>,
    position: usize,
}

impl Connector for IntroduceUniverseConnector {
    fn finder(&self) -> Result<Arc<dyn FinderRpc>> {
        Err(anyhow!("find not offered by this double"))
    }

    fn introducer(&self) -> Result<Arc<dyn IntroducerRpc>> {
        Ok(Arc::new(UniverseIntroducerRpc {
            self_address: self.self_address.clone(),
            universe: Arc::clone(&self.universe),
            position: self.position,
        }))
    }
}

/// Build `n` peers whose connectors answer Introduce queries from a shared
/// view of the whole universe.
pub fn new_introduce_universe(rng: &mut StdRng, n: usize) -> Vec<Arc<Peer>> {
    let addresses: Arc<Vec<PeerAddress>> = Arc::new(
        (0..n)
            .map(|i| PeerAddress {
                peer_id: Id::pseudo_random(rng),
                peer_name: format!("peer-{i:03}"),
                ip: "localhost".to_string(),
                port: 20100 + i as u16,
            })
            .collect(),
    );
    addresses
        .iter()
        .enumerate()
        .map(|(position, address)| {
            Arc::new(Peer::new(
                address.peer_id,
                address.peer_name.clone(),
                address.ip.clone(),
                address.port,
                Arc::new(IntroduceUniverseConnector {
                    self_address: address.clone(),
                    universe: Arc::clone(&addresses),
                    position,
                }),
            ))
        })
        .collect()
}

// ----------------------------------------------------------------------
// Failure doubles
// ----------------------------------------------------------------------

/// Find client factory that refuses every connection.
pub struct ErrFinderCreator;

impl FinderCreator for ErrFinderCreator {
    fn create(&self, _connector: &dyn Connector) -> Result<Arc<dyn FinderRpc>> {
        Err(anyhow!("connection refused"))
    }
}

/// Introduce client factory that refuses every connection.
pub struct ErrIntroducerCreator;

impl IntroducerCreator for ErrIntroducerCreator {
    fn create(&self, _connector: &dyn Connector) -> Result<Arc<dyn IntroducerRpc>> {
        Err(anyhow!("connection refused"))
    }
}
