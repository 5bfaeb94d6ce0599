//! # Iterative Search Engine
//!
//! Concurrent best-first lookup of the peers closest to a target key, or of
//! the stored value under that key. Starting from a set of seed peers, the
//! engine repeatedly pops the most promising unqueried peer, dispatches a
//! signed Find RPC, and merges the response into shared search state until a
//! termination predicate fires.
//!
//! ## State
//!
//! A [`Search`] owns one [`SearchState`] behind a single mutex:
//!
//! | Collection | Order | Role |
//! |------------|-------|------|
//! | `unqueried` | min-heap by distance to the key | candidates to query next |
//! | `closest` | bounded max-heap of at most K | the best responders seen |
//! | `responded` | insertion order | responders not (or no longer) in `closest` |
//! | `errored` | unordered | peers whose query failed; never retried |
//!
//! The four collections are pairwise disjoint by peer ID at all times. The
//! lock is held only around selection and merging, never across RPC I/O.
//!
//! ## Termination
//!
//! - `found_value`: a Find response carried the stored document
//! - `found_closest_peers`: `closest` is full and no unqueried candidate is
//!   nearer than its farthest member
//! - `exhausted`: no candidates remain and no queries are in flight
//! - `errored`: the error budget is spent, or response processing failed
//!   fatally
//!
//! The concurrency model is a pool of `concurrency` workers draining the
//! candidate heap; the terminal contents of `closest` do not depend on merge
//! order because admission is purely by distance. The first worker to
//! observe a fired predicate cancels a shared token, and the rest abandon
//! their in-flight queries unmerged at the next suspension point instead of
//! draining them to the per-query timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::RequestSigner;
use crate::id::{Distance, Id};
use crate::identity::NodeIdentity;
use crate::messages::{Document, FindRequest, FindResponse, Request};
use crate::peer::{Fromer, Peer};
use crate::protocols::FinderCreator;

pub const DEFAULT_N_CLOSEST_RESPONSES: usize = 20;
pub const DEFAULT_N_MAX_ERRORS: usize = 3;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_N_PEERS_PER_REQUEST: u32 = 20;

/// The candidate heap holds this many times K before evicting the farthest.
const UNQUERIED_CAPACITY_FACTOR: usize = 8;

/// How long an idle worker waits for in-flight queries to surface new
/// candidates before re-checking.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Terminal error when the per-operation error budget is spent.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("too many Find errors during search")]
pub struct TooManyFindErrors;

/// A response echoed a request identifier other than the one sent.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("response request id does not match the request")]
pub struct RequestIdMismatch;

/// A Find response carried neither a value nor any peer addresses.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("response carries neither a value nor peers")]
pub struct EmptyResponse;

/// Tunable parameters of one search operation.
#[derive(Clone, Copy, Debug)]
pub struct Parameters {
    /// Target size of `closest` before the search may succeed.
    pub n_closest_responses: usize,
    /// Query error budget; spending it terminates the search.
    pub n_max_errors: usize,
    /// Maximum number of in-flight queries.
    pub concurrency: usize,
    /// Wall-clock budget per query.
    pub query_timeout: Duration,
    /// How many peers each Find request asks the responder for.
    pub n_peers_per_request: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            n_closest_responses: DEFAULT_N_CLOSEST_RESPONSES,
            n_max_errors: DEFAULT_N_MAX_ERRORS,
            concurrency: DEFAULT_CONCURRENCY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            n_peers_per_request: DEFAULT_N_PEERS_PER_REQUEST,
        }
    }
}

/// A peer tagged with its distance to the search key. Orders by distance,
/// breaking ties on identifier bytes so heap order is total and
/// deterministic across processes.
#[derive(Clone)]
struct DistancedPeer {
    distance: Distance,
    peer: Arc<Peer>,
}

impl DistancedPeer {
    fn new(target: &Id, peer: Arc<Peer>) -> Self {
        Self {
            distance: target.distance(&peer.id()),
            peer,
        }
    }
}

impl PartialEq for DistancedPeer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for DistancedPeer {}

impl PartialOrd for DistancedPeer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistancedPeer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.peer.id().as_bytes().cmp(other.peer.id().as_bytes()))
    }
}

/// Bounded min-heap of candidate peers, nearest to the target first. When
/// full, a new candidate displaces the farthest member only if it is nearer.
pub struct NearestPeers {
    target: Id,
    capacity: usize,
    heap: std::collections::BinaryHeap<std::cmp::Reverse<DistancedPeer>>,
}

impl NearestPeers {
    pub fn new(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            heap: std::collections::BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.heap.iter().any(|entry| entry.0.peer.id() == id)
    }

    /// Distance of the nearest candidate, or [`Distance::MAX`] when empty.
    pub fn min_distance(&self) -> Distance {
        self.heap
            .peek()
            .map(|entry| entry.0.distance)
            .unwrap_or(Distance::MAX)
    }

    /// Admit a candidate, evicting the farthest member if at capacity.
    pub fn push(&mut self, peer: Arc<Peer>) {
        let entry = DistancedPeer::new(&self.target, peer);
        if self.heap.len() < self.capacity {
            self.heap.push(std::cmp::Reverse(entry));
            return;
        }

        // At capacity: displace the farthest member if the newcomer is
        // nearer. A min-heap has no cheap max, so scan.
        let mut entries: Vec<DistancedPeer> =
            std::mem::take(&mut self.heap).into_iter().map(|e| e.0).collect();
        if let Some((farthest_idx, farthest)) = entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, e)| (i, e.clone()))
            && entry < farthest
        {
            entries[farthest_idx] = entry;
        }
        self.heap = entries.into_iter().map(std::cmp::Reverse).collect();
    }

    pub fn pop_nearest(&mut self) -> Option<Arc<Peer>> {
        self.heap.pop().map(|entry| entry.0.peer)
    }
}

/// Bounded max-heap of the K closest responders. The top is the farthest of
/// the close peers; once full, a peer at least that far away is not
/// admitted.
pub struct KClosest {
    target: Id,
    capacity: usize,
    heap: std::collections::BinaryHeap<DistancedPeer>,
}

impl KClosest {
    pub fn new(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            heap: std::collections::BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn contains(&self, id: Id) -> bool {
        self.heap.iter().any(|entry| entry.peer.id() == id)
    }

    /// Distance of the farthest member, or [`Distance::MAX`] when empty.
    pub fn farthest_distance(&self) -> Distance {
        self.heap
            .peek()
            .map(|entry| entry.distance)
            .unwrap_or(Distance::MAX)
    }

    /// Admit a responder if there is room or it is strictly nearer than the
    /// farthest member. Returns whether it was admitted, plus any member it
    /// displaced.
    pub fn try_push(&mut self, peer: Arc<Peer>) -> (bool, Option<Arc<Peer>>) {
        if self.contains(peer.id()) {
            return (false, None);
        }
        let entry = DistancedPeer::new(&self.target, peer);
        if !self.is_full() {
            self.heap.push(entry);
            return (true, None);
        }
        if entry.distance
            >= self
                .heap
                .peek()
                .expect("full heap has a farthest member")
                .distance
        {
            return (false, None);
        }
        let displaced = self.heap.pop().map(|e| e.peer);
        self.heap.push(entry);
        (true, displaced)
    }

    /// Members in ascending distance order.
    pub fn ascending(&self) -> Vec<Arc<Peer>> {
        let mut entries: Vec<DistancedPeer> = self.heap.iter().cloned().collect();
        entries.sort();
        entries.into_iter().map(|e| e.peer).collect()
    }
}

/// Insertion-ordered set of peers keyed by identifier.
#[derive(Default)]
pub(crate) struct OrderedPeers {
    order: Vec<Arc<Peer>>,
}

impl OrderedPeers {
    pub(crate) fn insert(&mut self, peer: Arc<Peer>) -> bool {
        if self.contains(peer.id()) {
            return false;
        }
        self.order.push(peer);
        true
    }

    pub(crate) fn remove(&mut self, id: Id) -> Option<Arc<Peer>> {
        let idx = self.order.iter().position(|p| p.id() == id)?;
        Some(self.order.remove(idx))
    }

    pub(crate) fn contains(&self, id: Id) -> bool {
        self.order.iter().any(|p| p.id() == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn peers(&self) -> Vec<Arc<Peer>> {
        self.order.clone()
    }
}

/// The mutable result of a search, guarded by the [`Search`] mutex.
pub struct SearchState {
    self_id: Id,
    key: Id,
    n_max_errors: usize,
    unqueried: NearestPeers,
    closest: KClosest,
    responded: OrderedPeers,
    errored: HashMap<Id, Arc<Peer>>,
    n_errors: usize,
    n_in_flight: usize,
    value: Option<Document>,
    fatal: Option<Arc<anyhow::Error>>,
}

impl SearchState {
    /// Fresh state for a search by `self_id` for `key`.
    pub fn new(self_id: Id, key: Id, params: &Parameters) -> Self {
        Self {
            self_id,
            key,
            n_max_errors: params.n_max_errors,
            unqueried: NearestPeers::new(
                key,
                params.n_closest_responses * UNQUERIED_CAPACITY_FACTOR,
            ),
            closest: KClosest::new(key, params.n_closest_responses),
            responded: OrderedPeers::default(),
            errored: HashMap::new(),
            n_errors: 0,
            n_in_flight: 0,
            value: None,
            fatal: None,
        }
    }

    /// The searcher's own identifier; responses naming it are ignored.
    pub fn self_id(&self) -> Id {
        self.self_id
    }

    pub fn key(&self) -> Id {
        self.key
    }

    /// Whether the peer already appears in any of the four collections.
    pub fn contains(&self, id: Id) -> bool {
        self.unqueried.contains(id)
            || self.responded.contains(id)
            || self.errored.contains_key(&id)
            || self.closest.contains(id)
    }

    /// Admit a newly-learned peer as a candidate.
    pub fn push_unqueried(&mut self, peer: Arc<Peer>) {
        self.unqueried.push(peer);
    }

    /// Record a retrieved document.
    pub fn set_value(&mut self, value: Document) {
        self.value = Some(value);
    }

    pub fn value(&self) -> Option<&Document> {
        self.value.as_ref()
    }

    pub fn n_unqueried(&self) -> usize {
        self.unqueried.len()
    }

    pub fn n_closest(&self) -> usize {
        self.closest.len()
    }

    fn found_value(&self) -> bool {
        self.value.is_some()
    }

    fn found_closest_peers(&self) -> bool {
        // A still-outstanding query may name a nearer responder; success
        // waits for it to settle.
        self.closest.is_full()
            && self.n_in_flight == 0
            && self.unqueried.min_distance() >= self.closest.farthest_distance()
    }

    fn exhausted(&self) -> bool {
        self.unqueried.is_empty() && self.n_in_flight == 0 && !self.found_closest_peers()
    }

    fn errored(&self) -> bool {
        self.n_errors >= self.n_max_errors || self.fatal.is_some()
    }

    fn finished(&self) -> bool {
        self.found_value() || self.found_closest_peers() || self.exhausted() || self.errored()
    }
}

/// What a worker should do next.
enum Selection {
    Query(Arc<Peer>),
    /// No candidate right now, but in-flight queries may produce one.
    Wait,
    Finished,
}

/// One search operation: the target key, parameters, and mutable state.
pub struct Search {
    identity: NodeIdentity,
    key: Id,
    params: Parameters,
    state: Mutex<SearchState>,
}

impl Search {
    pub fn new(identity: &NodeIdentity, key: Id, params: Parameters) -> Self {
        let state = SearchState::new(identity.id(), key, &params);
        Self {
            identity: identity.clone(),
            key,
            params,
            state: Mutex::new(state),
        }
    }

    pub fn key(&self) -> Id {
        self.key
    }

    pub fn self_id(&self) -> Id {
        self.state().self_id
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    fn state(&self) -> MutexGuard<'_, SearchState> {
        self.state.lock().expect("search state lock poisoned")
    }

    pub fn found_value(&self) -> bool {
        self.state().found_value()
    }

    pub fn found_closest_peers(&self) -> bool {
        self.state().found_closest_peers()
    }

    pub fn exhausted(&self) -> bool {
        self.state().exhausted()
    }

    pub fn errored(&self) -> bool {
        self.state().errored()
    }

    pub fn finished(&self) -> bool {
        self.state().finished()
    }

    /// The retrieved document, for value lookups that found one.
    pub fn value(&self) -> Option<Document> {
        self.state().value.clone()
    }

    /// The fatal response-processing error, if one terminated the search.
    pub fn fatal_error(&self) -> Option<Arc<anyhow::Error>> {
        self.state().fatal.clone()
    }

    pub fn n_errors(&self) -> usize {
        self.state().n_errors
    }

    pub fn n_unqueried(&self) -> usize {
        self.state().unqueried.len()
    }

    pub fn n_responded(&self) -> usize {
        self.state().responded.len()
    }

    pub fn n_errored_peers(&self) -> usize {
        self.state().errored.len()
    }

    pub fn n_closest(&self) -> usize {
        self.state().closest.len()
    }

    /// The closest responders, nearest first.
    pub fn closest_peers(&self) -> Vec<Arc<Peer>> {
        self.state().closest.ascending()
    }

    /// Distance of the farthest peer admitted to `closest`.
    pub fn farthest_close_distance(&self) -> Distance {
        self.state().closest.farthest_distance()
    }

    /// Responders outside `closest`, in the order they answered.
    pub fn responded_peers(&self) -> Vec<Arc<Peer>> {
        self.state().responded.peers()
    }

    fn seed(&self, seeds: &[Arc<Peer>]) {
        let mut state = self.state();
        for seed in seeds {
            state.unqueried.push(Arc::clone(seed));
        }
    }

    /// Pick the next peer to query, skipping candidates that already
    /// resolved. A peer that errored once is not retried.
    fn select(&self) -> Selection {
        let mut state = self.state();
        if state.finished() {
            return Selection::Finished;
        }
        while let Some(peer) = state.unqueried.pop_nearest() {
            let id = peer.id();
            if id == state.self_id
                || state.errored.contains_key(&id)
                || state.responded.contains(id)
                || state.closest.contains(id)
            {
                continue;
            }
            state.n_in_flight += 1;
            return Selection::Query(peer);
        }
        if state.n_in_flight > 0 {
            Selection::Wait
        } else {
            Selection::Finished
        }
    }

    /// Release a claimed candidate whose query was abandoned on
    /// cancellation; its result is never merged.
    fn abandon(&self, peer: &Arc<Peer>) {
        let mut state = self.state();
        state.n_in_flight -= 1;
        trace!(peer = peer.id().short_hex(), "find query abandoned");
    }

    /// Merge a failed query. Results arriving after termination are
    /// discarded.
    fn record_error(&self, peer: &Arc<Peer>, err: &anyhow::Error) {
        let mut state = self.state();
        state.n_in_flight -= 1;
        if state.finished()
            || state.errored.contains_key(&peer.id())
            || state.responded.contains(peer.id())
            || state.closest.contains(peer.id())
        {
            return;
        }
        peer.record_error();
        state.n_errors += 1;
        state.errored.insert(peer.id(), Arc::clone(peer));
        trace!(
            peer = peer.id().short_hex(),
            n_errors = state.n_errors,
            %err,
            "find query failed"
        );
    }

    /// Merge a successful query: process the response, then consider the
    /// responder for the closest set. A fatal processing error terminates
    /// the search without registering the responder.
    fn record_response(
        &self,
        peer: &Arc<Peer>,
        response: &FindResponse,
        rtt: Duration,
        processor: &dyn FindResponseProcessor,
    ) {
        let mut state = self.state();
        state.n_in_flight -= 1;
        if state.finished() {
            return;
        }
        // A concurrent duplicate query can resolve for a peer that already
        // settled; there is nothing further to merge.
        if state.closest.contains(peer.id()) || state.responded.contains(peer.id()) {
            return;
        }

        // Register the responder before processing so a response naming its
        // own sender cannot re-admit it as a candidate.
        state.responded.insert(Arc::clone(peer));
        if let Err(err) = processor.process(response, &mut state) {
            warn!(peer = peer.id().short_hex(), %err, "fatal response processing error");
            state.responded.remove(peer.id());
            state.fatal = Some(Arc::new(err));
            return;
        }
        peer.record_response(rtt);

        let (admitted, displaced) = state.closest.try_push(Arc::clone(peer));
        if admitted {
            state.responded.remove(peer.id());
        }
        if let Some(displaced) = displaced {
            state.responded.insert(displaced);
        }
    }
}

/// Integrates one Find response into search state.
pub trait FindResponseProcessor: Send + Sync {
    fn process(&self, response: &FindResponse, state: &mut SearchState) -> Result<()>;
}

/// Default processor: record a returned value, or admit each previously
/// unseen peer address as a candidate. Processing the same response twice is
/// a no-op after the first application.
pub struct ResponseProcessor {
    fromer: Arc<dyn Fromer>,
}

impl ResponseProcessor {
    pub fn new(fromer: Arc<dyn Fromer>) -> Self {
        Self { fromer }
    }
}

impl FindResponseProcessor for ResponseProcessor {
    fn process(&self, response: &FindResponse, state: &mut SearchState) -> Result<()> {
        if let Some(value) = &response.value {
            state.set_value(value.clone());
            return Ok(());
        }
        if response.peers.is_empty() {
            return Err(anyhow!(EmptyResponse));
        }
        for address in &response.peers {
            if address.peer_id == state.self_id() || state.contains(address.peer_id) {
                continue;
            }
            state.push_unqueried(self.fromer.from_address(address));
        }
        Ok(())
    }
}

/// The concurrent search engine. Polymorphic over the signer, the client
/// factory, and the response processor so deterministic doubles can be
/// injected.
pub struct Searcher {
    signer: Arc<dyn RequestSigner>,
    finder_creator: Arc<dyn FinderCreator>,
    processor: Arc<dyn FindResponseProcessor>,
}

impl Searcher {
    pub fn new(
        signer: Arc<dyn RequestSigner>,
        finder_creator: Arc<dyn FinderCreator>,
        processor: Arc<dyn FindResponseProcessor>,
    ) -> Self {
        Self {
            signer,
            finder_creator,
            processor,
        }
    }

    /// A searcher wired to peers' own connectors and the default response
    /// processor.
    pub fn with_defaults(signer: Arc<dyn RequestSigner>, fromer: Arc<dyn Fromer>) -> Self {
        Self::new(
            signer,
            Arc::new(crate::protocols::ConnectorFinderCreator),
            Arc::new(ResponseProcessor::new(fromer)),
        )
    }

    /// Run the search to termination.
    ///
    /// Returns [`TooManyFindErrors`] when the error budget was spent, the
    /// fatal processing error when one occurred, and `Ok(())` otherwise —
    /// including plain exhaustion; callers inspect the [`Search`] to
    /// distinguish outcomes.
    pub async fn search(&self, search: &Arc<Search>, seeds: &[Arc<Peer>]) -> Result<()> {
        search.seed(seeds);
        debug!(
            key = search.key().short_hex(),
            n_seeds = seeds.len(),
            concurrency = search.params().concurrency,
            "starting search"
        );

        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        for _ in 0..search.params().concurrency.max(1) {
            let search = Arc::clone(search);
            let signer = Arc::clone(&self.signer);
            let creator = Arc::clone(&self.finder_creator);
            let processor = Arc::clone(&self.processor);
            let cancel = cancel.clone();
            workers.spawn(async move {
                search_work(&search, signer, creator, processor, cancel).await;
            });
        }
        while workers.join_next().await.is_some() {}

        debug!(
            key = search.key().short_hex(),
            n_closest = search.n_closest(),
            n_responded = search.n_responded(),
            n_errors = search.n_errors(),
            found_value = search.found_value(),
            "search finished"
        );

        if let Some(fatal) = search.fatal_error() {
            return Err(anyhow!(fatal));
        }
        if search.errored() {
            return Err(anyhow!(TooManyFindErrors));
        }
        Ok(())
    }
}

/// Worker loop: select, query, merge, until the search is finished. The
/// first worker to observe a fired termination predicate cancels the shared
/// token; workers race their in-flight query against it and abandon the
/// query, unmerged, when it fires.
async fn search_work(
    search: &Arc<Search>,
    signer: Arc<dyn RequestSigner>,
    creator: Arc<dyn FinderCreator>,
    processor: Arc<dyn FindResponseProcessor>,
    cancel: CancellationToken,
) {
    loop {
        let peer = match search.select() {
            Selection::Finished => {
                cancel.cancel();
                break;
            }
            Selection::Wait => {
                tokio::select! {
                    _ = tokio::time::sleep(WORKER_POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }
            Selection::Query(peer) => peer,
        };

        let started = Instant::now();
        tokio::select! {
            result = query(search, &peer, signer.as_ref(), creator.as_ref()) => {
                match result {
                    Ok(response) => {
                        search.record_response(
                            &peer,
                            &response,
                            started.elapsed(),
                            processor.as_ref(),
                        );
                    }
                    Err(err) => search.record_error(&peer, &err),
                }
                if search.finished() {
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {
                search.abandon(&peer);
                break;
            }
        }
    }
}

/// One signed, timeout-bounded Find query.
async fn query(
    search: &Search,
    peer: &Arc<Peer>,
    signer: &dyn RequestSigner,
    creator: &dyn FinderCreator,
) -> Result<FindResponse> {
    let request = FindRequest::new(
        &search.identity,
        search.key(),
        search.params().n_peers_per_request,
    );
    let request_id = request.metadata.request_id;

    let token = signer.sign_request(&Request::Find(request.clone()))?;
    let finder = creator.create(peer.connector())?;

    let response = timeout(search.params().query_timeout, finder.find(request, token))
        .await
        .map_err(|_| anyhow!("find query to {} timed out", peer.id()))??;

    if response.metadata.request_id != request_id {
        return Err(anyhow!(RequestIdMismatch));
    }
    Ok(response)
}
