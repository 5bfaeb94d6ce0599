//! # Bootstrap Introductions
//!
//! When a librarian joins the network it knows only a handful of seed peers.
//! The introducer walks outward from those seeds, sending each peer a signed
//! Introduce request that announces the joiner's own address and asks for
//! more peers, until it has heard back from a target number of distinct
//! responders.
//!
//! The concurrency skeleton is the same worker pool the search engine uses;
//! what differs is the goal and therefore the bookkeeping:
//!
//! - candidates live in an unordered map and are picked arbitrarily — the
//!   aim is breadth of acquaintance, not closeness to any key
//! - peers named in a response are admitted as candidates unconditionally
//!   (no distance admission rule)
//! - the operation succeeds once `target_num_introductions` distinct peers
//!   have responded
//!
//! Termination cancels a shared token, so queries still in flight when the
//! target is reached are abandoned unmerged rather than drained.
//!
//! Budget exhaustion does not surface as an engine error: the caller reads
//! the outcome from the [`Introduction`] predicates. Only a fatal
//! response-processing failure is returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::RequestSigner;
use crate::id::Id;
use crate::identity::NodeIdentity;
use crate::messages::{IntroduceRequest, IntroduceResponse, PeerAddress, Request};
use crate::peer::{Fromer, Peer};
use crate::protocols::IntroducerCreator;
use crate::search::{OrderedPeers, RequestIdMismatch};

pub const DEFAULT_TARGET_NUM_INTRODUCTIONS: usize = 64;
pub const DEFAULT_NUM_PEERS_PER_REQUEST: u32 = 16;
pub const DEFAULT_N_MAX_ERRORS: usize = 3;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an idle worker waits for in-flight queries to surface new
/// candidates before re-checking.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tunable parameters of one introduction operation.
#[derive(Clone, Copy, Debug)]
pub struct Parameters {
    /// Distinct responders to accumulate before the operation succeeds.
    pub target_num_introductions: usize,
    /// How many peers each Introduce request asks the responder for.
    pub num_peers_per_request: u32,
    /// Query error budget.
    pub n_max_errors: usize,
    /// Maximum number of in-flight queries.
    pub concurrency: usize,
    /// Wall-clock budget per query.
    pub query_timeout: Duration,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            target_num_introductions: DEFAULT_TARGET_NUM_INTRODUCTIONS,
            num_peers_per_request: DEFAULT_NUM_PEERS_PER_REQUEST,
            n_max_errors: DEFAULT_N_MAX_ERRORS,
            concurrency: DEFAULT_CONCURRENCY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// The mutable result of an introduction, guarded by the [`Introduction`]
/// mutex.
pub struct IntroductionState {
    self_id: Id,
    target: usize,
    n_max_errors: usize,
    unqueried: HashMap<Id, Arc<Peer>>,
    responded: OrderedPeers,
    errored: HashMap<Id, Arc<Peer>>,
    n_errors: usize,
    n_in_flight: usize,
    fatal: Option<Arc<anyhow::Error>>,
}

impl IntroductionState {
    /// Fresh state for an introduction by `self_id`.
    pub fn new(self_id: Id, params: &Parameters) -> Self {
        Self {
            self_id,
            target: params.target_num_introductions,
            n_max_errors: params.n_max_errors,
            unqueried: HashMap::new(),
            responded: OrderedPeers::default(),
            errored: HashMap::new(),
            n_errors: 0,
            n_in_flight: 0,
            fatal: None,
        }
    }

    /// The joiner's own identifier; responses naming it are ignored.
    pub fn self_id(&self) -> Id {
        self.self_id
    }

    /// Whether the peer already appears in any collection.
    pub fn contains(&self, id: Id) -> bool {
        self.unqueried.contains_key(&id)
            || self.responded.contains(id)
            || self.errored.contains_key(&id)
    }

    /// Admit a newly-learned peer as a candidate.
    pub fn push_unqueried(&mut self, peer: Arc<Peer>) {
        self.unqueried.insert(peer.id(), peer);
    }

    /// Register a peer that answered with a valid introduction.
    pub fn add_responded(&mut self, peer: Arc<Peer>) {
        self.responded.insert(peer);
    }

    pub fn n_unqueried(&self) -> usize {
        self.unqueried.len()
    }

    pub fn n_responded(&self) -> usize {
        self.responded.len()
    }

    fn reached_target(&self) -> bool {
        self.responded.len() >= self.target
    }

    fn exhausted(&self) -> bool {
        self.unqueried.is_empty() && self.n_in_flight == 0 && !self.reached_target()
    }

    fn errored(&self) -> bool {
        self.n_errors >= self.n_max_errors || self.fatal.is_some()
    }

    fn finished(&self) -> bool {
        self.reached_target() || self.exhausted() || self.errored()
    }
}

enum Selection {
    Query(Arc<Peer>),
    Wait,
    Finished,
}

/// One introduction operation: the joiner's identity and address,
/// parameters, and mutable state.
pub struct Introduction {
    identity: NodeIdentity,
    self_address: PeerAddress,
    params: Parameters,
    state: Mutex<IntroductionState>,
}

impl Introduction {
    pub fn new(identity: &NodeIdentity, self_address: PeerAddress, params: Parameters) -> Self {
        let state = IntroductionState::new(identity.id(), &params);
        Self {
            identity: identity.clone(),
            self_address,
            params,
            state: Mutex::new(state),
        }
    }

    pub fn self_id(&self) -> Id {
        self.state().self_id
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    fn state(&self) -> MutexGuard<'_, IntroductionState> {
        self.state.lock().expect("introduction state lock poisoned")
    }

    pub fn reached_target(&self) -> bool {
        self.state().reached_target()
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

    /// The fatal response-processing error, if one terminated the
    /// operation.
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

    /// Responders in the order they answered.
    pub fn responded_peers(&self) -> Vec<Arc<Peer>> {
        self.state().responded.peers()
    }

    fn seed(&self, seeds: &[Arc<Peer>]) {
        let mut state = self.state();
        for seed in seeds {
            state.unqueried.insert(seed.id(), Arc::clone(seed));
        }
    }

    /// Pick an arbitrary candidate to query. A peer that errored once is
    /// not retried.
    fn select(&self) -> Selection {
        let mut state = self.state();
        if state.finished() {
            return Selection::Finished;
        }
        while let Some(id) = state.unqueried.keys().next().copied() {
            let peer = state
                .unqueried
                .remove(&id)
                .expect("key was just observed under the lock");
            if id == state.self_id
                || state.errored.contains_key(&id)
                || state.responded.contains(id)
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
        trace!(peer = peer.id().short_hex(), "introduce query abandoned");
    }

    /// Merge a failed query. Results arriving after termination are
    /// discarded.
    fn record_error(&self, peer: &Arc<Peer>, err: &anyhow::Error) {
        let mut state = self.state();
        state.n_in_flight -= 1;
        if state.finished()
            || state.errored.contains_key(&peer.id())
            || state.responded.contains(peer.id())
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
            "introduce query failed"
        );
    }

    /// Merge a successful query by handing the response to the processor,
    /// which registers the responder and its peer list.
    fn record_response(
        &self,
        peer: &Arc<Peer>,
        response: &IntroduceResponse,
        rtt: Duration,
        processor: &dyn IntroduceResponseProcessor,
    ) {
        let mut state = self.state();
        state.n_in_flight -= 1;
        if state.finished() || state.responded.contains(peer.id()) {
            return;
        }
        if let Err(err) = processor.process(response, &mut state) {
            warn!(peer = peer.id().short_hex(), %err, "fatal response processing error");
            state.fatal = Some(Arc::new(err));
            return;
        }
        peer.record_response(rtt);
    }
}

/// Integrates one Introduce response into introduction state.
pub trait IntroduceResponseProcessor: Send + Sync {
    fn process(&self, response: &IntroduceResponse, state: &mut IntroductionState) -> Result<()>;
}

/// Default processor: register the responder, then admit every previously
/// unseen peer in its list as a candidate. Breadth over closeness — there is
/// no admission ordering. Reprocessing a response is a no-op.
pub struct ResponseProcessor {
    fromer: Arc<dyn Fromer>,
}

impl ResponseProcessor {
    pub fn new(fromer: Arc<dyn Fromer>) -> Self {
        Self { fromer }
    }
}

impl IntroduceResponseProcessor for ResponseProcessor {
    fn process(&self, response: &IntroduceResponse, state: &mut IntroductionState) -> Result<()> {
        let responder = self.fromer.from_address(&response.self_address);
        state.add_responded(responder);

        for address in &response.peers {
            if address.peer_id == state.self_id() || state.contains(address.peer_id) {
                continue;
            }
            state.push_unqueried(self.fromer.from_address(address));
        }
        Ok(())
    }
}

/// The concurrent introduction engine, polymorphic over the signer, the
/// client factory, and the response processor.
pub struct Introducer {
    signer: Arc<dyn RequestSigner>,
    introducer_creator: Arc<dyn IntroducerCreator>,
    processor: Arc<dyn IntroduceResponseProcessor>,
}

impl Introducer {
    pub fn new(
        signer: Arc<dyn RequestSigner>,
        introducer_creator: Arc<dyn IntroducerCreator>,
        processor: Arc<dyn IntroduceResponseProcessor>,
    ) -> Self {
        Self {
            signer,
            introducer_creator,
            processor,
        }
    }

    /// An introducer wired to peers' own connectors and the default
    /// response processor.
    pub fn with_defaults(signer: Arc<dyn RequestSigner>, fromer: Arc<dyn Fromer>) -> Self {
        Self::new(
            signer,
            Arc::new(crate::protocols::ConnectorIntroducerCreator),
            Arc::new(ResponseProcessor::new(fromer)),
        )
    }

    /// Run the introduction to termination.
    ///
    /// Returns the fatal response-processing error when one occurred and
    /// `Ok(())` otherwise; callers read budget exhaustion and target
    /// attainment from the [`Introduction`] predicates.
    pub async fn introduce(&self, intro: &Arc<Introduction>, seeds: &[Arc<Peer>]) -> Result<()> {
        intro.seed(seeds);
        debug!(
            self_id = intro.self_id().short_hex(),
            n_seeds = seeds.len(),
            target = intro.params().target_num_introductions,
            "starting introduction"
        );

        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        for _ in 0..intro.params().concurrency.max(1) {
            let intro = Arc::clone(intro);
            let signer = Arc::clone(&self.signer);
            let creator = Arc::clone(&self.introducer_creator);
            let processor = Arc::clone(&self.processor);
            let cancel = cancel.clone();
            workers.spawn(async move {
                introduce_work(&intro, signer, creator, processor, cancel).await;
            });
        }
        while workers.join_next().await.is_some() {}

        debug!(
            self_id = intro.self_id().short_hex(),
            n_responded = intro.n_responded(),
            n_errors = intro.n_errors(),
            reached_target = intro.reached_target(),
            "introduction finished"
        );

        match intro.fatal_error() {
            Some(fatal) => Err(anyhow!(fatal)),
            None => Ok(()),
        }
    }
}

/// Worker loop: select, query, merge, until the introduction is finished.
/// The first worker to observe a fired termination predicate cancels the
/// shared token; workers race their in-flight query against it and abandon
/// the query, unmerged, when it fires.
async fn introduce_work(
    intro: &Arc<Introduction>,
    signer: Arc<dyn RequestSigner>,
    creator: Arc<dyn IntroducerCreator>,
    processor: Arc<dyn IntroduceResponseProcessor>,
    cancel: CancellationToken,
) {
    loop {
        let peer = match intro.select() {
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
            result = query(intro, &peer, signer.as_ref(), creator.as_ref()) => {
                match result {
                    Ok(response) => {
                        intro.record_response(
                            &peer,
                            &response,
                            started.elapsed(),
                            processor.as_ref(),
                        );
                    }
                    Err(err) => intro.record_error(&peer, &err),
                }
                if intro.finished() {
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {
                intro.abandon(&peer);
                break;
            }
        }
    }
}

/// One signed, timeout-bounded Introduce query.
async fn query(
    intro: &Introduction,
    peer: &Arc<Peer>,
    signer: &dyn RequestSigner,
    creator: &dyn IntroducerCreator,
) -> Result<IntroduceResponse> {
    let request = IntroduceRequest::new(
        &intro.identity,
        intro.self_address.clone(),
        intro.params().num_peers_per_request,
    );
    let request_id = request.metadata.request_id;

    let token = signer.sign_request(&Request::Introduce(request.clone()))?;
    let introducer = creator.create(peer.connector())?;

    let response = timeout(
        intro.params().query_timeout,
        introducer.introduce(request, token),
    )
    .await
    .map_err(|_| anyhow!("introduce query to {} timed out", peer.id()))??;

    if response.metadata.request_id != request_id {
        return Err(anyhow!(RequestIdMismatch));
    }
    Ok(response)
}
