//! The transitive engine: the outer state machine of a consensus
//! instance.
//!
//! It owns every table the protocol needs (the topological consensus
//! core, in-flight polls, outstanding fetches, dependency-parked jobs,
//! and the pin that keeps processing vertices in memory) and exposes
//! the message-level operations the network delivers. During
//! bootstrap it instead routes fetched ancestries into the persistent
//! job queue, then hands off to steady-state consensus.

pub mod bootstrap;
pub mod polls;
mod voter;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::{ConfigError, Parameters};
use crate::consensus::{ConsensusError, Decided, Topological};
use crate::constants;
use crate::events::Blocker;
use crate::sender::{NodeId, Sender, Validators};
use crate::storage::Database;
use crate::transaction::{Status, TxId};
use crate::vertex::{StoreError, Vertex, VertexId, VertexStore};
use crate::vm::Vm;

use bootstrap::{BootstrapJob, JobQueue, QueueError};
use polls::PollSet;
use voter::VoterJob;

/// Fatal engine errors. Once one is accumulated the engine declines
/// all further state changes and the host is expected to stop the
/// chain.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("request id space exhausted")]
    RequestIdsExhausted,
}

/// Collapses the first fatal error and short-circuits later work.
#[derive(Default)]
struct ErrorSink {
    err: Option<EngineError>,
}

impl ErrorSink {
    fn set(&mut self, err: EngineError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    fn errored(&self) -> bool {
        self.err.is_some()
    }
}

/// Work parked on vertex IDs.
pub(crate) enum VtxJob {
    /// One front of a two-front vertex issuance.
    Issuer(u64),
    /// A peer's chits waiting for the voted vertices to be issued.
    Voter(VoterJob),
    /// A query answer owed once the queried vertex is issued.
    Convince { peer: NodeId, request_id: u32 },
}

/// A vertex waiting on its parents (vertex front) and its
/// transactions' dependencies (tx front) before entering consensus.
struct IssuerState {
    vtx: Arc<Vertex>,
    fronts: u8,
    abandoned: bool,
}

/// Fetch-and-queue state used only while bootstrapping.
struct BootstrapState {
    queue: JobQueue,
    outstanding: HashMap<(NodeId, u32), VertexId>,
    fetching: HashSet<VertexId>,
    started: bool,
}

/// The transitive consensus engine for one chain.
pub struct Transitive {
    vm: Arc<dyn Vm>,
    sender: Arc<dyn Sender>,
    validators: Arc<dyn Validators>,
    store: Arc<VertexStore>,
    consensus: Topological,
    polls: PollSet,

    /// Jobs parked on vertex issuance.
    vtx_blocked: Blocker<VertexId, VtxJob>,
    /// Issuer tx-fronts parked on transaction issuance.
    tx_blocked: Blocker<TxId, u64>,
    issuers: HashMap<u64, IssuerState>,
    next_issuer: u64,

    /// Outstanding vertex fetches by (peer, request id).
    outstanding_gets: HashMap<(NodeId, u32), VertexId>,
    /// Vertices with a fetch in flight.
    fetching: HashSet<VertexId>,
    /// Vertices with a registered issuer.
    pending_issue: HashSet<VertexId>,

    /// Strictly monotonic request-id allocator; wrapping is fatal.
    request_id: u32,

    /// Every processing vertex stays pinned here until terminal, so
    /// the VM may drop its own references.
    processing: HashMap<VertexId, Arc<Vertex>>,

    errs: ErrorSink,
    bootstrap: Option<BootstrapState>,
}

impl Transitive {
    /// Create an engine in the bootstrapping state.
    pub fn new(
        params: Parameters,
        db: Arc<dyn Database>,
        store: Arc<VertexStore>,
        vm: Arc<dyn Vm>,
        sender: Arc<dyn Sender>,
        validators: Arc<dyn Validators>,
    ) -> Result<Self, EngineError> {
        params.validate()?;
        vm.bootstrapping();
        let queue = JobQueue::open(db, store.clone(), vm.clone())?;
        let consensus = Self::consensus_from_frontier(&params, &store)?;
        Ok(Transitive {
            vm,
            sender,
            validators,
            store,
            consensus,
            polls: PollSet::new(constants::MAX_OUTSTANDING_POLLS),
            vtx_blocked: Blocker::new(),
            tx_blocked: Blocker::new(),
            issuers: HashMap::new(),
            next_issuer: 0,
            outstanding_gets: HashMap::new(),
            fetching: HashSet::new(),
            pending_issue: HashSet::new(),
            request_id: 0,
            processing: HashMap::new(),
            errs: ErrorSink::default(),
            bootstrap: Some(BootstrapState {
                queue,
                outstanding: HashMap::new(),
                fetching: HashSet::new(),
                started: false,
            }),
        })
    }

    fn consensus_from_frontier(
        params: &Parameters,
        store: &Arc<VertexStore>,
    ) -> Result<Topological, EngineError> {
        let mut frontier = Vec::new();
        for id in store.frontier() {
            match store.vertex(id) {
                Some(vtx) => frontier.push(vtx),
                None => {
                    tracing::warn!(vertex = %id, "accepted-frontier vertex missing from store")
                }
            }
        }
        let (consensus, _) = Topological::new(params.clone(), store.clone(), frontier)?;
        Ok(consensus)
    }

    /// Whether the engine is still bootstrapping. While true, all
    /// consensus messages are silently dropped.
    pub fn bootstrapping(&self) -> bool {
        self.bootstrap.is_some()
    }

    /// The accumulated fatal error, if any.
    pub fn error(&self) -> Option<&EngineError> {
        self.errs.err.as_ref()
    }

    /// Current strongly preferred frontier (chit contents), sorted.
    pub fn preferences(&self) -> Vec<VertexId> {
        let mut preferred: Vec<VertexId> = self.consensus.preferences().iter().copied().collect();
        preferred.sort();
        preferred
    }

    pub fn num_processing_vertices(&self) -> usize {
        self.processing.len()
    }

    pub fn num_outstanding_polls(&self) -> usize {
        self.polls.len()
    }

    pub(crate) fn fatal(&mut self, err: EngineError) -> EngineError {
        tracing::error!(error = %err, "fatal engine error; declining further state changes");
        self.errs.set(err.clone());
        err
    }

    // ── Steady-state operations ─────────────────────────────────────

    /// A peer queried us with the vertex attached.
    pub fn push_query(
        &mut self,
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        if self.bootstrapping() {
            tracing::debug!(peer = %peer, "dropping push query during bootstrap");
            return Ok(());
        }
        match self.store.parse_vertex(bytes) {
            Ok(vtx) if vtx.id() == vertex_id => {
                self.issue_vertex(vtx)?;
            }
            Ok(vtx) => {
                tracing::debug!(
                    peer = %peer,
                    claimed = %vertex_id,
                    actual = %vtx.id(),
                    "dropping push query whose bytes hash to a different vertex"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "dropping unparseable push query");
                return Ok(());
            }
        }
        self.send_chits_when_issued(peer, request_id, vertex_id)
    }

    /// A peer queried us by vertex ID.
    pub fn pull_query(
        &mut self,
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
    ) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        if self.bootstrapping() {
            tracing::debug!(peer = %peer, "dropping pull query during bootstrap");
            return Ok(());
        }
        let mut unreachable = false;
        if !self.consensus.vertex_issued(vertex_id) {
            match self.get_vertex_any(vertex_id) {
                Some(vtx) => {
                    self.issue_vertex(vtx)?;
                }
                None => unreachable = !self.fetch(vertex_id)?,
            }
        }
        self.send_chits_when_issued(peer, request_id, vertex_id)?;
        if unreachable {
            self.abandon_issue(vertex_id)?;
        }
        Ok(())
    }

    /// A peer answered one of our queries.
    pub fn chits(
        &mut self,
        peer: NodeId,
        request_id: u32,
        votes: Vec<VertexId>,
    ) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        if self.bootstrapping() {
            tracing::debug!(peer = %peer, "dropping chits during bootstrap");
            return Ok(());
        }
        let mut deps = Vec::new();
        let mut dead_deps = Vec::new();
        for vote in &votes {
            if self.consensus.vertex_issued(*vote) {
                continue;
            }
            let issued_now = match self.get_vertex_any(*vote) {
                Some(vtx) => self.issue_vertex(vtx)?,
                None => {
                    if !self.fetch(*vote)? {
                        dead_deps.push(*vote);
                    }
                    false
                }
            };
            if !issued_now {
                deps.push(*vote);
            }
        }
        let job = VtxJob::Voter(VoterJob {
            peer,
            request_id,
            response: votes,
        });
        if let Some((job, abandoned)) = self.vtx_blocked.register(deps, job) {
            self.run_vtx_job(job, abandoned)?;
        }
        for vote in dead_deps {
            self.abandon_issue(vote)?;
        }
        Ok(())
    }

    /// A peer failed to answer a query before its deadline.
    pub fn query_failed(&mut self, peer: NodeId, request_id: u32) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        if self.bootstrapping() {
            return Ok(());
        }
        self.run_voter(VoterJob {
            peer,
            request_id,
            response: Vec::new(),
        })
    }

    /// A peer delivered vertex bytes we asked for.
    pub fn put(
        &mut self,
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        if self.bootstrapping() {
            tracing::debug!(peer = %peer, "dropping put during bootstrap");
            return Ok(());
        }
        let expected = match self.outstanding_gets.remove(&(peer, request_id)) {
            Some(expected) => expected,
            None => {
                tracing::debug!(peer = %peer, request_id, "dropping unsolicited put");
                return Ok(());
            }
        };
        self.fetching.remove(&expected);

        // The claimed vertex_id is advisory; the content hash decides.
        let _ = vertex_id;
        match self.store.parse_vertex(bytes) {
            Ok(vtx) if vtx.id() == expected => {
                self.issue_vertex(vtx)?;
            }
            Ok(vtx) => {
                tracing::debug!(
                    peer = %peer,
                    expected = %expected,
                    actual = %vtx.id(),
                    "peer answered a fetch with the wrong vertex"
                );
                self.abandon_issue(expected)?;
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "peer delivered unparseable vertex");
                self.abandon_issue(expected)?;
            }
        }
        Ok(())
    }

    /// A fetch timed out or the peer declined.
    pub fn get_failed(&mut self, peer: NodeId, request_id: u32) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        if self.bootstrapping() {
            let removed = {
                let state = self.bootstrap.as_mut().unwrap();
                let removed = state.outstanding.remove(&(peer, request_id));
                if let Some(vertex_id) = removed {
                    state.fetching.remove(&vertex_id);
                }
                removed
            };
            if let Some(vertex_id) = removed {
                // Try another peer; the accepted set is required.
                self.bootstrap_fetch(vertex_id)?;
                self.try_finish_bootstrap()?;
            }
            return Ok(());
        }
        let vertex_id = match self.outstanding_gets.remove(&(peer, request_id)) {
            Some(vertex_id) => vertex_id,
            None => return Ok(()),
        };
        self.fetching.remove(&vertex_id);
        if !self.consensus.vertex_issued(vertex_id) {
            tracing::debug!(vertex = %vertex_id, "fetch failed; abandoning dependents");
            self.abandon_issue(vertex_id)?;
        }
        Ok(())
    }

    /// A peer asked for a vertex's bytes.
    pub fn get(&mut self, peer: NodeId, request_id: u32, vertex_id: VertexId) {
        match self.get_vertex_any(vertex_id) {
            Some(vtx) => self.sender.put(peer, request_id, vertex_id, vtx.bytes()),
            None => {
                // No negative answer on the wire; the peer's timeout
                // covers us.
                tracing::debug!(peer = %peer, vertex = %vertex_id, "ignoring get for unknown vertex");
            }
        }
    }

    /// A peer asked for a vertex and its ancestry.
    pub fn get_ancestors(&mut self, peer: NodeId, request_id: u32, vertex_id: VertexId) {
        let root = match self.get_vertex_any(vertex_id) {
            Some(root) => root,
            None => {
                tracing::debug!(peer = %peer, vertex = %vertex_id, "ignoring ancestors request for unknown vertex");
                return;
            }
        };
        let mut batch: Vec<Vec<u8>> = Vec::new();
        let mut total = 0usize;
        let mut visited: HashSet<VertexId> = HashSet::new();
        let mut queue: VecDeque<Arc<Vertex>> = VecDeque::new();
        visited.insert(root.id());
        queue.push_back(root);

        while let Some(vtx) = queue.pop_front() {
            if batch.len() >= constants::MAX_ANCESTORS_PER_REQUEST
                || total + vtx.bytes().len() > constants::MAX_ANCESTORS_RESPONSE_BYTES
            {
                break;
            }
            total += vtx.bytes().len();
            batch.push(vtx.bytes().to_vec());
            for parent_id in vtx.parent_ids() {
                if visited.insert(*parent_id) {
                    if let Some(parent) = self.get_vertex_any(*parent_id) {
                        queue.push_back(parent);
                    }
                }
            }
        }
        self.sender.multi_put(peer, request_id, &batch);
    }

    /// Broadcast one random accepted-frontier vertex.
    pub fn gossip(&mut self) {
        use rand::Rng;

        if self.errs.errored() || self.bootstrapping() {
            return;
        }
        let frontier = self.store.frontier();
        if frontier.is_empty() {
            return;
        }
        let pick = frontier[rand::thread_rng().gen_range(0..frontier.len())];
        match self.store.vertex(pick) {
            Some(vtx) => {
                tracing::debug!(vertex = %pick, "gossiping accepted frontier vertex");
                self.sender.gossip(pick, vtx.bytes());
            }
            None => tracing::warn!(vertex = %pick, "accepted frontier vertex missing from store"),
        }
    }

    // ── Bootstrap operations ────────────────────────────────────────

    /// A peer asked for our accepted frontier. Served in every phase.
    pub fn get_accepted_frontier(&mut self, peer: NodeId, request_id: u32) {
        let frontier = self.store.frontier();
        self.sender.accepted_frontier(peer, request_id, &frontier);
    }

    /// A peer asked which of `vertex_ids` we have accepted. Served in
    /// every phase.
    pub fn get_accepted(&mut self, peer: NodeId, request_id: u32, vertex_ids: Vec<VertexId>) {
        let accepted: Vec<VertexId> = vertex_ids
            .into_iter()
            .filter(|id| self.store.status(*id) == Status::Accepted)
            .collect();
        self.sender.accepted(peer, request_id, &accepted);
    }

    /// The host decided which vertices the network has accepted;
    /// fetch whatever is missing and replay it through the job queue.
    pub fn force_accepted(&mut self, accepted: Vec<VertexId>) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        match self.bootstrap.as_mut() {
            Some(state) => state.started = true,
            None => {
                tracing::debug!("force_accepted after bootstrap finished");
                return Ok(());
            }
        }
        for vertex_id in accepted {
            if self.store.status(vertex_id) == Status::Accepted {
                continue;
            }
            match self.get_vertex_any(vertex_id) {
                Some(vtx) => {
                    for parent_id in self.enqueue_bootstrap_vertex(vtx)? {
                        self.bootstrap_fetch(parent_id)?;
                    }
                }
                None => self.bootstrap_fetch(vertex_id)?,
            }
        }
        self.try_finish_bootstrap()
    }

    /// A peer answered a `get_ancestors` with a batch of vertices.
    pub fn multi_put(
        &mut self,
        peer: NodeId,
        request_id: u32,
        vertices: Vec<Vec<u8>>,
    ) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        if !self.bootstrapping() {
            tracing::debug!(peer = %peer, "dropping multi_put outside bootstrap");
            return Ok(());
        }
        let expected = {
            let state = self.bootstrap.as_mut().unwrap();
            match state.outstanding.remove(&(peer, request_id)) {
                Some(expected) => {
                    state.fetching.remove(&expected);
                    expected
                }
                None => {
                    tracing::debug!(peer = %peer, request_id, "dropping unsolicited multi_put");
                    return Ok(());
                }
            }
        };

        let mut delivered_expected = false;
        let mut missing = Vec::new();
        for bytes in vertices.iter().take(constants::MAX_ANCESTORS_PER_REQUEST) {
            match self.store.parse_vertex(bytes) {
                Ok(vtx) => {
                    delivered_expected |= vtx.id() == expected;
                    missing.extend(self.enqueue_bootstrap_vertex(vtx)?);
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "dropping unparseable bootstrap vertex");
                }
            }
        }
        // Chase only ancestry the batch itself did not carry.
        for parent_id in missing {
            if self.get_vertex_any(parent_id).is_none() {
                self.bootstrap_fetch(parent_id)?;
            }
        }
        if !delivered_expected {
            tracing::debug!(peer = %peer, vertex = %expected, "peer did not deliver the requested vertex; refetching");
            self.bootstrap_fetch(expected)?;
        }
        self.try_finish_bootstrap()
    }

    fn bootstrap_fetch(&mut self, vertex_id: VertexId) -> Result<(), EngineError> {
        match self.bootstrap.as_ref() {
            Some(state) if state.fetching.contains(&vertex_id) => return Ok(()),
            Some(_) => {}
            None => return Ok(()),
        }
        let peers = self.validators.sample(1);
        let peer = match peers.first() {
            Some(peer) => *peer,
            None => {
                tracing::warn!(vertex = %vertex_id, "no peer available to bootstrap from");
                return Ok(());
            }
        };
        let request_id = self.next_request_id()?;
        if let Some(state) = self.bootstrap.as_mut() {
            state.fetching.insert(vertex_id);
            state.outstanding.insert((peer, request_id), vertex_id);
        }
        self.sender.get_ancestors(peer, request_id, vertex_id);
        Ok(())
    }

    /// Queue jobs for a fetched vertex; returns the parents it still
    /// needs, for the caller to chase.
    fn enqueue_bootstrap_vertex(
        &mut self,
        vtx: Arc<Vertex>,
    ) -> Result<Vec<VertexId>, EngineError> {
        {
            let state = match self.bootstrap.as_mut() {
                Some(state) => state,
                None => return Ok(Vec::new()),
            };
            for tx in vtx.txs() {
                state
                    .queue
                    .push(BootstrapJob::Tx(tx.clone()))
                    .map_err(EngineError::from)?;
            }
            state
                .queue
                .push(BootstrapJob::Vertex(vtx.clone()))
                .map_err(EngineError::from)?;
        }
        let mut missing_parents = Vec::new();
        for parent_id in vtx.parent_ids() {
            if self.store.status(*parent_id) != Status::Accepted
                && self.get_vertex_any(*parent_id).is_none()
            {
                missing_parents.push(*parent_id);
            }
        }
        Ok(missing_parents)
    }

    /// When nothing is left to fetch, drain the queue and enter the
    /// steady state.
    fn try_finish_bootstrap(&mut self) -> Result<(), EngineError> {
        let ready = match self.bootstrap.as_ref() {
            Some(state) => state.started && state.outstanding.is_empty(),
            None => false,
        };
        if !ready {
            return Ok(());
        }
        let mut state = self.bootstrap.take().unwrap();
        let executed = match state.queue.execute_runnable() {
            Ok(executed) => executed,
            Err(e) => return Err(self.fatal(e.into())),
        };
        tracing::info!(executed, "bootstrap complete; entering consensus");

        let params = self.consensus.parameters().clone();
        let fresh = Self::consensus_from_frontier(&params, &self.store)?;
        self.consensus = fresh;
        self.vm.bootstrapped();
        self.repoll()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn next_request_id(&mut self) -> Result<u32, EngineError> {
        match self.request_id.checked_add(1) {
            Some(next) => {
                self.request_id = next;
                Ok(next)
            }
            None => Err(self.fatal(EngineError::RequestIdsExhausted)),
        }
    }

    /// A vertex from the processing pin or the store.
    pub(crate) fn get_vertex_any(&self, vertex_id: VertexId) -> Option<Arc<Vertex>> {
        if let Some(vtx) = self.processing.get(&vertex_id) {
            return Some(vtx.clone());
        }
        self.store.vertex(vertex_id)
    }

    /// Request a vertex's bytes from one sampled peer. Repeated calls
    /// while a fetch is outstanding are no-ops. Returns whether a
    /// fetch is in flight; when it is not, the caller must abandon
    /// whatever it parked on the vertex.
    fn fetch(&mut self, vertex_id: VertexId) -> Result<bool, EngineError> {
        if self.fetching.contains(&vertex_id) {
            return Ok(true);
        }
        if self.outstanding_gets.len() >= constants::MAX_OUTSTANDING_GETS {
            tracing::warn!(vertex = %vertex_id, "too many outstanding fetches");
            return Ok(false);
        }
        let peers = self.validators.sample(1);
        let peer = match peers.first() {
            Some(peer) => *peer,
            None => {
                tracing::warn!(vertex = %vertex_id, "no peer available to fetch from");
                return Ok(false);
            }
        };
        let request_id = self.next_request_id()?;
        self.fetching.insert(vertex_id);
        self.outstanding_gets.insert((peer, request_id), vertex_id);
        tracing::debug!(vertex = %vertex_id, peer = %peer, request_id, "fetching vertex");
        self.sender.get(peer, request_id, vertex_id);
        Ok(true)
    }

    /// Move a vertex toward consensus. Returns true when the vertex is
    /// already issued or was issued by this call; false when issuance
    /// is parked on missing parents or transaction dependencies.
    pub(crate) fn issue_vertex(&mut self, vtx: Arc<Vertex>) -> Result<bool, EngineError> {
        let id = vtx.id();
        if self.consensus.vertex_issued(id) {
            return Ok(true);
        }
        if self.pending_issue.contains(&id) {
            return Ok(false);
        }
        self.pending_issue.insert(id);
        self.processing.insert(id, vtx.clone());

        let mut vtx_deps = Vec::new();
        let mut dead_deps = Vec::new();
        for parent_id in vtx.parent_ids() {
            if self.consensus.vertex_issued(*parent_id) {
                continue;
            }
            match self.get_vertex_any(*parent_id) {
                Some(parent) => {
                    if !self.issue_vertex(parent)? {
                        vtx_deps.push(*parent_id);
                    }
                }
                None => {
                    if !self.fetch(*parent_id)? {
                        dead_deps.push(*parent_id);
                    }
                    vtx_deps.push(*parent_id);
                }
            }
        }

        let mut tx_deps = Vec::new();
        for tx in vtx.txs() {
            for dep in tx.dependencies() {
                if !dep.status().decided() && !self.consensus.tx_issued(&dep) {
                    tx_deps.push(dep.id());
                }
            }
        }

        let handle = self.next_issuer;
        self.next_issuer += 1;

        let mut fronts = 2u8;
        let mut abandoned = false;
        if let Some((_, ab)) = self.vtx_blocked.register(vtx_deps, VtxJob::Issuer(handle)) {
            fronts -= 1;
            abandoned |= ab;
        }
        if let Some((_, ab)) = self.tx_blocked.register(tx_deps, handle) {
            fronts -= 1;
            abandoned |= ab;
        }
        self.issuers.insert(
            handle,
            IssuerState {
                vtx,
                fronts,
                abandoned,
            },
        );
        if fronts == 0 {
            return self.run_issuer(handle);
        }
        tracing::debug!(vertex = %id, "vertex issuance blocked on dependencies");
        // Parents that can never arrive abandon their waiters now that
        // the issuer is registered.
        for parent_id in dead_deps {
            self.abandon_issue(parent_id)?;
        }
        Ok(false)
    }

    /// One front of an issuer resolved.
    fn issuer_front_done(&mut self, handle: u64, abandoned: bool) -> Result<(), EngineError> {
        let run = match self.issuers.get_mut(&handle) {
            Some(state) => {
                state.fronts = state.fronts.saturating_sub(1);
                state.abandoned |= abandoned;
                state.fronts == 0
            }
            None => false,
        };
        if run {
            self.run_issuer(handle)?;
        }
        Ok(())
    }

    /// All dependencies resolved: verify and issue the vertex, query
    /// the network about it, and release everything parked on it.
    fn run_issuer(&mut self, handle: u64) -> Result<bool, EngineError> {
        let state = match self.issuers.remove(&handle) {
            Some(state) => state,
            None => return Ok(false),
        };
        let vtx = state.vtx;
        let id = vtx.id();
        self.pending_issue.remove(&id);

        if self.errs.errored() {
            return Ok(false);
        }
        if state.abandoned {
            tracing::debug!(vertex = %id, "abandoning vertex whose dependencies failed");
            return self.abandon_issue(id).map(|_| false);
        }
        if self.consensus.vertex_issued(id) {
            self.resolve_issued(&vtx)?;
            return Ok(true);
        }

        // Salvage: a vertex carrying an invalid transaction is
        // abandoned, but its valid transactions are re-batched into a
        // vertex of our own.
        let mut valid = Vec::new();
        for tx in vtx.txs() {
            match tx.verify() {
                Ok(()) => valid.push(tx.clone()),
                Err(e) => {
                    tracing::warn!(vertex = %id, tx = %tx.id(), error = %e, "rejecting transaction that failed verification");
                    // A tx already issued through another vertex is
                    // decided by the conflict graph, not here.
                    if !self.consensus.tx_issued(tx) && !tx.status().decided() {
                        if let Err(e) = tx.reject() {
                            tracing::debug!(tx = %tx.id(), error = %e, "reject after failed verification");
                        }
                    }
                }
            }
        }
        if valid.len() != vtx.txs().len() {
            self.abandon_issue(id)?;
            if !valid.is_empty() {
                self.batch(valid, false)?;
            }
            return Ok(false);
        }

        tracing::debug!(vertex = %id, txs = vtx.txs().len(), "issuing vertex to consensus");
        let decided = match self.consensus.add(vtx.clone()) {
            Ok(decided) => decided,
            Err(e) => return Err(self.fatal(e.into())),
        };
        self.apply_decided(&decided)?;
        self.issue_query(&vtx)?;
        self.resolve_issued(&vtx)?;
        Ok(true)
    }

    /// Fulfill everything parked on a newly issued vertex and its txs.
    fn resolve_issued(&mut self, vtx: &Arc<Vertex>) -> Result<(), EngineError> {
        let ready = self.vtx_blocked.fulfill(vtx.id());
        for (job, abandoned) in ready {
            self.run_vtx_job(job, abandoned)?;
        }
        for tx in vtx.txs() {
            let ready = self.tx_blocked.fulfill(tx.id());
            for (handle, abandoned) in ready {
                self.issuer_front_done(handle, abandoned)?;
            }
        }
        Ok(())
    }

    /// Give up on a vertex ever being issued; cascades through every
    /// job that waited on it.
    fn abandon_issue(&mut self, vertex_id: VertexId) -> Result<(), EngineError> {
        self.pending_issue.remove(&vertex_id);
        self.processing.remove(&vertex_id);
        let ready = self.vtx_blocked.abandon(vertex_id);
        for (job, _) in ready {
            self.run_vtx_job(job, true)?;
        }
        Ok(())
    }

    fn run_vtx_job(&mut self, job: VtxJob, abandoned: bool) -> Result<(), EngineError> {
        match job {
            VtxJob::Issuer(handle) => self.issuer_front_done(handle, abandoned),
            // A voter treats an abandoned dependency like a fulfilled
            // one; bubbling sorts out whatever actually arrived.
            VtxJob::Voter(voter) => self.run_voter(voter),
            VtxJob::Convince { peer, request_id } => {
                let preferences = self.preferences();
                self.sender.chits(peer, request_id, &preferences);
                Ok(())
            }
        }
    }

    /// Answer a query now, or once the queried vertex is issued.
    fn send_chits_when_issued(
        &mut self,
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
    ) -> Result<(), EngineError> {
        let job = VtxJob::Convince { peer, request_id };
        let deps = if self.consensus.vertex_issued(vertex_id) {
            Vec::new()
        } else {
            vec![vertex_id]
        };
        if let Some((job, abandoned)) = self.vtx_blocked.register(deps, job) {
            self.run_vtx_job(job, abandoned)?;
        }
        Ok(())
    }

    /// Query a sample of validators about a freshly issued vertex.
    fn issue_query(&mut self, vtx: &Arc<Vertex>) -> Result<(), EngineError> {
        let request_id = self.next_request_id()?;
        let sample = self
            .validators
            .sample(self.consensus.parameters().k);
        if sample.is_empty() {
            tracing::warn!(vertex = %vtx.id(), "no validators to query");
            return Ok(());
        }
        if let Err(e) = self.polls.add(request_id, sample.clone()) {
            tracing::warn!(error = %e, vertex = %vtx.id(), "skipping query");
            return Ok(());
        }
        tracing::debug!(vertex = %vtx.id(), request_id, peers = sample.len(), "querying network");
        self.sender
            .push_query(&sample, request_id, vtx.id(), vtx.bytes());
        Ok(())
    }

    /// Persist newly accepted transactions and unpin vertices that
    /// reached a terminal status. A failed save is fatal: the engine
    /// cannot retry a partially applied accept.
    pub(crate) fn apply_decided(&mut self, decided: &Decided) -> Result<(), EngineError> {
        for tx in &decided.accepted_txs {
            if let Err(e) = self.vm.save_tx(tx) {
                return Err(self.fatal(ConsensusError::Tx(e).into()));
            }
        }
        for id in decided.accepted.iter().chain(decided.rejected.iter()) {
            self.processing.remove(id);
        }
        Ok(())
    }
}
