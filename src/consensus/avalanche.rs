//! Topological vote engine over the vertex DAG.
//!
//! Vertex-level chits are translated into transaction-level votes by a
//! two-pass walk: a Kahn in-degree pass over the ancestry reachable
//! from the voted vertices, then a propagation pass that pushes each
//! voter's bit up from the leaves, cancelling voters that back two
//! conflicting transactions at once. Decisions from the conflict graph
//! then drive vertex accept/reject and the frontier sets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::bag::{Bag, BitSet64, UniqueBag};
use crate::config::Parameters;
use crate::transaction::{Status, Tx, TxId};
use crate::vertex::{Vertex, VertexId, VertexStore};

use super::{ConflictGraph, ConsensusError, Decided};

#[derive(Clone, Copy, Default)]
struct KahnNode {
    in_degree: usize,
    votes: BitSet64,
}

/// The Avalanche DAG engine: processing vertices, vote bubbling, and
/// the preferred/virtuous frontiers.
pub struct Topological {
    params: Parameters,
    cg: ConflictGraph,
    store: Arc<VertexStore>,

    /// Processing vertices by ID; removed on terminal status.
    nodes: HashMap<VertexId, Arc<Vertex>>,

    /// Frontier of strongly preferred vertices.
    preferred: HashSet<VertexId>,
    /// Frontier of strongly virtuous vertices.
    virtuous: HashSet<VertexId>,
    /// Virtuous transactions whose vertex is not preferred.
    orphans: HashSet<TxId>,

    /// Vertices with no processing descendants.
    frontier: HashMap<VertexId, Arc<Vertex>>,

    /// Memoisation for one frontier recomputation; diamond ancestry is
    /// visited once.
    preference_cache: HashMap<VertexId, bool>,
    virtuous_cache: HashMap<VertexId, bool>,
}

impl Topological {
    /// Create the engine seeded with the current accepted frontier.
    pub fn new(
        params: Parameters,
        store: Arc<VertexStore>,
        frontier: Vec<Arc<Vertex>>,
    ) -> Result<(Self, Decided), ConsensusError> {
        let mut engine = Topological {
            cg: ConflictGraph::new(params.clone()),
            params,
            store,
            nodes: HashMap::new(),
            preferred: HashSet::new(),
            virtuous: HashSet::new(),
            orphans: HashSet::new(),
            frontier: frontier.into_iter().map(|vtx| (vtx.id(), vtx)).collect(),
            preference_cache: HashMap::new(),
            virtuous_cache: HashMap::new(),
        };
        let decided = engine.update_frontiers()?;
        Ok((engine, decided))
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Status as consensus sees it: processing while in the node map,
    /// otherwise whatever the store has recorded.
    pub fn vertex_status(&self, id: VertexId) -> Status {
        if self.nodes.contains_key(&id) {
            Status::Processing
        } else {
            self.store.status(id)
        }
    }

    pub fn vertex_issued(&self, id: VertexId) -> bool {
        self.vertex_status(id) != Status::Unknown
    }

    pub fn tx_issued(&self, tx: &Arc<dyn Tx>) -> bool {
        self.cg.issued(tx)
    }

    pub fn is_virtuous(&self, tx: &Arc<dyn Tx>) -> bool {
        self.cg.is_virtuous(tx)
    }

    /// Frontier of strongly preferred vertices; chits are answered
    /// from this set.
    pub fn preferences(&self) -> &HashSet<VertexId> {
        &self.preferred
    }

    pub fn virtuous_frontier(&self) -> &HashSet<VertexId> {
        &self.virtuous
    }

    /// Virtuous transactions left out of the preferred frontier,
    /// candidates for re-issuance.
    pub fn orphans(&self) -> &HashSet<TxId> {
        &self.orphans
    }

    /// Whether polling can pause without stalling any virtuous tx.
    pub fn quiesce(&self) -> bool {
        self.cg.quiesce()
    }

    /// Whether every issued transaction has been decided.
    pub fn finalized(&self) -> bool {
        self.cg.finalized()
    }

    pub fn num_processing_vertices(&self) -> usize {
        self.nodes.len()
    }

    /// Issue a vertex. A no-op if the vertex is already processing or
    /// decided. The caller has already verified the vertex and fetched
    /// all its parents.
    pub fn add(&mut self, vtx: Arc<Vertex>) -> Result<Decided, ConsensusError> {
        let id = vtx.id();
        if self.store.status(id).decided() || self.nodes.contains_key(&id) {
            return Ok(Decided::default());
        }

        for tx in vtx.txs() {
            if !tx.status().decided() {
                self.cg.add(tx.clone())?;
            }
        }
        self.nodes.insert(id, vtx);

        // A transaction whose dependency was already rejected decides
        // immediately; apply before walking the ancestry.
        let (accepted_txs, _) = self.cg.updateable()?;
        let mut decided = self.update(id)?;
        decided.accepted_txs.extend(accepted_txs);
        Ok(decided)
    }

    /// Record the finished poll's chits (vertex ID → voter bit-set).
    pub fn record_poll(
        &mut self,
        responses: &UniqueBag<VertexId>,
    ) -> Result<Decided, ConsensusError> {
        // If alpha voters can't be reached by any vertex, skip the
        // traversal and just break every confidence run.
        let mut partial = BitSet64::default();
        for id in responses.ids() {
            partial.union(responses.get(id));
        }
        if partial.len() < self.params.alpha {
            self.cg.record_poll(Bag::new());
            return Ok(Decided::default());
        }

        let (mut kahns, leaves) = self.calculate_in_degree(responses);
        let votes = self.push_votes(&mut kahns, leaves);

        if !self.cg.record_poll(votes) {
            return Ok(Decided::default());
        }
        let (accepted_txs, _) = self.cg.updateable()?;
        let mut decided = self.update_frontiers()?;
        decided.accepted_txs.extend(accepted_txs);
        Ok(decided)
    }

    /// Kahn pass: walk up from every voted, still-processing vertex,
    /// counting in-edges. Votes for unknown or decided vertices are
    /// discarded here.
    fn calculate_in_degree(
        &self,
        responses: &UniqueBag<VertexId>,
    ) -> (HashMap<VertexId, KahnNode>, Vec<VertexId>) {
        let mut kahns: HashMap<VertexId, KahnNode> = HashMap::new();
        let mut leaves: HashSet<VertexId> = HashSet::new();

        let mut voted: Vec<VertexId> = responses.ids().copied().collect();
        voted.sort();
        for vote in voted {
            let vtx = match self.nodes.get(&vote) {
                Some(vtx) => vtx.clone(),
                None => continue,
            };
            let previously_seen = kahns.contains_key(&vote);
            let kahn = kahns.entry(vote).or_default();
            kahn.votes.union(responses.get(&vote));

            if !previously_seen {
                leaves.insert(vote);
                self.mark_ancestor_in_degrees(&mut kahns, &mut leaves, vtx.parent_ids());
            }
        }

        let mut leaves: Vec<VertexId> = leaves.into_iter().collect();
        leaves.sort();
        (kahns, leaves)
    }

    fn mark_ancestor_in_degrees(
        &self,
        kahns: &mut HashMap<VertexId, KahnNode>,
        leaves: &mut HashSet<VertexId>,
        parent_ids: &[VertexId],
    ) {
        let mut stack: Vec<Arc<Vertex>> = parent_ids
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();

        while let Some(current) = stack.pop() {
            let id = current.id();
            let already_seen = kahns.contains_key(&id);
            let kahn = kahns.entry(id).or_default();
            kahn.in_degree += 1;

            if kahn.in_degree == 1 {
                // First transitive edge in; no longer a leaf.
                leaves.remove(&id);
            }
            if !already_seen {
                for parent_id in current.parent_ids() {
                    if let Some(parent) = self.nodes.get(parent_id) {
                        stack.push(parent.clone());
                    }
                }
            }
        }
    }

    /// Propagation pass: pop leaves, give their voter sets to their
    /// transactions and parents, and cancel voters backing conflicting
    /// transactions simultaneously.
    fn push_votes(
        &mut self,
        kahns: &mut HashMap<VertexId, KahnNode>,
        mut leaves: Vec<VertexId>,
    ) -> Bag<TxId> {
        let mut votes: UniqueBag<TxId> = UniqueBag::new();
        let mut tx_conflicts: HashMap<TxId, HashSet<TxId>> = HashMap::new();

        while let Some(leaf) = leaves.pop() {
            let kahn = match kahns.get(&leaf) {
                Some(kahn) => *kahn,
                None => continue,
            };
            let vtx = match self.nodes.get(&leaf) {
                Some(vtx) => vtx.clone(),
                None => continue,
            };

            for tx in vtx.txs() {
                let tx_id = tx.id();
                votes.union(tx_id, kahn.votes);
                tx_conflicts
                    .entry(tx_id)
                    .or_insert_with(|| self.cg.conflicts(tx));
            }

            for parent_id in vtx.parent_ids() {
                if let Some(dep) = kahns.get_mut(parent_id) {
                    dep.in_degree -= 1;
                    dep.votes.union(kahn.votes);
                    if dep.in_degree == 0 {
                        leaves.push(*parent_id);
                    }
                }
            }
        }

        // A voter may back at most one member of a conflict set; a
        // voter seen on both sides cancels out of both.
        let mut conflicting_votes: UniqueBag<TxId> = UniqueBag::new();
        for (tx_id, conflicts) in &tx_conflicts {
            for conflict_id in conflicts {
                conflicting_votes.union(*tx_id, votes.get(conflict_id));
            }
        }
        votes.difference(&conflicting_votes);
        votes.bag()
    }

    /// Recompute the preferred/virtuous frontiers and drive decided
    /// vertices to their terminal status.
    pub fn update_frontiers(&mut self) -> Result<Decided, ConsensusError> {
        let previous: Vec<Arc<Vertex>> = self.frontier.values().cloned().collect();

        self.preferred.clear();
        self.virtuous.clear();
        self.orphans.clear();
        self.frontier.clear();
        self.preference_cache.clear();
        self.virtuous_cache.clear();

        // Virtuous txs start as orphans; vertices that carry them
        // preferred pull them back out.
        self.orphans.extend(self.cg.virtuous().iter().copied());

        let mut decided = Decided::default();
        for vtx in previous {
            decided.union(self.update(vtx.id())?);
        }
        Ok(decided)
    }

    /// Update one vertex and its ancestry, memoised per recomputation.
    fn update(&mut self, id: VertexId) -> Result<Decided, ConsensusError> {
        if self.preference_cache.contains_key(&id) {
            return Ok(Decided::default());
        }

        match self.vertex_status(id) {
            Status::Accepted => {
                let vtx = self
                    .store
                    .vertex(id)
                    .ok_or(ConsensusError::MissingVertex(id))?;
                self.preferred.insert(id);
                self.virtuous.insert(id);
                self.frontier.insert(id, vtx);
                self.preference_cache.insert(id, true);
                self.virtuous_cache.insert(id, true);
                return Ok(Decided::default());
            }
            Status::Rejected => {
                self.preference_cache.insert(id, false);
                self.virtuous_cache.insert(id, false);
                return Ok(Decided::default());
            }
            Status::Unknown => return Err(ConsensusError::MissingVertex(id)),
            Status::Processing => {}
        }

        let vtx = self
            .nodes
            .get(&id)
            .cloned()
            .ok_or(ConsensusError::MissingVertex(id))?;

        let mut acceptable = true;
        let mut rejectable = false;
        let mut preferred = true;
        let mut virtuous = true;

        for tx in vtx.txs() {
            let status = tx.status();
            if status == Status::Rejected {
                rejectable = true;
                preferred = false;
                virtuous = false;
            }
            if status != Status::Accepted {
                acceptable = false;
                preferred = preferred && self.cg.preferences().contains(&tx.id());
                virtuous = virtuous && self.cg.virtuous().contains(&tx.id());
            }
        }

        let mut decided = Decided::default();
        for parent_id in vtx.parent_ids() {
            decided.union(self.update(*parent_id)?);
            preferred = preferred && *self.preference_cache.get(parent_id).unwrap_or(&false);
            virtuous = virtuous && *self.virtuous_cache.get(parent_id).unwrap_or(&false);
        }

        for parent_id in vtx.parent_ids() {
            match self.vertex_status(*parent_id) {
                Status::Rejected => {
                    // A rejected parent sinks the whole subtree.
                    self.store.reject_vertex(id)?;
                    self.nodes.remove(&id);
                    decided.rejected.insert(id);
                    tracing::info!(vertex = %id, parent = %parent_id, "rejected vertex with rejected parent");
                    self.preference_cache.insert(id, false);
                    self.virtuous_cache.insert(id, false);
                    return Ok(decided);
                }
                Status::Accepted => {}
                _ => acceptable = false,
            }
        }

        for parent_id in vtx.parent_ids() {
            self.frontier.remove(parent_id);
        }
        self.frontier.insert(id, vtx.clone());

        self.preference_cache.insert(id, preferred);
        self.virtuous_cache.insert(id, virtuous);

        if preferred {
            self.preferred.insert(id);
            for parent_id in vtx.parent_ids() {
                self.preferred.remove(parent_id);
            }
            for tx in vtx.txs() {
                if tx.status() != Status::Accepted {
                    self.orphans.remove(&tx.id());
                }
            }
        }
        if virtuous {
            self.virtuous.insert(id);
            for parent_id in vtx.parent_ids() {
                self.virtuous.remove(parent_id);
            }
        }

        if acceptable {
            self.store.accept_vertex(&vtx)?;
            self.nodes.remove(&id);
            decided.accepted.insert(id);
            tracing::info!(vertex = %id, height = vtx.height(), "accepted vertex");
        } else if rejectable {
            self.store.reject_vertex(id)?;
            self.nodes.remove(&id);
            decided.rejected.insert(id);
            tracing::info!(vertex = %id, "rejected vertex");
        }
        Ok(decided)
    }
}
