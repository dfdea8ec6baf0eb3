//! Conflict graph over processing transactions.
//!
//! Two transactions conflict iff their input sets intersect. Conflicts
//! are tracked as directed edges between processing transactions: the
//! edge points from the currently preferred transaction to its rival,
//! so a transaction is preferred iff it has no incoming edge and
//! virtuous iff it has no edge at all.
//!
//! Each poll that reaches the alpha quorum for a transaction extends
//! its run of consecutive successes; a run of `beta_virtuous` (for
//! virtuous transactions) or `beta_rogue` (for conflicted ones)
//! accepts it, once every dependency has itself been accepted.
//! Accepting a transaction makes each of its rivals rejectable, and
//! rejecting one cascades to its dependents.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::bag::Bag;
use crate::config::Parameters;
use crate::events::Blocker;
use crate::transaction::{Status, Tx, TxId};
use crate::Hash;

use super::ConsensusError;

struct TxNode {
    tx: Arc<dyn Tx>,
    /// Input keys this transaction consumes, frozen at issuance.
    inputs: Vec<Hash>,
    /// Conflicting txs currently preferred over this one.
    ins: HashSet<TxId>,
    /// Conflicting txs this one is currently preferred over.
    outs: HashSet<TxId>,
    num_successful_polls: u64,
    confidence: u64,
    /// Poll counter value of the last successful poll; a gap resets
    /// confidence on the next success.
    last_poll: u64,
    /// Already queued (or parked) for acceptance.
    accept_queued: bool,
}

/// The conflict-set engine: decides which processing transactions are
/// acceptable or rejectable as polls are recorded.
pub struct ConflictGraph {
    params: Parameters,
    txs: HashMap<TxId, TxNode>,
    /// Input key → processing txs consuming it.
    spenders: HashMap<Hash, HashSet<TxId>>,
    /// Processing txs with no conflicts.
    virtuous: HashSet<TxId>,
    /// Virtuous txs not yet decided; empty means polling can stop.
    virtuous_voting: HashSet<TxId>,
    /// Processing txs preferred within all their conflict sets.
    preferences: HashSet<TxId>,
    /// Dependency → processing txs that depend on it.
    dependents: HashMap<TxId, HashSet<TxId>>,
    /// Txs at beta whose dependencies have not all been accepted yet.
    pending_accept: Blocker<TxId, TxId>,
    acceptable: VecDeque<TxId>,
    rejectable: VecDeque<TxId>,
    rejectable_ids: HashSet<TxId>,
    current_poll: u64,
}

impl ConflictGraph {
    pub fn new(params: Parameters) -> Self {
        ConflictGraph {
            params,
            txs: HashMap::new(),
            spenders: HashMap::new(),
            virtuous: HashSet::new(),
            virtuous_voting: HashSet::new(),
            preferences: HashSet::new(),
            dependents: HashMap::new(),
            pending_accept: Blocker::new(),
            acceptable: VecDeque::new(),
            rejectable: VecDeque::new(),
            rejectable_ids: HashSet::new(),
            current_poll: 0,
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Whether `tx` is processing or already decided.
    pub fn issued(&self, tx: &Arc<dyn Tx>) -> bool {
        tx.status().decided() || self.txs.contains_key(&tx.id())
    }

    /// Whether no processing transaction conflicts with `tx`. May be
    /// called for transactions that are not yet issued.
    pub fn is_virtuous(&self, tx: &Arc<dyn Tx>) -> bool {
        let id = tx.id();
        for input in tx.input_ids() {
            if let Some(spenders) = self.spenders.get(&input) {
                if spenders.iter().any(|spender| *spender != id) {
                    return false;
                }
            }
        }
        true
    }

    /// Processing transactions that conflict with `tx`.
    pub fn conflicts(&self, tx: &Arc<dyn Tx>) -> HashSet<TxId> {
        let id = tx.id();
        let mut conflicting = HashSet::new();
        for input in tx.input_ids() {
            if let Some(spenders) = self.spenders.get(&input) {
                conflicting.extend(spenders.iter().copied().filter(|s| *s != id));
            }
        }
        conflicting
    }

    /// Issue a transaction into the conflict graph. A second add of
    /// the same transaction is a no-op.
    pub fn add(&mut self, tx: Arc<dyn Tx>) -> Result<(), ConsensusError> {
        if self.issued(&tx) {
            return Ok(());
        }
        let id = tx.id();

        let mut dep_rejected = false;
        let mut unaccepted_deps = HashSet::new();
        for dep in tx.dependencies() {
            match dep.status() {
                Status::Accepted => {}
                Status::Rejected => dep_rejected = true,
                _ => {
                    unaccepted_deps.insert(dep.id());
                }
            }
        }

        let inputs = tx.input_ids();
        let mut node = TxNode {
            tx,
            inputs: inputs.clone(),
            ins: HashSet::new(),
            outs: HashSet::new(),
            num_successful_polls: 0,
            confidence: 0,
            last_poll: 0,
            accept_queued: false,
        };

        for input in &inputs {
            let spenders = self.spenders.entry(*input).or_default();
            for conflict_id in spenders.iter() {
                if *conflict_id == id {
                    continue;
                }
                // The incumbent stays preferred over the newcomer.
                node.ins.insert(*conflict_id);
                self.virtuous.remove(conflict_id);
                self.virtuous_voting.remove(conflict_id);
            }
            spenders.insert(id);
        }
        for conflict_id in node.ins.clone() {
            if let Some(conflict) = self.txs.get_mut(&conflict_id) {
                conflict.outs.insert(id);
            }
        }

        if node.ins.is_empty() {
            self.preferences.insert(id);
            self.virtuous.insert(id);
            self.virtuous_voting.insert(id);
        }

        for dep_id in &unaccepted_deps {
            self.dependents.entry(*dep_id).or_default().insert(id);
        }

        self.txs.insert(id, node);

        if dep_rejected {
            self.mark_rejectable(id);
        }
        Ok(())
    }

    /// Record one poll's alpha-thresholded vote counts. Returns true
    /// iff any transaction registered a successful poll.
    pub fn record_poll(&mut self, votes: Bag<TxId>) -> bool {
        self.current_poll += 1;
        let mut changed = false;

        let mut met = votes.threshold(self.params.alpha);
        met.sort();
        for tx_id in met {
            let node = match self.txs.get_mut(&tx_id) {
                Some(node) => node,
                None => continue,
            };
            node.num_successful_polls += 1;
            node.confidence = if node.last_poll + 1 == self.current_poll {
                node.confidence + 1
            } else {
                1
            };
            node.last_poll = self.current_poll;
            changed = true;

            // A transaction that out-polls a rival that beat it takes
            // over the preference; the rival's run restarts.
            let my_polls = node.num_successful_polls;
            let beaten_by: Vec<TxId> = node.ins.iter().copied().collect();
            for rival_id in beaten_by {
                let flips = self
                    .txs
                    .get(&rival_id)
                    .map(|rival| my_polls > rival.num_successful_polls)
                    .unwrap_or(false);
                if flips {
                    self.flip_edge(rival_id, tx_id);
                }
            }

            let node = &self.txs[&tx_id];
            let beta = if self.virtuous.contains(&tx_id) {
                self.params.beta_virtuous
            } else {
                self.params.beta_rogue
            };
            if node.ins.is_empty()
                && node.confidence >= beta
                && !node.accept_queued
                && !self.rejectable_ids.contains(&tx_id)
            {
                self.queue_accept(tx_id);
            }
        }
        changed
    }

    /// Drain transactions ready to be decided, applying their accept
    /// and reject transitions and every cascade they trigger.
    #[allow(clippy::type_complexity)]
    pub fn updateable(
        &mut self,
    ) -> Result<(Vec<Arc<dyn Tx>>, Vec<Arc<dyn Tx>>), ConsensusError> {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        loop {
            if let Some(id) = self.acceptable.pop_front() {
                if self.rejectable_ids.contains(&id) {
                    // A dependency was rejected after this tx reached
                    // beta; the rejectable pass will claim it.
                    continue;
                }
                let node = match self.txs.remove(&id) {
                    Some(node) => node,
                    None => continue,
                };
                node.tx.accept()?;
                tracing::debug!(tx = %id, "accepted transaction");
                self.detach(&id, &node);
                self.virtuous.remove(&id);
                self.virtuous_voting.remove(&id);
                self.preferences.remove(&id);
                self.dependents.remove(&id);

                // Everything conflicting with an accepted tx dies.
                for rival in node.ins.iter().chain(node.outs.iter()) {
                    self.mark_rejectable(*rival);
                }
                for (waiter, abandoned) in self.pending_accept.fulfill(id) {
                    if abandoned {
                        self.mark_rejectable(waiter);
                    } else if self.txs.contains_key(&waiter)
                        && !self.rejectable_ids.contains(&waiter)
                    {
                        self.acceptable.push_back(waiter);
                    }
                }
                accepted.push(node.tx);
                continue;
            }

            if let Some(id) = self.rejectable.pop_front() {
                let node = match self.txs.remove(&id) {
                    Some(node) => node,
                    None => {
                        self.rejectable_ids.remove(&id);
                        continue;
                    }
                };
                node.tx.reject()?;
                tracing::debug!(tx = %id, "rejected transaction");
                self.detach(&id, &node);
                self.virtuous.remove(&id);
                self.virtuous_voting.remove(&id);
                self.preferences.remove(&id);
                self.rejectable_ids.remove(&id);

                // Dependents can never be accepted now.
                if let Some(dependents) = self.dependents.remove(&id) {
                    for dependent in dependents {
                        if self.txs.contains_key(&dependent) {
                            self.mark_rejectable(dependent);
                        }
                    }
                }
                for (waiter, _) in self.pending_accept.abandon(id) {
                    self.mark_rejectable(waiter);
                }
                rejected.push(node.tx);
                continue;
            }

            break;
        }
        Ok((accepted, rejected))
    }

    /// Transactions currently in singleton conflict sets.
    pub fn virtuous(&self) -> &HashSet<TxId> {
        &self.virtuous
    }

    /// The preferred transaction of every conflict set.
    pub fn preferences(&self) -> &HashSet<TxId> {
        &self.preferences
    }

    /// Whether polling can stop: no virtuous transaction still voting.
    pub fn quiesce(&self) -> bool {
        self.virtuous_voting.is_empty()
    }

    /// Whether every issued transaction has been decided.
    pub fn finalized(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn num_processing(&self) -> usize {
        self.txs.len()
    }

    fn queue_accept(&mut self, tx_id: TxId) {
        let node = match self.txs.get_mut(&tx_id) {
            Some(node) => node,
            None => return,
        };
        node.accept_queued = true;
        let unaccepted: Vec<TxId> = node
            .tx
            .dependencies()
            .into_iter()
            .filter(|dep| !matches!(dep.status(), Status::Accepted))
            .map(|dep| dep.id())
            .collect();
        if let Some((ready, abandoned)) = self.pending_accept.register(unaccepted, tx_id) {
            if abandoned {
                self.mark_rejectable(ready);
            } else {
                self.acceptable.push_back(ready);
            }
        }
    }

    fn mark_rejectable(&mut self, id: TxId) {
        if !self.txs.contains_key(&id) {
            return;
        }
        if self.rejectable_ids.insert(id) {
            self.rejectable.push_back(id);
        }
    }

    /// Remove a decided tx from the spender index and its rivals' edge
    /// sets; a rival left with no incoming edges becomes preferred.
    fn detach(&mut self, id: &TxId, node: &TxNode) {
        for input in &node.inputs {
            if let Some(spenders) = self.spenders.get_mut(input) {
                spenders.remove(id);
                if spenders.is_empty() {
                    self.spenders.remove(input);
                }
            }
        }
        for rival_id in node.ins.iter().chain(node.outs.iter()) {
            if let Some(rival) = self.txs.get_mut(rival_id) {
                rival.outs.remove(id);
                rival.ins.remove(id);
                if rival.ins.is_empty() {
                    self.preferences.insert(*rival_id);
                }
            }
        }
    }

    /// Move the preference edge between `loser` and `winner` so the
    /// winner now beats the loser, resetting the loser's run.
    fn flip_edge(&mut self, loser_id: TxId, winner_id: TxId) {
        if let Some(loser) = self.txs.get_mut(&loser_id) {
            loser.outs.remove(&winner_id);
            loser.ins.insert(winner_id);
            loser.confidence = 0;
            self.preferences.remove(&loser_id);
        }
        if let Some(winner) = self.txs.get_mut(&winner_id) {
            winner.ins.remove(&loser_id);
            winner.outs.insert(loser_id);
            if winner.ins.is_empty() {
                self.preferences.insert(winner_id);
            }
        }
        tracing::trace!(winner = %winner_id, loser = %loser_id, "conflict preference flipped");
    }
}
