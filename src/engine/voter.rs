//! Poll-finish handling: route a finished tally through vote bubbling,
//! record it in consensus, re-issue orphaned transactions, and keep
//! the query pipeline full.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::bag::UniqueBag;
use crate::sender::NodeId;
use crate::transaction::{Status, Tx};
use crate::vertex::VertexId;

use super::{EngineError, Transitive};

/// A peer's chits for one poll, parked until every voted-for vertex
/// has been issued (or its issuance abandoned).
pub(crate) struct VoterJob {
    pub peer: NodeId,
    pub request_id: u32,
    pub response: Vec<VertexId>,
}

impl Transitive {
    /// Apply a responder's (possibly empty) chits to its poll and, if
    /// that finished the poll, run the poll-finish pipeline.
    pub(crate) fn run_voter(&mut self, job: VoterJob) -> Result<(), EngineError> {
        if self.errs.errored() {
            return Ok(());
        }
        let tally = if job.response.is_empty() {
            self.polls.drop_vote(job.request_id, job.peer)
        } else {
            self.polls.vote(job.request_id, job.peer, &job.response)
        };
        let tally = match tally {
            Some(tally) => tally,
            None => return Ok(()),
        };
        self.finish_poll(tally)
    }

    fn finish_poll(&mut self, tally: UniqueBag<VertexId>) -> Result<(), EngineError> {
        let bubbled = self.bubble_votes(tally);
        tracing::debug!(vertices = bubbled.len(), "finishing poll");

        let decided = match self.consensus.record_poll(&bubbled) {
            Ok(decided) => decided,
            Err(e) => return Err(self.fatal(e.into())),
        };
        self.apply_decided(&decided)?;

        // Virtuous transactions stranded outside the preferred
        // frontier ride again in a fresh vertex.
        let orphans: Vec<_> = self.consensus.orphans().iter().copied().collect();
        let mut reissue = Vec::new();
        for orphan in orphans {
            match self.vm.get_tx(orphan) {
                Some(tx) if !tx.status().decided() => reissue.push(tx),
                Some(_) => {}
                None => {
                    tracing::warn!(tx = %orphan, "failed to fetch orphan for re-issuance")
                }
            }
        }
        if !reissue.is_empty() {
            tracing::debug!(count = reissue.len(), "re-issuing orphaned transactions");
            self.batch(reissue, true)?;
        }

        if self.consensus.finalized() {
            tracing::debug!("every issued transaction is decided; engine can quiesce");
            return Ok(());
        }
        self.repoll()
    }

    /// Move each vote up the ancestry to the nearest issued,
    /// undecided vertex. Votes for unknown vertices are dropped;
    /// votes for decided vertices are spent.
    fn bubble_votes(&mut self, tally: UniqueBag<VertexId>) -> UniqueBag<VertexId> {
        let mut votes = tally;
        let mut bubbled = UniqueBag::new();
        // Deepest vertices first, so votes accumulate before a vertex
        // is taken off the heap.
        let mut heap: BinaryHeap<(u64, VertexId)> = BinaryHeap::new();
        let mut queued: HashSet<VertexId> = HashSet::new();

        let mut voted: Vec<VertexId> = votes.ids().copied().collect();
        voted.sort();
        for vote in voted {
            match self.get_vertex_any(vote) {
                Some(vtx) => {
                    if queued.insert(vote) {
                        heap.push((vtx.height(), vote));
                    }
                }
                None => {
                    tracing::debug!(vertex = %vote, "dropping votes for unknown vertex");
                }
            }
        }

        while let Some((_, id)) = heap.pop() {
            queued.remove(&id);
            let set = votes.get(&id);

            if self.consensus.vertex_status(id).decided() {
                tracing::trace!(vertex = %id, "dropping votes for decided vertex");
                continue;
            }
            if self.consensus.vertex_status(id) == Status::Processing {
                bubbled.union(id, set);
                continue;
            }

            // Known but never issued: the votes move to its parents.
            let vtx = match self.get_vertex_any(id) {
                Some(vtx) => vtx,
                None => continue,
            };
            tracing::trace!(vertex = %id, "bubbling votes past unissued vertex");
            for parent_id in vtx.parent_ids() {
                if let Some(parent) = self.get_vertex_any(*parent_id) {
                    votes.union(*parent_id, set);
                    if queued.insert(*parent_id) {
                        heap.push((parent.height(), *parent_id));
                    }
                }
            }
        }
        bubbled
    }

    /// Issue fresh pending transactions from the VM, batched into new
    /// vertices.
    pub fn notify_pending_txs(&mut self) -> Result<(), EngineError> {
        if self.errs.errored() || self.bootstrapping() {
            return Ok(());
        }
        let txs = self.vm.pending_txs();
        if txs.is_empty() {
            return Ok(());
        }
        self.batch(txs, false)
    }

    /// Group transactions into vertices of at most `batch_size`,
    /// flushing early when `force` is set and a batch would otherwise
    /// double-spend an input against itself.
    pub(crate) fn batch(
        &mut self,
        txs: Vec<Arc<dyn Tx>>,
        force: bool,
    ) -> Result<(), EngineError> {
        let txs = match crate::transaction::topological_sort(txs) {
            Ok(txs) => txs,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unbatchable transactions");
                return Ok(());
            }
        };

        let mut batch: Vec<Arc<dyn Tx>> = Vec::new();
        let mut batched_ids = HashSet::new();
        let mut consumed: HashSet<crate::Hash> = HashSet::new();

        for tx in txs {
            let inputs = tx.input_ids();
            let mut overlaps = inputs.iter().any(|input| consumed.contains(input));
            if batch.len() >= self.consensus.parameters().batch_size || (force && overlaps) {
                let drained = std::mem::take(&mut batch);
                consumed.clear();
                overlaps = false;
                self.issue_batch(drained)?;
            }
            if overlaps || batched_ids.contains(&tx.id()) {
                continue;
            }
            if !force && self.consensus.tx_issued(&tx) {
                continue;
            }
            batched_ids.insert(tx.id());
            consumed.extend(inputs);
            batch.push(tx);
        }

        if !batch.is_empty() {
            self.issue_batch(batch)?;
        }
        Ok(())
    }

    fn issue_batch(&mut self, txs: Vec<Arc<dyn Tx>>) -> Result<(), EngineError> {
        if txs.is_empty() {
            return Ok(());
        }
        let mut parents: Vec<VertexId> = self
            .consensus
            .virtuous_frontier()
            .iter()
            .copied()
            .collect();
        parents.sort();
        parents.truncate(self.consensus.parameters().parents);

        let vtx = match self.store.build_vertex(parents, txs) {
            Ok(vtx) => vtx,
            Err(e) => return Err(self.fatal(e.into())),
        };
        tracing::debug!(vertex = %vtx.id(), txs = vtx.txs().len(), "built vertex");
        self.issue_vertex(vtx)?;
        Ok(())
    }

    /// Issue pull queries until `concurrent_repolls` polls are in
    /// flight, each on a random strongly preferred vertex.
    pub(crate) fn repoll(&mut self) -> Result<(), EngineError> {
        use rand::Rng;

        while self.polls.len() < self.consensus.parameters().concurrent_repolls {
            let mut preferred: Vec<VertexId> =
                self.consensus.preferences().iter().copied().collect();
            if preferred.is_empty() {
                return Ok(());
            }
            preferred.sort();
            let pick = preferred[rand::thread_rng().gen_range(0..preferred.len())];

            let request_id = self.next_request_id()?;
            let sample = self.validators.sample(self.consensus.parameters().k);
            if sample.is_empty() {
                tracing::warn!("no validators available to repoll");
                return Ok(());
            }
            if let Err(e) = self.polls.add(request_id, sample.clone()) {
                tracing::warn!(error = %e, "skipping repoll");
                return Ok(());
            }
            tracing::debug!(vertex = %pick, request_id, "repolling");
            self.sender.pull_query(&sample, request_id, pick);
        }
        Ok(())
    }
}
