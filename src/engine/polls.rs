//! In-flight poll registry.
//!
//! One poll per request ID. The expected responders are fixed when the
//! query is issued (the sample taken at send time, duplicates allowed
//! for weighted sampling); each responder's chit or failure is counted
//! once, and the poll finishes when every expected response is in.

use std::collections::HashMap;

use crate::bag::UniqueBag;
use crate::sender::NodeId;
use crate::vertex::VertexId;

/// Errors from the poll registry.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PollError {
    #[error("request id {0} already has an in-flight poll")]
    DuplicateRequest(u32),
    #[error("too many outstanding polls ({0})")]
    TooManyPolls(usize),
}

struct Poll {
    /// Expected responders in sample order; the position is the
    /// voter's bit index in the result bag.
    voters: Vec<NodeId>,
    responded: Vec<bool>,
    votes: UniqueBag<VertexId>,
    outstanding: usize,
}

impl Poll {
    fn vote_slot(&mut self, voter: NodeId) -> Option<usize> {
        // First unresponded occurrence; repeats from weighted
        // sampling each get their own slot.
        let slot = self
            .voters
            .iter()
            .zip(self.responded.iter())
            .position(|(v, responded)| *v == voter && !responded)?;
        self.responded[slot] = true;
        self.outstanding -= 1;
        Some(slot)
    }

    fn finished(&self) -> bool {
        self.outstanding == 0
    }
}

/// All in-flight polls, keyed by request ID.
#[derive(Default)]
pub struct PollSet {
    polls: HashMap<u32, Poll>,
    max_polls: usize,
}

impl PollSet {
    pub fn new(max_polls: usize) -> Self {
        PollSet {
            polls: HashMap::new(),
            max_polls,
        }
    }

    /// Start tracking a poll. Fails on a duplicate request ID or when
    /// the registry is at capacity.
    pub fn add(&mut self, request_id: u32, voters: Vec<NodeId>) -> Result<(), PollError> {
        if self.polls.len() >= self.max_polls {
            return Err(PollError::TooManyPolls(self.polls.len()));
        }
        if self.polls.contains_key(&request_id) {
            return Err(PollError::DuplicateRequest(request_id));
        }
        let outstanding = voters.len();
        self.polls.insert(
            request_id,
            Poll {
                responded: vec![false; outstanding],
                votes: UniqueBag::new(),
                outstanding,
                voters,
            },
        );
        Ok(())
    }

    /// Record a chit. Returns the final tally when this was the last
    /// outstanding response; the poll is then gone. Chits from
    /// unexpected peers, duplicate chits, and chits for unknown
    /// request IDs are ignored.
    pub fn vote(
        &mut self,
        request_id: u32,
        voter: NodeId,
        votes: &[VertexId],
    ) -> Option<UniqueBag<VertexId>> {
        let poll = self.polls.get_mut(&request_id)?;
        let slot = match poll.vote_slot(voter) {
            Some(slot) => slot,
            None => {
                tracing::debug!(request_id, peer = %voter, "ignoring unexpected or duplicate chit");
                return None;
            }
        };
        for vertex_id in votes {
            poll.votes.add(*vertex_id, slot);
        }
        if poll.finished() {
            return Some(self.polls.remove(&request_id).unwrap().votes);
        }
        None
    }

    /// Record a failed response, equivalent to an empty vote.
    pub fn drop_vote(&mut self, request_id: u32, voter: NodeId) -> Option<UniqueBag<VertexId>> {
        self.vote(request_id, voter, &[])
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::peer;

    fn vid(seed: u8) -> VertexId {
        VertexId([seed; 32])
    }

    #[test]
    fn duplicate_request_id_rejected() {
        let mut polls = PollSet::new(16);
        polls.add(1, vec![peer(0)]).unwrap();
        assert!(matches!(
            polls.add(1, vec![peer(1)]),
            Err(PollError::DuplicateRequest(1))
        ));
    }

    #[test]
    fn capacity_enforced() {
        let mut polls = PollSet::new(1);
        polls.add(1, vec![peer(0)]).unwrap();
        assert!(matches!(
            polls.add(2, vec![peer(0)]),
            Err(PollError::TooManyPolls(1))
        ));
    }

    #[test]
    fn poll_finishes_when_all_respond() {
        let mut polls = PollSet::new(16);
        polls.add(7, vec![peer(0), peer(1)]).unwrap();

        assert!(polls.vote(7, peer(0), &[vid(1)]).is_none());
        let result = polls.vote(7, peer(1), &[vid(1)]).unwrap();
        assert_eq!(result.get(&vid(1)).len(), 2);
        assert!(polls.is_empty());
    }

    #[test]
    fn duplicate_chit_ignored() {
        let mut polls = PollSet::new(16);
        polls.add(7, vec![peer(0), peer(1)]).unwrap();

        assert!(polls.vote(7, peer(0), &[vid(1)]).is_none());
        // Same voter again: no effect, poll still open.
        assert!(polls.vote(7, peer(0), &[vid(2)]).is_none());
        assert_eq!(polls.len(), 1);

        let result = polls.vote(7, peer(1), &[]).unwrap();
        assert_eq!(result.get(&vid(1)).len(), 1);
        assert!(result.get(&vid(2)).is_empty());
    }

    #[test]
    fn unexpected_peer_ignored() {
        let mut polls = PollSet::new(16);
        polls.add(7, vec![peer(0)]).unwrap();
        assert!(polls.vote(7, peer(9), &[vid(1)]).is_none());
        assert_eq!(polls.len(), 1);
    }

    #[test]
    fn drop_counts_as_empty_vote() {
        let mut polls = PollSet::new(16);
        polls.add(7, vec![peer(0), peer(1)]).unwrap();

        assert!(polls.vote(7, peer(0), &[vid(1)]).is_none());
        let result = polls.drop_vote(7, peer(1)).unwrap();
        assert_eq!(result.get(&vid(1)).len(), 1);
    }

    #[test]
    fn late_chit_after_finish_dropped() {
        let mut polls = PollSet::new(16);
        polls.add(7, vec![peer(0)]).unwrap();
        assert!(polls.vote(7, peer(0), &[vid(1)]).is_some());
        assert!(polls.vote(7, peer(0), &[vid(1)]).is_none());
    }

    #[test]
    fn repeated_sample_gets_two_slots() {
        let mut polls = PollSet::new(16);
        polls.add(7, vec![peer(0), peer(0)]).unwrap();

        assert!(polls.vote(7, peer(0), &[vid(1)]).is_none());
        let result = polls.vote(7, peer(0), &[vid(1)]).unwrap();
        assert_eq!(result.get(&vid(1)).len(), 2);
    }
}
