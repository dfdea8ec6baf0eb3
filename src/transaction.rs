//! Transactions as the conflict graph sees them: opaque state
//! consumers with identity, dependencies, and consumed input keys.
//!
//! The engine never parses transaction bytes itself; the VM does. What
//! consensus needs is the narrow surface below: a stable content ID,
//! the set of state keys the transaction consumes (two transactions
//! conflict iff their input sets intersect), the transactions it
//! depends on, and the accept/reject transitions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::Hash;

/// Decision state of a transaction or vertex.
///
/// `Accepted` and `Rejected` are terminal; a status never regresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    /// Never seen, or known only by ID.
    #[default]
    Unknown,
    /// Issued into consensus, not yet decided.
    Processing,
    Accepted,
    Rejected,
}

impl Status {
    pub fn decided(&self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }

    /// Whether the object itself is locally available.
    pub fn fetched(&self) -> bool {
        !matches!(self, Status::Unknown)
    }

    /// Wire encoding, also used for the persisted status record.
    pub fn to_u32(self) -> u32 {
        match self {
            Status::Unknown => 0,
            Status::Processing => 1,
            Status::Accepted => 2,
            Status::Rejected => 3,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Status> {
        match raw {
            0 => Some(Status::Unknown),
            1 => Some(Status::Processing),
            2 => Some(Status::Accepted),
            3 => Some(Status::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unknown => "unknown",
            Status::Processing => "processing",
            Status::Accepted => "accepted",
            Status::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Unique identifier of a transaction (content hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub Hash);

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Errors surfaced by transaction transitions and verification.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxError {
    #[error("transaction failed verification: {0}")]
    Invalid(String),
    #[error("transaction {0} already decided as {1}")]
    AlreadyDecided(TxId, Status),
    #[error("transaction dependency cycle detected")]
    DependencyCycle,
    #[error("VM error: {0}")]
    Vm(String),
}

/// A transaction the conflict graph can decide on.
///
/// Implementations carry their own interior status cell; `accept` and
/// `reject` are called at most once each, on the consensus executor.
/// Once `Processing`, `dependencies` and `input_ids` are immutable.
pub trait Tx: Send + Sync {
    fn id(&self) -> TxId;

    fn status(&self) -> Status;

    /// Transition to `Accepted` and apply the state transition.
    fn accept(&self) -> Result<(), TxError>;

    /// Transition to `Rejected`.
    fn reject(&self) -> Result<(), TxError>;

    /// Transactions that must be accepted before this one.
    fn dependencies(&self) -> Vec<Arc<dyn Tx>>;

    /// State keys consumed if this transaction is accepted.
    fn input_ids(&self) -> Vec<Hash>;

    /// Check the state transition is valid. Guaranteed to be called
    /// only after every dependency has itself verified.
    fn verify(&self) -> Result<(), TxError>;

    /// Binary representation, parseable by any peer's VM.
    fn bytes(&self) -> Vec<u8>;
}

/// Sort a batch of transactions so every dependency precedes its
/// dependents (Kahn's algorithm over intra-batch dependencies).
///
/// Fails if the batch contains a dependency cycle, which a correct VM
/// never produces.
pub fn topological_sort(txs: Vec<Arc<dyn Tx>>) -> Result<Vec<Arc<dyn Tx>>, TxError> {
    let batch_ids: HashSet<TxId> = txs.iter().map(|tx| tx.id()).collect();

    let mut sorted = Vec::with_capacity(txs.len());
    let mut no_deps = Vec::new();
    let mut blocked: Vec<(Arc<dyn Tx>, HashSet<TxId>)> = Vec::new();

    for tx in txs {
        let deps: HashSet<TxId> = tx
            .dependencies()
            .iter()
            .map(|dep| dep.id())
            .filter(|dep| batch_ids.contains(dep))
            .collect();
        if deps.is_empty() {
            no_deps.push(tx);
        } else {
            blocked.push((tx, deps));
        }
    }

    while let Some(tx) = no_deps.pop() {
        let done = tx.id();
        sorted.push(tx);
        let mut i = 0;
        while i < blocked.len() {
            blocked[i].1.remove(&done);
            if blocked[i].1.is_empty() {
                no_deps.push(blocked.swap_remove(i).0);
            } else {
                i += 1;
            }
        }
    }

    if !blocked.is_empty() {
        return Err(TxError::DependencyCycle);
    }
    Ok(sorted)
}
