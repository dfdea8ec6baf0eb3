//! The consensus core: the conflict graph over transactions
//! (`snowstorm`) and the topological vote engine over the vertex DAG
//! (`avalanche`).

pub mod avalanche;
pub mod snowstorm;

pub use avalanche::Topological;
pub use snowstorm::ConflictGraph;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::transaction::{Tx, TxError};
use crate::vertex::{StoreError, VertexId};

/// Errors escaping the consensus core. Anything here is fatal to the
/// instance: it means an accept/reject transition or its persistence
/// failed midway.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("processing vertex {0} missing from the node map")]
    MissingVertex(VertexId),
}

/// What one consensus operation decided: terminal vertices, plus the
/// accepted transactions the caller must hand to the VM's durable
/// store.
#[derive(Clone, Default)]
pub struct Decided {
    pub accepted: HashSet<VertexId>,
    pub rejected: HashSet<VertexId>,
    pub accepted_txs: Vec<Arc<dyn Tx>>,
}

impl Decided {
    pub fn union(&mut self, other: Decided) {
        self.accepted.extend(other.accepted);
        self.rejected.extend(other.rejected);
        self.accepted_txs.extend(other.accepted_txs);
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }
}

impl fmt::Debug for Decided {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decided")
            .field("accepted", &self.accepted)
            .field("rejected", &self.rejected)
            .field("accepted_txs", &self.accepted_txs.len())
            .finish()
    }
}
