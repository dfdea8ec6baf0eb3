//! The virtual machine boundary.
//!
//! The VM owns transaction semantics: parsing bytes, verifying state
//! transitions, and durably storing decided transactions. The engine
//! only sees the [`crate::transaction::Tx`] trait. Implementations
//! must be internally thread-safe; `get_tx`/`save_tx` may be called
//! both from the consensus executor and from external users.

use std::sync::Arc;

use crate::transaction::{Tx, TxError, TxId};

pub trait Vm: Send + Sync {
    /// Parse a transaction from its wire bytes.
    fn parse_tx(&self, bytes: &[u8]) -> Result<Arc<dyn Tx>, TxError>;

    /// Look up a transaction by ID.
    fn get_tx(&self, id: TxId) -> Option<Arc<dyn Tx>>;

    /// Durably store a decided transaction.
    fn save_tx(&self, tx: &Arc<dyn Tx>) -> Result<(), TxError>;

    /// Drain the set of transactions waiting to be issued. Called when
    /// the engine is notified of pending work.
    fn pending_txs(&self) -> Vec<Arc<dyn Tx>>;

    /// Lifecycle callback: the chain entered bootstrap.
    fn bootstrapping(&self);

    /// Lifecycle callback: bootstrap finished; consensus is live.
    fn bootstrapped(&self);
}
