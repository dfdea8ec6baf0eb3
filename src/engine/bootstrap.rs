//! Persistent bootstrap job queue.
//!
//! Before consensus starts, fetched vertices and their transactions
//! are executed (verified and accepted) in dependency order. Jobs are
//! durable: bytes and blocking relations are persisted so a restart
//! resumes where it left off.
//!
//! Key layout (all integers big-endian):
//! - `0x10`             → runnable stack size (u32)
//! - `0x11 ∥ u32 index` → job ID at that stack index
//! - `0x12 ∥ job_id`    → job bytes (kind byte + payload)
//! - `0x13 ∥ id`        → IDs of jobs blocked on `id` (u32 count + 32B × count)

use std::sync::Arc;

use crate::storage::{Database, StorageError};
use crate::transaction::{Status, Tx, TxError};
use crate::vertex::{StoreError, Vertex, VertexStore};
use crate::vm::Vm;
use crate::Hash;

const STACK_SIZE_KEY: [u8; 1] = [0x10];
const STACK_INDEX_PREFIX: u8 = 0x11;
const JOB_PREFIX: u8 = 0x12;
const BLOCKING_PREFIX: u8 = 0x13;

const JOB_KIND_TX: u8 = 0x00;
const JOB_KIND_VERTEX: u8 = 0x01;

/// Errors from the bootstrap queue.
#[derive(Clone, Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("corrupt queue record: {0}")]
    Corrupt(String),
    #[error("malformed job bytes: {0}")]
    BadJob(String),
    #[error("vertex executed with unaccepted transaction {0}")]
    UnacceptedTx(crate::transaction::TxId),
}

/// One unit of bootstrap work.
pub enum BootstrapJob {
    /// Verify and accept a transaction.
    Tx(Arc<dyn Tx>),
    /// Accept a vertex once its parents and transactions have.
    Vertex(Arc<Vertex>),
}

/// What executing a job did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Executed {
    Accepted,
    /// The job could not be completed and was discarded (e.g. the VM
    /// no longer has one of the vertex's transactions).
    Dropped,
}

impl BootstrapJob {
    pub fn id(&self) -> Hash {
        match self {
            BootstrapJob::Tx(tx) => tx.id().0,
            BootstrapJob::Vertex(vtx) => vtx.id().0,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            BootstrapJob::Tx(tx) => {
                let payload = tx.bytes();
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(JOB_KIND_TX);
                out.extend_from_slice(&payload);
                out
            }
            BootstrapJob::Vertex(vtx) => {
                let mut out = Vec::with_capacity(1 + vtx.bytes().len());
                out.push(JOB_KIND_VERTEX);
                out.extend_from_slice(vtx.bytes());
                out
            }
        }
    }

    /// Dependencies that are not yet accepted.
    fn missing_dependencies(&self, store: &VertexStore) -> Vec<Hash> {
        match self {
            BootstrapJob::Tx(tx) => tx
                .dependencies()
                .iter()
                .filter(|dep| dep.status() != Status::Accepted)
                .map(|dep| dep.id().0)
                .collect(),
            BootstrapJob::Vertex(vtx) => {
                let mut missing = Vec::new();
                for parent_id in vtx.parent_ids() {
                    if store.status(*parent_id) != Status::Accepted {
                        missing.push(parent_id.0);
                    }
                }
                for tx in vtx.txs() {
                    if tx.status() != Status::Accepted {
                        missing.push(tx.id().0);
                    }
                }
                missing
            }
        }
    }

    fn execute(&self, store: &VertexStore, vm: &Arc<dyn Vm>) -> Result<Executed, QueueError> {
        match self {
            BootstrapJob::Tx(tx) => {
                if tx.status() == Status::Accepted {
                    return Ok(Executed::Accepted);
                }
                if let Err(e) = tx.verify() {
                    tracing::warn!(tx = %tx.id(), error = %e, "dropping invalid bootstrap transaction");
                    return Ok(Executed::Dropped);
                }
                tx.accept()?;
                vm.save_tx(tx)?;
                Ok(Executed::Accepted)
            }
            BootstrapJob::Vertex(vtx) => {
                if store.status(vtx.id()) == Status::Accepted {
                    return Ok(Executed::Accepted);
                }
                for tx in vtx.txs() {
                    if vm.get_tx(tx.id()).is_none() {
                        tracing::warn!(
                            vertex = %vtx.id(),
                            tx = %tx.id(),
                            "dropping bootstrap vertex whose transaction the VM cannot provide"
                        );
                        return Ok(Executed::Dropped);
                    }
                    if tx.status() != Status::Accepted {
                        return Err(QueueError::UnacceptedTx(tx.id()));
                    }
                }
                store.accept_vertex(vtx)?;
                Ok(Executed::Accepted)
            }
        }
    }
}

/// The durable queue itself: a runnable stack plus parked jobs keyed
/// by the dependency they wait on.
pub struct JobQueue {
    db: Arc<dyn Database>,
    store: Arc<VertexStore>,
    vm: Arc<dyn Vm>,
    stack_size: u32,
}

impl JobQueue {
    pub fn open(
        db: Arc<dyn Database>,
        store: Arc<VertexStore>,
        vm: Arc<dyn Vm>,
    ) -> Result<Self, QueueError> {
        let stack_size = match db.get(&STACK_SIZE_KEY)? {
            Some(bytes) => u32::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| QueueError::Corrupt("stack size record".into()))?,
            ),
            None => 0,
        };
        Ok(JobQueue {
            db,
            store,
            vm,
            stack_size,
        })
    }

    /// Enqueue a job: runnable immediately if its dependencies are all
    /// accepted, parked under them otherwise. Re-adding a known job is
    /// a no-op.
    pub fn push(&mut self, job: BootstrapJob) -> Result<bool, QueueError> {
        let id = job.id();
        if self.db.has(&prefixed(JOB_PREFIX, &id))? {
            return Ok(false);
        }
        self.db.put(&prefixed(JOB_PREFIX, &id), &job.bytes())?;

        let missing = job.missing_dependencies(&self.store);
        if missing.is_empty() {
            self.push_runnable(&id)?;
        } else {
            for dep in missing {
                self.add_blocking(&dep, &id)?;
            }
        }
        Ok(true)
    }

    pub fn has_job(&self, id: &Hash) -> Result<bool, QueueError> {
        Ok(self.db.has(&prefixed(JOB_PREFIX, id))?)
    }

    pub fn runnable_len(&self) -> u32 {
        self.stack_size
    }

    /// Run every executable job, waking parked dependents as their
    /// dependencies land. Returns the number of jobs accepted.
    pub fn execute_runnable(&mut self) -> Result<usize, QueueError> {
        let mut executed = 0;
        while let Some(id) = self.pop_runnable()? {
            let job = match self.load_job(&id)? {
                Some(job) => job,
                None => continue,
            };

            let missing = job.missing_dependencies(&self.store);
            if !missing.is_empty() {
                tracing::warn!(
                    job = %hex::encode(&id[..8]),
                    missing = missing.len(),
                    "dropping bootstrap job whose dependencies were dropped"
                );
                self.db.delete(&prefixed(JOB_PREFIX, &id))?;
                continue;
            }

            match job.execute(&self.store, &self.vm)? {
                Executed::Accepted => executed += 1,
                Executed::Dropped => {}
            }
            self.db.delete(&prefixed(JOB_PREFIX, &id))?;

            for blocked_id in self.take_blocking(&id)? {
                let blocked = match self.load_job(&blocked_id)? {
                    Some(blocked) => blocked,
                    None => continue,
                };
                let missing = blocked.missing_dependencies(&self.store);
                if missing.is_empty() {
                    self.push_runnable(&blocked_id)?;
                } else {
                    for dep in missing {
                        self.add_blocking(&dep, &blocked_id)?;
                    }
                }
            }
        }
        Ok(executed)
    }

    fn load_job(&self, id: &Hash) -> Result<Option<BootstrapJob>, QueueError> {
        let bytes = match self.db.get(&prefixed(JOB_PREFIX, id))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let (kind, payload) = bytes
            .split_first()
            .ok_or_else(|| QueueError::BadJob("empty job record".into()))?;
        let job = match *kind {
            JOB_KIND_TX => {
                let tx = self
                    .vm
                    .parse_tx(payload)
                    .map_err(|e| QueueError::BadJob(e.to_string()))?;
                BootstrapJob::Tx(tx)
            }
            JOB_KIND_VERTEX => {
                let vtx = self
                    .store
                    .parse_vertex(payload)
                    .map_err(|e| QueueError::BadJob(e.to_string()))?;
                BootstrapJob::Vertex(vtx)
            }
            other => return Err(QueueError::BadJob(format!("unknown job kind {other}"))),
        };
        Ok(Some(job))
    }

    fn push_runnable(&mut self, id: &Hash) -> Result<(), QueueError> {
        self.db.put(&stack_index_key(self.stack_size), id)?;
        self.stack_size += 1;
        self.db
            .put(&STACK_SIZE_KEY, &self.stack_size.to_be_bytes())?;
        Ok(())
    }

    fn pop_runnable(&mut self) -> Result<Option<Hash>, QueueError> {
        if self.stack_size == 0 {
            return Ok(None);
        }
        let index = self.stack_size - 1;
        let key = stack_index_key(index);
        let id = match self.db.get(&key)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| QueueError::Corrupt("stack index record".into()))?,
            None => return Err(QueueError::Corrupt(format!("missing stack index {index}"))),
        };
        self.db.delete(&key)?;
        self.stack_size = index;
        self.db
            .put(&STACK_SIZE_KEY, &self.stack_size.to_be_bytes())?;
        Ok(Some(id))
    }

    fn add_blocking(&mut self, dep: &Hash, blocked: &Hash) -> Result<(), QueueError> {
        let key = prefixed(BLOCKING_PREFIX, dep);
        let mut ids = match self.db.get(&key)? {
            Some(bytes) => decode_id_list(&bytes)?,
            None => Vec::new(),
        };
        if ids.contains(blocked) {
            return Ok(());
        }
        ids.push(*blocked);
        self.db.put(&key, &encode_id_list(&ids))?;
        Ok(())
    }

    fn take_blocking(&mut self, dep: &Hash) -> Result<Vec<Hash>, QueueError> {
        let key = prefixed(BLOCKING_PREFIX, dep);
        let ids = match self.db.get(&key)? {
            Some(bytes) => decode_id_list(&bytes)?,
            None => return Ok(Vec::new()),
        };
        self.db.delete(&key)?;
        Ok(ids)
    }
}

fn prefixed(prefix: u8, id: &Hash) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = prefix;
    key[1..].copy_from_slice(id);
    key
}

fn stack_index_key(index: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = STACK_INDEX_PREFIX;
    key[1..].copy_from_slice(&index.to_be_bytes());
    key
}

fn encode_id_list(ids: &[Hash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ids.len() * 32);
    out.extend_from_slice(&(ids.len() as u32).to_be_bytes());
    for id in ids {
        out.extend_from_slice(id);
    }
    out
}

fn decode_id_list(bytes: &[u8]) -> Result<Vec<Hash>, QueueError> {
    if bytes.len() < 4 {
        return Err(QueueError::Corrupt("blocking record too short".into()));
    }
    let count = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    if bytes.len() != 4 + count * 32 {
        return Err(QueueError::Corrupt("blocking record length mismatch".into()));
    }
    Ok(bytes[4..]
        .chunks_exact(32)
        .map(|chunk| chunk.try_into().unwrap())
        .collect())
}
