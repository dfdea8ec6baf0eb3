//! Durable vertex storage with content-addressed lookup.
//!
//! Wraps the database with an LRU cache that also records misses, so
//! repeated lookups of unknown vertices short-circuit. A vertex that
//! is persisted but fails to re-parse is logged and treated as a miss,
//! never as a fatal error.
//!
//! Key layout (all integers big-endian):
//! - `0x00 ∥ vertex_id` → vertex bytes
//! - `0x01 ∥ vertex_id` → status (u32)
//! - `0x02`             → accepted frontier (u32 count + 32B × count)

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::storage::{Database, StorageError};
use crate::transaction::{Status, Tx};
use crate::vm::Vm;
use crate::Hash;

use super::{parse, Vertex, VertexError, VertexId};

const VERTEX_PREFIX: u8 = 0x00;
const STATUS_PREFIX: u8 = 0x01;
const FRONTIER_KEY: [u8; 1] = [0x02];

/// Errors from the vertex store.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Vertex(#[from] VertexError),
    #[error("vertex {0} not found")]
    NotFound(VertexId),
    #[error("cannot build a vertex with no transactions")]
    EmptyBuild,
    #[error("unknown parent {0} while building vertex")]
    UnknownParent(VertexId),
}

enum CacheEntry {
    Vertex(Arc<Vertex>),
    Miss,
}

struct Caches {
    vertices: LruCache<VertexId, CacheEntry>,
    statuses: LruCache<VertexId, Status>,
    /// Accepted vertex IDs with no accepted children.
    frontier: BTreeSet<VertexId>,
}

/// Content-addressed vertex storage: serialization, caching, status
/// records, and the accepted-frontier record.
pub struct VertexStore {
    chain_id: Hash,
    db: Arc<dyn Database>,
    vm: Arc<dyn Vm>,
    caches: Mutex<Caches>,
}

impl VertexStore {
    /// Open the store, loading the persisted accepted frontier.
    pub fn open(
        chain_id: Hash,
        db: Arc<dyn Database>,
        vm: Arc<dyn Vm>,
        cache_size: usize,
    ) -> Result<Self, StoreError> {
        let cap = NonZeroUsize::new(cache_size.max(16)).unwrap();
        let frontier = load_frontier(db.as_ref())?;
        Ok(VertexStore {
            chain_id,
            db,
            vm,
            caches: Mutex::new(Caches {
                vertices: LruCache::new(cap),
                statuses: LruCache::new(cap),
                frontier,
            }),
        })
    }

    pub fn chain_id(&self) -> Hash {
        self.chain_id
    }

    /// Parse wire bytes into a vertex and cache it. The vertex is not
    /// persisted until it is accepted.
    pub fn parse_vertex(&self, bytes: &[u8]) -> Result<Arc<Vertex>, VertexError> {
        let vtx = parse(bytes, &self.vm)?;
        let mut caches = self.caches.lock().unwrap();
        caches
            .vertices
            .put(vtx.id(), CacheEntry::Vertex(vtx.clone()));
        Ok(vtx)
    }

    /// Build a vertex from locally chosen parents and transactions.
    ///
    /// Parents are sorted and deduplicated, transactions sorted by ID;
    /// height is 1 + the maximum parent height.
    pub fn build_vertex(
        &self,
        parent_ids: Vec<VertexId>,
        mut txs: Vec<Arc<dyn Tx>>,
    ) -> Result<Arc<Vertex>, StoreError> {
        if txs.is_empty() {
            return Err(StoreError::EmptyBuild);
        }
        let mut parents: Vec<VertexId> = parent_ids;
        parents.sort();
        parents.dedup();
        txs.sort_by_key(|tx| tx.id());
        txs.dedup_by_key(|tx| tx.id());

        let mut height = 0u64;
        for parent_id in &parents {
            let parent = self
                .vertex(*parent_id)
                .ok_or(StoreError::UnknownParent(*parent_id))?;
            height = height.max(parent.height());
        }
        if !parents.is_empty() {
            height += 1;
        }

        let vtx = Vertex::new(self.chain_id, height, parents, txs)?;
        let mut caches = self.caches.lock().unwrap();
        caches
            .vertices
            .put(vtx.id(), CacheEntry::Vertex(vtx.clone()));
        Ok(vtx)
    }

    /// Look up a vertex, consulting the cache first. Both hits and
    /// misses are cached; a persisted vertex that fails to parse is
    /// logged and reported as a miss.
    pub fn vertex(&self, id: VertexId) -> Option<Arc<Vertex>> {
        let mut caches = self.caches.lock().unwrap();
        if let Some(entry) = caches.vertices.get(&id) {
            return match entry {
                CacheEntry::Vertex(vtx) => Some(vtx.clone()),
                CacheEntry::Miss => None,
            };
        }
        drop(caches);

        let loaded = match self.db.get(&prefixed(VERTEX_PREFIX, &id.0)) {
            Ok(Some(bytes)) => match parse(&bytes, &self.vm) {
                Ok(vtx) => Some(vtx),
                Err(e) => {
                    tracing::error!(vertex = %id, error = %e, "parsing failed on saved vertex");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::error!(vertex = %id, error = %e, "database error reading vertex");
                None
            }
        };

        let mut caches = self.caches.lock().unwrap();
        match &loaded {
            Some(vtx) => caches.vertices.put(id, CacheEntry::Vertex(vtx.clone())),
            None => caches.vertices.put(id, CacheEntry::Miss),
        };
        loaded
    }

    /// Persist a vertex's bytes.
    pub fn put_vertex(&self, vtx: &Arc<Vertex>) -> Result<(), StoreError> {
        self.db
            .put(&prefixed(VERTEX_PREFIX, &vtx.id().0), vtx.bytes())?;
        let mut caches = self.caches.lock().unwrap();
        caches
            .vertices
            .put(vtx.id(), CacheEntry::Vertex(vtx.clone()));
        Ok(())
    }

    /// Remove a vertex's bytes from store and cache.
    pub fn delete_vertex(&self, id: VertexId) -> Result<(), StoreError> {
        self.db.delete(&prefixed(VERTEX_PREFIX, &id.0))?;
        let mut caches = self.caches.lock().unwrap();
        caches.vertices.put(id, CacheEntry::Miss);
        Ok(())
    }

    /// The persisted status of a vertex; `Unknown` when no record
    /// exists or the record is corrupt.
    pub fn status(&self, id: VertexId) -> Status {
        let mut caches = self.caches.lock().unwrap();
        if let Some(status) = caches.statuses.get(&id) {
            return *status;
        }
        drop(caches);

        let status = match self.db.get(&prefixed(STATUS_PREFIX, &id.0)) {
            Ok(Some(bytes)) => match <[u8; 4]>::try_from(bytes.as_slice()) {
                Ok(raw) => Status::from_u32(u32::from_be_bytes(raw)).unwrap_or_else(|| {
                    tracing::error!(vertex = %id, "unrecognized status record");
                    Status::Unknown
                }),
                Err(_) => {
                    tracing::error!(vertex = %id, "malformed status record");
                    Status::Unknown
                }
            },
            Ok(None) => Status::Unknown,
            Err(e) => {
                tracing::error!(vertex = %id, error = %e, "database error reading status");
                Status::Unknown
            }
        };

        self.caches.lock().unwrap().statuses.put(id, status);
        status
    }

    /// Persist a status record.
    pub fn set_status(&self, id: VertexId, status: Status) -> Result<(), StoreError> {
        self.db
            .put(&prefixed(STATUS_PREFIX, &id.0), &status.to_u32().to_be_bytes())?;
        self.caches.lock().unwrap().statuses.put(id, status);
        Ok(())
    }

    /// Accepted vertex IDs that have no accepted children.
    pub fn frontier(&self) -> Vec<VertexId> {
        self.caches
            .lock()
            .unwrap()
            .frontier
            .iter()
            .copied()
            .collect()
    }

    /// Accept a vertex: persist its bytes and status and splice it
    /// into the accepted frontier in place of its parents. Failures
    /// here are fatal to the engine.
    pub fn accept_vertex(&self, vtx: &Arc<Vertex>) -> Result<(), StoreError> {
        self.put_vertex(vtx)?;
        self.set_status(vtx.id(), Status::Accepted)?;

        let frontier = {
            let mut caches = self.caches.lock().unwrap();
            for parent_id in vtx.parent_ids() {
                caches.frontier.remove(parent_id);
            }
            caches.frontier.insert(vtx.id());
            caches.frontier.iter().copied().collect::<Vec<_>>()
        };
        self.persist_frontier(&frontier)
    }

    /// Reject a vertex: persist the terminal status.
    pub fn reject_vertex(&self, id: VertexId) -> Result<(), StoreError> {
        self.set_status(id, Status::Rejected)
    }

    fn persist_frontier(&self, frontier: &[VertexId]) -> Result<(), StoreError> {
        let mut bytes = Vec::with_capacity(4 + frontier.len() * 32);
        bytes.extend_from_slice(&(frontier.len() as u32).to_be_bytes());
        for id in frontier {
            bytes.extend_from_slice(&id.0);
        }
        self.db.put(&FRONTIER_KEY, &bytes)?;
        Ok(())
    }
}

fn prefixed(prefix: u8, id: &Hash) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = prefix;
    key[1..].copy_from_slice(id);
    key
}

fn load_frontier(db: &dyn Database) -> Result<BTreeSet<VertexId>, StoreError> {
    let bytes = match db.get(&FRONTIER_KEY)? {
        Some(bytes) => bytes,
        None => return Ok(BTreeSet::new()),
    };
    if bytes.len() < 4 {
        return Err(StorageError::Corrupt {
            key: "frontier".into(),
            reason: "record shorter than its count".into(),
        }
        .into());
    }
    let count = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    if bytes.len() != 4 + count * 32 {
        return Err(StorageError::Corrupt {
            key: "frontier".into(),
            reason: format!("expected {} ids, record holds {} bytes", count, bytes.len() - 4),
        }
        .into());
    }
    let mut frontier = BTreeSet::new();
    for chunk in bytes[4..].chunks_exact(32) {
        frontier.insert(VertexId(chunk.try_into().unwrap()));
    }
    Ok(frontier)
}
