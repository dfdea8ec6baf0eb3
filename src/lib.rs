//! # Floe
//!
//! A metastable consensus engine for a DAG of transaction-batching
//! vertices (the Avalanche protocol family):
//! - **Conflict graph** — per-transaction confidence counters over a
//!   directed graph of spend conflicts, with repeated-poll acceptance
//! - **Topological DAG engine** — vertex-level votes bubbled down to
//!   transactions by a two-pass topological walk
//! - **Transitive engine** — queries, chit handling, dependency parking,
//!   and the bootstrap-to-steady-state hand-off
//! - **Durable vertex store** — content-addressed vertices with a
//!   bit-exact wire codec and a persisted accepted frontier
//!
//! The network, transaction VM, and validator registry are host
//! concerns reached through the [`sender::Sender`], [`vm::Vm`], and
//! [`sender::Validators`] traits. All consensus state is owned by a
//! single [`engine::Transitive`] driven from one logical executor
//! ([`runner::Runner`]).

pub mod bag;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod events;
pub mod runner;
pub mod sender;
pub mod storage;
pub mod transaction;
pub mod vertex;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;

/// Protocol constants
pub mod constants {
    /// Maximum serialized size of a vertex in bytes (1 MiB)
    pub const MAX_VERTEX_SIZE: usize = 1 << 20;
    /// Wire codec version; parsing rejects anything else
    pub const CODEC_VERSION: u16 = 0;
    /// Vertex epoch field; reserved, always zero in the current codec
    pub const VERTEX_EPOCH: u32 = 0;
    /// Default number of validators sampled per query
    pub const DEFAULT_K: usize = 20;
    /// Default vote threshold for a preference to count in one poll
    pub const DEFAULT_ALPHA: usize = 15;
    /// Default consecutive-success threshold for unconflicted txs
    pub const DEFAULT_BETA_VIRTUOUS: u64 = 15;
    /// Default consecutive-success threshold for conflicted txs
    pub const DEFAULT_BETA_ROGUE: u64 = 20;
    /// Default number of simultaneously outstanding repolls
    pub const DEFAULT_CONCURRENT_REPOLLS: usize = 4;
    /// Default maximum transactions per locally built vertex
    pub const DEFAULT_BATCH_SIZE: usize = 30;
    /// Default maximum parents per locally built vertex
    pub const DEFAULT_PARENTS: usize = 5;
    /// Default vertex LRU cache capacity
    pub const DEFAULT_VERTEX_CACHE_SIZE: usize = 2048;
    /// Default transaction pin cache capacity hint
    pub const DEFAULT_TX_CACHE_SIZE: usize = 8192;
    /// Soft cap on outstanding vertex fetches
    pub const MAX_OUTSTANDING_GETS: usize = 1024;
    /// Soft cap on simultaneously in-flight polls
    pub const MAX_OUTSTANDING_POLLS: usize = 256;
    /// Maximum vertices returned by one ancestors request
    pub const MAX_ANCESTORS_PER_REQUEST: usize = 2048;
    /// Soft byte budget for one ancestors response
    pub const MAX_ANCESTORS_RESPONSE_BYTES: usize = 2 * 1024 * 1024;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all floe domains use ASCII).
/// Panics at runtime if it is not; that is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Content hash of a serialized vertex; vertex IDs are derived from this.
pub fn hash_vertex(bytes: &[u8]) -> Hash {
    hash_domain(b"floe.vertex.id", bytes)
}
