//! Outbound message surface and validator sampling.
//!
//! Every send is fire-and-forget; delivery is best-effort and the
//! engine relies on external timers to deliver `GetFailed` /
//! `QueryFailed` when a response never arrives.

use std::fmt;

use crate::vertex::VertexId;

/// Identifies a validator/node on the network (20-byte key hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Outbound network operations consumed by the engine.
pub trait Sender: Send + Sync {
    /// Query `peers` with the full vertex attached.
    fn push_query(&self, peers: &[NodeId], request_id: u32, vertex_id: VertexId, bytes: &[u8]);

    /// Query `peers` by vertex ID only.
    fn pull_query(&self, peers: &[NodeId], request_id: u32, vertex_id: VertexId);

    /// Answer a query with our current preferences.
    fn chits(&self, peer: NodeId, request_id: u32, votes: &[VertexId]);

    /// Request a vertex's bytes.
    fn get(&self, peer: NodeId, request_id: u32, vertex_id: VertexId);

    /// Deliver a vertex's bytes in response to `get`.
    fn put(&self, peer: NodeId, request_id: u32, vertex_id: VertexId, bytes: &[u8]);

    /// Request a vertex and as much of its ancestry as fits.
    fn get_ancestors(&self, peer: NodeId, request_id: u32, vertex_id: VertexId);

    /// Deliver a batch of vertices in response to `get_ancestors`.
    fn multi_put(&self, peer: NodeId, request_id: u32, vertices: &[Vec<u8>]);

    /// Answer `get_accepted_frontier`.
    fn accepted_frontier(&self, peer: NodeId, request_id: u32, vertex_ids: &[VertexId]);

    /// Answer `get_accepted`.
    fn accepted(&self, peer: NodeId, request_id: u32, vertex_ids: &[VertexId]);

    /// Broadcast a vertex to peers opportunistically.
    fn gossip(&self, vertex_id: VertexId, bytes: &[u8]);
}

/// Read access to the validator registry, which lives with the host.
pub trait Validators: Send + Sync {
    /// Sample up to `k` validators, weighted by stake. May return
    /// fewer when the registry is small.
    fn sample(&self, k: usize) -> Vec<NodeId>;
}
