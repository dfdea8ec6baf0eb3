//! Shared fixtures for the end-to-end scenarios: a scriptable VM, a
//! recording sender, and a fixed validator set, all built on the
//! crate's public traits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use floe::sender::{NodeId, Sender, Validators};
use floe::transaction::{Status, Tx, TxError, TxId};
use floe::vertex::VertexId;
use floe::vm::Vm;
use floe::{hash_domain, Hash};

/// A transaction with a scriptable status cell.
pub struct ScriptedTx {
    id: TxId,
    status: Mutex<Status>,
    dependencies: Vec<Arc<dyn Tx>>,
    input_ids: Vec<Hash>,
    bytes: Vec<u8>,
}

impl ScriptedTx {
    pub fn new(seed: u8) -> Self {
        ScriptedTx {
            id: TxId(hash_domain(b"floe.e2e.tx", &[seed])),
            status: Mutex::new(Status::Processing),
            dependencies: Vec::new(),
            input_ids: Vec::new(),
            bytes: vec![seed],
        }
    }

    pub fn with_inputs(mut self, seeds: &[u8]) -> Self {
        self.input_ids = seeds
            .iter()
            .map(|s| hash_domain(b"floe.e2e.input", &[*s]))
            .collect();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Arc<dyn Tx>>) -> Self {
        self.dependencies = deps;
        self
    }
}

impl Tx for ScriptedTx {
    fn id(&self) -> TxId {
        self.id
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    fn accept(&self) -> Result<(), TxError> {
        let mut status = self.status.lock().unwrap();
        if status.decided() {
            return Err(TxError::AlreadyDecided(self.id, *status));
        }
        *status = Status::Accepted;
        Ok(())
    }

    fn reject(&self) -> Result<(), TxError> {
        let mut status = self.status.lock().unwrap();
        if status.decided() {
            return Err(TxError::AlreadyDecided(self.id, *status));
        }
        *status = Status::Rejected;
        Ok(())
    }

    fn dependencies(&self) -> Vec<Arc<dyn Tx>> {
        self.dependencies.clone()
    }

    fn input_ids(&self) -> Vec<Hash> {
        self.input_ids.clone()
    }

    fn verify(&self) -> Result<(), TxError> {
        Ok(())
    }

    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// A VM over a fixed table of scripted transactions.
#[derive(Default)]
pub struct ScriptedVm {
    by_id: Mutex<HashMap<TxId, Arc<dyn Tx>>>,
    by_bytes: Mutex<HashMap<Vec<u8>, Arc<dyn Tx>>>,
    pending: Mutex<Vec<Arc<dyn Tx>>>,
}

impl ScriptedVm {
    pub fn register(&self, tx: Arc<dyn Tx>) {
        self.by_bytes.lock().unwrap().insert(tx.bytes(), tx.clone());
        self.by_id.lock().unwrap().insert(tx.id(), tx);
    }

    pub fn push_pending(&self, tx: Arc<dyn Tx>) {
        self.register(tx.clone());
        self.pending.lock().unwrap().push(tx);
    }
}

impl Vm for ScriptedVm {
    fn parse_tx(&self, bytes: &[u8]) -> Result<Arc<dyn Tx>, TxError> {
        self.by_bytes
            .lock()
            .unwrap()
            .get(bytes)
            .cloned()
            .ok_or_else(|| TxError::Vm("unknown tx bytes".into()))
    }

    fn get_tx(&self, id: TxId) -> Option<Arc<dyn Tx>> {
        self.by_id.lock().unwrap().get(&id).cloned()
    }

    fn save_tx(&self, _tx: &Arc<dyn Tx>) -> Result<(), TxError> {
        Ok(())
    }

    fn pending_txs(&self) -> Vec<Arc<dyn Tx>> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    fn bootstrapping(&self) {}

    fn bootstrapped(&self) {}
}

/// Every message the engine sent, for assertions.
#[derive(Clone, Debug)]
pub enum Sent {
    PushQuery {
        request_id: u32,
        vertex_id: VertexId,
        bytes: Vec<u8>,
    },
    PullQuery {
        request_id: u32,
        vertex_id: VertexId,
    },
    Chits {
        peer: NodeId,
        request_id: u32,
        votes: Vec<VertexId>,
    },
    Get {
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
    },
    Put {
        request_id: u32,
        vertex_id: VertexId,
    },
    GetAncestors {
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
    },
    MultiPut {
        request_id: u32,
        count: usize,
    },
    AcceptedFrontier {
        request_id: u32,
        vertex_ids: Vec<VertexId>,
    },
    Accepted {
        request_id: u32,
        vertex_ids: Vec<VertexId>,
    },
    Gossip {
        vertex_id: VertexId,
    },
}

#[derive(Default)]
pub struct RecordingSender {
    log: Mutex<Vec<Sent>>,
}

impl RecordingSender {
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    fn push(&self, sent: Sent) {
        self.log.lock().unwrap().push(sent);
    }
}

impl Sender for RecordingSender {
    fn push_query(&self, _peers: &[NodeId], request_id: u32, vertex_id: VertexId, bytes: &[u8]) {
        self.push(Sent::PushQuery {
            request_id,
            vertex_id,
            bytes: bytes.to_vec(),
        });
    }

    fn pull_query(&self, _peers: &[NodeId], request_id: u32, vertex_id: VertexId) {
        self.push(Sent::PullQuery {
            request_id,
            vertex_id,
        });
    }

    fn chits(&self, peer: NodeId, request_id: u32, votes: &[VertexId]) {
        self.push(Sent::Chits {
            peer,
            request_id,
            votes: votes.to_vec(),
        });
    }

    fn get(&self, peer: NodeId, request_id: u32, vertex_id: VertexId) {
        self.push(Sent::Get {
            peer,
            request_id,
            vertex_id,
        });
    }

    fn put(&self, _peer: NodeId, request_id: u32, vertex_id: VertexId, _bytes: &[u8]) {
        self.push(Sent::Put {
            request_id,
            vertex_id,
        });
    }

    fn get_ancestors(&self, peer: NodeId, request_id: u32, vertex_id: VertexId) {
        self.push(Sent::GetAncestors {
            peer,
            request_id,
            vertex_id,
        });
    }

    fn multi_put(&self, _peer: NodeId, request_id: u32, vertices: &[Vec<u8>]) {
        self.push(Sent::MultiPut {
            request_id,
            count: vertices.len(),
        });
    }

    fn accepted_frontier(&self, _peer: NodeId, request_id: u32, vertex_ids: &[VertexId]) {
        self.push(Sent::AcceptedFrontier {
            request_id,
            vertex_ids: vertex_ids.to_vec(),
        });
    }

    fn accepted(&self, _peer: NodeId, request_id: u32, vertex_ids: &[VertexId]) {
        self.push(Sent::Accepted {
            request_id,
            vertex_ids: vertex_ids.to_vec(),
        });
    }

    fn gossip(&self, vertex_id: VertexId, _bytes: &[u8]) {
        self.push(Sent::Gossip { vertex_id });
    }
}

/// A fixed validator set; sampling returns the first `k` peers.
pub struct FixedValidators {
    peers: Vec<NodeId>,
}

impl FixedValidators {
    pub fn new(n: usize) -> Self {
        FixedValidators {
            peers: (0..n).map(|i| validator(i as u8)).collect(),
        }
    }
}

impl Validators for FixedValidators {
    fn sample(&self, k: usize) -> Vec<NodeId> {
        self.peers.iter().copied().take(k).collect()
    }
}

pub fn validator(seed: u8) -> NodeId {
    let mut raw = [0u8; 20];
    raw[0] = seed;
    NodeId(raw)
}
