//! Shared test doubles for the unit-test suites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::transaction::{Status, Tx, TxError, TxId};
use crate::{hash_domain, Hash};

/// A scriptable in-memory transaction.
///
/// Status lives in a mutex cell so the trait's `&self` transitions
/// work; `fail_verify` makes `verify` return an error.
pub struct TestTx {
    id: TxId,
    status: Mutex<Status>,
    dependencies: Vec<Arc<dyn Tx>>,
    input_ids: Vec<Hash>,
    fail_verify: bool,
    bytes: Vec<u8>,
}

impl TestTx {
    pub fn new(seed: u8) -> Self {
        TestTx {
            id: Self::id_of(seed),
            status: Mutex::new(Status::Processing),
            dependencies: Vec::new(),
            input_ids: Vec::new(),
            fail_verify: false,
            bytes: vec![seed],
        }
    }

    /// The ID `new(seed)` produces, for building expectations.
    pub fn id_of(seed: u8) -> TxId {
        TxId(hash_domain(b"floe.test.tx", &[seed]))
    }

    pub fn with_dependencies(mut self, deps: Vec<Arc<dyn Tx>>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<Hash>) -> Self {
        self.input_ids = inputs;
        self
    }

    pub fn with_status(self, status: Status) -> Self {
        *self.status.lock().unwrap() = status;
        self
    }

    pub fn failing_verify(mut self) -> Self {
        self.fail_verify = true;
        self
    }
}

impl Tx for TestTx {
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
        if self.fail_verify {
            Err(TxError::Invalid("scripted failure".into()))
        } else {
            Ok(())
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// An input key derived from a small seed, for conflict scripting.
pub fn input(seed: u8) -> Hash {
    hash_domain(b"floe.test.input", &[seed])
}

/// A VM over a fixed table of test transactions.
#[derive(Default)]
pub struct TestVm {
    txs: Mutex<HashMap<TxId, Arc<dyn Tx>>>,
    by_bytes: Mutex<HashMap<Vec<u8>, Arc<dyn Tx>>>,
    pending: Mutex<Vec<Arc<dyn Tx>>>,
    saved: Mutex<Vec<TxId>>,
}

impl TestVm {
    pub fn register(&self, tx: Arc<dyn Tx>) {
        self.by_bytes.lock().unwrap().insert(tx.bytes(), tx.clone());
        self.txs.lock().unwrap().insert(tx.id(), tx);
    }

    /// Make the tx parseable without being retrievable by ID, for
    /// exercising the "VM cannot provide" paths.
    pub fn register_bytes_only(&self, tx: Arc<dyn Tx>) {
        self.by_bytes.lock().unwrap().insert(tx.bytes(), tx);
    }

    pub fn push_pending(&self, tx: Arc<dyn Tx>) {
        self.register(tx.clone());
        self.pending.lock().unwrap().push(tx);
    }

    pub fn saved(&self) -> Vec<TxId> {
        self.saved.lock().unwrap().clone()
    }
}

impl crate::vm::Vm for TestVm {
    fn parse_tx(&self, bytes: &[u8]) -> Result<Arc<dyn Tx>, TxError> {
        self.by_bytes
            .lock()
            .unwrap()
            .get(bytes)
            .cloned()
            .ok_or_else(|| TxError::Vm("unknown tx bytes".into()))
    }

    fn get_tx(&self, id: TxId) -> Option<Arc<dyn Tx>> {
        self.txs.lock().unwrap().get(&id).cloned()
    }

    fn save_tx(&self, tx: &Arc<dyn Tx>) -> Result<(), TxError> {
        self.saved.lock().unwrap().push(tx.id());
        Ok(())
    }

    fn pending_txs(&self) -> Vec<Arc<dyn Tx>> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    fn bootstrapping(&self) {}

    fn bootstrapped(&self) {}
}

/// Records every outbound message for assertions.
#[derive(Default)]
pub struct TestSender {
    pub log: Mutex<Vec<SentMessage>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentMessage {
    PushQuery {
        peers: Vec<crate::sender::NodeId>,
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
    },
    PullQuery {
        peers: Vec<crate::sender::NodeId>,
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
    },
    Chits {
        peer: crate::sender::NodeId,
        request_id: u32,
        votes: Vec<crate::vertex::VertexId>,
    },
    Get {
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
    },
    Put {
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
    },
    GetAncestors {
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
    },
    MultiPut {
        peer: crate::sender::NodeId,
        request_id: u32,
        count: usize,
    },
    AcceptedFrontier {
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_ids: Vec<crate::vertex::VertexId>,
    },
    Accepted {
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_ids: Vec<crate::vertex::VertexId>,
    },
    Gossip {
        vertex_id: crate::vertex::VertexId,
    },
}

impl TestSender {
    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

impl crate::sender::Sender for TestSender {
    fn push_query(
        &self,
        peers: &[crate::sender::NodeId],
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
        _bytes: &[u8],
    ) {
        self.log.lock().unwrap().push(SentMessage::PushQuery {
            peers: peers.to_vec(),
            request_id,
            vertex_id,
        });
    }

    fn pull_query(
        &self,
        peers: &[crate::sender::NodeId],
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
    ) {
        self.log.lock().unwrap().push(SentMessage::PullQuery {
            peers: peers.to_vec(),
            request_id,
            vertex_id,
        });
    }

    fn chits(
        &self,
        peer: crate::sender::NodeId,
        request_id: u32,
        votes: &[crate::vertex::VertexId],
    ) {
        self.log.lock().unwrap().push(SentMessage::Chits {
            peer,
            request_id,
            votes: votes.to_vec(),
        });
    }

    fn get(&self, peer: crate::sender::NodeId, request_id: u32, vertex_id: crate::vertex::VertexId) {
        self.log.lock().unwrap().push(SentMessage::Get {
            peer,
            request_id,
            vertex_id,
        });
    }

    fn put(
        &self,
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
        _bytes: &[u8],
    ) {
        self.log.lock().unwrap().push(SentMessage::Put {
            peer,
            request_id,
            vertex_id,
        });
    }

    fn get_ancestors(
        &self,
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_id: crate::vertex::VertexId,
    ) {
        self.log.lock().unwrap().push(SentMessage::GetAncestors {
            peer,
            request_id,
            vertex_id,
        });
    }

    fn multi_put(&self, peer: crate::sender::NodeId, request_id: u32, vertices: &[Vec<u8>]) {
        self.log.lock().unwrap().push(SentMessage::MultiPut {
            peer,
            request_id,
            count: vertices.len(),
        });
    }

    fn accepted_frontier(
        &self,
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_ids: &[crate::vertex::VertexId],
    ) {
        self.log.lock().unwrap().push(SentMessage::AcceptedFrontier {
            peer,
            request_id,
            vertex_ids: vertex_ids.to_vec(),
        });
    }

    fn accepted(
        &self,
        peer: crate::sender::NodeId,
        request_id: u32,
        vertex_ids: &[crate::vertex::VertexId],
    ) {
        self.log.lock().unwrap().push(SentMessage::Accepted {
            peer,
            request_id,
            vertex_ids: vertex_ids.to_vec(),
        });
    }

    fn gossip(&self, vertex_id: crate::vertex::VertexId, _bytes: &[u8]) {
        self.log
            .lock()
            .unwrap()
            .push(SentMessage::Gossip { vertex_id });
    }
}

/// A fixed validator set sampled round-robin-free: always the first k.
pub struct TestValidators {
    pub peers: Vec<crate::sender::NodeId>,
}

impl TestValidators {
    pub fn new(n: usize) -> Self {
        TestValidators {
            peers: (0..n).map(|i| peer(i as u8)).collect(),
        }
    }
}

impl crate::sender::Validators for TestValidators {
    fn sample(&self, k: usize) -> Vec<crate::sender::NodeId> {
        self.peers.iter().copied().take(k).collect()
    }
}

/// A deterministic peer ID from a small seed.
pub fn peer(seed: u8) -> crate::sender::NodeId {
    let mut raw = [0u8; 20];
    raw[0] = seed;
    crate::sender::NodeId(raw)
}
