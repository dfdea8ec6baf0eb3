#![no_main]

use std::sync::{Arc, Mutex};

use libfuzzer_sys::fuzz_target;

use floe::transaction::{Status, Tx, TxError, TxId};
use floe::vm::Vm;

/// Accepts any byte string as a transaction, so the fuzzer exercises
/// the vertex codec rather than transaction semantics.
struct OpaqueTx {
    id: TxId,
    status: Mutex<Status>,
    bytes: Vec<u8>,
}

impl Tx for OpaqueTx {
    fn id(&self) -> TxId {
        self.id
    }
    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }
    fn accept(&self) -> Result<(), TxError> {
        *self.status.lock().unwrap() = Status::Accepted;
        Ok(())
    }
    fn reject(&self) -> Result<(), TxError> {
        *self.status.lock().unwrap() = Status::Rejected;
        Ok(())
    }
    fn dependencies(&self) -> Vec<Arc<dyn Tx>> {
        Vec::new()
    }
    fn input_ids(&self) -> Vec<floe::Hash> {
        Vec::new()
    }
    fn verify(&self) -> Result<(), TxError> {
        Ok(())
    }
    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

struct OpaqueVm;

impl Vm for OpaqueVm {
    fn parse_tx(&self, bytes: &[u8]) -> Result<Arc<dyn Tx>, TxError> {
        Ok(Arc::new(OpaqueTx {
            id: TxId(floe::hash_domain(b"fuzz.tx", bytes)),
            status: Mutex::new(Status::Processing),
            bytes: bytes.to_vec(),
        }))
    }
    fn get_tx(&self, _id: TxId) -> Option<Arc<dyn Tx>> {
        None
    }
    fn save_tx(&self, _tx: &Arc<dyn Tx>) -> Result<(), TxError> {
        Ok(())
    }
    fn pending_txs(&self) -> Vec<Arc<dyn Tx>> {
        Vec::new()
    }
    fn bootstrapping(&self) {}
    fn bootstrapped(&self) {}
}

// Parsing must never panic on arbitrary bytes, and anything that
// parses must re-serialize to the identical byte string.
fuzz_target!(|data: &[u8]| {
    let vm: Arc<dyn Vm> = Arc::new(OpaqueVm);
    if let Ok(vtx) = floe::vertex::parse(data, &vm) {
        assert_eq!(vtx.bytes(), data);
    }
});
