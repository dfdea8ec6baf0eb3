//! DAG vertices: content-addressed batches of transactions.
//!
//! A vertex commits to a chain, a height (1 + max parent height), a
//! sorted set of parent vertex IDs, and a non-empty sorted batch of
//! transactions. The wire format is bit-exact and versioned; any
//! deviation is a parse error and the message is dropped.

pub mod store;

use std::fmt;
use std::sync::Arc;

use crate::constants::{CODEC_VERSION, MAX_VERTEX_SIZE, VERTEX_EPOCH};
use crate::transaction::Tx;
use crate::vm::Vm;
use crate::{hash_vertex, Hash};

pub use store::{StoreError, VertexStore};

/// Unique identifier for a vertex (content hash of its bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub Hash);

impl fmt::Debug for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VertexId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Errors related to vertex structure and serialization.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VertexError {
    #[error("vertex exceeds maximum size ({0} bytes)")]
    TooLarge(usize),
    #[error("unsupported codec version {0}")]
    BadCodecVersion(u16),
    #[error("reserved epoch field is non-zero ({0})")]
    NonZeroEpoch(u32),
    #[error("truncated vertex bytes")]
    Truncated,
    #[error("{0} unused trailing bytes")]
    TrailingBytes(usize),
    #[error("parent IDs are not sorted and unique")]
    InvalidParents,
    #[error("vertex has no transactions")]
    NoTxs,
    #[error("transactions are not sorted by ID and unique")]
    InvalidTxs,
    #[error("vertex contains conflicting transactions")]
    ConflictingTxs,
    #[error("non-genesis vertex has no parents")]
    NoParents,
    #[error("transaction failed to parse: {0}")]
    BadTx(String),
}

/// A vertex in the consensus DAG.
///
/// Content is immutable after construction; decision status lives in
/// the vertex store and the consensus engine's processing maps.
pub struct Vertex {
    id: VertexId,
    chain_id: Hash,
    height: u64,
    parent_ids: Vec<VertexId>,
    txs: Vec<Arc<dyn Tx>>,
    bytes: Vec<u8>,
}

impl Vertex {
    /// Assemble and serialize a vertex from already-sorted parts.
    ///
    /// `parent_ids` must be sorted and unique and `txs` sorted by ID
    /// and unique; `build` in the store handles the sorting for
    /// locally created vertices.
    pub fn new(
        chain_id: Hash,
        height: u64,
        parent_ids: Vec<VertexId>,
        txs: Vec<Arc<dyn Tx>>,
    ) -> Result<Arc<Vertex>, VertexError> {
        let bytes = marshal(&chain_id, height, &parent_ids, &txs)?;
        let id = VertexId(hash_vertex(&bytes));
        let vtx = Vertex {
            id,
            chain_id,
            height,
            parent_ids,
            txs,
            bytes,
        };
        vtx.verify()?;
        Ok(Arc::new(vtx))
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn chain_id(&self) -> Hash {
        self.chain_id
    }

    /// 1 + the maximum height of the parents; genesis vertices are 0.
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn parent_ids(&self) -> &[VertexId] {
        &self.parent_ids
    }

    pub fn txs(&self) -> &[Arc<dyn Tx>] {
        &self.txs
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Structural validity: sorted unique parents, non-empty sorted
    /// unique transactions, and no two transactions consuming the same
    /// state key.
    pub fn verify(&self) -> Result<(), VertexError> {
        if !is_sorted_and_unique(&self.parent_ids) {
            return Err(VertexError::InvalidParents);
        }
        if self.txs.is_empty() {
            return Err(VertexError::NoTxs);
        }
        if self.parent_ids.is_empty() && self.height != 0 {
            return Err(VertexError::NoParents);
        }
        let tx_ids: Vec<_> = self.txs.iter().map(|tx| tx.id()).collect();
        if !is_sorted_and_unique(&tx_ids) {
            return Err(VertexError::InvalidTxs);
        }

        let mut consumed = std::collections::HashSet::new();
        for tx in &self.txs {
            for input in tx.input_ids() {
                if !consumed.insert(input) {
                    return Err(VertexError::ConflictingTxs);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("id", &self.id)
            .field("height", &self.height)
            .field("parents", &self.parent_ids.len())
            .field("txs", &self.txs.len())
            .finish()
    }
}

fn is_sorted_and_unique<T: Ord>(items: &[T]) -> bool {
    items.windows(2).all(|w| w[0] < w[1])
}

/// Pack the wire representation:
///
/// ```text
/// u16 codec_version = 0
/// 32B chain_id
/// u64 height
/// u32 epoch = 0
/// u32 parent_count, then 32B x parent_count parent IDs
/// u32 tx_count, then (u32 len, tx bytes) x tx_count
/// ```
///
/// All integers big-endian. Total size capped at 1 MiB.
fn marshal(
    chain_id: &Hash,
    height: u64,
    parent_ids: &[VertexId],
    txs: &[Arc<dyn Tx>],
) -> Result<Vec<u8>, VertexError> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(&CODEC_VERSION.to_be_bytes());
    out.extend_from_slice(chain_id);
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&VERTEX_EPOCH.to_be_bytes());

    out.extend_from_slice(&(parent_ids.len() as u32).to_be_bytes());
    for parent_id in parent_ids {
        out.extend_from_slice(&parent_id.0);
    }

    out.extend_from_slice(&(txs.len() as u32).to_be_bytes());
    for tx in txs {
        let tx_bytes = tx.bytes();
        out.extend_from_slice(&(tx_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&tx_bytes);
    }

    if out.len() > MAX_VERTEX_SIZE {
        return Err(VertexError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Parse a vertex from wire bytes, delegating transaction payloads to
/// the VM. Rejects oversized input, a wrong codec version, a non-zero
/// epoch, and unused trailing bytes.
pub fn parse(bytes: &[u8], vm: &Arc<dyn Vm>) -> Result<Arc<Vertex>, VertexError> {
    if bytes.len() > MAX_VERTEX_SIZE {
        return Err(VertexError::TooLarge(bytes.len()));
    }
    let mut r = Reader::new(bytes);

    let version = r.u16()?;
    if version != CODEC_VERSION {
        return Err(VertexError::BadCodecVersion(version));
    }
    let chain_id: Hash = r.array()?;
    let height = r.u64()?;
    let epoch = r.u32()?;
    if epoch != VERTEX_EPOCH {
        return Err(VertexError::NonZeroEpoch(epoch));
    }

    let parent_count = r.u32()? as usize;
    let mut parent_ids = Vec::with_capacity(parent_count.min(1024));
    for _ in 0..parent_count {
        parent_ids.push(VertexId(r.array()?));
    }

    let tx_count = r.u32()? as usize;
    let mut txs: Vec<Arc<dyn Tx>> = Vec::with_capacity(tx_count.min(1024));
    for _ in 0..tx_count {
        let len = r.u32()? as usize;
        let tx_bytes = r.slice(len)?;
        let tx = vm
            .parse_tx(tx_bytes)
            .map_err(|e| VertexError::BadTx(e.to_string()))?;
        txs.push(tx);
    }

    let remaining = r.remaining();
    if remaining != 0 {
        return Err(VertexError::TrailingBytes(remaining));
    }

    let vtx = Vertex {
        id: VertexId(hash_vertex(bytes)),
        chain_id,
        height,
        parent_ids,
        txs,
        bytes: bytes.to_vec(),
    };
    vtx.verify()?;
    Ok(Arc::new(vtx))
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, offset: 0 }
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8], VertexError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(VertexError::Truncated)?;
        let out = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], VertexError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, VertexError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, VertexError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, VertexError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{input, TestTx, TestVm};
    use crate::vm::Vm;

    fn test_vm_with(txs: &[Arc<dyn Tx>]) -> Arc<dyn Vm> {
        let vm = TestVm::default();
        for tx in txs {
            vm.register(tx.clone());
        }
        Arc::new(vm)
    }

    fn sorted_txs(seeds: &[u8]) -> Vec<Arc<dyn Tx>> {
        let mut txs: Vec<Arc<dyn Tx>> = seeds
            .iter()
            .map(|&s| {
                Arc::new(TestTx::new(s).with_inputs(vec![input(s)])) as Arc<dyn Tx>
            })
            .collect();
        txs.sort_by_key(|tx| tx.id());
        txs
    }

    #[test]
    fn roundtrip_identity() {
        let txs = sorted_txs(&[1, 2, 3]);
        let vm = test_vm_with(&txs);
        let mut parents = vec![VertexId([1u8; 32]), VertexId([2u8; 32])];
        parents.sort();

        let vtx = Vertex::new([7u8; 32], 4, parents.clone(), txs).unwrap();
        let parsed = parse(vtx.bytes(), &vm).unwrap();

        assert_eq!(parsed.id(), vtx.id());
        assert_eq!(parsed.height(), 4);
        assert_eq!(parsed.chain_id(), [7u8; 32]);
        assert_eq!(parsed.parent_ids(), &parents[..]);
        assert_eq!(parsed.bytes(), vtx.bytes());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let txs = sorted_txs(&[1]);
        let vm = test_vm_with(&txs);
        let vtx = Vertex::new([0u8; 32], 1, vec![VertexId([9u8; 32])], txs).unwrap();

        let mut bytes = vtx.bytes().to_vec();
        bytes.push(0);
        assert!(matches!(
            parse(&bytes, &vm),
            Err(VertexError::TrailingBytes(1))
        ));
    }

    #[test]
    fn rejects_wrong_codec_version() {
        let txs = sorted_txs(&[1]);
        let vm = test_vm_with(&txs);
        let vtx = Vertex::new([0u8; 32], 1, vec![VertexId([9u8; 32])], txs).unwrap();

        let mut bytes = vtx.bytes().to_vec();
        bytes[0] = 0xff;
        assert!(matches!(
            parse(&bytes, &vm),
            Err(VertexError::BadCodecVersion(_))
        ));
    }

    #[test]
    fn rejects_nonzero_epoch() {
        let txs = sorted_txs(&[1]);
        let vm = test_vm_with(&txs);
        let vtx = Vertex::new([0u8; 32], 1, vec![VertexId([9u8; 32])], txs).unwrap();

        // epoch lives after version (2) + chain id (32) + height (8)
        let mut bytes = vtx.bytes().to_vec();
        bytes[2 + 32 + 8 + 3] = 1;
        assert!(matches!(
            parse(&bytes, &vm),
            Err(VertexError::NonZeroEpoch(1))
        ));
    }

    #[test]
    fn rejects_truncation() {
        let txs = sorted_txs(&[1]);
        let vm = test_vm_with(&txs);
        let vtx = Vertex::new([0u8; 32], 1, vec![VertexId([9u8; 32])], txs).unwrap();

        let bytes = vtx.bytes();
        for cut in [1, 10, bytes.len() / 2, bytes.len() - 1] {
            assert!(parse(&bytes[..cut], &vm).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn rejects_empty_tx_list() {
        let err = Vertex::new([0u8; 32], 1, vec![VertexId([9u8; 32])], vec![]).unwrap_err();
        assert!(matches!(err, VertexError::NoTxs));
    }

    #[test]
    fn rejects_zero_parents_above_genesis() {
        let txs = sorted_txs(&[1]);
        let err = Vertex::new([0u8; 32], 1, vec![], txs).unwrap_err();
        assert!(matches!(err, VertexError::NoParents));
    }

    #[test]
    fn genesis_height_zero_without_parents_is_valid() {
        let txs = sorted_txs(&[1]);
        assert!(Vertex::new([0u8; 32], 0, vec![], txs).is_ok());
    }

    #[test]
    fn rejects_unsorted_parents() {
        let txs = sorted_txs(&[1]);
        let parents = vec![VertexId([2u8; 32]), VertexId([1u8; 32])];
        let err = Vertex::new([0u8; 32], 1, parents, txs).unwrap_err();
        assert!(matches!(err, VertexError::InvalidParents));
    }

    #[test]
    fn rejects_duplicate_parents() {
        let txs = sorted_txs(&[1]);
        let parents = vec![VertexId([1u8; 32]), VertexId([1u8; 32])];
        let err = Vertex::new([0u8; 32], 1, parents, txs).unwrap_err();
        assert!(matches!(err, VertexError::InvalidParents));
    }

    #[test]
    fn rejects_internally_conflicting_txs() {
        let shared = input(42);
        let mut txs: Vec<Arc<dyn Tx>> = vec![
            Arc::new(TestTx::new(1).with_inputs(vec![shared])),
            Arc::new(TestTx::new(2).with_inputs(vec![shared])),
        ];
        txs.sort_by_key(|tx| tx.id());
        let err = Vertex::new([0u8; 32], 1, vec![VertexId([9u8; 32])], txs).unwrap_err();
        assert!(matches!(err, VertexError::ConflictingTxs));
    }

    #[test]
    fn parse_arbitrary_garbage_never_panics() {
        let vm = test_vm_with(&[]);
        for len in 0..64 {
            let garbage: Vec<u8> = (0..len).map(|i| (i * 37) as u8).collect();
            let _ = parse(&garbage, &vm);
        }
    }
}
