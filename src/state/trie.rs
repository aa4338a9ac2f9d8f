//! Trie capabilities consumed by the state database, with in-memory
//! implementations.
//!
//! The state layer never sees trie internals: it drives account and storage
//! tries through [`Trie`], opens them through [`StateDatabase`], and pins
//! reachable nodes through [`TrieDatabase`] reference counting. The
//! `Memory*` implementations back tests and standalone use; their root is a
//! deterministic keccak accumulation over the sorted key/value pairs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use primitive_types::H256;

use crate::error::Result;
use crate::state::account::{keccak256, EMPTY_ROOT};
use crate::Error;

/// Callback invoked per committed leaf with the leaf value and the hash of
/// its parent node.
pub type LeafCallback<'a> = dyn FnMut(&[u8], H256) -> Result<()> + 'a;

/// A Merkle trie handle.
pub trait Trie: Send {
    fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn try_update(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn try_delete(&mut self, key: &[u8]) -> Result<()>;

    /// Merkle proof for `key`, outermost node first.
    fn prove(&self, key: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Root hash of the current (uncommitted) contents.
    fn hash(&self) -> H256;

    /// Persists the trie and returns its root. `on_leaf` runs once per leaf
    /// so the caller can reference child structures.
    fn commit(&mut self, on_leaf: &mut LeafCallback) -> Result<H256>;

    fn clone_box(&self) -> Box<dyn Trie>;
}

/// The low-level node store backing the tries; owns reference counting of
/// trie nodes.
pub trait TrieDatabase: Send + Sync {
    /// Stores an opaque blob (contract code) under its hash.
    fn insert_blob(&self, hash: H256, bytes: &[u8]);

    /// Records that `child` is reachable from `parent`, pinning it.
    fn reference(&self, child: H256, parent: H256);
}

/// Opens account and storage tries and resolves contract code.
pub trait StateDatabase: Send + Sync {
    fn open_trie(&self, root: H256) -> Result<Box<dyn Trie>>;
    fn open_storage_trie(&self, addr_hash: H256, root: H256) -> Result<Box<dyn Trie>>;

    fn copy_trie(&self, trie: &dyn Trie) -> Box<dyn Trie> {
        trie.clone_box()
    }

    fn contract_code(&self, addr_hash: H256, code_hash: H256) -> Result<Vec<u8>>;

    fn contract_code_size(&self, addr_hash: H256, code_hash: H256) -> Result<usize> {
        Ok(self.contract_code(addr_hash, code_hash)?.len())
    }

    fn trie_db(&self) -> Arc<dyn TrieDatabase>;
}

/// Committed trie contents addressable by root.
#[derive(Default)]
struct SnapshotStore {
    snapshots: Mutex<HashMap<H256, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

/// In-memory trie. The root is `keccak(keccak(k1) || keccak(v1) || ...)`
/// over the pairs in key order, with the empty trie pinned to the canonical
/// empty root.
pub struct MemoryTrie {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    store: Arc<SnapshotStore>,
}

impl MemoryTrie {
    fn new(store: Arc<SnapshotStore>) -> Self {
        Self {
            data: BTreeMap::new(),
            store,
        }
    }

    fn from_snapshot(store: Arc<SnapshotStore>, root: H256) -> Result<Self> {
        let snapshots = store.snapshots.lock()?;
        let data = snapshots.get(&root).cloned().ok_or(Error::NotFound)?;
        drop(snapshots);
        Ok(Self { data, store })
    }
}

impl Trie for MemoryTrie {
    fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn try_update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn try_delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn prove(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut proof = vec![self.hash().as_bytes().to_vec()];
        if let Some(value) = self.data.get(key) {
            proof.push(value.clone());
        }
        Ok(proof)
    }

    fn hash(&self) -> H256 {
        if self.data.is_empty() {
            return *EMPTY_ROOT;
        }
        use sha3::{Digest, Keccak256};
        let mut hasher = Keccak256::new();
        for (key, value) in &self.data {
            hasher.update(keccak256(key).as_bytes());
            hasher.update(keccak256(value).as_bytes());
        }
        H256::from_slice(&hasher.finalize())
    }

    fn commit(&mut self, on_leaf: &mut LeafCallback) -> Result<H256> {
        let root = self.hash();
        for value in self.data.values() {
            on_leaf(value, root)?;
        }
        self.store.snapshots.lock()?.insert(root, self.data.clone());
        Ok(root)
    }

    fn clone_box(&self) -> Box<dyn Trie> {
        Box::new(MemoryTrie {
            data: self.data.clone(),
            store: self.store.clone(),
        })
    }
}

/// Node store that records blobs and references; doubles as the observer
/// for commit-time reference counting in tests.
#[derive(Default)]
pub struct MemoryTrieDatabase {
    blobs: Mutex<HashMap<H256, Vec<u8>>>,
    references: Mutex<Vec<(H256, H256)>>,
}

impl MemoryTrieDatabase {
    pub fn blob(&self, hash: &H256) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.get(hash).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// All `(child, parent)` references recorded so far, in order.
    pub fn references(&self) -> Vec<(H256, H256)> {
        self.references.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn reference_count(&self, child: &H256) -> usize {
        self.references
            .lock()
            .map(|r| r.iter().filter(|(c, _)| c == child).count())
            .unwrap_or(0)
    }
}

impl TrieDatabase for MemoryTrieDatabase {
    fn insert_blob(&self, hash: H256, bytes: &[u8]) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(hash, bytes.to_vec());
        }
    }

    fn reference(&self, child: H256, parent: H256) {
        if let Ok(mut references) = self.references.lock() {
            references.push((child, parent));
        }
    }
}

/// In-memory state database: root-addressed trie snapshots plus a blob
/// store for contract code.
pub struct MemoryStateDatabase {
    store: Arc<SnapshotStore>,
    trie_db: Arc<MemoryTrieDatabase>,
}

impl Default for MemoryStateDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateDatabase {
    pub fn new() -> Self {
        Self {
            store: Arc::new(SnapshotStore::default()),
            trie_db: Arc::new(MemoryTrieDatabase::default()),
        }
    }

    /// Concrete handle to the node store, exposing the recorded blobs and
    /// references.
    pub fn trie_database(&self) -> &Arc<MemoryTrieDatabase> {
        &self.trie_db
    }
}

impl StateDatabase for MemoryStateDatabase {
    fn open_trie(&self, root: H256) -> Result<Box<dyn Trie>> {
        if root == H256::zero() || root == *EMPTY_ROOT {
            return Ok(Box::new(MemoryTrie::new(self.store.clone())));
        }
        Ok(Box::new(MemoryTrie::from_snapshot(
            self.store.clone(),
            root,
        )?))
    }

    fn open_storage_trie(&self, _addr_hash: H256, root: H256) -> Result<Box<dyn Trie>> {
        self.open_trie(root)
    }

    fn contract_code(&self, _addr_hash: H256, code_hash: H256) -> Result<Vec<u8>> {
        self.trie_db.blob(&code_hash).ok_or(Error::NotFound)
    }

    fn trie_db(&self) -> Arc<dyn TrieDatabase> {
        self.trie_db.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_trie_has_canonical_root() {
        let db = MemoryStateDatabase::new();
        let trie = db.open_trie(H256::zero()).expect("open");
        assert_eq!(trie.hash(), *EMPTY_ROOT);
    }

    #[test]
    fn test_hash_is_content_determined() {
        let db = MemoryStateDatabase::new();
        let mut a = db.open_trie(H256::zero()).expect("open");
        let mut b = db.open_trie(H256::zero()).expect("open");

        a.try_update(b"k1", b"v1").unwrap();
        a.try_update(b"k2", b"v2").unwrap();
        // Same contents, different insertion order.
        b.try_update(b"k2", b"v2").unwrap();
        b.try_update(b"k1", b"v1").unwrap();
        assert_eq!(a.hash(), b.hash());

        b.try_delete(b"k2").unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_commit_then_reopen_at_root() {
        let db = MemoryStateDatabase::new();
        let mut trie = db.open_trie(H256::zero()).expect("open");
        trie.try_update(b"key", b"value").unwrap();
        let root = trie.commit(&mut |_, _| Ok(())).expect("commit");

        let reopened = db.open_trie(root).expect("reopen");
        assert_eq!(reopened.try_get(b"key").unwrap(), Some(b"value".to_vec()));

        assert!(matches!(
            db.open_trie(keccak256(b"unknown root")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_commit_runs_leaf_callback() {
        let db = MemoryStateDatabase::new();
        let mut trie = db.open_trie(H256::zero()).expect("open");
        trie.try_update(b"k1", b"v1").unwrap();
        trie.try_update(b"k2", b"v2").unwrap();

        let mut leaves = Vec::new();
        let root = trie
            .commit(&mut |leaf, parent| {
                leaves.push((leaf.to_vec(), parent));
                Ok(())
            })
            .expect("commit");

        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|(_, parent)| *parent == root));
    }

    #[test]
    fn test_trie_db_records_blobs_and_references() {
        let db = MemoryStateDatabase::new();
        let trie_db = db.trie_database().clone();

        let hash = keccak256(b"code");
        trie_db.insert_blob(hash, b"code");
        assert_eq!(trie_db.blob(&hash), Some(b"code".to_vec()));

        let parent = keccak256(b"parent");
        trie_db.reference(hash, parent);
        assert_eq!(trie_db.reference_count(&hash), 1);
        assert_eq!(trie_db.references(), vec![(hash, parent)]);
    }

    #[test]
    fn test_contract_code_via_blob_store() {
        let db = MemoryStateDatabase::new();
        let hash = keccak256(b"bytecode");
        db.trie_db().insert_blob(hash, b"bytecode");

        assert_eq!(
            db.contract_code(H256::zero(), hash).unwrap(),
            b"bytecode".to_vec()
        );
        assert_eq!(db.contract_code_size(H256::zero(), hash).unwrap(), 8);
        assert!(matches!(
            db.contract_code(H256::zero(), keccak256(b"other")),
            Err(Error::NotFound)
        ));
    }
}
