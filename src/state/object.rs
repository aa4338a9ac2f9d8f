//! Per-account working copy.
//!
//! A state object stages every pending change to one account: balance,
//! nonce, code, and storage slots. Mutators here are raw; the owning state
//! database journals the prior value before delegating, so the object itself
//! carries no undo information and no back-reference to its owner.

use std::collections::HashMap;

use primitive_types::{H160, H256, U256};

use crate::error::Result;
use crate::state::account::{keccak256, Account, EMPTY_CODE_HASH};
use crate::state::trie::{StateDatabase, Trie};
use crate::Error;

pub struct StateObject {
    address: H160,
    addr_hash: H256,
    data: Account,

    code: Option<Vec<u8>>,
    dirty_code: bool,

    /// Storage trie, opened on first access.
    trie: Option<Box<dyn Trie>>,
    /// Last-committed slot values, cached on read.
    origin_storage: HashMap<H256, H256>,
    /// Pending slot writes, flushed by `update_trie`.
    dirty_storage: HashMap<H256, H256>,

    suicided: bool,
    deleted: bool,
    touched: bool,
}

impl std::fmt::Debug for StateObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateObject")
            .field("address", &self.address)
            .field("data", &self.data)
            .field("suicided", &self.suicided)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl StateObject {
    pub fn new(address: H160, data: Account) -> Self {
        Self {
            address,
            addr_hash: keccak256(address.as_bytes()),
            data,
            code: None,
            dirty_code: false,
            trie: None,
            origin_storage: HashMap::new(),
            dirty_storage: HashMap::new(),
            suicided: false,
            deleted: false,
            touched: false,
        }
    }

    pub fn address(&self) -> H160 {
        self.address
    }

    pub fn addr_hash(&self) -> H256 {
        self.addr_hash
    }

    pub fn account(&self) -> &Account {
        &self.data
    }

    pub fn balance(&self) -> U256 {
        self.data.balance
    }

    pub fn nonce(&self) -> u64 {
        self.data.nonce
    }

    pub fn code_hash(&self) -> H256 {
        self.data.code_hash
    }

    pub fn storage_root(&self) -> H256 {
        self.data.root
    }

    pub fn set_balance(&mut self, balance: U256) {
        self.data.balance = balance;
        self.touched = true;
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.data.nonce = nonce;
        self.touched = true;
    }

    /// Installs code and its hash. `None` restores the no-code state on
    /// journal revert.
    pub fn set_code(&mut self, code_hash: H256, code: Option<Vec<u8>>) {
        self.data.code_hash = code_hash;
        self.code = code;
        self.dirty_code = true;
        self.touched = true;
    }

    /// Contract bytecode, loaded through `db` and cached.
    pub fn code(&mut self, db: &dyn StateDatabase) -> Result<Option<Vec<u8>>> {
        if let Some(code) = &self.code {
            return Ok(Some(code.clone()));
        }
        if self.data.code_hash == *EMPTY_CODE_HASH {
            return Ok(None);
        }
        let code = db.contract_code(self.addr_hash, self.data.code_hash)?;
        self.code = Some(code.clone());
        Ok(Some(code))
    }

    pub fn code_size(&mut self, db: &dyn StateDatabase) -> Result<usize> {
        if let Some(code) = &self.code {
            return Ok(code.len());
        }
        if self.data.code_hash == *EMPTY_CODE_HASH {
            return Ok(0);
        }
        db.contract_code_size(self.addr_hash, self.data.code_hash)
    }

    pub fn dirty_code(&self) -> bool {
        self.dirty_code
    }

    pub fn clear_dirty_code(&mut self) {
        self.dirty_code = false;
    }

    pub fn cached_code(&self) -> Option<&Vec<u8>> {
        self.code.as_ref()
    }

    fn storage_trie(&mut self, db: &dyn StateDatabase) -> Result<&mut Box<dyn Trie>> {
        if self.trie.is_none() {
            self.trie = Some(db.open_storage_trie(self.addr_hash, self.data.root)?);
        }
        Ok(self.trie.as_mut().expect("storage trie just opened"))
    }

    /// Pending value of a slot, falling back to the committed value.
    pub fn get_state(&mut self, db: &dyn StateDatabase, key: H256) -> Result<H256> {
        if let Some(value) = self.dirty_storage.get(&key) {
            return Ok(*value);
        }
        self.get_committed_state(db, key)
    }

    /// Last-committed value of a slot, loaded from the storage trie and
    /// cached.
    pub fn get_committed_state(&mut self, db: &dyn StateDatabase, key: H256) -> Result<H256> {
        if let Some(value) = self.origin_storage.get(&key) {
            return Ok(*value);
        }
        let value = match self.storage_trie(db)?.try_get(key.as_bytes())? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(Error::Corrupted(format!(
                        "storage slot value has length {}",
                        bytes.len()
                    )));
                }
                H256::from_slice(&bytes)
            }
            None => H256::zero(),
        };
        self.origin_storage.insert(key, value);
        Ok(value)
    }

    /// Stages a slot write. The owner journals the prior value first.
    pub fn set_state(&mut self, key: H256, value: H256) {
        self.dirty_storage.insert(key, value);
        self.touched = true;
    }

    /// Flushes dirty slots into the storage trie; zero values delete.
    pub fn update_trie(&mut self, db: &dyn StateDatabase) -> Result<()> {
        if self.trie.is_none() {
            self.trie = Some(db.open_storage_trie(self.addr_hash, self.data.root)?);
        }
        if self.dirty_storage.is_empty() {
            return Ok(());
        }

        let dirty: Vec<(H256, H256)> = self.dirty_storage.drain().collect();
        let trie = self.trie.as_mut().expect("storage trie opened above");
        for (key, value) in dirty {
            if self.origin_storage.get(&key) == Some(&value) {
                continue;
            }
            self.origin_storage.insert(key, value);
            if value == H256::zero() {
                trie.try_delete(key.as_bytes())?;
            } else {
                trie.try_update(key.as_bytes(), value.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Flushes dirty slots and refreshes the cached storage root.
    pub fn update_root(&mut self, db: &dyn StateDatabase) -> Result<()> {
        self.update_trie(db)?;
        self.data.root = self.trie.as_ref().expect("trie opened by update_trie").hash();
        Ok(())
    }

    /// Flushes dirty slots and commits the storage trie to the node store.
    pub fn commit_trie(&mut self, db: &dyn StateDatabase) -> Result<()> {
        self.update_trie(db)?;
        let trie = self.trie.as_mut().expect("trie opened by update_trie");
        self.data.root = trie.commit(&mut |_, _| Ok(()))?;
        Ok(())
    }

    pub fn mark_suicided(&mut self) {
        self.suicided = true;
    }

    pub fn suicided(&self) -> bool {
        self.suicided
    }

    pub fn set_suicided(&mut self, suicided: bool) {
        self.suicided = suicided;
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub fn touched(&self) -> bool {
        self.touched
    }

    pub fn set_touched(&mut self, touched: bool) {
        self.touched = touched;
    }

    /// Empty per the deletion rule: zero nonce, zero balance, no code.
    pub fn empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Independent copy sharing nothing mutable with the original; the
    /// storage trie is duplicated through the database.
    pub fn deep_copy(&self, db: &dyn StateDatabase) -> StateObject {
        StateObject {
            address: self.address,
            addr_hash: self.addr_hash,
            data: self.data.clone(),
            code: self.code.clone(),
            dirty_code: self.dirty_code,
            trie: self.trie.as_ref().map(|t| db.copy_trie(t.as_ref())),
            origin_storage: self.origin_storage.clone(),
            dirty_storage: self.dirty_storage.clone(),
            suicided: self.suicided,
            deleted: self.deleted,
            touched: self.touched,
        }
    }

    /// Clone of the opened storage trie, if any.
    pub fn storage_trie_copy(&self) -> Option<Box<dyn Trie>> {
        self.trie.as_ref().map(|t| t.clone_box())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::account::EMPTY_ROOT;
    use crate::state::trie::MemoryStateDatabase;

    fn addr(n: u8) -> H160 {
        H160::repeat_byte(n)
    }

    fn slot(n: u8) -> H256 {
        H256::repeat_byte(n)
    }

    #[test]
    fn test_storage_dirty_over_committed() {
        let db = MemoryStateDatabase::new();
        let mut object = StateObject::new(addr(1), Account::default());

        // Nothing committed: slots read zero.
        assert_eq!(object.get_state(&db, slot(1)).unwrap(), H256::zero());

        object.set_state(slot(1), slot(0xaa));
        assert_eq!(object.get_state(&db, slot(1)).unwrap(), slot(0xaa));
        // Committed view unchanged until the trie is updated.
        assert_eq!(object.get_committed_state(&db, slot(1)).unwrap(), H256::zero());
    }

    #[test]
    fn test_update_root_tracks_storage() {
        let db = MemoryStateDatabase::new();
        let mut object = StateObject::new(addr(1), Account::default());
        assert_eq!(object.storage_root(), *EMPTY_ROOT);

        object.set_state(slot(1), slot(0xaa));
        object.update_root(&db).expect("update root");
        let root_with_slot = object.storage_root();
        assert_ne!(root_with_slot, *EMPTY_ROOT);

        // Zeroing the slot deletes it and restores the empty root.
        object.set_state(slot(1), H256::zero());
        object.update_root(&db).expect("update root");
        assert_eq!(object.storage_root(), *EMPTY_ROOT);
    }

    #[test]
    fn test_commit_trie_persists_storage() {
        let db = MemoryStateDatabase::new();
        let mut object = StateObject::new(addr(1), Account::default());

        object.set_state(slot(1), slot(0xaa));
        object.commit_trie(&db).expect("commit");
        let root = object.storage_root();

        // A fresh object over the committed root reads the slot back.
        let mut account = Account::default();
        account.root = root;
        let mut reloaded = StateObject::new(addr(1), account);
        assert_eq!(reloaded.get_committed_state(&db, slot(1)).unwrap(), slot(0xaa));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let db = MemoryStateDatabase::new();
        let mut object = StateObject::new(addr(1), Account::default());
        object.set_state(slot(1), slot(0xaa));
        object.set_balance(U256::from(5));

        let mut copy = object.deep_copy(&db);
        copy.set_state(slot(1), slot(0xbb));
        copy.set_balance(U256::from(9));

        assert_eq!(object.get_state(&db, slot(1)).unwrap(), slot(0xaa));
        assert_eq!(object.balance(), U256::from(5));
        assert_eq!(copy.get_state(&db, slot(1)).unwrap(), slot(0xbb));
        assert_eq!(copy.balance(), U256::from(9));
    }

    #[test]
    fn test_code_cache_round_trip() {
        let db = MemoryStateDatabase::new();
        let mut object = StateObject::new(addr(1), Account::default());
        assert_eq!(object.code(&db).unwrap(), None);

        let code = b"\x60\x60\x60".to_vec();
        let hash = keccak256(&code);
        object.set_code(hash, Some(code.clone()));
        assert!(object.dirty_code());
        assert_eq!(object.code(&db).unwrap(), Some(code.clone()));
        assert_eq!(object.code_size(&db).unwrap(), code.len());
        assert!(!object.empty());
    }
}
