//! Transactional facade over the account trie and live state objects.
//!
//! The state database caches account objects loaded from the trie, stages
//! every mutation in memory, and records each one in the journal so any
//! prefix of a transaction can be rolled back via snapshots. `finalise`
//! folds the dirty objects into the trie between transactions; `commit`
//! additionally persists the tries and pins reachable code and storage
//! through the node store's reference counts.
//!
//! Not safe for concurrent use; one execution thread drives one instance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use primitive_types::{H160, H256, U256};

use crate::error::Result;
use crate::state::account::{keccak256, Account, EMPTY_CODE_HASH, EMPTY_ROOT};
use crate::state::journal::{Journal, JournalEntry};
use crate::state::log::Log;
use crate::state::object::StateObject;
use crate::state::trie::{StateDatabase, Trie};
use crate::Error;

struct Revision {
    id: u64,
    journal_index: usize,
}

pub struct StateDb {
    db: Arc<dyn StateDatabase>,
    trie: Box<dyn Trie>,

    /// Live objects, mutated while processing a state transition.
    pub(crate) state_objects: HashMap<H160, StateObject>,
    state_objects_dirty: HashSet<H160>,

    /// The refund counter, also used by state transitioning.
    pub(crate) refund: u64,

    tx_hash: H256,
    block_hash: H256,
    tx_index: u32,
    pub(crate) logs: HashMap<H256, Vec<Log>>,
    pub(crate) log_size: u64,

    pub(crate) preimages: HashMap<H256, Vec<u8>>,

    /// Journal of state modifications, the backbone of snapshot/revert.
    journal: Journal,
    valid_revisions: Vec<Revision>,
    next_revision_id: u64,
}

impl StateDb {
    /// Creates a new state over the trie rooted at `root`.
    pub fn new(root: H256, db: Arc<dyn StateDatabase>) -> Result<Self> {
        let trie = db.open_trie(root)?;
        Ok(Self {
            db,
            trie,
            state_objects: HashMap::new(),
            state_objects_dirty: HashSet::new(),
            refund: 0,
            tx_hash: H256::zero(),
            block_hash: H256::zero(),
            tx_index: 0,
            logs: HashMap::new(),
            log_size: 0,
            preimages: HashMap::new(),
            journal: Journal::new(),
            valid_revisions: Vec::new(),
            next_revision_id: 0,
        })
    }

    /// Clears all ephemeral state and reopens the trie at `root`.
    pub fn reset(&mut self, root: H256) -> Result<()> {
        self.trie = self.db.open_trie(root)?;
        self.state_objects.clear();
        self.state_objects_dirty.clear();
        self.tx_hash = H256::zero();
        self.block_hash = H256::zero();
        self.tx_index = 0;
        self.logs.clear();
        self.log_size = 0;
        self.preimages.clear();
        self.clear_journal_and_refund();
        Ok(())
    }

    /// The low-level database supporting trie operations.
    pub fn database(&self) -> &Arc<dyn StateDatabase> {
        &self.db
    }

    // ── Per-transaction metadata ──────────────────────────────────────

    /// Sets the transaction hash, block hash, and index used when logs are
    /// emitted.
    pub fn prepare(&mut self, tx_hash: H256, block_hash: H256, tx_index: u32) {
        self.tx_hash = tx_hash;
        self.block_hash = block_hash;
        self.tx_index = tx_index;
    }

    pub fn tx_index(&self) -> u32 {
        self.tx_index
    }

    pub fn block_hash(&self) -> H256 {
        self.block_hash
    }

    pub fn add_log(&mut self, mut log: Log) {
        self.journal.append(JournalEntry::AddLog {
            tx_hash: self.tx_hash,
        });

        log.tx_hash = self.tx_hash;
        log.block_hash = self.block_hash;
        log.tx_index = self.tx_index;
        log.index = self.log_size;
        self.logs.entry(self.tx_hash).or_default().push(log);
        self.log_size += 1;
    }

    pub fn get_logs(&self, tx_hash: &H256) -> Vec<Log> {
        self.logs.get(tx_hash).cloned().unwrap_or_default()
    }

    pub fn logs(&self) -> Vec<Log> {
        let mut all: Vec<Log> = self.logs.values().flatten().cloned().collect();
        all.sort_by_key(|log| log.index);
        all
    }

    /// Records a hash preimage seen by the executor.
    pub fn add_preimage(&mut self, hash: H256, preimage: &[u8]) {
        if !self.preimages.contains_key(&hash) {
            self.journal.append(JournalEntry::AddPreimage { hash });
            self.preimages.insert(hash, preimage.to_vec());
        }
    }

    pub fn preimages(&self) -> &HashMap<H256, Vec<u8>> {
        &self.preimages
    }

    // ── Refund counter ────────────────────────────────────────────────

    pub fn add_refund(&mut self, gas: u64) {
        self.journal.append(JournalEntry::Refund { prev: self.refund });
        self.refund += gas;
    }

    /// Panics if the counter would go below zero; that is executor misuse.
    pub fn sub_refund(&mut self, gas: u64) {
        self.journal.append(JournalEntry::Refund { prev: self.refund });
        if gas > self.refund {
            panic!("refund counter below zero");
        }
        self.refund -= gas;
    }

    pub fn get_refund(&self) -> u64 {
        self.refund
    }

    // ── Object loading ────────────────────────────────────────────────

    /// Loads the object for `address` into the live set if the trie has it.
    /// Returns whether a live (non-deleted) object is present afterwards.
    fn load_state_object(&mut self, address: H160) -> Result<bool> {
        if let Some(object) = self.state_objects.get(&address) {
            return Ok(!object.deleted());
        }

        let encoded = match self.trie.try_get(address.as_bytes())? {
            Some(encoded) if !encoded.is_empty() => encoded,
            _ => return Ok(false),
        };
        let data = match Account::decode(&encoded) {
            Ok(data) => data,
            Err(e) => {
                // Treated as missing; the executor sees an empty account.
                tracing::error!(address = %address, error = %e, "Failed to decode state object");
                return Ok(false);
            }
        };

        self.state_objects
            .insert(address, StateObject::new(address, data));
        Ok(true)
    }

    /// Ensures a live object exists, creating one if needed.
    fn ensure_live_object(&mut self, address: H160) -> Result<()> {
        if !self.load_state_object(address)? {
            self.create_object(address)?;
        }
        Ok(())
    }

    /// Installs a fresh object, journaling the overwrite. Returns the prior
    /// balance when a live object was replaced.
    fn create_object(&mut self, address: H160) -> Result<Option<U256>> {
        let prev_live = self.load_state_object(address)?;
        let prev = self
            .state_objects
            .insert(address, StateObject::new(address, Account::default()));

        if prev_live {
            let prev = prev.expect("live object present");
            let prev_balance = prev.balance();
            self.journal.append(JournalEntry::ResetObject {
                prev: Box::new(prev),
            });
            Ok(Some(prev_balance))
        } else {
            self.journal.append(JournalEntry::CreateObject { address });
            Ok(None)
        }
    }

    /// Explicitly creates an account. An existing account's balance is
    /// carried over so funds do not disappear when a contract is created at
    /// a funded address.
    pub fn create_account(&mut self, address: H160) {
        match self.create_object(address) {
            Ok(Some(prev_balance)) => {
                self.state_objects
                    .get_mut(&address)
                    .expect("object just created")
                    .set_balance(prev_balance);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(address = %address, error = %e, "Failed to create account"),
        }
    }

    // ── Convenience getters (swallow errors) and try_ variants ────────

    /// Whether the account exists; suicided accounts still exist until
    /// commit.
    pub fn exist(&mut self, address: H160) -> bool {
        self.load_state_object(address).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get state object");
            false
        })
    }

    /// Whether the account is missing or empty (zero nonce, balance, code).
    pub fn empty(&mut self, address: H160) -> bool {
        match self.load_state_object(address) {
            Ok(true) => self
                .state_objects
                .get(&address)
                .map(|o| o.empty())
                .unwrap_or(true),
            Ok(false) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to get state object");
                true
            }
        }
    }

    pub fn get_balance(&mut self, address: H160) -> U256 {
        self.try_get_balance(address).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get balance");
            U256::zero()
        })
    }

    pub fn try_get_balance(&mut self, address: H160) -> Result<U256> {
        if self.load_state_object(address)? {
            Ok(self
                .state_objects
                .get(&address)
                .map(|o| o.balance())
                .unwrap_or_default())
        } else {
            Ok(U256::zero())
        }
    }

    pub fn get_nonce(&mut self, address: H160) -> u64 {
        self.try_get_nonce(address).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get nonce");
            0
        })
    }

    pub fn try_get_nonce(&mut self, address: H160) -> Result<u64> {
        if self.load_state_object(address)? {
            Ok(self
                .state_objects
                .get(&address)
                .map(|o| o.nonce())
                .unwrap_or_default())
        } else {
            Ok(0)
        }
    }

    pub fn get_code(&mut self, address: H160) -> Option<Vec<u8>> {
        self.try_get_code(address).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get code");
            None
        })
    }

    pub fn try_get_code(&mut self, address: H160) -> Result<Option<Vec<u8>>> {
        if !self.load_state_object(address)? {
            return Ok(None);
        }
        let db = self.db.clone();
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .code(db.as_ref())
    }

    pub fn get_code_size(&mut self, address: H160) -> usize {
        let result = (|| -> Result<usize> {
            if !self.load_state_object(address)? {
                return Ok(0);
            }
            let db = self.db.clone();
            self.state_objects
                .get_mut(&address)
                .expect("live object")
                .code_size(db.as_ref())
        })();
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get code size");
            0
        })
    }

    pub fn get_code_hash(&mut self, address: H160) -> H256 {
        match self.load_state_object(address) {
            Ok(true) => self
                .state_objects
                .get(&address)
                .map(|o| o.code_hash())
                .unwrap_or_default(),
            Ok(false) => H256::zero(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to get code hash");
                H256::zero()
            }
        }
    }

    /// Pending value of a storage slot.
    pub fn get_state(&mut self, address: H160, key: H256) -> H256 {
        self.try_get_state(address, key).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get state");
            H256::zero()
        })
    }

    pub fn try_get_state(&mut self, address: H160, key: H256) -> Result<H256> {
        if !self.load_state_object(address)? {
            return Ok(H256::zero());
        }
        let db = self.db.clone();
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .get_state(db.as_ref(), key)
    }

    /// Last-committed value of a storage slot.
    pub fn get_committed_state(&mut self, address: H160, key: H256) -> H256 {
        self.try_get_committed_state(address, key).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get committed state");
            H256::zero()
        })
    }

    pub fn try_get_committed_state(&mut self, address: H160, key: H256) -> Result<H256> {
        if !self.load_state_object(address)? {
            return Ok(H256::zero());
        }
        let db = self.db.clone();
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .get_committed_state(db.as_ref(), key)
    }

    pub fn has_suicided(&mut self, address: H160) -> bool {
        match self.load_state_object(address) {
            Ok(true) => self
                .state_objects
                .get(&address)
                .map(|o| o.suicided())
                .unwrap_or(false),
            Ok(false) => false,
            Err(e) => {
                tracing::error!(error = %e, "Failed to get state object");
                false
            }
        }
    }

    /// Merkle proof for the account.
    pub fn get_proof(&mut self, address: H160) -> Result<Vec<Vec<u8>>> {
        self.trie.prove(address.as_bytes())
    }

    /// Merkle proof for a storage slot of the account.
    pub fn get_storage_proof(&mut self, address: H160, key: H256) -> Result<Vec<Vec<u8>>> {
        let trie = self.storage_trie(address)?.ok_or(Error::NotFound)?;
        trie.prove(key.as_bytes())
    }

    /// Copy of the account's storage trie with pending slots applied, or
    /// `None` for a non-existent account.
    pub fn storage_trie(&mut self, address: H160) -> Result<Option<Box<dyn Trie>>> {
        if !self.load_state_object(address)? {
            return Ok(None);
        }
        let db = self.db.clone();
        let object = self.state_objects.get(&address).expect("live object");
        let mut copy = object.deep_copy(db.as_ref());
        copy.update_trie(db.as_ref())?;
        Ok(copy.storage_trie_copy())
    }

    // ── Mutators ──────────────────────────────────────────────────────

    pub fn add_balance(&mut self, address: H160, amount: U256) {
        if let Err(e) = self.try_add_balance(address, amount) {
            tracing::error!(address = %address, error = %e, "Failed to add balance");
        }
    }

    pub fn try_add_balance(&mut self, address: H160, amount: U256) -> Result<()> {
        self.ensure_live_object(address)?;
        let (prev, is_empty) = {
            let object = self.state_objects.get(&address).expect("live object");
            (object.balance(), object.empty())
        };

        // A zero-amount transfer still counts as touching the account, so
        // empty-object deletion can find it.
        if amount.is_zero() {
            if is_empty {
                self.touch(address);
            }
            return Ok(());
        }

        self.journal.append(JournalEntry::Balance { address, prev });
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .set_balance(prev + amount);
        Ok(())
    }

    pub fn sub_balance(&mut self, address: H160, amount: U256) {
        if let Err(e) = self.try_sub_balance(address, amount) {
            tracing::error!(address = %address, error = %e, "Failed to sub balance");
        }
    }

    pub fn try_sub_balance(&mut self, address: H160, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.ensure_live_object(address)?;
        let prev = self
            .state_objects
            .get(&address)
            .expect("live object")
            .balance();
        self.journal.append(JournalEntry::Balance { address, prev });
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .set_balance(prev - amount);
        Ok(())
    }

    pub fn set_balance(&mut self, address: H160, amount: U256) {
        if let Err(e) = self.try_set_balance(address, amount) {
            tracing::error!(address = %address, error = %e, "Failed to set balance");
        }
    }

    pub fn try_set_balance(&mut self, address: H160, amount: U256) -> Result<()> {
        self.ensure_live_object(address)?;
        let prev = self
            .state_objects
            .get(&address)
            .expect("live object")
            .balance();
        self.journal.append(JournalEntry::Balance { address, prev });
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .set_balance(amount);
        Ok(())
    }

    pub fn set_nonce(&mut self, address: H160, nonce: u64) {
        if let Err(e) = self.try_set_nonce(address, nonce) {
            tracing::error!(address = %address, error = %e, "Failed to set nonce");
        }
    }

    pub fn try_set_nonce(&mut self, address: H160, nonce: u64) -> Result<()> {
        self.ensure_live_object(address)?;
        let prev = self
            .state_objects
            .get(&address)
            .expect("live object")
            .nonce();
        self.journal.append(JournalEntry::Nonce { address, prev });
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .set_nonce(nonce);
        Ok(())
    }

    pub fn set_code(&mut self, address: H160, code: Vec<u8>) {
        if let Err(e) = self.try_set_code(address, code) {
            tracing::error!(address = %address, error = %e, "Failed to set code");
        }
    }

    pub fn try_set_code(&mut self, address: H160, code: Vec<u8>) -> Result<()> {
        self.ensure_live_object(address)?;
        let db = self.db.clone();
        let (prev_hash, prev_code) = {
            let object = self.state_objects.get_mut(&address).expect("live object");
            (object.code_hash(), object.code(db.as_ref())?)
        };
        self.journal.append(JournalEntry::Code {
            address,
            prev_hash,
            prev_code,
        });

        let code_hash = keccak256(&code);
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .set_code(code_hash, Some(code));
        Ok(())
    }

    pub fn set_state(&mut self, address: H160, key: H256, value: H256) {
        if let Err(e) = self.try_set_state(address, key, value) {
            tracing::error!(address = %address, error = %e, "Failed to set state");
        }
    }

    pub fn try_set_state(&mut self, address: H160, key: H256, value: H256) -> Result<()> {
        self.ensure_live_object(address)?;
        let db = self.db.clone();
        let prev = self
            .state_objects
            .get_mut(&address)
            .expect("live object")
            .get_state(db.as_ref(), key)?;
        self.journal.append(JournalEntry::Storage { address, key, prev });
        self.state_objects
            .get_mut(&address)
            .expect("live object")
            .set_state(key, value);
        Ok(())
    }

    /// Marks the account as suicided and zeroes its balance. The object
    /// remains available until the state is committed. Returns whether an
    /// account was found.
    pub fn suicide(&mut self, address: H160) -> bool {
        let live = self.load_state_object(address).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to get state object");
            false
        });
        if !live {
            return false;
        }

        let (prev_suicided, prev_balance) = {
            let object = self.state_objects.get(&address).expect("live object");
            (object.suicided(), object.balance())
        };
        self.journal.append(JournalEntry::Suicide {
            address,
            prev_suicided,
            prev_balance,
        });

        let object = self.state_objects.get_mut(&address).expect("live object");
        object.mark_suicided();
        object.set_balance(U256::zero());
        true
    }

    fn touch(&mut self, address: H160) {
        self.journal.append(JournalEntry::Touch { address });
        if let Some(object) = self.state_objects.get_mut(&address) {
            object.set_touched(true);
        }
    }

    // ── Snapshot / revert ─────────────────────────────────────────────

    /// Returns an identifier for the current revision of the state.
    pub fn snapshot(&mut self) -> u64 {
        let id = self.next_revision_id;
        self.next_revision_id += 1;
        self.valid_revisions.push(Revision {
            id,
            journal_index: self.journal.len(),
        });
        id
    }

    /// Reverts all state changes made since the given revision. Passing an
    /// unknown or already-reverted id is a programming error and panics.
    pub fn revert_to_snapshot(&mut self, id: u64) {
        let idx = self.valid_revisions.partition_point(|r| r.id < id);
        if idx == self.valid_revisions.len() || self.valid_revisions[idx].id != id {
            panic!("revision id {id} cannot be reverted");
        }
        let snapshot = self.valid_revisions[idx].journal_index;

        let mut journal = std::mem::take(&mut self.journal);
        journal.revert(self, snapshot);
        self.journal = journal;
        self.valid_revisions.truncate(idx);
    }

    // ── Finalisation and commit ───────────────────────────────────────

    fn update_state_object(&mut self, address: H160) -> Result<()> {
        let object = self.state_objects.get(&address).expect("object in live set");
        let encoded = object
            .account()
            .encode()
            .unwrap_or_else(|e| panic!("can't encode object at {address:x}: {e}"));
        self.trie.try_update(address.as_bytes(), &encoded)
    }

    fn delete_state_object(&mut self, address: H160) -> Result<()> {
        if let Some(object) = self.state_objects.get_mut(&address) {
            object.set_deleted(true);
        }
        self.trie.try_delete(address.as_bytes())
    }

    /// Folds journal-dirty objects into the account trie, deleting suicided
    /// (and optionally empty) ones, then clears the journal and refunds.
    /// Reverting across transactions is not allowed afterwards.
    pub fn finalise(&mut self, delete_empty_objects: bool) {
        let addresses: Vec<H160> = self.journal.dirty_addresses().collect();
        for address in addresses {
            // A touch can outlive its object when the enclosing call ran out
            // of gas: the journal entry survives the revert while the object
            // does not. Skip those.
            if !self.state_objects.contains_key(&address) {
                continue;
            }

            let remove = {
                let object = self.state_objects.get(&address).expect("checked above");
                object.suicided() || (delete_empty_objects && object.empty())
            };
            if remove {
                if let Err(e) = self.delete_state_object(address) {
                    tracing::error!(address = %address, error = %e, "Failed to delete state object");
                }
            } else {
                let db = self.db.clone();
                let object = self.state_objects.get_mut(&address).expect("checked above");
                if let Err(e) = object.update_root(db.as_ref()) {
                    tracing::error!(address = %address, error = %e, "Failed to update storage root");
                }
                if let Err(e) = self.update_state_object(address) {
                    tracing::error!(address = %address, error = %e, "Failed to update state object");
                }
            }
            self.state_objects_dirty.insert(address);
        }
        self.clear_journal_and_refund();
    }

    /// Current root hash of the state trie after finalisation. Called
    /// between transactions; the hash goes into receipts.
    pub fn intermediate_root(&mut self, delete_empty_objects: bool) -> H256 {
        self.finalise(delete_empty_objects);
        self.trie.hash()
    }

    /// Writes the state to the underlying trie database and returns the new
    /// root. Reachable storage roots and code hashes are referenced in the
    /// node store so its reference counts keep them pinned.
    pub fn commit(&mut self, delete_empty_objects: bool) -> Result<H256> {
        let result = self.commit_objects(delete_empty_objects);
        self.clear_journal_and_refund();
        result
    }

    fn commit_objects(&mut self, delete_empty_objects: bool) -> Result<H256> {
        let dirtied: Vec<H160> = self.journal.dirty_addresses().collect();
        for address in dirtied {
            self.state_objects_dirty.insert(address);
        }

        let addresses: Vec<H160> = self.state_objects.keys().copied().collect();
        for address in addresses {
            let is_dirty = self.state_objects_dirty.contains(&address);
            let (suicided, is_empty) = {
                let object = self.state_objects.get(&address).expect("listed");
                (object.suicided(), object.empty())
            };

            if suicided || (is_dirty && delete_empty_objects && is_empty) {
                self.delete_state_object(address)?;
            } else if is_dirty {
                let db = self.db.clone();
                let object = self.state_objects.get_mut(&address).expect("listed");

                // Write any contract code associated with the object.
                if object.dirty_code() {
                    if let Some(code) = object.cached_code() {
                        db.trie_db().insert_blob(object.code_hash(), code);
                    }
                    object.clear_dirty_code();
                }
                // Write storage changes to the object's storage trie.
                object.commit_trie(db.as_ref())?;
                // Update the object in the main account trie.
                self.update_state_object(address)?;
            }
            self.state_objects_dirty.remove(&address);
        }

        let trie_db = self.db.trie_db();
        self.trie.commit(&mut |leaf, parent| {
            let account = match Account::decode(leaf) {
                Ok(account) => account,
                Err(_) => return Ok(()),
            };
            if account.root != *EMPTY_ROOT {
                trie_db.reference(account.root, parent);
            }
            if account.code_hash != *EMPTY_CODE_HASH {
                trie_db.reference(account.code_hash, parent);
            }
            Ok(())
        })
    }

    fn clear_journal_and_refund(&mut self) {
        self.journal = Journal::new();
        self.valid_revisions.clear();
        self.refund = 0;
    }

    // ── Copy ──────────────────────────────────────────────────────────

    /// Deep, independent copy of the state. Snapshots of the original
    /// cannot be applied to the copy; the copy starts with an empty
    /// journal.
    pub fn copy(&self) -> StateDb {
        let mut state = StateDb {
            db: self.db.clone(),
            trie: self.db.copy_trie(self.trie.as_ref()),
            state_objects: HashMap::new(),
            state_objects_dirty: HashSet::new(),
            refund: self.refund,
            tx_hash: H256::zero(),
            block_hash: H256::zero(),
            tx_index: 0,
            logs: HashMap::new(),
            log_size: self.log_size,
            preimages: self.preimages.clone(),
            journal: Journal::new(),
            valid_revisions: Vec::new(),
            next_revision_id: 0,
        };

        for address in self.journal.dirty_addresses() {
            if let Some(object) = self.state_objects.get(&address) {
                state
                    .state_objects
                    .insert(address, object.deep_copy(self.db.as_ref()));
                state.state_objects_dirty.insert(address);
            }
        }
        // The journal itself is not copied, so a copy of a copy would lose
        // its dirty set above; carry it through state_objects_dirty instead.
        for address in &self.state_objects_dirty {
            if !state.state_objects.contains_key(address) {
                if let Some(object) = self.state_objects.get(address) {
                    state
                        .state_objects
                        .insert(*address, object.deep_copy(self.db.as_ref()));
                    state.state_objects_dirty.insert(*address);
                }
            }
        }

        for (tx_hash, logs) in &self.logs {
            state.logs.insert(*tx_hash, logs.clone());
        }
        state
    }

    /// Journal length, exposed for inspection in tests.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }
}
