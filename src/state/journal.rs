//! Undo log for state mutations.
//!
//! Every mutation the state database performs appends one entry capturing
//! the prior value. Reverting to a snapshot pops entries back to the
//! recorded length, applying each entry's inverse. Reverts touch memory
//! only and cannot fail.

use std::collections::HashMap;

use primitive_types::{H160, H256, U256};

use crate::state::object::StateObject;
use crate::state::statedb::StateDb;

/// A single reversible change.
pub enum JournalEntry {
    /// A fresh object was inserted into the live set.
    CreateObject { address: H160 },
    /// An existing object was overwritten by account re-creation.
    ResetObject { prev: Box<StateObject> },
    Suicide {
        address: H160,
        prev_suicided: bool,
        prev_balance: U256,
    },
    Balance { address: H160, prev: U256 },
    Nonce { address: H160, prev: u64 },
    Storage {
        address: H160,
        key: H256,
        prev: H256,
    },
    Code {
        address: H160,
        prev_hash: H256,
        prev_code: Option<Vec<u8>>,
    },
    Refund { prev: u64 },
    AddLog { tx_hash: H256 },
    AddPreimage { hash: H256 },
    /// The account was touched without another recorded change.
    Touch { address: H160 },
}

impl JournalEntry {
    /// The address this entry dirties, if any.
    pub fn dirtied(&self) -> Option<H160> {
        match self {
            JournalEntry::CreateObject { address } => Some(*address),
            JournalEntry::ResetObject { prev } => Some(prev.address()),
            JournalEntry::Suicide { address, .. } => Some(*address),
            JournalEntry::Balance { address, .. } => Some(*address),
            JournalEntry::Nonce { address, .. } => Some(*address),
            JournalEntry::Storage { address, .. } => Some(*address),
            JournalEntry::Code { address, .. } => Some(*address),
            JournalEntry::Touch { address } => Some(*address),
            JournalEntry::Refund { .. }
            | JournalEntry::AddLog { .. }
            | JournalEntry::AddPreimage { .. } => None,
        }
    }

    fn revert(self, state: &mut StateDb) {
        match self {
            JournalEntry::CreateObject { address } => {
                state.state_objects.remove(&address);
            }
            JournalEntry::ResetObject { prev } => {
                state.state_objects.insert(prev.address(), *prev);
            }
            JournalEntry::Suicide {
                address,
                prev_suicided,
                prev_balance,
            } => {
                if let Some(object) = state.state_objects.get_mut(&address) {
                    object.set_suicided(prev_suicided);
                    object.set_balance(prev_balance);
                }
            }
            JournalEntry::Balance { address, prev } => {
                if let Some(object) = state.state_objects.get_mut(&address) {
                    object.set_balance(prev);
                }
            }
            JournalEntry::Nonce { address, prev } => {
                if let Some(object) = state.state_objects.get_mut(&address) {
                    object.set_nonce(prev);
                }
            }
            JournalEntry::Storage { address, key, prev } => {
                if let Some(object) = state.state_objects.get_mut(&address) {
                    object.set_state(key, prev);
                }
            }
            JournalEntry::Code {
                address,
                prev_hash,
                prev_code,
            } => {
                if let Some(object) = state.state_objects.get_mut(&address) {
                    object.set_code(prev_hash, prev_code);
                }
            }
            JournalEntry::Refund { prev } => {
                state.refund = prev;
            }
            JournalEntry::AddLog { tx_hash } => {
                let drained = match state.logs.get_mut(&tx_hash) {
                    Some(logs) => {
                        logs.pop();
                        logs.is_empty()
                    }
                    None => false,
                };
                if drained {
                    state.logs.remove(&tx_hash);
                }
                state.log_size -= 1;
            }
            JournalEntry::AddPreimage { hash } => {
                state.preimages.remove(&hash);
            }
            // The dirty-count decrement in `Journal::revert` is the whole
            // inverse of a touch.
            JournalEntry::Touch { .. } => {}
        }
    }
}

/// Ordered log of reversible changes plus the set of addresses they dirty.
pub struct Journal {
    entries: Vec<JournalEntry>,
    dirties: HashMap<H160, usize>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            dirties: HashMap::new(),
        }
    }

    pub fn append(&mut self, entry: JournalEntry) {
        if let Some(address) = entry.dirtied() {
            *self.dirties.entry(address).or_default() += 1;
        }
        self.entries.push(entry);
    }

    /// Undoes every entry after `snapshot`, newest first, and unmarks
    /// addresses whose dirty count drops to zero.
    pub fn revert(&mut self, state: &mut StateDb, snapshot: usize) {
        while self.entries.len() > snapshot {
            let entry = self.entries.pop().expect("length checked");

            if let Some(address) = entry.dirtied() {
                if let Some(count) = self.dirties.get_mut(&address) {
                    *count -= 1;
                    if *count == 0 {
                        self.dirties.remove(&address);
                    }
                }
            }

            entry.revert(state);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Addresses with at least one live entry.
    pub fn dirty_addresses(&self) -> impl Iterator<Item = H160> + '_ {
        self.dirties.keys().copied()
    }

    pub fn is_dirty(&self, address: &H160) -> bool {
        self.dirties.contains_key(address)
    }
}
