//! Journaled state database.
//!
//! A caching and staging layer above a Merkle trie with transactional
//! semantics. Mutations stage in per-account [`StateObject`]s and append
//! reversible entries to the [`Journal`]; [`StateDb::snapshot`] and
//! [`StateDb::revert_to_snapshot`] roll any suffix of them back.
//! Finalisation folds dirty accounts into the account trie between
//! transactions, and commit persists everything through the consumed
//! [`Trie`]/[`TrieDatabase`] capabilities while pinning reachable storage
//! roots and code blobs via reference counting.

pub mod account;
pub mod journal;
pub mod log;
pub mod object;
pub mod statedb;
pub mod trie;

pub use account::{keccak256, Account, EMPTY_CODE_HASH, EMPTY_ROOT};
pub use journal::{Journal, JournalEntry};
pub use log::Log;
pub use object::StateObject;
pub use statedb::StateDb;
pub use trie::{
    LeafCallback, MemoryStateDatabase, MemoryTrie, MemoryTrieDatabase, StateDatabase, Trie,
    TrieDatabase,
};
