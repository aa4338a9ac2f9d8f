//! EmberDB: segmented key-value tables and a journaled state database for
//! blockchain nodes.
//!
//! Two subsystems share this crate. [`table`] stores chain data (blocks,
//! receipts) in partitioned tables whose segments age from a writable
//! log-backed tier into immutable files, with a semaphore-interlocked LRU
//! bounding how many of them are open. [`state`] stages account state above
//! a Merkle trie with full snapshot/revert journaling and atomic commit.

pub mod config;
pub mod error;
pub mod state;
pub mod table;

pub use config::TableConfig;
pub use error::{Error, Result};
pub use state::StateDb;
pub use table::{CompactionTask, Table};
