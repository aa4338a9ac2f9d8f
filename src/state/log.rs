use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};

/// An event emitted during transaction execution. Positioning fields are
/// filled in by the state database when the log is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: H160,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,

    /// Hash of the transaction that emitted the log.
    pub tx_hash: H256,
    /// Hash of the block the transaction belongs to.
    pub block_hash: H256,
    /// Index of the transaction within the block.
    pub tx_index: u32,
    /// Index of the log within the block.
    pub index: u64,
}

impl Log {
    pub fn new(address: H160, topics: Vec<H256>, data: Vec<u8>) -> Self {
        Self {
            address,
            topics,
            data,
            tx_hash: H256::zero(),
            block_hash: H256::zero(),
            tx_index: 0,
            index: 0,
        }
    }
}
