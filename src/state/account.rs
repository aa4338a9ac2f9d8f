use once_cell::sync::Lazy;
use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::Result;

/// Black-box 32-byte digest used for addresses, code, and trie roots.
pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

/// Hash of an empty state trie.
pub static EMPTY_ROOT: Lazy<H256> = Lazy::new(|| keccak256(&[]));

/// Hash of empty contract bytecode.
pub static EMPTY_CODE_HASH: Lazy<H256> = Lazy::new(|| keccak256(&[]));

/// The account record stored at a state trie leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    /// Root of the account's storage trie.
    pub root: H256,
    pub code_hash: H256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            root: *EMPTY_ROOT,
            code_hash: *EMPTY_CODE_HASH,
        }
    }
}

impl Account {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Empty per the deletion rule: zero nonce, zero balance, no code.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == *EMPTY_CODE_HASH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_encode_decode_round_trip() {
        let account = Account {
            nonce: 7,
            balance: U256::from(1_000_000u64),
            root: keccak256(b"storage"),
            code_hash: keccak256(b"code"),
        };

        let encoded = account.encode().expect("encode");
        let decoded = Account::decode(&encoded).expect("decode");
        assert_eq!(decoded, account);
    }

    #[test]
    fn test_decode_garbage_is_corrupted() {
        assert!(matches!(
            Account::decode(&[0xff; 3]),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_is_empty() {
        assert!(Account::default().is_empty());

        let mut account = Account::default();
        account.nonce = 1;
        assert!(!account.is_empty());

        let mut account = Account::default();
        account.balance = U256::one();
        assert!(!account.is_empty());

        let mut account = Account::default();
        account.code_hash = keccak256(b"code");
        assert!(!account.is_empty());
    }
}
