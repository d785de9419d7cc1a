//! Accounting backend on sled.
//!
//! The proxy records shares, block candidates, node state, and ban mirrors;
//! payout and statistics services consume the same database out of process.

use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashSet;
use std::path::Path;

/// Key prefixes for the record families.
const PREFIX_SHARE: &[u8] = b"shr:";
const PREFIX_BLOCK: &[u8] = b"blk:";
const PREFIX_NODE: &[u8] = b"nod:";
const PREFIX_BAN: &[u8] = b"ban:";
const PREFIX_BLACKLIST: &[u8] = b"bl:";

pub struct Storage {
    db: Db,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShareRecord {
    pub login: String,
    pub worker: String,
    pub ip: String,
    pub difficulty: u64,
    pub height: u64,
    pub is_block: bool,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockCandidate {
    pub login: String,
    pub worker: String,
    pub ip: String,
    pub difficulty: u64,
    pub height: u64,
    pub nonce: String,
    pub header: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeState {
    pub name: String,
    pub height: u64,
    pub difficulty: u64,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip: String,
    pub banned_until: u64,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(Storage { db })
    }

    #[cfg(test)]
    pub fn temporary() -> Self {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Storage { db }
    }

    // ─── Share accounting ────────────────────────────────────────────

    pub fn write_share(&self, record: &ShareRecord) -> Result<(), StorageError> {
        let id = self.db.generate_id().map_err(|e| StorageError::DbError(e.to_string()))?;
        let mut key = Vec::with_capacity(PREFIX_SHARE.len() + 16);
        key.extend_from_slice(PREFIX_SHARE);
        key.extend_from_slice(&record.height.to_be_bytes());
        key.extend_from_slice(&id.to_be_bytes());
        self.put(key, record)
    }

    pub fn write_block_candidate(&self, candidate: &BlockCandidate) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(PREFIX_BLOCK.len() + 8 + candidate.nonce.len());
        key.extend_from_slice(PREFIX_BLOCK);
        key.extend_from_slice(&candidate.height.to_be_bytes());
        key.extend_from_slice(candidate.nonce.as_bytes());
        self.put(key, candidate)
    }

    /// Shares recorded at or above the given height, oldest first.
    pub fn shares_from(&self, height: u64) -> Result<Vec<ShareRecord>, StorageError> {
        let mut from = Vec::with_capacity(PREFIX_SHARE.len() + 8);
        from.extend_from_slice(PREFIX_SHARE);
        from.extend_from_slice(&height.to_be_bytes());
        let mut out = Vec::new();
        for item in self.db.range(from..prefix_end(PREFIX_SHARE)) {
            let (_, value) = item.map_err(|e| StorageError::DbError(e.to_string()))?;
            let record = bincode::deserialize(&value)
                .map_err(|e| StorageError::SerializeError(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    // ─── Node state ──────────────────────────────────────────────────

    pub fn write_node_state(&self, state: &NodeState) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(PREFIX_NODE.len() + state.name.len());
        key.extend_from_slice(PREFIX_NODE);
        key.extend_from_slice(state.name.as_bytes());
        self.put(key, state)
    }

    pub fn read_node_state(&self, name: &str) -> Result<Option<NodeState>, StorageError> {
        let mut key = Vec::with_capacity(PREFIX_NODE.len() + name.len());
        key.extend_from_slice(PREFIX_NODE);
        key.extend_from_slice(name.as_bytes());
        match self.db.get(key).map_err(|e| StorageError::DbError(e.to_string()))? {
            Some(bytes) => {
                let state = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::SerializeError(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    // ─── Ban mirror / blacklist ──────────────────────────────────────

    pub fn write_ban(&self, ip: &str, banned_until: u64) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(PREFIX_BAN.len() + ip.len());
        key.extend_from_slice(PREFIX_BAN);
        key.extend_from_slice(ip.as_bytes());
        self.put(key, &BanRecord { ip: ip.to_string(), banned_until })
    }

    pub fn add_blacklisted_login(&self, login: &str) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(PREFIX_BLACKLIST.len() + login.len());
        key.extend_from_slice(PREFIX_BLACKLIST);
        key.extend_from_slice(login.as_bytes());
        self.db.insert(key, &[]).map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(())
    }

    /// All blacklisted login addresses, lowercase.
    pub fn load_blacklist(&self) -> Result<HashSet<String>, StorageError> {
        let mut out = HashSet::new();
        for item in self.db.scan_prefix(PREFIX_BLACKLIST) {
            let (key, _) = item.map_err(|e| StorageError::DbError(e.to_string()))?;
            let login = String::from_utf8_lossy(&key[PREFIX_BLACKLIST.len()..]).to_lowercase();
            out.insert(login);
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(())
    }

    fn put<T: Serialize>(&self, key: Vec<u8>, value: &T) -> Result<(), StorageError> {
        let bytes =
            bincode::serialize(value).map_err(|e| StorageError::SerializeError(e.to_string()))?;
        self.db.insert(key, bytes).map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(())
    }
}

/// Smallest key strictly above every key carrying this prefix.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    end
}

#[derive(Debug)]
pub enum StorageError {
    DbError(String),
    SerializeError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DbError(e) => write!(f, "database error: {}", e),
            StorageError::SerializeError(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}
