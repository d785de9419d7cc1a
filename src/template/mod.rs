//! The current work template and the duplicate-share log.
//!
//! The refresh loop is the only writer of the template slot; miners, the
//! broadcaster, and the share pipeline read it. A published template is
//! immutable — superseding never mutates, it swaps the `Arc`.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// One snapshot of mineable work.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    /// 32-byte header hash, `0x` hex.
    pub header: String,
    /// DAG seed hash, `0x` hex.
    pub seed: String,
    /// Network target boundary, `0x` hex, big-endian 256-bit.
    pub target: String,
    pub height: u64,
    pub difficulty: u64,
    /// Cached `eth_getBlockByNumber("pending")` reply, served verbatim.
    pub pending_block: Option<Value>,
}

impl BlockTemplate {
    /// An empty header means the upstream had no work; never serve it.
    pub fn is_ready(&self) -> bool {
        !self.header.is_empty()
    }
}

const SHARE_LOG_SHARDS: usize = 16;

struct Shard {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

/// Sharded FIFO set of recently-seen share fingerprints.
///
/// `insert` is the linearization point for duplicate detection: for a given
/// fingerprint, exactly one caller observes `true`.
pub struct ShareLog {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
}

impl ShareLog {
    pub fn new(capacity: usize) -> Self {
        let shard_capacity = (capacity / SHARE_LOG_SHARDS).max(1);
        let shards = (0..SHARE_LOG_SHARDS)
            .map(|_| Mutex::new(Shard { seen: HashSet::new(), order: VecDeque::new() }))
            .collect();
        Self { shards, shard_capacity }
    }

    fn shard_of(&self, fingerprint: &str) -> &Mutex<Shard> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARE_LOG_SHARDS]
    }

    /// Record a fingerprint. Returns false if it was already present.
    pub fn insert(&self, fingerprint: &str) -> bool {
        let mut shard = self.shard_of(fingerprint).lock();
        if !shard.seen.insert(fingerprint.to_string()) {
            return false;
        }
        shard.order.push_back(fingerprint.to_string());
        if shard.order.len() > self.shard_capacity {
            if let Some(oldest) = shard.order.pop_front() {
                shard.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.shard_of(fingerprint).lock().seen.contains(fingerprint)
    }
}

/// Headers from this many recent templates are still accepted for shares.
const RECENT_HEADERS: usize = 3;

/// Single-slot holder of the latest template plus the share log.
pub struct TemplateCache {
    slot: RwLock<Option<Arc<BlockTemplate>>>,
    recent: RwLock<VecDeque<(String, u64)>>,
    shares: ShareLog,
}

impl TemplateCache {
    /// `share_capacity` bounds the duplicate log, sized for expected miners
    /// times the handful of templates still in flight.
    pub fn new(share_capacity: usize) -> Self {
        Self {
            slot: RwLock::new(None),
            recent: RwLock::new(VecDeque::with_capacity(RECENT_HEADERS)),
            shares: ShareLog::new(share_capacity),
        }
    }

    /// The atomically published current template. Never blocks on the writer
    /// beyond the pointer swap itself.
    pub fn current(&self) -> Option<Arc<BlockTemplate>> {
        self.slot.read().clone()
    }

    /// Single-writer publication: one pointer swap, old readers keep their Arc.
    pub fn publish(&self, template: BlockTemplate) -> Arc<BlockTemplate> {
        let template = Arc::new(template);
        {
            let mut recent = self.recent.write();
            recent.push_back((template.header.clone(), template.height));
            if recent.len() > RECENT_HEADERS {
                recent.pop_front();
            }
        }
        *self.slot.write() = Some(template.clone());
        template
    }

    /// Height of a recently published header; `None` means the share is stale
    /// beyond the window this proxy accepts.
    pub fn height_of(&self, header: &str) -> Option<u64> {
        self.recent.read().iter().rev().find(|(h, _)| h == header).map(|(_, height)| *height)
    }

    /// Duplicate detection; `true` means the share is fresh and now recorded.
    pub fn insert_share(&self, fingerprint: &str) -> bool {
        self.shares.insert(fingerprint)
    }
}

/// Dedup key for one submission: height, header hash, nonce, hex-concatenated.
pub fn share_fingerprint(height: u64, header: &str, nonce: &str) -> String {
    format!(
        "{:x}{}{}",
        height,
        header.strip_prefix("0x").unwrap_or(header),
        nonce.strip_prefix("0x").unwrap_or(nonce)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(header: &str, height: u64) -> BlockTemplate {
        BlockTemplate {
            header: header.to_string(),
            seed: "0xseed".into(),
            target: "0xtarget".into(),
            height,
            difficulty: 1000,
            pending_block: None,
        }
    }

    #[test]
    fn test_publish_and_current() {
        let cache = TemplateCache::new(100);
        assert!(cache.current().is_none());

        cache.publish(template("0xaa", 1));
        let t = cache.current().unwrap();
        assert_eq!(t.header, "0xaa");
        assert_eq!(t.height, 1);
    }

    #[test]
    fn test_publication_supersedes() {
        let cache = TemplateCache::new(100);
        let old = cache.publish(template("0xaa", 1));
        cache.publish(template("0xbb", 2));
        // Readers holding the old Arc still see their snapshot; new reads
        // observe the latest publication.
        assert_eq!(old.header, "0xaa");
        assert_eq!(cache.current().unwrap().header, "0xbb");
    }

    #[test]
    fn test_recent_header_window() {
        let cache = TemplateCache::new(100);
        for i in 0..5u64 {
            cache.publish(template(&format!("0x{:02}", i), i));
        }
        // Only the last RECENT_HEADERS templates are still known.
        assert_eq!(cache.height_of("0x04"), Some(4));
        assert_eq!(cache.height_of("0x02"), Some(2));
        assert_eq!(cache.height_of("0x01"), None);
        assert_eq!(cache.height_of("0x00"), None);
    }

    #[test]
    fn test_not_ready_template() {
        assert!(!template("", 1).is_ready());
        assert!(template("0xaa", 1).is_ready());
    }

    #[test]
    fn test_duplicate_share_detected() {
        let cache = TemplateCache::new(100);
        let fp = share_fingerprint(5, "0xaaaa", "0x1111");
        assert!(cache.insert_share(&fp));
        assert!(!cache.insert_share(&fp));
    }

    #[test]
    fn test_distinct_fingerprints() {
        let a = share_fingerprint(5, "0xaaaa", "0x1111");
        let b = share_fingerprint(5, "0xaaaa", "0x2222");
        let c = share_fingerprint(6, "0xaaaa", "0x1111");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_share_log_evicts_fifo() {
        let log = ShareLog::new(16); // one slot per shard
        // Fill one shard past its bound; oldest entries drop out.
        let mut keys = Vec::new();
        for i in 0..64 {
            let key = format!("fp-{}", i);
            assert!(log.insert(&key));
            keys.push(key);
        }
        let still_present = keys.iter().filter(|k| log.contains(k)).count();
        assert!(still_present <= 16, "evictions expected, {} left", still_present);
        // Re-inserting an evicted key succeeds again.
        let evicted = keys.iter().find(|k| !log.contains(k)).unwrap();
        assert!(log.insert(evicted));
    }

    #[test]
    fn test_share_log_concurrent_single_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let log = Arc::new(ShareLog::new(1024));
        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let log = log.clone();
            let wins = wins.clone();
            handles.push(std::thread::spawn(move || {
                if log.insert("contended") {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
