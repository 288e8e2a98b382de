//! Expiring key-value store used for attempt counters and block records.
//!
//! The detector and the gate only need per-key read, write-with-TTL,
//! existence check and delete. Expiry belongs to the backend; nothing in this
//! crate sweeps or polls.

use crate::policy::is_block_key;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Error from a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot be reached or its state is unusable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// No room for a new key without dropping a live block record.
    #[error("store full ({capacity} entries)")]
    Full { capacity: usize },
}

/// Key-value store with per-key expiry.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Read a live value. Missing and expired keys both read as `None`.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Write a value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError>;

    /// Check for a live value.
    async fn has(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove a key. Returns true if a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Add one to a counter and reset its TTL, returning the new value.
    ///
    /// The provided implementation is a plain read-then-write, so concurrent
    /// callers on the same key can lose increments. Backends with an atomic
    /// primitive should override it, keeping the TTL reset on every call.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let next = self.get(key).await?.unwrap_or(0).saturating_add(1);
        self.set(key, next, ttl).await?;
        Ok(next)
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Stored value with its expiry information.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub value: u64,
    /// When this entry was last written.
    pub written_at: Instant,
    pub ttl: Duration,
}

impl StoredEntry {
    fn new(value: u64, ttl: Duration) -> Self {
        Self {
            value,
            written_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.written_at.elapsed() >= self.ttl
    }
}

/// Thread-safe in-process store with lazy expiry.
///
/// When full, expired entries go first, then the oldest counter. A live block
/// record is only evicted to make room for another block record.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
    max_entries: usize,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` keys.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Remove expired entries.
    pub fn cleanup(&self) {
        if let Ok(mut entries) = self.entries.write() {
            evict_expired_entries(&mut entries);
        }
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn insert(
        &self,
        entries: &mut HashMap<String, StoredEntry>,
        key: &str,
        entry: StoredEntry,
    ) -> Result<(), StoreError> {
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            evict_expired_entries(entries);

            // Still full: drop the counter written longest ago
            if entries.len() >= self.max_entries {
                let victim = oldest_key(entries, |k| !is_block_key(k)).or_else(|| {
                    if is_block_key(key) {
                        oldest_key(entries, is_block_key)
                    } else {
                        None
                    }
                });

                match victim {
                    Some(victim) => {
                        entries.remove(&victim);
                    }
                    None => {
                        return Err(StoreError::Full {
                            capacity: self.max_entries,
                        })
                    }
                }
            }
        }

        entries.insert(key.to_string(), entry);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn evict_expired_entries(entries: &mut HashMap<String, StoredEntry>) {
    entries.retain(|_, v| !v.is_expired());
}

fn oldest_key(
    entries: &HashMap<String, StoredEntry>,
    eligible: impl Fn(&str) -> bool,
) -> Option<String> {
    entries
        .iter()
        .filter(|(k, _)| eligible(k.as_str()))
        .min_by_key(|(_, v)| v.written_at)
        .map(|(k, _)| k.clone())
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl ExpiringStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        self.insert(&mut entries, key, StoredEntry::new(value, ttl))
    }

    async fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries
            .remove(key)
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let current = entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map_or(0, |entry| entry.value);
        let next = current.saturating_add(1);
        self.insert(&mut entries, key, StoredEntry::new(next, ttl))?;
        Ok(next)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const MINUTE: Duration = Duration::from_secs(60);

    /// Store that relies on the provided read-then-write `increment`.
    struct PlainStore(MemoryStore);

    #[async_trait]
    impl ExpiringStore for PlainStore {
        async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
            self.0.set(key, value, ttl).await
        }

        async fn has(&self, key: &str) -> Result<bool, StoreError> {
            self.0.has(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.0.delete(key).await
        }

        fn name(&self) -> &str {
            "plain"
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new(1000);

        store.set("k", 7, MINUTE).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(7));
        assert!(store.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_miss() {
        let store = MemoryStore::new(1000);

        assert_eq!(store.get("missing").await.unwrap(), None);
        assert!(!store.has("missing").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration() {
        let store = MemoryStore::new(1000);
        store.set("k", 1, MINUTE).await.unwrap();

        advance(Duration::from_secs(59)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(1));

        advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.has("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_ttl() {
        let store = MemoryStore::new(1000);
        store.set("k", 1, MINUTE).await.unwrap();

        advance(Duration::from_secs(50)).await;
        store.set("k", 2, MINUTE).await.unwrap();

        advance(Duration::from_secs(50)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new(1000);
        store.set("k", 1, MINUTE).await.unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_expired_reports_false() {
        let store = MemoryStore::new(1000);
        store.set("k", 1, MINUTE).await.unwrap();

        advance(MINUTE).await;
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_refreshes_window() {
        let store = MemoryStore::new(1000);

        assert_eq!(store.increment("c", MINUTE).await.unwrap(), 1);
        advance(Duration::from_secs(45)).await;
        assert_eq!(store.increment("c", MINUTE).await.unwrap(), 2);
        advance(Duration::from_secs(45)).await;

        // 90s after the first write, but only 45s after the last one
        assert_eq!(store.get("c").await.unwrap(), Some(2));

        advance(MINUTE).await;
        assert_eq!(store.increment("c", MINUTE).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_increment_matches_atomic_semantics() {
        let store = PlainStore(MemoryStore::new(1000));

        assert_eq!(store.increment("c", MINUTE).await.unwrap(), 1);
        assert_eq!(store.increment("c", MINUTE).await.unwrap(), 2);

        advance(Duration::from_secs(30)).await;
        assert_eq!(store.increment("c", MINUTE).await.unwrap(), 3);

        advance(Duration::from_secs(45)).await;
        assert_eq!(store.get("c").await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_entries() {
        let store = MemoryStore::new(2);

        store.set("a", 1, MINUTE).await.unwrap();
        advance(Duration::from_millis(1)).await;
        store.set("b", 2, MINUTE).await.unwrap();
        advance(Duration::from_millis(1)).await;
        store.set("c", 3, MINUTE).await.unwrap();

        // Oldest write (a) is evicted
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_entries_keeps_block_records() {
        let store = MemoryStore::new(4);
        let block = "scan_detect_blocked_192.168.1.100";

        store.set(block, 1, Duration::from_secs(300)).await.unwrap();
        for i in 1..=4 {
            advance(Duration::from_millis(1)).await;
            let key = format!("scan_detect_count_10.0.0.{i}");
            store.increment(&key, MINUTE).await.unwrap();
        }

        assert_eq!(store.len(), 4);
        assert!(store.has(block).await.unwrap());
        assert_eq!(store.get("scan_detect_count_10.0.0.1").await.unwrap(), None);
        assert_eq!(store.get("scan_detect_count_10.0.0.4").await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_of_blocks_rejects_counter() {
        let store = MemoryStore::new(2);
        let first = "scan_detect_blocked_192.168.1.1";
        let second = "scan_detect_blocked_192.168.1.2";

        store.set(first, 1, Duration::from_secs(300)).await.unwrap();
        advance(Duration::from_millis(1)).await;
        store.set(second, 1, Duration::from_secs(300)).await.unwrap();

        let err = store
            .increment("scan_detect_count_192.168.1.3", MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Full { capacity: 2 }));
        assert!(store.has(first).await.unwrap());

        // A new block displaces the oldest block
        store
            .set("scan_detect_blocked_192.168.1.3", 1, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(!store.has(first).await.unwrap());
        assert!(store.has(second).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_entries_prefers_expired() {
        let store = MemoryStore::new(2);

        store.set("short", 1, Duration::from_secs(1)).await.unwrap();
        store.set("long", 2, MINUTE).await.unwrap();
        advance(Duration::from_secs(2)).await;
        store.set("new", 3, MINUTE).await.unwrap();

        assert_eq!(store.get("long").await.unwrap(), Some(2));
        assert_eq!(store.get("new").await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup() {
        let store = MemoryStore::new(1000);
        store.set("a", 1, Duration::from_secs(1)).await.unwrap();
        store.set("b", 2, Duration::from_secs(1)).await.unwrap();

        advance(Duration::from_secs(2)).await;
        store.cleanup();

        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStore::new(1000);
        store.set("a", 1, MINUTE).await.unwrap();
        store.set("b", 2, MINUTE).await.unwrap();

        assert_eq!(store.len(), 2);

        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_entry_is_expired() {
        let entry = StoredEntry::new(1, MINUTE);
        assert!(!entry.is_expired());

        advance(Duration::from_secs(100)).await;
        assert!(entry.is_expired());
    }
}
