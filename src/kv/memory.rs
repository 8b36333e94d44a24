//! In-memory KV store implementation using `DashMap`.
//!
//! State is lost on process restart. Sharing one instance between two
//! services (via `Arc`) simulates a restart against the same durable store.

use std::sync::atomic::{AtomicBool, Ordering};

use super::KvStore;
use crate::{Error, Result};
use dashmap::DashMap;

/// In-memory key-value store using a lock-free concurrent hashmap.
///
/// Writes can be made to fail with [`MemoryKvStore::fail_writes`] to
/// exercise persistence recovery paths.
///
/// # Example
///
/// ```rust
/// use trueno_ab::kv::{KvStore, MemoryKvStore};
///
/// # async fn example() -> trueno_ab::Result<()> {
/// let store = MemoryKvStore::new();
/// store.set("ab.identity", b"lx2k9-a8f3".to_vec()).await?;
/// assert_eq!(store.get("ab.identity").await?, Some(b"lx2k9-a8f3".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    store: DashMap<String, Vec<u8>>,
    fail_writes: AtomicBool,
}

impl MemoryKvStore {
    /// Create a new in-memory KV store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of entries in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Clear all entries, as if local storage were wiped.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Make every subsequent `set`/`delete` fail with `Error::Persistence`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!("write to {key} rejected")));
        }
        Ok(())
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_writable(key)?;
        self.store.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable(key)?;
        self.store.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_kv_set_get_overwrite() {
        let store = MemoryKvStore::new();

        store.set("key", b"value1".to_vec()).await.unwrap();
        store.set("key", b"value2".to_vec()).await.unwrap();

        assert_eq!(store.get("key").await.unwrap(), Some(b"value2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_kv_delete_nonexistent() {
        let store = MemoryKvStore::new();
        // Should not error
        store.delete("nonexistent").await.unwrap();
        assert!(!store.exists("nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_kv_clear() {
        let store = MemoryKvStore::new();
        store.set("a", b"1".to_vec()).await.unwrap();
        store.set("b", b"2".to_vec()).await.unwrap();

        store.clear();

        assert!(store.is_empty());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_kv_fail_writes() {
        let store = MemoryKvStore::new();
        store.set("a", b"1".to_vec()).await.unwrap();

        store.fail_writes(true);
        assert!(matches!(
            store.set("a", b"2".to_vec()).await,
            Err(Error::Persistence(_))
        ));
        assert!(store.delete("a").await.is_err());
        // Reads still work and see the last durable value.
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));

        store.fail_writes(false);
        store.set("a", b"3".to_vec()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_kv_concurrent_access() {
        let store = Arc::new(MemoryKvStore::new());
        let mut handles = vec![];

        for i in 0..100 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set(&format!("key{i}"), format!("value{i}").into_bytes())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
        assert_eq!(store.get("key42").await.unwrap(), Some(b"value42".to_vec()));
    }
}
