//! Key-value persistence for local experiment state
//!
//! Identity, assignment cache, sync mode and the local event log are all
//! persisted through a [`KvStore`]:
//! - [`MemoryKvStore`]: `DashMap`-backed, lost on restart (tests, ephemeral)
//! - [`FileKvStore`]: one file per key with atomic replace (durable)
//!
//! # Example
//!
//! ```rust,no_run
//! use trueno_ab::kv::{KvStore, MemoryKvStore};
//!
//! # async fn example() -> trueno_ab::Result<()> {
//! let store = MemoryKvStore::new();
//!
//! store.set_json("ab.sync_mode", &"local-only").await?;
//! let mode: Option<String> = store.get_json("ab.sync_mode").await?;
//! assert_eq!(mode.as_deref(), Some("local-only"));
//!
//! store.delete("ab.sync_mode").await?;
//! assert!(!store.exists("ab.sync_mode").await?);
//! # Ok(())
//! # }
//! ```

mod file;
mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

/// Durable key-value store for local state.
///
/// `set` must not return until the value is durable for the backend, so a
/// crash right after a completed write does not lose it.
pub trait KvStore: Send + Sync + 'static {
    /// Get a value by key.
    ///
    /// Returns `None` if the key doesn't exist.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Set a value for a key.
    ///
    /// Overwrites any existing value.
    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Delete a key.
    ///
    /// No-op if the key doesn't exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check if a key exists.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Get and decode a JSON value.
    ///
    /// A payload that fails to decode is reported as `Error::Persistence`
    /// so callers can recover by recomputing.
    fn get_json<T>(&self, key: &str) -> impl Future<Output = Result<Option<T>>> + Send
    where
        T: DeserializeOwned,
    {
        async move {
            match self.get(key).await? {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(|e| Error::Persistence(format!("{key}: {e}"))),
                None => Ok(None),
            }
        }
    }

    /// Encode a value as JSON and store it.
    fn set_json<T>(&self, key: &str, value: &T) -> impl Future<Output = Result<()>> + Send
    where
        T: Serialize + Sync,
    {
        async move {
            let bytes = serde_json::to_vec(value)?;
            self.set(key, bytes).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_json_roundtrip() {
        let store = MemoryKvStore::new();
        let mut map = BTreeMap::new();
        map.insert("checkout-cta".to_string(), "B".to_string());

        store.set_json("assignments", &map).await.unwrap();
        let loaded: Option<BTreeMap<String, String>> =
            store.get_json("assignments").await.unwrap();

        assert_eq!(loaded, Some(map));
    }

    #[tokio::test]
    async fn test_json_missing_key() {
        let store = MemoryKvStore::new();
        let loaded: Option<Vec<String>> = store.get_json("nothing").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_json_corrupt_payload_is_persistence_error() {
        let store = MemoryKvStore::new();
        store.set("assignments", b"{not json".to_vec()).await.unwrap();

        let err = store
            .get_json::<BTreeMap<String, String>>("assignments")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Persistence(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_json_wrong_shape_is_persistence_error() {
        let store = MemoryKvStore::new();
        store.set_json("assignments", &vec![1, 2, 3]).await.unwrap();

        let result = store.get_json::<BTreeMap<String, String>>("assignments").await;
        assert!(matches!(result, Err(Error::Persistence(_))));
    }
}
