//! Durable anonymous identity
//!
//! One opaque identifier per installation, created lazily and persisted
//! before it is handed out. It is only regenerated if the underlying store
//! is wiped.

use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;

use crate::kv::KvStore;
use crate::Result;

/// Length of the random suffix.
const SUFFIX_LEN: usize = 9;

/// Creates and caches the installation identity.
pub struct IdentityManager<S: KvStore> {
    store: Arc<S>,
    key: String,
    cached: Mutex<Option<String>>,
}

impl<S: KvStore> IdentityManager<S> {
    /// Create a manager persisting under `key`.
    #[must_use]
    pub fn new(store: Arc<S>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            cached: Mutex::new(None),
        }
    }

    /// Return the persisted identity, creating and persisting one first if
    /// none exists.
    ///
    /// A persisted value that is not valid non-empty UTF-8 is treated as
    /// absent and replaced.
    ///
    /// # Errors
    ///
    /// Returns the store error if reading fails or the new identity cannot be
    /// persisted. Nothing is cached in that case, so the next call retries.
    pub async fn get_or_create(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        if let Some(bytes) = self.store.get(&self.key).await? {
            match String::from_utf8(bytes) {
                Ok(identity) if !identity.trim().is_empty() => {
                    *cached = Some(identity.clone());
                    return Ok(identity);
                }
                _ => tracing::warn!(key = %self.key, "persisted identity unreadable; regenerating"),
            }
        }

        let identity = generate_identity();
        self.store
            .set(&self.key, identity.clone().into_bytes())
            .await?;
        tracing::debug!(%identity, "created anonymous identity");
        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// Drop the in-memory copy so the next call re-reads the store.
    pub async fn forget_cached(&self) {
        *self.cached.lock().await = None;
    }
}

/// Time-based prefix (base-36 milliseconds) plus a random alphanumeric
/// suffix. Unique enough for bucketing; not a security token.
#[must_use]
pub fn generate_identity() -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{suffix}", to_base36(millis))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
