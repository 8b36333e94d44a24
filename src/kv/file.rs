//! File-backed KV store: one file per key inside a directory.
//!
//! Writes go to a `~<key>.<nonce>.tmp` sibling, are flushed with
//! `sync_all`, then renamed over the live file. A failed write removes its
//! temp file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::KvStore;
use crate::Result;

/// Durable KV store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }

    // `~` never appears in an encoded key, so temp files cannot shadow keys.
    fn temp_path_for(&self, key: &str) -> PathBuf {
        let nonce: u32 = rand::random();
        self.root.join(format!("~{}.{nonce:08x}.tmp", encode_key(key)))
    }
}

/// Map a key onto a portable file name. Unreserved characters pass through;
/// everything else becomes `%XX` so distinct keys never collide.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    // Keep "", "." and ".." from resolving to the directory itself.
    if out.is_empty() || out.chars().all(|c| c == '.') {
        out = out.replace('.', "%2E");
        out.push_str("%_");
    }
    out
}

async fn write_replace(tmp: &Path, path: &Path, value: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(value).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, path).await
}

impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.temp_path_for(key);

        if let Err(error) = write_replace(&tmp, &path, &value).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %tmp.display(), %cleanup, "temp file left behind");
                }
            }
            return Err(error.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("ab.identity"), "ab.identity");
        assert_eq!(encode_key("a/b"), "a%2Fb");
        assert_eq!(encode_key("a%b"), "a%25b");
        assert_ne!(encode_key(""), "");
        assert_ne!(encode_key(".."), "..");
    }

    #[tokio::test]
    async fn test_file_kv_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileKvStore::open(dir.path()).await.unwrap();
            store.set("ab.identity", b"abc-123".to_vec()).await.unwrap();
        }

        let reopened = FileKvStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("ab.identity").await.unwrap(),
            Some(b"abc-123".to_vec())
        );
        assert!(reopened.exists("ab.identity").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_kv_missing_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path().join("nested/state")).await.unwrap();

        assert_eq!(store.get("missing").await.unwrap(), None);
        store.delete("missing").await.unwrap();

        store.set("k", b"v".to_vec()).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_kv_overwrite_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();

        store.set("k", b"first".to_vec()).await.unwrap();
        store.set("k", b"second".to_vec()).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"second".to_vec()));
        let names: Vec<_> = std::fs::read_dir(&store.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_write_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();

        // A non-empty directory at the key's path makes the rename fail.
        let blocked = dir.path().join("ab.events");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), b"x").unwrap();

        assert!(store.set("ab.events", b"[]".to_vec()).await.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('~'))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }
}
