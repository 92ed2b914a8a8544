//! Filesystem Backend
//!
//! Single-process L2 tier on local disk: one file per key under a root
//! directory, named by a Blake2b-128 digest of the key so arbitrary key
//! strings never reach the filesystem. Each file carries a small expiry
//! header ahead of the payload; expired files are unlinked lazily on
//! access.
//!
//! File layout: `expires_at_unix_ms(8, LE; 0 = no expiry) || payload(*)`.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use bytes::Bytes;

use crate::error::{Error, Result};

use super::CacheBackend;

const HEADER_LEN: usize = 8;

/// Local-disk byte store for single-process deployments.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (and create) the store under `root`.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Blake2b::<U16>::new();
        hasher.update(key.as_bytes());
        self.root.join(format!("{}.cache", hex::encode(hasher.finalize())))
    }

    fn now_unix_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Read a file and enforce its expiry header. Returns the payload.
    async fn read_live(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if raw.len() < HEADER_LEN {
            // Truncated write; drop the file rather than serve garbage
            let _ = tokio::fs::remove_file(&path).await;
            return Err(Error::MalformedEnvelope(
                "cache file shorter than its expiry header".into(),
            ));
        }

        let expires_at = u64::from_le_bytes(raw[..HEADER_LEN].try_into().expect("8-byte header"));
        if expires_at != 0 && Self::now_unix_ms() > expires_at {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(Bytes::copy_from_slice(&raw[HEADER_LEN..])))
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.read_live(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Self::now_unix_ms() + ttl.as_millis() as u64,
            None => 0,
        };

        let mut contents = Vec::with_capacity(HEADER_LEN + value.len());
        contents.extend_from_slice(&expires_at.to_le_bytes());
        contents.extend_from_slice(&value);

        // Write-then-rename so readers never observe a half-written file
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read_live(key).await?.is_some())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend() -> (TempDir, FileBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (_dir, backend) = backend().await;

        backend
            .set("ns:a:func:f:args:x:1s", Bytes::from_static(b"payload"), None)
            .await
            .unwrap();
        assert_eq!(
            backend.get("ns:a:func:f:args:x:1s").await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let (_dir, backend) = backend().await;
        assert_eq!(backend.get("absent").await.unwrap(), None);
        assert!(!backend.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry_unlinks_file() {
        let (_dir, backend) = backend().await;
        backend
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(backend.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, backend) = backend().await;
        backend
            .set("k", Bytes::from_static(b"v"), None)
            .await
            .unwrap();

        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_arbitrary_key_characters() {
        let (_dir, backend) = backend().await;
        let key = "ns:weird/../key\0with:everything";
        backend
            .set(key, Bytes::from_static(b"safe"), None)
            .await
            .unwrap();
        assert_eq!(
            backend.get(key).await.unwrap(),
            Some(Bytes::from_static(b"safe"))
        );
    }

    #[tokio::test]
    async fn test_binary_payload_roundtrip() {
        let (_dir, backend) = backend().await;
        let payload: Vec<u8> = (0..=255).collect();
        backend
            .set("bin", Bytes::from(payload.clone()), None)
            .await
            .unwrap();
        assert_eq!(
            backend.get("bin").await.unwrap().unwrap().as_ref(),
            payload.as_slice()
        );
    }
}
