//! Raw object storage for uploaded bytes.
//!
//! Uploads themselves happen outside Pagewise; the pipeline only needs to
//! read bytes back by storage key. Two backends are provided:
//!
//! - **[`FsObjectStore`]** resolves keys under a local root directory.
//! - **[`HttpObjectStore`]** fetches `{base_url}/{key}` over HTTP.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::StorageConfig;

/// Read access to stored upload bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch_bytes(&self, key: &str) -> Result<Bytes>;
}

/// Keys are relative paths under `root`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key to a path, refusing anything that escapes `root`.
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("invalid storage key '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn fetch_bytes(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve(key)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Bytes::from(data))
    }
}

pub struct HttpObjectStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch_bytes(&self, key: &str) -> Result<Bytes> {
        let url = self.url_for(key);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("GET {} returned {}", url, status);
        }
        Ok(response.bytes().await?)
    }
}

/// Build the configured storage backend.
pub fn create_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.provider.as_str() {
        "fs" => Ok(Arc::new(FsObjectStore::new(&config.root))),
        "http" => {
            let base_url = config
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow!("storage.base_url required for http provider"))?;
            Ok(Arc::new(HttpObjectStore::new(
                base_url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        other => bail!("Unknown storage provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_keys_are_rejected() {
        let store = FsObjectStore::new("/srv/uploads");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
        assert_eq!(
            store.resolve("u1/report.pdf").unwrap(),
            PathBuf::from("/srv/uploads/u1/report.pdf")
        );
    }

    #[tokio::test]
    async fn fs_store_reads_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let store = FsObjectStore::new(dir.path());
        assert_eq!(store.fetch_bytes("a.txt").await.unwrap(), Bytes::from("hello"));
        assert!(store.fetch_bytes("missing.txt").await.is_err());
    }

    #[test]
    fn http_urls_join_cleanly() {
        let store = HttpObjectStore::new("https://files.example.com/", Duration::from_secs(1))
            .unwrap();
        assert_eq!(store.url_for("/k1"), "https://files.example.com/k1");
    }
}
