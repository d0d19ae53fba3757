//! Resource fetching for dataset and model references
//!
//! A reference is one of:
//! - `http://` / `https://` URL
//! - `data:<mime>[;base64],<payload>` inline URL (the upload fallback)
//! - `file://` path written by [`LocalObjectStore`](crate::storage::LocalObjectStore),
//!   honoured only under the root given to [`HttpFetcher::with_local_root`]
//! - `mem://` path when the fetcher is attached to a [`MemoryObjectStore`]

use async_trait::async_trait;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::storage::MemoryObjectStore;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data url: {0}")]
    DataUrl(String),

    #[error("unsupported reference: {0}")]
    Unsupported(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("path outside the local store: {0}")]
    Forbidden(String),
}

pub type Result<T> = std::result::Result<T, FetchError>;

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    memory: Option<Arc<MemoryObjectStore>>,
    local_root: Option<PathBuf>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            memory: None,
            local_root: None,
        })
    }

    /// Also resolve `mem://` references against `store`
    pub fn with_memory_store(mut self, store: Arc<MemoryObjectStore>) -> Self {
        self.memory = Some(store);
        self
    }

    /// Resolve `file://` references, but only for paths under `root`
    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = Some(root.into());
        self
    }

    async fn read_local(&self, path: &str) -> Result<Vec<u8>> {
        let root = self
            .local_root
            .as_deref()
            .ok_or_else(|| FetchError::Unsupported(format!("file://{}", path)))?;
        let root = tokio::fs::canonicalize(root).await?;
        let target = tokio::fs::canonicalize(Path::new(path)).await?;
        if !target.starts_with(&root) {
            return Err(FetchError::Forbidden(path.to_string()));
        }
        Ok(tokio::fs::read(target).await?)
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Decode the payload of a `data:` URL
pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| FetchError::DataUrl("missing data: prefix".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::DataUrl("missing ',' separator".to_string()))?;

    if header.split(';').any(|part| part == "base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| FetchError::DataUrl(e.to_string()))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        debug!("Fetching {}", reference.chars().take(80).collect::<String>());

        if reference.starts_with("http://") || reference.starts_with("https://") {
            self.fetch_http(reference).await
        } else if reference.starts_with("data:") {
            decode_data_url(reference)
        } else if let Some(path) = reference.strip_prefix("file://") {
            self.read_local(path).await
        } else if reference.starts_with(crate::storage::memory::MEMORY_SCHEME) {
            let store = self
                .memory
                .as_ref()
                .ok_or_else(|| FetchError::Unsupported(reference.to_string()))?;
            store
                .get(reference)
                .ok_or_else(|| FetchError::NotFound(reference.to_string()))
        } else {
            Err(FetchError::Unsupported(reference.to_string()))
        }
    }
}
