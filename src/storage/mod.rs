//! Object storage for trained model artifacts
//!
//! Uploads return a URL that is written into the job's result reference and
//! later resolved by the fetcher.

pub mod http;
pub mod local;
pub mod memory;

pub use http::HttpObjectStore;
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use thiserror::Error;

/// Bucket that holds trained model artifacts
pub const MODEL_BUCKET: &str = "trained-models";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upload rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid object path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path` and return a URL the fetcher can resolve
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    fn public_url(&self, path: &str) -> String;
}

/// Object path for a job's generic artifact
pub fn model_object_path(job_id: &str, unix_millis: i64) -> String {
    format!("models/model_{}_{}.json", job_id, unix_millis)
}

/// Reject absolute paths and parent traversal
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_object_path() {
        assert_eq!(
            model_object_path("abc", 1700000000000),
            "models/model_abc_1700000000000.json"
        );
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("models/model_a_1.json").is_ok());
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("/abs").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("").is_err());
    }
}
