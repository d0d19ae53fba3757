//! In-process object store used by tests and `simulate`

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{validate_path, ObjectStore, Result, StorageError};

pub const MEMORY_SCHEME: &str = "mem://";

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
    fail_uploads: Mutex<bool>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent uploads fail, to exercise the inline fallback
    pub fn set_fail_uploads(&self, fail: bool) {
        *self.fail_uploads.lock() = fail;
    }

    /// Resolve a `mem://` URL
    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        let path = url.strip_prefix(MEMORY_SCHEME)?;
        self.objects.get(path).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        validate_path(path)?;
        if *self.fail_uploads.lock() {
            return Err(StorageError::Rejected {
                status: 503,
                body: "uploads disabled".to_string(),
            });
        }
        self.objects.insert(path.to_string(), bytes);
        Ok(self.public_url(path))
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}{}", MEMORY_SCHEME, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_get() {
        let store = MemoryObjectStore::new();
        let url = store
            .upload("models/a.json", b"hello".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(url, "mem://models/a.json");
        assert_eq!(store.get(&url), Some(b"hello".to_vec()));
        assert_eq!(store.get("mem://missing"), None);
    }

    #[tokio::test]
    async fn test_failing_uploads() {
        let store = MemoryObjectStore::new();
        store.set_fail_uploads(true);
        assert!(store.upload("models/a.json", vec![], "x").await.is_err());
        assert!(store.is_empty());
    }
}
