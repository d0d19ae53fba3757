//! Filesystem object store

use async_trait::async_trait;
use std::path::PathBuf;

use super::{validate_path, ObjectStore, Result};

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        validate_path(path)?;
        let target = self.object_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(self.public_url(path))
    }

    fn public_url(&self, path: &str) -> String {
        format!("file://{}", self.object_path(path).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        let url = store
            .upload("models/model_x_1.json", b"{\"a\":1}".to_vec(), "application/json")
            .await
            .unwrap();

        assert!(url.starts_with("file://"));
        let written = std::fs::read(dir.path().join("models/model_x_1.json")).unwrap();
        assert_eq!(written, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store
            .upload("../escape.json", vec![], "application/json")
            .await
            .is_err());
    }
}
