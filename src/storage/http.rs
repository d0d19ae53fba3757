//! REST object storage client

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{validate_path, ObjectStore, Result, StorageError};

pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    api_key: String,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, bucket: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        validate_path(path)?;
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, path
        );
        debug!("Uploading {} bytes to {}", bytes.len(), url);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Rejected { status, body });
        }

        Ok(self.public_url(path))
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_upload_returns_public_url() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/storage/v1/object/trained-models/models/m.json")
                .header("Authorization", "Bearer secret")
                .header("Content-Type", "application/json");
            then.status(200).body(r#"{"Key":"trained-models/models/m.json"}"#);
        });

        let store = HttpObjectStore::new(&server.base_url(), "trained-models", "secret").unwrap();
        let url = store
            .upload("models/m.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();

        mock.assert();
        assert_eq!(
            url,
            format!(
                "{}/storage/v1/object/public/trained-models/models/m.json",
                server.base_url()
            )
        );
    }

    #[tokio::test]
    async fn test_upload_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(403).body("forbidden");
        });

        let store = HttpObjectStore::new(&server.base_url(), "trained-models", "bad").unwrap();
        let err = store
            .upload("models/m.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected { status: 403, .. }));
    }
}
