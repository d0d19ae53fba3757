//! Artifact download
//!
//! Resolves a job's result reference, decodes whichever layout it holds and
//! re-encodes it in the requested format. When the artifact cannot be
//! fetched or decoded, a default-initialized artifact is exported instead so
//! the caller always receives a file.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::core::short_id;
use crate::engine::artifact::{load_network, ArtifactMetadata};
use crate::engine::{ArtifactFormat, EngineError, ModelArtifact, NetworkShape};
use crate::fetch::Fetcher;
use crate::ledger::{Ledger, LedgerError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("encode error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDownload {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
    /// False when the default artifact was substituted
    pub from_job: bool,
}

pub fn download_filename(job_id: &str, format: ArtifactFormat) -> String {
    format!("model_{}.{}", short_id(job_id), format.extension())
}

pub struct ArtifactExporter {
    ledger: Arc<dyn Ledger>,
    fetcher: Arc<dyn Fetcher>,
    shape: NetworkShape,
}

impl ArtifactExporter {
    pub fn new(ledger: Arc<dyn Ledger>, fetcher: Arc<dyn Fetcher>, shape: NetworkShape) -> Self {
        Self {
            ledger,
            fetcher,
            shape,
        }
    }

    pub async fn export(
        &self,
        job_id: &str,
        format: ArtifactFormat,
    ) -> Result<ArtifactDownload, DownloadError> {
        let job = self
            .ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| DownloadError::JobNotFound(job_id.to_string()))?;

        let resolved = match job.result_ref.as_deref() {
            Some(reference) => self.resolve(reference).await,
            None => None,
        };
        let from_job = resolved.is_some();
        let artifact = match resolved {
            Some(artifact) => artifact,
            None => {
                warn!(
                    "No usable artifact for job {}, exporting default model",
                    job.short_id()
                );
                ModelArtifact::untrained(
                    self.shape,
                    job.provider.as_deref().unwrap_or("unknown"),
                    job.completed_at.unwrap_or_else(Utc::now),
                    &mut rand::thread_rng(),
                )
            }
        };

        Ok(ArtifactDownload {
            filename: download_filename(&job.id, format),
            content_type: format.content_type(),
            bytes: artifact.encode(format)?,
            from_job,
        })
    }

    async fn resolve(&self, reference: &str) -> Option<ModelArtifact> {
        let bytes = match self.fetcher.fetch(reference).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Artifact fetch failed: {}", e);
                return None;
            }
        };

        if let Ok(artifact) = ModelArtifact::decode(&bytes) {
            return Some(artifact);
        }

        // Older workers uploaded a different envelope; keep the weights
        match load_network(&bytes, self.shape) {
            Ok(network) => Some(ModelArtifact::from_network(
                &network,
                ArtifactMetadata::new(0.0, Utc::now(), "unknown"),
            )),
            Err(e) => {
                warn!("Artifact decode failed: {}", e);
                None
            }
        }
    }
}
