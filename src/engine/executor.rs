//! Job execution
//!
//! Recoverable failures degrade here rather than failing the job:
//! - dataset fetch/parse failure -> synthetic samples
//! - model fetch/load failure -> default-initialized weights
//! - artifact upload failure -> inline `data:` URL
//!
//! Only a fault inside the blocking pool, or a training run whose weights
//! overflow, surfaces as an error.

use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::artifact::{load_network, ArtifactFormat, ArtifactMetadata, ModelArtifact};
use super::dataset::{parse_csv, synthetic_samples, DataSource, Sample};
use super::network::{fit_to_width, Mlp};
use super::{EngineConfig, EngineError, Result};
use crate::core::{InferenceOutput, Job, JobPayload};
use crate::fetch::Fetcher;
use crate::storage::{model_object_path, ObjectStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub final_loss: f64,
    pub epochs: usize,
    pub data_points: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Trained {
        summary: TrainingSummary,
        /// Object store URL or inline data URL of the generic artifact
        result_ref: String,
    },
    Inferred(InferenceOutput),
}

impl JobOutcome {
    pub fn result_ref(&self) -> Option<&str> {
        match self {
            JobOutcome::Trained { result_ref, .. } => Some(result_ref),
            JobOutcome::Inferred(_) => None,
        }
    }

    /// JSON value delivered to job-completion observers
    pub fn result_value(&self) -> serde_json::Value {
        let value = match self {
            JobOutcome::Trained { summary, .. } => serde_json::to_value(summary),
            JobOutcome::Inferred(output) => serde_json::to_value(output),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

pub struct ExecutionEngine {
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ObjectStore>,
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Fault(e.to_string()))
}

/// Raw input vector from `{"data": [...]}` or a bare array; ten zeros when
/// neither parses
pub fn parse_inference_input(raw: &str) -> Vec<f64> {
    let parsed: Option<serde_json::Value> = serde_json::from_str(raw).ok();
    let values = parsed.and_then(|value| {
        let array = match value.get("data") {
            Some(data) => data.as_array()?.clone(),
            None => value.as_array()?.clone(),
        };
        array.iter().map(serde_json::Value::as_f64).collect::<Option<Vec<f64>>>()
    });
    values.unwrap_or_else(|| vec![0.0; 10])
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            fetcher,
            store,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn execute(&self, job: &Job, worker_id: &str) -> Result<JobOutcome> {
        match &job.payload {
            JobPayload::Training { data_ref, .. } => {
                self.run_training(&job.id, data_ref.as_deref(), worker_id).await
            }
            JobPayload::Inference { model_ref, input } => self
                .run_inference(model_ref.as_deref(), input)
                .await
                .map(JobOutcome::Inferred),
        }
    }

    // ========================================================================
    // TRAINING
    // ========================================================================

    /// Fetched dataset when available and non-empty, synthetic otherwise
    pub async fn load_samples(&self, data_ref: Option<&str>) -> (Vec<Sample>, DataSource) {
        if let Some(reference) = data_ref.filter(|r| !r.is_empty()) {
            match self.fetcher.fetch(reference).await {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let samples = parse_csv(&text, self.config.input_size);
                    if !samples.is_empty() {
                        info!("Loaded {} training samples", samples.len());
                        return (samples, DataSource::Fetched);
                    }
                    warn!("Dataset {} had no usable rows, using synthetic data", reference);
                }
                Err(e) => warn!("Failed to load dataset, using synthetic data: {}", e),
            }
        } else {
            debug!("No dataset reference, using synthetic data");
        }

        let samples = synthetic_samples(
            self.config.synthetic_samples,
            self.config.input_size,
            &mut rand::thread_rng(),
        );
        (samples, DataSource::Synthetic)
    }

    async fn run_training(
        &self,
        job_id: &str,
        data_ref: Option<&str>,
        worker_id: &str,
    ) -> Result<JobOutcome> {
        let (samples, _) = self.load_samples(data_ref).await;
        let config = self.config.clone();

        let (network, report) = run_blocking(move || {
            let mut rng = rand::thread_rng();
            let mut network = Mlp::new(config.shape(), &mut rng);
            let report = network.train(&samples, config.epochs, config.learning_rate, &mut rng);
            (network, report)
        })
        .await?;
        if !report.final_loss.is_finite() || !network.is_finite() {
            return Err(EngineError::Fault(format!(
                "training diverged for job {} (loss={})",
                crate::core::short_id(job_id),
                report.final_loss
            )));
        }
        info!(
            "Training complete for job {}: loss={:.6}",
            crate::core::short_id(job_id),
            report.final_loss
        );

        let trained_at = Utc::now();
        let artifact = ModelArtifact::from_network(
            &network,
            ArtifactMetadata::new(report.final_loss, trained_at, worker_id),
        );
        let result_ref = self
            .persist_artifact(job_id, &artifact, trained_at.timestamp_millis())
            .await?;

        Ok(JobOutcome::Trained {
            summary: TrainingSummary {
                final_loss: report.final_loss,
                epochs: report.epochs,
                data_points: report.samples,
            },
            result_ref,
        })
    }

    /// Upload the generic encoding, inlining it as a data URL if the upload fails
    async fn persist_artifact(
        &self,
        job_id: &str,
        artifact: &ModelArtifact,
        unix_millis: i64,
    ) -> Result<String> {
        let format = ArtifactFormat::Generic;
        let bytes = artifact.encode(format)?;
        let path = model_object_path(job_id, unix_millis);

        match self
            .store
            .upload(&path, bytes.clone(), format.content_type())
            .await
        {
            Ok(url) => {
                debug!("Uploaded model to {}", url);
                Ok(url)
            }
            Err(e) => {
                warn!("Model upload failed, inlining artifact: {}", e);
                Ok(format!(
                    "data:{};base64,{}",
                    format.content_type(),
                    base64::engine::general_purpose::STANDARD.encode(&bytes)
                ))
            }
        }
    }

    // ========================================================================
    // INFERENCE
    // ========================================================================

    async fn load_model(&self, model_ref: Option<&str>) -> Option<Mlp> {
        let reference = model_ref.filter(|r| !r.is_empty())?;
        let bytes = match self.fetcher.fetch(reference).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Model fetch failed, using default weights: {}", e);
                return None;
            }
        };
        match load_network(&bytes, self.config.shape()) {
            Ok(network) => Some(network),
            Err(e) => {
                warn!("Model load failed, using default weights: {}", e);
                None
            }
        }
    }

    async fn run_inference(
        &self,
        model_ref: Option<&str>,
        raw_input: &str,
    ) -> Result<InferenceOutput> {
        let loaded = self.load_model(model_ref).await;
        let input = parse_inference_input(raw_input);
        let config = self.config.clone();

        run_blocking(move || {
            let network =
                loaded.unwrap_or_else(|| Mlp::new(config.shape(), &mut rand::thread_rng()));
            let output = network.forward(fit_to_width(&input, config.input_size).view());
            let prediction = output.get(0).copied().unwrap_or(0.5);
            InferenceOutput {
                prediction,
                confidence: (prediction - 0.5).abs() * 2.0,
                input_shape: input.len(),
                processed_by: config.processor_name,
            }
        })
        .await
    }
}
