//! Embedded execution engine
//!
//! A fixed-architecture perceptron that trains on a fetched CSV dataset (or
//! synthetic data), runs inference, and encodes its parameters into
//! interchange artifacts. CPU-bound work runs on the blocking pool.

pub mod artifact;
pub mod dataset;
pub mod executor;
pub mod network;

pub use artifact::{ArtifactFormat, ArtifactMetadata, ModelArtifact};
pub use dataset::{DataSource, Sample};
pub use executor::{ExecutionEngine, JobOutcome, TrainingSummary};
pub use network::{Mlp, ModelParameters, NetworkShape, TrainingReport};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unknown artifact format: {0}")]
    UnknownFormat(String),

    /// Panic or cancellation inside the blocking pool
    #[error("execution fault: {0}")]
    Fault(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine settings, the `[engine]` table of the node config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub learning_rate: f64,
    pub epochs: usize,
    /// Samples generated when no dataset is available
    pub synthetic_samples: usize,
    /// Reported as `processed_by` in inference output
    pub processor_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_size: 10,
            hidden_size: 32,
            output_size: 1,
            learning_rate: 0.01,
            epochs: 50,
            synthetic_samples: 100,
            processor_name: "native-worker".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn shape(&self) -> NetworkShape {
        NetworkShape {
            input: self.input_size,
            hidden: self.hidden_size,
            output: self.output_size,
        }
    }
}
