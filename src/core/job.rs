//! Job records
//!
//! A job is created by a requester, claimed by exactly one provider and then
//! driven to a terminal status. Kind-specific fields live in [`JobPayload`]
//! so training and inference jobs only carry what they use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::state::JobStatus;

/// Job kind, derived from the payload variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Training,
    Inference,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Training => "training",
            JobKind::Inference => "inference",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(JobKind::Training),
            "inference" => Ok(JobKind::Inference),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// Kind-specific job fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Training {
        /// Base model or training script reference (informational)
        model_ref: Option<String>,
        /// Dataset reference, usually a CSV URL
        data_ref: Option<String>,
    },
    Inference {
        /// Trained model artifact reference
        model_ref: Option<String>,
        /// Raw input text: `{"data": [..]}` or a bare JSON array
        input: String,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Training { .. } => JobKind::Training,
            JobPayload::Inference { .. } => JobKind::Inference,
        }
    }

    pub fn model_ref(&self) -> Option<&str> {
        match self {
            JobPayload::Training { model_ref, .. } | JobPayload::Inference { model_ref, .. } => {
                model_ref.as_deref()
            }
        }
    }
}

/// Output of an inference job, stored alongside the job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub prediction: f64,
    pub confidence: f64,
    /// Length of the raw input vector before padding/truncation
    pub input_shape: usize,
    pub processed_by: String,
}

/// A job as stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub requester: String,
    /// Decimal amount in the payment token's units, e.g. "0.1"
    pub reward: String,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_ref: Option<String>,
    pub inference_output: Option<InferenceOutput>,
    /// Times the stale cleanup returned this job to pending
    pub reclaim_count: u32,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// First 8 characters of the id, used in filenames and log lines
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Pending and not carrying a provider
    pub fn is_claimable(&self) -> bool {
        self.status == JobStatus::Pending && self.provider.is_none()
    }
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Requester-side description of a job to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub payload: JobPayload,
    pub requester: String,
    pub reward: String,
}

impl NewJob {
    pub fn training(requester: impl Into<String>, data_ref: Option<String>) -> Self {
        Self {
            payload: JobPayload::Training {
                model_ref: None,
                data_ref,
            },
            requester: requester.into(),
            reward: "0".to_string(),
        }
    }

    pub fn inference(
        requester: impl Into<String>,
        model_ref: Option<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            payload: JobPayload::Inference {
                model_ref,
                input: input.into(),
            },
            requester: requester.into(),
            reward: "0".to_string(),
        }
    }

    pub fn with_reward(mut self, reward: impl Into<String>) -> Self {
        self.reward = reward.into();
        self
    }

    /// Materialize into a fresh pending job
    pub fn into_job(self, id: String, created_at: DateTime<Utc>) -> Job {
        Job {
            id,
            status: JobStatus::Pending,
            payload: self.payload,
            requester: self.requester,
            reward: self.reward,
            provider: None,
            created_at,
            claimed_at: None,
            completed_at: None,
            result_ref: None,
            inference_output: None,
            reclaim_count: 0,
        }
    }
}
