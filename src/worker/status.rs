//! Observable worker status and job reports

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Running,
    Idle,
    Processing(String),
}

impl WorkerStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self, WorkerStatus::Stopped)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Stopped => f.write_str("stopped"),
            WorkerStatus::Running => f.write_str("running"),
            WorkerStatus::Idle => f.write_str("idle"),
            WorkerStatus::Processing(job_id) => write!(f, "processing:{}", job_id),
        }
    }
}

/// Delivered to `on_job_complete` once a job reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub success: bool,
    /// Inference output or training summary
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub model_output_url: Option<String>,
}

pub type StatusCallback = Arc<dyn Fn(&WorkerStatus) + Send + Sync>;
pub type JobCallback = Arc<dyn Fn(&str, &JobReport) + Send + Sync>;

#[derive(Clone, Default)]
pub struct WorkerCallbacks {
    pub on_status_change: Option<StatusCallback>,
    pub on_job_complete: Option<JobCallback>,
}

impl WorkerCallbacks {
    pub fn on_status_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkerStatus) + Send + Sync + 'static,
    {
        self.on_status_change = Some(Arc::new(f));
        self
    }

    pub fn on_job_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &JobReport) + Send + Sync + 'static,
    {
        self.on_job_complete = Some(Arc::new(f));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(WorkerStatus::Stopped.to_string(), "stopped");
        assert_eq!(WorkerStatus::Running.to_string(), "running");
        assert_eq!(WorkerStatus::Idle.to_string(), "idle");
        assert_eq!(
            WorkerStatus::Processing("abc".to_string()).to_string(),
            "processing:abc"
        );
    }
}
