//! Job/node ledger
//!
//! The ledger is the only shared mutable resource between workers. Every
//! mutual-exclusion guarantee in the system is delegated to its atomic and
//! conditional-update primitives; workers never hold locks of their own.
//!
//! Backends:
//! - [`MemoryLedger`]: in-process, used by tests and `simulate`
//! - [`PgLedger`]: PostgreSQL with server-side claim functions

pub mod memory;
pub mod postgres;

pub use memory::{LedgerCapabilities, MemoryLedger};
pub use postgres::{PgConfig, PgLedger};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{InferenceOutput, Job, JobStatus, NewJob, Node, NodeRegistration};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// The backend does not provide this primitive
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl LedgerError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, LedgerError::Unsupported(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Durable job and node ledger shared by every worker
#[async_trait]
pub trait Ledger: Send + Sync {
    // ==================== Jobs ====================

    async fn create_job(&self, job: NewJob) -> Result<Job>;
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Pending jobs, oldest first
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    /// Jobs newest first, optionally filtered by status
    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;

    /// Requester cancellation; only succeeds while the job is still pending
    async fn cancel_job(&self, job_id: &str, requester: &str) -> Result<bool>;

    async fn record_inference_output(
        &self,
        job_id: &str,
        provider: &str,
        output: &InferenceOutput,
    ) -> Result<()>;

    // ==================== Claims ====================

    /// Claim only if `provider` has the fewest in-flight jobs among
    /// eligible nodes
    async fn claim_job_fair(&self, job_id: &str, provider: &str) -> Result<bool>;

    /// Claim keyed on job id + status = pending, regardless of load
    async fn claim_job(&self, job_id: &str, provider: &str) -> Result<bool>;

    /// Unverified write used by the optimistic claim path: set the provider
    /// and status = processing where status = pending
    async fn conditional_claim(&self, job_id: &str, provider: &str) -> Result<()>;

    /// Move a job owned by `provider` to a terminal status and update the
    /// provider's stats. Returns false when the job is no longer owned by
    /// `provider` or is not processing.
    async fn complete_job(
        &self,
        job_id: &str,
        provider: &str,
        result_ref: Option<&str>,
        status: JobStatus,
    ) -> Result<bool>;

    /// Return stale processing jobs to pending and mark silent nodes
    /// offline. Idempotent and safe to call concurrently from many workers.
    /// Returns the number of jobs reclaimed.
    async fn cleanup_stale(&self) -> Result<u64>;

    // ==================== Nodes ====================

    async fn upsert_node(&self, registration: &NodeRegistration) -> Result<Node>;
    async fn heartbeat(&self, hardware_id: &str) -> Result<()>;

    /// Mark offline and reset the in-flight count
    async fn mark_offline(&self, hardware_id: &str) -> Result<()>;

    async fn get_node(&self, hardware_id: &str) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}
