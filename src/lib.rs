//! Oblivion compute node
//!
//! Distributes small training and inference jobs across independent worker
//! nodes that coordinate only through a shared ledger. Each job is executed
//! by at most one worker: claims are arbitrated by the ledger's atomic
//! primitives, and abandoned jobs are reclaimed once they go stale.
//!
//! ## Module Structure
//!
//! - `core/`: job, node and state-machine types
//! - `ledger/`: the shared job/node ledger (memory and PostgreSQL)
//! - `claim`: tiered claim arbitration
//! - `engine/`: embedded perceptron, datasets, artifact encoders
//! - `storage/`: artifact object stores
//! - `fetch`: dataset and model reference resolution
//! - `worker/`: node identity and lifecycle (heartbeat, poll)
//! - `download`: artifact export in interchange formats
//! - `api`: read-only HTTP API
//! - `config`: TOML node configuration

pub mod api;
pub mod claim;
pub mod config;
pub mod core;
pub mod download;
pub mod engine;
pub mod fetch;
pub mod ledger;
pub mod storage;
pub mod worker;

pub use crate::core::{
    InferenceOutput, Job, JobKind, JobPayload, JobStatus, NewJob, Node, NodeRegistration,
    NodeStatus, ReclaimPolicy, WorkerType,
};
pub use claim::{ClaimArbiter, ClaimAttempt, ClaimStrategy};
pub use config::{ConfigError, NodeConfig};
pub use download::{ArtifactDownload, ArtifactExporter, DownloadError};
pub use engine::{ArtifactFormat, EngineConfig, EngineError, ExecutionEngine, ModelArtifact};
pub use fetch::{FetchError, Fetcher, HttpFetcher};
pub use ledger::{Ledger, LedgerError, MemoryLedger, PgLedger};
pub use storage::{ObjectStore, StorageError};
pub use worker::{
    JobReport, NodeIdentity, WorkerCallbacks, WorkerConfig, WorkerManager, WorkerStatus,
};
