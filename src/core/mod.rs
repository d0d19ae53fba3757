//! Core types shared by the ledger, the engine and the worker

pub mod job;
pub mod node;
pub mod state;

pub use job::{short_id, InferenceOutput, Job, JobKind, JobPayload, NewJob};
pub use node::{Node, NodeRegistration, NodeStatus, WorkerType};
pub use state::{JobStatus, ReclaimPolicy, Transition};
