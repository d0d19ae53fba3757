//! Worker agent: identity, lifecycle, and its scheduled tasks

pub mod identity;
pub mod manager;
pub mod scheduler;
pub mod status;

pub use identity::NodeIdentity;
pub use manager::{WorkerConfig, WorkerManager};
pub use scheduler::ScheduledTasks;
pub use status::{JobReport, WorkerCallbacks, WorkerStatus};
