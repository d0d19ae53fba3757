//! Worker lifecycle
//!
//! Flow:
//! 1. `start()` registers the node and schedules two independent tasks
//! 2. Heartbeat: refresh liveness, then run the ledger's stale cleanup
//! 3. Poll: fetch the oldest pending jobs, claim one, execute it, and write
//!    the result back before the next tick
//! 4. `stop()` aborts both tasks (abandoning any in-flight job to stale
//!    reclamation) and marks the node offline

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::identity::NodeIdentity;
use super::scheduler::ScheduledTasks;
use super::status::{JobReport, WorkerCallbacks, WorkerStatus};
use crate::claim::ClaimArbiter;
use crate::core::{short_id, Job, JobStatus, WorkerType};
use crate::engine::{ExecutionEngine, JobOutcome};
use crate::ledger::{Ledger, LedgerError};

/// `[worker]` table of the node config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// File holding the persisted hardware id
    pub identity_file: PathBuf,
    pub wallet_address: Option<String>,
    pub worker_type: WorkerType,
    pub heartbeat_interval_secs: u64,
    pub poll_interval_ms: u64,
    /// Pending jobs considered per poll
    pub batch_size: usize,
    pub max_concurrent_jobs: usize,
    /// Random delay before claiming, spreads out workers polling in lockstep
    pub claim_jitter_min_ms: u64,
    pub claim_jitter_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identity_file: PathBuf::from("node_id.txt"),
            wallet_address: None,
            worker_type: WorkerType::Native,
            heartbeat_interval_secs: 15,
            poll_interval_ms: 3000,
            batch_size: 5,
            max_concurrent_jobs: 1,
            claim_jitter_min_ms: 100,
            claim_jitter_max_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

struct WorkerInner {
    identity: NodeIdentity,
    config: WorkerConfig,
    ledger: Arc<dyn Ledger>,
    arbiter: ClaimArbiter,
    engine: Arc<ExecutionEngine>,
    in_flight: AtomicUsize,
    status: Mutex<WorkerStatus>,
    callbacks: RwLock<WorkerCallbacks>,
}

pub struct WorkerManager {
    inner: Arc<WorkerInner>,
    tasks: Mutex<ScheduledTasks>,
}

impl WorkerManager {
    pub fn new(
        identity: NodeIdentity,
        config: WorkerConfig,
        ledger: Arc<dyn Ledger>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        let arbiter = ClaimArbiter::new(ledger.clone());
        Self::with_arbiter(identity, config, ledger, arbiter, engine)
    }

    pub fn with_arbiter(
        identity: NodeIdentity,
        config: WorkerConfig,
        ledger: Arc<dyn Ledger>,
        arbiter: ClaimArbiter,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                identity,
                config,
                ledger,
                arbiter,
                engine,
                in_flight: AtomicUsize::new(0),
                status: Mutex::new(WorkerStatus::Stopped),
                callbacks: RwLock::new(WorkerCallbacks::default()),
            }),
            tasks: Mutex::new(ScheduledTasks::new()),
        }
    }

    pub fn hardware_id(&self) -> &str {
        &self.inner.identity.hardware_id
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn set_callbacks(&self, callbacks: WorkerCallbacks) {
        *self.inner.callbacks.write() = callbacks;
    }

    /// Register and begin heartbeat + poll. Calling again while running is a
    /// no-op.
    pub async fn start(&self) {
        if self.is_running() {
            debug!("Worker {} already running", self.hardware_id());
            return;
        }

        let registration = self.inner.identity.registration();
        match self.inner.ledger.upsert_node(&registration).await {
            Ok(node) => info!(
                "Registered node {} ({}, reputation {:.1})",
                node.hardware_id, node.worker_type, node.reputation
            ),
            Err(e) => error!("Node registration failed: {}", e),
        }

        {
            let mut tasks = self.tasks.lock();
            if !tasks.is_empty() {
                return;
            }
            self.inner.set_status(WorkerStatus::Running);

            let inner = self.inner.clone();
            tasks.every("heartbeat", self.inner.config.heartbeat_interval(), move || {
                let inner = inner.clone();
                async move { inner.heartbeat().await }
            });

            let inner = self.inner.clone();
            tasks.every("poll", self.inner.config.poll_interval(), move || {
                let inner = inner.clone();
                async move {
                    inner.poll_cycle().await;
                }
            });
        }

        info!(
            "Worker {} started (heartbeat={}s, poll={}ms, cap={})",
            self.hardware_id(),
            self.inner.config.heartbeat_interval_secs,
            self.inner.config.poll_interval_ms,
            self.inner.config.max_concurrent_jobs
        );
    }

    /// Cancel both tasks and mark the node offline. An in-flight job stays
    /// in processing until stale reclamation returns it to pending.
    pub async fn stop(&self) {
        self.tasks.lock().cancel_all();
        self.inner.in_flight.store(0, Ordering::SeqCst);

        if let Err(e) = self.inner.ledger.mark_offline(self.hardware_id()).await {
            warn!("Failed to mark node offline: {}", e);
        }
        self.inner.set_status(WorkerStatus::Stopped);
        info!("Worker {} stopped", self.hardware_id());
    }

    /// Run a single poll cycle. Returns the id of the job processed, if any.
    pub async fn poll_once(&self) -> Option<String> {
        self.inner.poll_cycle().await
    }

    /// Run a single heartbeat cycle
    pub async fn heartbeat_once(&self) {
        self.inner.heartbeat().await
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.tasks.lock().cancel_all();
    }
}

impl WorkerInner {
    fn hardware_id(&self) -> &str {
        &self.identity.hardware_id
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status.clone();
        let callback = self.callbacks.read().on_status_change.clone();
        if let Some(callback) = callback {
            callback(&status);
        }
    }

    fn at_capacity(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) >= self.config.max_concurrent_jobs
    }

    fn claim_jitter(&self) -> Duration {
        let (min, max) = (
            self.config.claim_jitter_min_ms,
            self.config.claim_jitter_max_ms,
        );
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn heartbeat(&self) {
        match self.ledger.heartbeat(self.hardware_id()).await {
            Ok(()) => debug!("Heartbeat sent for {}", self.hardware_id()),
            Err(LedgerError::NotFound(_)) => {
                warn!("Node {} missing from ledger, re-registering", self.hardware_id());
                if let Err(e) = self.ledger.upsert_node(&self.identity.registration()).await {
                    warn!("Re-registration failed: {}", e);
                }
            }
            Err(e) => warn!("Heartbeat failed: {}", e),
        }

        match self.ledger.cleanup_stale().await {
            Ok(0) => {}
            Ok(n) => info!("Stale cleanup returned {} job(s) to the queue", n),
            Err(e) => warn!("Stale cleanup failed: {}", e),
        }
    }

    async fn poll_cycle(&self) -> Option<String> {
        if self.at_capacity() {
            debug!("At capacity, skipping poll");
            return None;
        }

        let jobs = match self.ledger.pending_jobs(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Poll failed: {}", e);
                return None;
            }
        };
        if jobs.is_empty() {
            return None;
        }
        debug!("Found {} pending job(s)", jobs.len());

        let jitter = self.claim_jitter();
        tokio::time::sleep(jitter).await;

        for job in jobs {
            if self.at_capacity() {
                return None;
            }
            if !self.arbiter.try_claim(&job.id, self.hardware_id()).await {
                continue;
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let job_id = job.id.clone();
            self.process(job).await;
            self.in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .ok();
            return Some(job_id);
        }
        None
    }

    async fn process(&self, job: Job) {
        let started = Instant::now();
        self.set_status(WorkerStatus::Processing(job.id.clone()));
        info!("Processing {} job {}", job.kind(), job.short_id());

        let outcome = self.engine.execute(&job, self.hardware_id()).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let (status, report) = match outcome {
            Ok(outcome) => {
                if let JobOutcome::Inferred(output) = &outcome {
                    if let Err(e) = self
                        .ledger
                        .record_inference_output(&job.id, self.hardware_id(), output)
                        .await
                    {
                        warn!("Failed to record inference output: {}", e);
                    }
                }
                let report = JobReport {
                    success: true,
                    result: Some(outcome.result_value()),
                    error: None,
                    execution_time_ms,
                    model_output_url: outcome.result_ref().map(String::from),
                };
                (JobStatus::Completed, report)
            }
            Err(e) => {
                error!("Job {} failed: {}", job.short_id(), e);
                let report = JobReport {
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    execution_time_ms,
                    model_output_url: None,
                };
                (JobStatus::Failed, report)
            }
        };

        self.complete(&job.id, report.model_output_url.as_deref(), status)
            .await;

        let callback = self.callbacks.read().on_job_complete.clone();
        if let Some(callback) = callback {
            callback(&job.id, &report);
        }
        self.set_status(WorkerStatus::Idle);
    }

    /// Write the terminal status, retrying once on a ledger error. A refusal
    /// (job no longer ours) is final.
    async fn complete(&self, job_id: &str, result_ref: Option<&str>, status: JobStatus) {
        for attempt in 1..=2 {
            match self
                .ledger
                .complete_job(job_id, self.hardware_id(), result_ref, status)
                .await
            {
                Ok(true) => {
                    info!("Job {} {}", short_id(job_id), status);
                    return;
                }
                Ok(false) => {
                    warn!(
                        "Completion of job {} refused, no longer owned by {}",
                        short_id(job_id),
                        self.hardware_id()
                    );
                    return;
                }
                Err(e) if attempt == 1 => {
                    warn!("Completion write failed, retrying: {}", e);
                }
                Err(e) => {
                    error!(
                        "Completion write failed again, job {} left for reclamation: {}",
                        short_id(job_id),
                        e
                    );
                }
            }
        }
    }
}
