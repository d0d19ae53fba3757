//! In-process ledger
//!
//! All state sits behind one mutex, so every primitive below is atomic the
//! same way a single-statement database function is. Capability switches let
//! callers disable the server-side claim functions to exercise the fallback
//! claim paths.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Ledger, LedgerError, Result};
use crate::core::node::adjust_reputation;
use crate::core::{
    InferenceOutput, Job, JobStatus, NewJob, Node, NodeRegistration, NodeStatus, ReclaimPolicy,
    Transition,
};

/// Which server-side claim primitives the ledger exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerCapabilities {
    pub fair_claim: bool,
    pub atomic_claim: bool,
}

impl Default for LedgerCapabilities {
    fn default() -> Self {
        Self {
            fair_claim: true,
            atomic_claim: true,
        }
    }
}

#[derive(Default)]
struct LedgerState {
    /// Insertion order; `created_at` is non-decreasing along it
    jobs: Vec<Job>,
    nodes: Vec<Node>,
}

impl LedgerState {
    fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    fn node_mut(&mut self, hardware_id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.hardware_id == hardware_id)
    }

    fn load_of(&self, hardware_id: &str) -> u32 {
        self.nodes
            .iter()
            .find(|n| n.hardware_id == hardware_id)
            .map(|n| n.current_jobs)
            .unwrap_or(0)
    }

    /// Pending → processing for `provider`. Caller has checked eligibility.
    fn grant_claim(&mut self, job_id: &str, provider: &str, now: DateTime<Utc>) -> bool {
        let Some(job) = self.job_mut(job_id) else {
            return false;
        };
        if !job.is_claimable() {
            return false;
        }
        let Some(next) = job.status.apply(Transition::Claim) else {
            return false;
        };
        job.status = next;
        job.provider = Some(provider.to_string());
        job.claimed_at = Some(now);

        if let Some(node) = self.node_mut(provider) {
            node.current_jobs += 1;
        }
        true
    }

    fn release_load(&mut self, hardware_id: &str) {
        if let Some(node) = self.node_mut(hardware_id) {
            node.current_jobs = node.current_jobs.saturating_sub(1);
        }
    }
}

pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    capabilities: LedgerCapabilities,
    policy: ReclaimPolicy,
    /// Added to the wall clock; tests advance it to age records
    clock_offset: Mutex<Duration>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_policy(ReclaimPolicy::default())
    }

    pub fn with_policy(policy: ReclaimPolicy) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            capabilities: LedgerCapabilities::default(),
            policy,
            clock_offset: Mutex::new(Duration::zero()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: LedgerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn policy(&self) -> &ReclaimPolicy {
        &self.policy
    }

    /// Move the ledger clock forward
    pub fn advance_clock(&self, by: Duration) {
        let mut offset = self.clock_offset.lock();
        *offset += by;
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.lock()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let now = self.now();
        let job = job.into_job(Uuid::new_v4().to_string(), now);
        let mut state = self.state.lock();
        state.jobs.push(job.clone());
        debug!("Created {} job {}", job.kind(), job.short_id());
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let state = self.state.lock();
        Ok(state.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let state = self.state.lock();
        let mut pending: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .iter()
            .rev()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn cancel_job(&self, job_id: &str, requester: &str) -> Result<bool> {
        let now = self.now();
        let mut state = self.state.lock();
        let job = state
            .job_mut(job_id)
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;

        if job.requester != requester || job.provider.is_some() {
            return Ok(false);
        }
        match job.status.apply(Transition::Cancel) {
            Some(next) => {
                job.status = next;
                job.completed_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_inference_output(
        &self,
        job_id: &str,
        provider: &str,
        output: &InferenceOutput,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .job_mut(job_id)
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;
        if job.provider.as_deref() != Some(provider) {
            return Err(LedgerError::InvalidData(format!(
                "job {} is not owned by {}",
                job_id, provider
            )));
        }
        job.inference_output = Some(output.clone());
        Ok(())
    }

    async fn claim_job_fair(&self, job_id: &str, provider: &str) -> Result<bool> {
        if !self.capabilities.fair_claim {
            return Err(LedgerError::Unsupported("claim_job_fair"));
        }
        let now = self.now();
        let cutoff = now - self.policy.node_timeout();
        let mut state = self.state.lock();

        let own_load = state.load_of(provider);
        let min_load = state
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active && n.last_seen >= cutoff)
            .map(|n| n.current_jobs)
            .min()
            .unwrap_or(own_load);

        if own_load > min_load {
            debug!(
                "Fair claim of {} declined for {} (load {} > min {})",
                job_id, provider, own_load, min_load
            );
            return Ok(false);
        }
        Ok(state.grant_claim(job_id, provider, now))
    }

    async fn claim_job(&self, job_id: &str, provider: &str) -> Result<bool> {
        if !self.capabilities.atomic_claim {
            return Err(LedgerError::Unsupported("claim_job"));
        }
        let now = self.now();
        let mut state = self.state.lock();
        Ok(state.grant_claim(job_id, provider, now))
    }

    async fn conditional_claim(&self, job_id: &str, provider: &str) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock();
        let is_pending = state
            .jobs
            .iter()
            .any(|j| j.id == job_id && j.status == JobStatus::Pending);
        if is_pending {
            state.grant_claim(job_id, provider, now);
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: &str,
        provider: &str,
        result_ref: Option<&str>,
        status: JobStatus,
    ) -> Result<bool> {
        let transition = status.completion_transition().ok_or_else(|| {
            LedgerError::InvalidData(format!("{} is not a completion status", status))
        })?;
        let now = self.now();
        let mut state = self.state.lock();

        let Some(job) = state.job_mut(job_id) else {
            return Err(LedgerError::NotFound(job_id.to_string()));
        };
        if job.provider.as_deref() != Some(provider) {
            return Ok(false);
        }
        let Some(next) = job.status.apply(transition) else {
            return Ok(false);
        };
        job.status = next;
        job.completed_at = Some(now);
        if let Some(url) = result_ref {
            job.result_ref = Some(url.to_string());
        }

        let succeeded = next == JobStatus::Completed;
        if let Some(node) = state.node_mut(provider) {
            node.current_jobs = node.current_jobs.saturating_sub(1);
            if succeeded {
                node.total_jobs_completed += 1;
            }
            node.reputation = adjust_reputation(node.reputation, succeeded);
        }
        Ok(true)
    }

    async fn cleanup_stale(&self) -> Result<u64> {
        let now = self.now();
        let stale_before = now - self.policy.staleness_window();
        let offline_before = now - self.policy.node_timeout();
        let mut state = self.state.lock();

        let mut released = Vec::new();
        for job in state.jobs.iter_mut() {
            let is_stale = job.status == JobStatus::Processing
                && job.claimed_at.map_or(true, |t| t < stale_before);
            if !is_stale {
                continue;
            }

            match self.policy.stale_outcome(job.reclaim_count) {
                JobStatus::Failed => {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                    if let Some(p) = job.provider.clone() {
                        released.push(p);
                    }
                }
                _ => {
                    if let Some(p) = job.provider.take() {
                        released.push(p);
                    }
                    job.status = JobStatus::Pending;
                    job.claimed_at = None;
                    job.reclaim_count += 1;
                }
            }
        }

        let reclaimed = released.len() as u64;
        for provider in released {
            state.release_load(&provider);
        }

        for node in state.nodes.iter_mut() {
            if node.status == NodeStatus::Active && node.last_seen < offline_before {
                node.status = NodeStatus::Offline;
                node.current_jobs = 0;
            }
        }

        if reclaimed > 0 {
            info!("Reclaimed {} stale job(s)", reclaimed);
        }
        Ok(reclaimed)
    }

    async fn upsert_node(&self, registration: &NodeRegistration) -> Result<Node> {
        let now = self.now();
        let mut state = self.state.lock();
        if let Some(node) = state.node_mut(&registration.hardware_id) {
            node.wallet_address = registration.wallet_address.clone();
            node.worker_type = registration.worker_type;
            node.status = NodeStatus::Active;
            node.current_jobs = 0;
            node.last_seen = node.last_seen.max(now);
            return Ok(node.clone());
        }
        let node = registration.clone().into_node(now);
        state.nodes.push(node.clone());
        Ok(node)
    }

    async fn heartbeat(&self, hardware_id: &str) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock();
        let node = state
            .node_mut(hardware_id)
            .ok_or_else(|| LedgerError::NotFound(hardware_id.to_string()))?;
        node.status = NodeStatus::Active;
        node.last_seen = node.last_seen.max(now);
        Ok(())
    }

    async fn mark_offline(&self, hardware_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let node = state
            .node_mut(hardware_id)
            .ok_or_else(|| LedgerError::NotFound(hardware_id.to_string()))?;
        node.status = NodeStatus::Offline;
        node.current_jobs = 0;
        Ok(())
    }

    async fn get_node(&self, hardware_id: &str) -> Result<Option<Node>> {
        let state = self.state.lock();
        Ok(state
            .nodes
            .iter()
            .find(|n| n.hardware_id == hardware_id)
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().nodes.clone())
    }
}
