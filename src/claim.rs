//! Claim arbitration
//!
//! Strategies are tried in order. A win ends the attempt, as does a refusal
//! because the job is no longer open. A fair-arbitration refusal on load
//! grounds, a missing primitive, or a transient error falls through to the
//! next strategy.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{short_id, JobStatus};
use crate::ledger::{Ledger, LedgerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStrategy {
    /// Ledger grants the claim only to the least-loaded eligible node
    FairArbitration,
    /// Ledger-side conditional update on status = pending
    AtomicClaim,
    /// Read, conditional write, re-read and verify. Best-effort only.
    Optimistic,
}

impl ClaimStrategy {
    pub const DEFAULT_ORDER: [ClaimStrategy; 3] = [
        ClaimStrategy::FairArbitration,
        ClaimStrategy::AtomicClaim,
        ClaimStrategy::Optimistic,
    ];
}

impl fmt::Display for ClaimStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClaimStrategy::FairArbitration => "fair",
            ClaimStrategy::AtomicClaim => "atomic",
            ClaimStrategy::Optimistic => "optimistic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAttempt {
    Won,
    /// The job is no longer pending or already has a provider
    Lost,
    /// Fair arbitration preferred a less-loaded node; the job is still open
    Declined,
    /// Primitive not installed, or a transient error
    Unavailable,
}

fn classify(strategy: ClaimStrategy, result: Result<bool, LedgerError>) -> ClaimAttempt {
    match result {
        Ok(true) => ClaimAttempt::Won,
        Ok(false) => ClaimAttempt::Lost,
        Err(e) if e.is_unsupported() => {
            debug!("{} claim unavailable: {}", strategy, e);
            ClaimAttempt::Unavailable
        }
        Err(e) => {
            warn!("{} claim failed: {}", strategy, e);
            ClaimAttempt::Unavailable
        }
    }
}

pub struct ClaimArbiter {
    ledger: Arc<dyn Ledger>,
    strategies: Vec<ClaimStrategy>,
}

impl ClaimArbiter {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self::with_strategies(ledger, ClaimStrategy::DEFAULT_ORDER.to_vec())
    }

    pub fn with_strategies(ledger: Arc<dyn Ledger>, strategies: Vec<ClaimStrategy>) -> Self {
        Self { ledger, strategies }
    }

    pub fn strategies(&self) -> &[ClaimStrategy] {
        &self.strategies
    }

    /// Try to become the exclusive provider of `job_id`. Returns false with
    /// no side effect when the job is already claimed or not pending.
    pub async fn try_claim(&self, job_id: &str, worker_id: &str) -> bool {
        for strategy in &self.strategies {
            match self.attempt(*strategy, job_id, worker_id).await {
                ClaimAttempt::Won => {
                    info!("Claimed job {} via {} claim", short_id(job_id), strategy);
                    return true;
                }
                ClaimAttempt::Lost => {
                    debug!("Lost job {} via {} claim", short_id(job_id), strategy);
                    return false;
                }
                ClaimAttempt::Declined => {
                    debug!(
                        "{} claim of job {} declined, trying next strategy",
                        strategy,
                        short_id(job_id)
                    );
                    continue;
                }
                ClaimAttempt::Unavailable => continue,
            }
        }
        debug!("No claim strategy available for job {}", short_id(job_id));
        false
    }

    pub async fn attempt(
        &self,
        strategy: ClaimStrategy,
        job_id: &str,
        worker_id: &str,
    ) -> ClaimAttempt {
        match strategy {
            ClaimStrategy::FairArbitration => {
                match classify(strategy, self.ledger.claim_job_fair(job_id, worker_id).await) {
                    ClaimAttempt::Lost => self.still_open(job_id).await,
                    other => other,
                }
            }
            ClaimStrategy::AtomicClaim => {
                classify(strategy, self.ledger.claim_job(job_id, worker_id).await)
            }
            ClaimStrategy::Optimistic => self.optimistic(job_id, worker_id).await,
        }
    }

    /// Tell a load-based refusal apart from a job that is gone
    async fn still_open(&self, job_id: &str) -> ClaimAttempt {
        match self.ledger.get_job(job_id).await {
            Ok(Some(job)) if job.is_claimable() => ClaimAttempt::Declined,
            Ok(_) => ClaimAttempt::Lost,
            Err(e) => classify(ClaimStrategy::FairArbitration, Err(e)),
        }
    }

    async fn optimistic(&self, job_id: &str, worker_id: &str) -> ClaimAttempt {
        let strategy = ClaimStrategy::Optimistic;

        match self.ledger.get_job(job_id).await {
            Ok(Some(job)) if job.is_claimable() => {}
            Ok(_) => return ClaimAttempt::Lost,
            Err(e) => return classify(strategy, Err(e)),
        }

        if let Err(e) = self.ledger.conditional_claim(job_id, worker_id).await {
            return classify(strategy, Err(e));
        }

        let verified = self.ledger.get_job(job_id).await.map(|job| {
            job.is_some_and(|j| {
                j.status == JobStatus::Processing && j.provider.as_deref() == Some(worker_id)
            })
        });
        classify(strategy, verified)
    }
}
