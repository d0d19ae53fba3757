//! Job state machine
//!
//! ```text
//!            claim              complete
//! pending ──────────► processing ─────────► completed
//!   │  ▲                 │   │    fail
//!   │  └─────────────────┘   └────────────► failed
//!   │       reclaim
//!   │ cancel
//!   └──────────► cancelled
//! ```
//!
//! Ledgers consult [`JobStatus::apply`] before mutating a record so that a
//! transition outside this graph is rejected rather than persisted.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Events that move a job between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Claim,
    Complete,
    Fail,
    Cancel,
    Reclaim,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a job in this status must carry a provider identity
    pub fn requires_provider(&self) -> bool {
        matches!(
            self,
            JobStatus::Processing | JobStatus::Completed | JobStatus::Failed
        )
    }

    /// Status after `transition`, or `None` if the transition is not allowed
    pub fn apply(self, transition: Transition) -> Option<JobStatus> {
        match (self, transition) {
            (JobStatus::Pending, Transition::Claim) => Some(JobStatus::Processing),
            (JobStatus::Pending, Transition::Cancel) => Some(JobStatus::Cancelled),
            (JobStatus::Processing, Transition::Complete) => Some(JobStatus::Completed),
            (JobStatus::Processing, Transition::Fail) => Some(JobStatus::Failed),
            (JobStatus::Processing, Transition::Reclaim) => Some(JobStatus::Pending),
            _ => None,
        }
    }

    /// The completion transition that leads to this terminal status
    pub fn completion_transition(self) -> Option<Transition> {
        match self {
            JobStatus::Completed => Some(Transition::Complete),
            JobStatus::Failed => Some(Transition::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Operator policy applied by the stale cleanup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclaimPolicy {
    /// A processing job older than this is presumed abandoned
    pub staleness_window_secs: i64,
    /// Active nodes not seen within this are marked offline
    pub node_timeout_secs: i64,
    /// Fail instead of reclaiming once a job has been reclaimed this often
    pub max_reclaims: Option<u32>,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            staleness_window_secs: 600, // 10 minutes
            node_timeout_secs: 60,
            max_reclaims: None,
        }
    }
}

impl ReclaimPolicy {
    pub fn staleness_window(&self) -> Duration {
        Duration::seconds(self.staleness_window_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::seconds(self.node_timeout_secs)
    }

    /// Status a stale job moves to given how often it was already reclaimed
    pub fn stale_outcome(&self, reclaim_count: u32) -> JobStatus {
        match self.max_reclaims {
            Some(max) if reclaim_count >= max => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        assert_eq!(
            JobStatus::Pending.apply(Transition::Claim),
            Some(JobStatus::Processing)
        );
        assert_eq!(
            JobStatus::Processing.apply(Transition::Reclaim),
            Some(JobStatus::Pending)
        );
        assert_eq!(
            JobStatus::Pending.apply(Transition::Cancel),
            Some(JobStatus::Cancelled)
        );
    }

    #[test]
    fn test_rejected_transitions() {
        assert_eq!(JobStatus::Processing.apply(Transition::Cancel), None);
        assert_eq!(JobStatus::Processing.apply(Transition::Claim), None);
        assert_eq!(JobStatus::Pending.apply(Transition::Complete), None);
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for t in [
                Transition::Claim,
                Transition::Complete,
                Transition::Fail,
                Transition::Cancel,
                Transition::Reclaim,
            ] {
                assert_eq!(terminal.apply(t), None);
            }
        }
    }

    #[test]
    fn test_provider_requirement() {
        assert!(!JobStatus::Pending.requires_provider());
        assert!(JobStatus::Processing.requires_provider());
        assert!(JobStatus::Failed.requires_provider());
        assert!(!JobStatus::Cancelled.requires_provider());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("processing".parse::<JobStatus>(), Ok(JobStatus::Processing));
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_reclaim_policy() {
        let policy = ReclaimPolicy::default();
        assert_eq!(policy.stale_outcome(100), JobStatus::Pending);

        let bounded = ReclaimPolicy {
            max_reclaims: Some(3),
            ..ReclaimPolicy::default()
        };
        assert_eq!(bounded.stale_outcome(2), JobStatus::Pending);
        assert_eq!(bounded.stale_outcome(3), JobStatus::Failed);
    }
}
