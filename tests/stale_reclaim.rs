//! Integration tests for stale job reclamation and node liveness
//!
//! The memory ledger's clock is advanced past the staleness window to
//! simulate a worker that claimed a job and then disappeared.

use chrono::Duration;
use std::sync::Arc;

use oblivion_node::core::{NodeStatus, WorkerType};
use oblivion_node::{
    ClaimArbiter, JobStatus, Ledger, MemoryLedger, NewJob, NodeIdentity, ReclaimPolicy,
};

const CRASHED: &str = "WORKER-DEAD0001";
const SURVIVOR: &str = "WORKER-LIVE0002";

async fn ledger_with_claimed_job(policy: ReclaimPolicy) -> (Arc<MemoryLedger>, String) {
    let ledger = Arc::new(MemoryLedger::with_policy(policy));
    for id in [CRASHED, SURVIVOR] {
        ledger
            .upsert_node(&NodeIdentity::new(id, WorkerType::Native).registration())
            .await
            .unwrap();
    }
    let job = ledger
        .create_job(NewJob::training("0xrequester", None))
        .await
        .unwrap();
    assert!(ledger.claim_job(&job.id, CRASHED).await.unwrap());
    (ledger, job.id)
}

fn past_window(policy: &ReclaimPolicy) -> Duration {
    policy.staleness_window() + Duration::seconds(1)
}

#[tokio::test]
async fn test_fresh_claim_is_not_reclaimed() {
    let (ledger, job_id) = ledger_with_claimed_job(ReclaimPolicy::default()).await;
    ledger.advance_clock(Duration::seconds(30));

    assert_eq!(ledger.cleanup_stale().await.unwrap(), 0);
    let job = ledger.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.provider.as_deref(), Some(CRASHED));
}

#[tokio::test]
async fn test_stale_job_returns_to_pending() {
    let policy = ReclaimPolicy::default();
    let (ledger, job_id) = ledger_with_claimed_job(policy.clone()).await;
    ledger.advance_clock(past_window(&policy));

    assert_eq!(ledger.cleanup_stale().await.unwrap(), 1);
    let job = ledger.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.provider.is_none());
    assert!(job.claimed_at.is_none());
    assert_eq!(job.reclaim_count, 1);

    // Both nodes went silent past the node timeout as well
    let crashed = ledger.get_node(CRASHED).await.unwrap().unwrap();
    assert_eq!(crashed.status, NodeStatus::Offline);
    assert_eq!(crashed.current_jobs, 0);

    // Another worker can now pick it up
    ledger.heartbeat(SURVIVOR).await.unwrap();
    let arbiter = ClaimArbiter::new(ledger.clone());
    assert!(arbiter.try_claim(&job_id, SURVIVOR).await);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let policy = ReclaimPolicy::default();
    let (ledger, job_id) = ledger_with_claimed_job(policy.clone()).await;
    ledger.advance_clock(past_window(&policy));

    assert_eq!(ledger.cleanup_stale().await.unwrap(), 1);
    let after_first = ledger.get_job(&job_id).await.unwrap();
    assert_eq!(ledger.cleanup_stale().await.unwrap(), 0);
    assert_eq!(ledger.get_job(&job_id).await.unwrap(), after_first);
}

#[tokio::test]
async fn test_late_completion_is_refused_after_reclaim() {
    let policy = ReclaimPolicy::default();
    let (ledger, job_id) = ledger_with_claimed_job(policy.clone()).await;
    ledger.advance_clock(past_window(&policy));
    ledger.cleanup_stale().await.unwrap();

    ledger.heartbeat(SURVIVOR).await.unwrap();
    assert!(ledger.claim_job(&job_id, SURVIVOR).await.unwrap());

    // The crashed worker comes back and tries to report
    let accepted = ledger
        .complete_job(&job_id, CRASHED, Some("mem://late"), JobStatus::Completed)
        .await
        .unwrap();
    assert!(!accepted);

    let job = ledger.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.provider.as_deref(), Some(SURVIVOR));
    assert!(job.result_ref.is_none());
}

#[tokio::test]
async fn test_reclaim_limit_fails_job() {
    let policy = ReclaimPolicy {
        max_reclaims: Some(1),
        ..ReclaimPolicy::default()
    };
    let (ledger, job_id) = ledger_with_claimed_job(policy.clone()).await;

    ledger.advance_clock(past_window(&policy));
    assert_eq!(ledger.cleanup_stale().await.unwrap(), 1);
    assert_eq!(
        ledger.get_job(&job_id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    ledger.heartbeat(SURVIVOR).await.unwrap();
    assert!(ledger.claim_job(&job_id, SURVIVOR).await.unwrap());
    ledger.advance_clock(past_window(&policy));
    assert_eq!(ledger.cleanup_stale().await.unwrap(), 1);

    let job = ledger.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.reclaim_count, 1);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_terminal_jobs_are_never_reclaimed() {
    let policy = ReclaimPolicy::default();
    let (ledger, job_id) = ledger_with_claimed_job(policy.clone()).await;
    assert!(ledger
        .complete_job(&job_id, CRASHED, None, JobStatus::Failed)
        .await
        .unwrap());

    ledger.advance_clock(past_window(&policy));
    assert_eq!(ledger.cleanup_stale().await.unwrap(), 0);
    let job = ledger.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.provider.as_deref(), Some(CRASHED));
}
