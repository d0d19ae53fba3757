//! End-to-end worker tests: register, poll, train, infer, report, stop
//!
//! Workers run against the in-process ledger and object store, so artifacts
//! written by a training job can be fetched back by inference and export.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use oblivion_node::core::{NodeStatus, WorkerType};
use oblivion_node::engine::ExecutionEngine;
use oblivion_node::storage::MemoryObjectStore;
use oblivion_node::{
    ArtifactExporter, ArtifactFormat, EngineConfig, HttpFetcher, JobStatus, Ledger, MemoryLedger,
    ModelArtifact, NewJob, NodeIdentity, WorkerCallbacks, WorkerConfig, WorkerManager,
    WorkerStatus,
};

// ============================================================================
// TEST HELPERS
// ============================================================================

struct Cluster {
    ledger: Arc<MemoryLedger>,
    fetcher: Arc<HttpFetcher>,
    engine: Arc<ExecutionEngine>,
}

impl Cluster {
    fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryObjectStore::new());
        let fetcher = Arc::new(HttpFetcher::new().unwrap().with_memory_store(store.clone()));
        let engine = Arc::new(ExecutionEngine::new(
            EngineConfig {
                epochs: 3,
                synthetic_samples: 20,
                ..EngineConfig::default()
            },
            fetcher.clone(),
            store,
        ));
        Self {
            ledger,
            fetcher,
            engine,
        }
    }

    fn worker(&self, hardware_id: &str) -> WorkerManager {
        WorkerManager::new(
            NodeIdentity::new(hardware_id, WorkerType::Native),
            fast_config(),
            self.ledger.clone(),
            self.engine.clone(),
        )
    }

    async fn wait_for(&self, job_id: &str, status: JobStatus) -> bool {
        for _ in 0..200 {
            let job = self.ledger.get_job(job_id).await.unwrap().unwrap();
            if job.status == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_interval_secs: 1,
        poll_interval_ms: 20,
        claim_jitter_min_ms: 0,
        claim_jitter_max_ms: 0,
        ..WorkerConfig::default()
    }
}

// ============================================================================
// TRAINING THEN INFERENCE
// ============================================================================

#[tokio::test]
async fn test_training_artifact_feeds_inference() {
    let cluster = Cluster::new();
    let worker = cluster.worker("WORKER-TRAIN001");
    cluster
        .ledger
        .upsert_node(&NodeIdentity::new("WORKER-TRAIN001", WorkerType::Native).registration())
        .await
        .unwrap();

    let training = cluster
        .ledger
        .create_job(NewJob::training("0xrequester", None).with_reward("0.25"))
        .await
        .unwrap();
    assert_eq!(worker.poll_once().await.as_deref(), Some(training.id.as_str()));

    let trained = cluster.ledger.get_job(&training.id).await.unwrap().unwrap();
    assert_eq!(trained.status, JobStatus::Completed);
    assert_eq!(trained.provider.as_deref(), Some("WORKER-TRAIN001"));
    let model_ref = trained.result_ref.clone().expect("training stores an artifact");

    let inference = cluster
        .ledger
        .create_job(NewJob::inference(
            "0xrequester",
            Some(model_ref),
            r#"{"data": [0.5, 0.1, 0.9]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(worker.poll_once().await.as_deref(), Some(inference.id.as_str()));

    let inferred = cluster.ledger.get_job(&inference.id).await.unwrap().unwrap();
    assert_eq!(inferred.status, JobStatus::Completed);
    let output = inferred.inference_output.expect("inference output recorded");
    assert_eq!(output.input_shape, 3);
    assert_eq!(output.processed_by, "native-worker");
    assert!(output.prediction.is_finite());

    let node = cluster.ledger.get_node("WORKER-TRAIN001").await.unwrap().unwrap();
    assert_eq!(node.total_jobs_completed, 2);
    assert_eq!(node.current_jobs, 0);
}

#[tokio::test]
async fn test_completed_job_exports_trained_weights() {
    let cluster = Cluster::new();
    let worker = cluster.worker("WORKER-EXPORT01");
    let job = cluster
        .ledger
        .create_job(NewJob::training("0xrequester", None))
        .await
        .unwrap();
    worker.poll_once().await.unwrap();

    let exporter = ArtifactExporter::new(
        cluster.ledger.clone(),
        cluster.fetcher.clone(),
        cluster.engine.config().shape(),
    );
    let download = exporter.export(&job.id, ArtifactFormat::Generic).await.unwrap();
    assert!(download.from_job);

    let artifact = ModelArtifact::decode(&download.bytes).unwrap();
    assert_eq!(artifact.metadata.trained_by, "WORKER-EXPORT01");
    assert_eq!(artifact.shape(), cluster.engine.config().shape());
}

// ============================================================================
// COMPETING WORKERS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_job_processed_once() {
    let cluster = Cluster::new();
    let workers: Vec<Arc<WorkerManager>> = (0..3)
        .map(|i| Arc::new(cluster.worker(&format!("WORKER-RACE000{}", i))))
        .collect();
    for worker in &workers {
        cluster
            .ledger
            .upsert_node(
                &NodeIdentity::new(worker.hardware_id(), WorkerType::Native).registration(),
            )
            .await
            .unwrap();
    }

    let mut job_ids = Vec::new();
    for _ in 0..6 {
        let job = cluster
            .ledger
            .create_job(NewJob::training("0xrequester", None))
            .await
            .unwrap();
        job_ids.push(job.id);
    }

    let processed = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = workers
        .iter()
        .cloned()
        .map(|worker| {
            let ledger = cluster.ledger.clone();
            let processed = processed.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(job_id) = worker.poll_once().await {
                        processed.lock().push(job_id);
                        continue;
                    }
                    if ledger.pending_jobs(1).await.unwrap().is_empty() {
                        break;
                    }
                }
            })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    let mut processed = processed.lock().clone();
    processed.sort();
    let mut expected = job_ids.clone();
    expected.sort();
    assert_eq!(processed, expected, "every job processed exactly once");

    for job_id in &job_ids {
        let job = cluster.ledger.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.provider.is_some());
    }
}

// ============================================================================
// START / STOP
// ============================================================================

#[tokio::test]
async fn test_started_worker_picks_up_jobs_and_stops_cleanly() {
    let cluster = Cluster::new();
    let worker = cluster.worker("WORKER-LOOP0001");

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let reports = Arc::new(Mutex::new(Vec::new()));
    let (status_log, report_log) = (statuses.clone(), reports.clone());
    worker.set_callbacks(
        WorkerCallbacks::default()
            .on_status_change(move |status| status_log.lock().push(status.clone()))
            .on_job_complete(move |job_id, report| {
                report_log.lock().push((job_id.to_string(), report.success))
            }),
    );

    worker.start().await;
    assert!(worker.is_running());
    let node = cluster.ledger.get_node("WORKER-LOOP0001").await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Active);

    let job = cluster
        .ledger
        .create_job(NewJob::training("0xrequester", None))
        .await
        .unwrap();
    assert!(cluster.wait_for(&job.id, JobStatus::Completed).await);
    while worker.in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    worker.stop().await;
    assert!(!worker.is_running());
    assert_eq!(worker.status(), WorkerStatus::Stopped);

    let node = cluster.ledger.get_node("WORKER-LOOP0001").await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Offline);

    let reports = reports.lock().clone();
    assert_eq!(reports, vec![(job.id.clone(), true)]);

    let statuses = statuses.lock().clone();
    assert_eq!(statuses.first(), Some(&WorkerStatus::Running));
    assert!(statuses.contains(&WorkerStatus::Processing(job.id.clone())));
    assert_eq!(statuses.last(), Some(&WorkerStatus::Stopped));

    // A stopped worker no longer claims new work
    let idle = cluster
        .ledger
        .create_job(NewJob::training("0xrequester", None))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let idle = cluster.ledger.get_job(&idle.id).await.unwrap().unwrap();
    assert_eq!(idle.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_unparseable_inference_input_uses_zero_vector() {
    let cluster = Cluster::new();
    let worker = cluster.worker("WORKER-ZERO0001");
    let job = cluster
        .ledger
        .create_job(NewJob::inference("0xrequester", None, "not a vector"))
        .await
        .unwrap();
    worker.poll_once().await.unwrap();

    let job = cluster.ledger.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let output = job.inference_output.unwrap();
    assert_eq!(output.input_shape, 10);
    assert!(output.confidence >= 0.0 && output.confidence <= 1.0);
}
