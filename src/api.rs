//! Read-only HTTP API over the ledger, plus artifact download
//!
//! Endpoints:
//!   GET /health
//!   GET /api/v1/jobs?status=&limit=
//!   GET /api/v1/jobs/:id
//!   GET /api/v1/jobs/:id/artifact?format=
//!   GET /api/v1/nodes

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::{Job, JobStatus, Node};
use crate::download::{ArtifactExporter, DownloadError};
use crate::engine::ArtifactFormat;
use crate::ledger::{Ledger, LedgerError};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub struct ApiState {
    pub ledger: Arc<dyn Ledger>,
    pub exporter: ArtifactExporter,
}

type ApiError = (StatusCode, String);

fn ledger_error(e: LedgerError) -> ApiError {
    match e {
        LedgerError::NotFound(what) => (StatusCode::NOT_FOUND, format!("not found: {}", what)),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

// ============================================================================
// /health ENDPOINT
// ============================================================================

pub async fn health_check() -> &'static str {
    "OK"
}

// ============================================================================
// JOBS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);

    let jobs = state
        .ledger
        .list_jobs(status, limit)
        .await
        .map_err(ledger_error)?;
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .ledger
        .get_job(&job_id)
        .await
        .map_err(ledger_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("job not found: {}", job_id)))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub format: Option<String>,
}

pub async fn download_artifact(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        Some(tag) => tag
            .parse::<ArtifactFormat>()
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
        None => ArtifactFormat::Generic,
    };

    let download = state
        .exporter
        .export(&job_id, format)
        .await
        .map_err(|e| match e {
            DownloadError::JobNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;

    let disposition = format!("attachment; filename=\"{}\"", download.filename);
    Ok((
        [
            (header::CONTENT_TYPE, download.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.bytes,
    )
        .into_response())
}

// ============================================================================
// NODES
// ============================================================================

pub async fn list_nodes(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<Node>>, ApiError> {
    let nodes = state.ledger.list_nodes().await.map_err(ledger_error)?;
    Ok(Json(nodes))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/artifact", get(download_artifact))
        .route("/api/v1/nodes", get(list_nodes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn run_server(state: Arc<ApiState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Oblivion node API listening on {}", addr);
    info!("  GET /health");
    info!("  GET /api/v1/jobs");
    info!("  GET /api/v1/jobs/:id");
    info!("  GET /api/v1/jobs/:id/artifact?format=json|pt|onnx|pkl|h5");
    info!("  GET /api/v1/nodes");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NewJob;
    use crate::engine::NetworkShape;
    use crate::fetch::HttpFetcher;
    use crate::ledger::MemoryLedger;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Arc<MemoryLedger>, Router) {
        let ledger = Arc::new(MemoryLedger::new());
        let exporter = ArtifactExporter::new(
            ledger.clone(),
            Arc::new(HttpFetcher::new().unwrap()),
            NetworkShape::default(),
        );
        let state = Arc::new(ApiState {
            ledger: ledger.clone(),
            exporter,
        });
        (ledger, router(state))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Response) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        (resp.status(), resp)
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app();
        let (status, resp) = get(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_list_and_get_jobs() {
        let (ledger, app) = app();
        let job = ledger
            .create_job(NewJob::training("0xreq", None))
            .await
            .unwrap();

        let (status, resp) = get(app.clone(), "/api/v1/jobs?status=pending").await;
        assert_eq!(status, StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let jobs: Vec<Job> = serde_json::from_slice(&body).unwrap();
        assert_eq!(jobs.len(), 1);

        let (status, _) = get(app.clone(), &format!("/api/v1/jobs/{}", job.id)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(app.clone(), "/api/v1/jobs/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(app, "/api/v1/jobs?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_artifact_download_headers() {
        let (ledger, app) = app();
        let job = ledger
            .create_job(NewJob::training("0xreq", None))
            .await
            .unwrap();

        let (status, resp) = get(
            app.clone(),
            &format!("/api/v1/jobs/{}/artifact?format=h5", job.id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let disposition = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(
            disposition,
            format!("attachment; filename=\"model_{}.h5\"", &job.id[..8])
        );

        let (status, _) = get(
            app,
            &format!("/api/v1/jobs/{}/artifact?format=tflite", job.id),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_nodes() {
        let (_, app) = app();
        let (status, resp) = get(app, "/api/v1/nodes").await;
        assert_eq!(status, StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let nodes: Vec<Node> = serde_json::from_slice(&body).unwrap();
        assert!(nodes.is_empty());
    }
}
