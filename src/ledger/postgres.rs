//! PostgreSQL ledger
//!
//! Claim arbitration, completion and stale cleanup run as server-side
//! functions so that each one is a single atomic statement from the
//! worker's point of view. Deployments that manage their own schema can
//! skip installation; a missing function surfaces as
//! [`LedgerError::Unsupported`] and the claim arbiter falls through to its
//! next strategy.

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::Deserialize;
use std::fmt;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Ledger, LedgerError, Result};
use crate::core::{
    InferenceOutput, Job, JobKind, JobPayload, JobStatus, NewJob, Node, NodeRegistration,
    ReclaimPolicy,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    requester TEXT NOT NULL,
    reward TEXT NOT NULL DEFAULT '0',
    provider_address TEXT,
    model_ref TEXT,
    data_ref TEXT,
    input_data TEXT,
    result_ref TEXT,
    inference_result JSONB,
    reclaim_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    claimed_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_provider ON jobs(provider_address);

CREATE TABLE IF NOT EXISTS nodes (
    hardware_id TEXT PRIMARY KEY,
    wallet_address TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    current_jobs INTEGER NOT NULL DEFAULT 0,
    total_jobs_completed BIGINT NOT NULL DEFAULT 0,
    reputation DOUBLE PRECISION NOT NULL DEFAULT 100.0,
    worker_type TEXT NOT NULL DEFAULT 'native',
    last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes(status);

CREATE OR REPLACE FUNCTION claim_job(p_job_id TEXT, p_provider_address TEXT)
RETURNS BOOLEAN AS $$
DECLARE
    claimed INTEGER;
BEGIN
    UPDATE jobs
       SET status = 'processing', provider_address = p_provider_address, claimed_at = NOW()
     WHERE id = p_job_id AND status = 'pending' AND provider_address IS NULL;
    GET DIAGNOSTICS claimed = ROW_COUNT;
    IF claimed = 0 THEN
        RETURN FALSE;
    END IF;
    UPDATE nodes SET current_jobs = current_jobs + 1 WHERE hardware_id = p_provider_address;
    RETURN TRUE;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION claim_job_fair(
    p_job_id TEXT,
    p_provider_address TEXT,
    p_node_timeout_secs INTEGER DEFAULT 60
)
RETURNS BOOLEAN AS $$
DECLARE
    own_load INTEGER;
    min_load INTEGER;
BEGIN
    PERFORM 1 FROM jobs WHERE id = p_job_id AND status = 'pending' FOR UPDATE;
    IF NOT FOUND THEN
        RETURN FALSE;
    END IF;

    SELECT COALESCE(
        (SELECT current_jobs FROM nodes WHERE hardware_id = p_provider_address), 0
    ) INTO own_load;

    SELECT MIN(current_jobs) INTO min_load
      FROM nodes
     WHERE status = 'active'
       AND last_seen >= NOW() - make_interval(secs => p_node_timeout_secs);

    IF min_load IS NOT NULL AND own_load > min_load THEN
        RETURN FALSE;
    END IF;
    RETURN claim_job(p_job_id, p_provider_address);
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION complete_job(
    p_job_id TEXT,
    p_provider_address TEXT,
    p_result_url TEXT,
    p_status TEXT
)
RETURNS BOOLEAN AS $$
DECLARE
    updated INTEGER;
BEGIN
    IF p_status NOT IN ('completed', 'failed') THEN
        RETURN FALSE;
    END IF;

    UPDATE jobs
       SET status = p_status,
           result_ref = COALESCE(p_result_url, result_ref),
           completed_at = NOW()
     WHERE id = p_job_id AND provider_address = p_provider_address AND status = 'processing';
    GET DIAGNOSTICS updated = ROW_COUNT;
    IF updated = 0 THEN
        RETURN FALSE;
    END IF;

    UPDATE nodes
       SET current_jobs = GREATEST(current_jobs - 1, 0),
           total_jobs_completed = total_jobs_completed
               + CASE WHEN p_status = 'completed' THEN 1 ELSE 0 END,
           reputation = CASE WHEN p_status = 'completed'
               THEN reputation + 1.0
               ELSE GREATEST(reputation - 1.0, 0.0) END
     WHERE hardware_id = p_provider_address;
    RETURN TRUE;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION cleanup_stale_jobs(
    p_staleness_secs INTEGER,
    p_node_timeout_secs INTEGER,
    p_max_reclaims INTEGER
)
RETURNS INTEGER AS $$
DECLARE
    r RECORD;
    touched INTEGER := 0;
BEGIN
    FOR r IN
        SELECT id, provider_address, reclaim_count FROM jobs
         WHERE status = 'processing'
           AND (claimed_at IS NULL
                OR claimed_at < NOW() - make_interval(secs => p_staleness_secs))
         FOR UPDATE SKIP LOCKED
    LOOP
        IF p_max_reclaims IS NOT NULL AND r.reclaim_count >= p_max_reclaims THEN
            UPDATE jobs SET status = 'failed', completed_at = NOW() WHERE id = r.id;
        ELSE
            UPDATE jobs
               SET status = 'pending', provider_address = NULL, claimed_at = NULL,
                   reclaim_count = reclaim_count + 1
             WHERE id = r.id;
        END IF;
        UPDATE nodes SET current_jobs = GREATEST(current_jobs - 1, 0)
         WHERE hardware_id = r.provider_address;
        touched := touched + 1;
    END LOOP;

    UPDATE nodes SET status = 'offline', current_jobs = 0
     WHERE status = 'active'
       AND last_seen < NOW() - make_interval(secs => p_node_timeout_secs);

    RETURN touched;
END;
$$ LANGUAGE plpgsql;
"#;

const JOB_COLUMNS: &str = "id, job_type, status, requester, reward, provider_address, model_ref, \
     data_ref, input_data, result_ref, inference_result, reclaim_count, created_at, claimed_at, \
     completed_at";

const NODE_COLUMNS: &str = "hardware_id, wallet_address, status, current_jobs, \
     total_jobs_completed, reputation, worker_type, last_seen";

#[derive(Clone, Deserialize)]
pub struct PgConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Create tables and claim functions on connect
    #[serde(default = "default_install_schema")]
    pub install_schema: bool,
}

impl fmt::Debug for PgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConfig")
            .field("url", &"[REDACTED]")
            .field("pool_size", &self.pool_size)
            .field("install_schema", &self.install_schema)
            .finish()
    }
}

fn default_pool_size() -> usize {
    16
}

fn default_install_schema() -> bool {
    true
}

impl PgConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: default_pool_size(),
            install_schema: default_install_schema(),
        }
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: Pool,
    policy: ReclaimPolicy,
}

impl PgLedger {
    /// Connect, and install the schema unless disabled
    pub async fn connect(cfg: &PgConfig, policy: ReclaimPolicy) -> Result<Self> {
        let mut config = Config::new();
        config.url = Some(cfg.url.clone());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        config.pool = Some(deadpool_postgres::PoolConfig::new(cfg.pool_size));
        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| LedgerError::InvalidData(format!("pool config: {}", e)))?;

        let client = pool.get().await?;
        info!("Connected to PostgreSQL ledger");

        if cfg.install_schema {
            client.batch_execute(SCHEMA).await?;
            info!("Ledger schema installed");
        }

        Ok(Self { pool, policy })
    }

    async fn call_bool(
        &self,
        name: &'static str,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(sql, params)
            .await
            .map_err(|e| map_function_error(e, name))?;
        Ok(row.get(0))
    }
}

/// Undefined functions mean the deployment never installed that primitive
fn map_function_error(err: tokio_postgres::Error, name: &'static str) -> LedgerError {
    if err.code() == Some(&SqlState::UNDEFINED_FUNCTION) {
        LedgerError::Unsupported(name)
    } else {
        LedgerError::Database(err)
    }
}

fn parse_field<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(LedgerError::InvalidData)
}

fn row_to_job(row: &Row) -> Result<Job> {
    let kind: JobKind = parse_field(row.get::<_, &str>("job_type"))?;
    let model_ref: Option<String> = row.get("model_ref");
    let payload = match kind {
        JobKind::Training => JobPayload::Training {
            model_ref,
            data_ref: row.get("data_ref"),
        },
        JobKind::Inference => JobPayload::Inference {
            model_ref,
            input: row
                .get::<_, Option<String>>("input_data")
                .unwrap_or_default(),
        },
    };

    let inference_output = row
        .get::<_, Option<serde_json::Value>>("inference_result")
        .map(serde_json::from_value::<InferenceOutput>)
        .transpose()?;

    Ok(Job {
        id: row.get("id"),
        status: parse_field(row.get::<_, &str>("status"))?,
        payload,
        requester: row.get("requester"),
        reward: row.get("reward"),
        provider: row.get("provider_address"),
        created_at: row.get("created_at"),
        claimed_at: row.get("claimed_at"),
        completed_at: row.get("completed_at"),
        result_ref: row.get("result_ref"),
        inference_output,
        reclaim_count: row.get::<_, i32>("reclaim_count").max(0) as u32,
    })
}

fn row_to_node(row: &Row) -> Result<Node> {
    Ok(Node {
        hardware_id: row.get("hardware_id"),
        wallet_address: row.get("wallet_address"),
        status: parse_field(row.get::<_, &str>("status"))?,
        current_jobs: row.get::<_, i32>("current_jobs").max(0) as u32,
        total_jobs_completed: row.get::<_, i64>("total_jobs_completed").max(0) as u64,
        reputation: row.get("reputation"),
        worker_type: parse_field(row.get::<_, &str>("worker_type"))?,
        last_seen: row.get("last_seen"),
    })
}

fn clamp_limit(limit: usize) -> i64 {
    limit.min(i64::MAX as usize) as i64
}

/// Seconds as the `INTEGER` the stored functions take
fn int4_secs(secs: i64) -> i32 {
    secs.clamp(0, i64::from(i32::MAX)) as i32
}

#[async_trait]
impl Ledger for PgLedger {
    // ========================================================================
    // JOBS
    // ========================================================================

    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let kind = job.payload.kind();
        let (model_ref, data_ref, input_data) = match &job.payload {
            JobPayload::Training {
                model_ref,
                data_ref,
            } => (model_ref.clone(), data_ref.clone(), None),
            JobPayload::Inference { model_ref, input } => {
                (model_ref.clone(), None, Some(input.clone()))
            }
        };

        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO jobs (id, job_type, status, requester, reward, model_ref, data_ref, input_data)
                     VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7)
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                &[
                    &id,
                    &kind.as_str(),
                    &job.requester,
                    &job.reward,
                    &model_ref,
                    &data_ref,
                    &input_data,
                ],
            )
            .await?;

        debug!("Created {} job {}", kind, id);
        row_to_job(&row)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS),
                &[&job_id],
            )
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM jobs WHERE status = 'pending'
                     ORDER BY created_at ASC LIMIT $1",
                    JOB_COLUMNS
                ),
                &[&clamp_limit(limit)],
            )
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let status = status.map(|s| s.as_str());
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM jobs WHERE ($1::TEXT IS NULL OR status = $1)
                     ORDER BY created_at DESC LIMIT $2",
                    JOB_COLUMNS
                ),
                &[&status, &clamp_limit(limit)],
            )
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn cancel_job(&self, job_id: &str, requester: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE jobs SET status = 'cancelled', completed_at = NOW()
                 WHERE id = $1 AND requester = $2 AND status = 'pending'
                   AND provider_address IS NULL",
                &[&job_id, &requester],
            )
            .await?;
        if updated == 0 && self.get_job(job_id).await?.is_none() {
            return Err(LedgerError::NotFound(job_id.to_string()));
        }
        Ok(updated > 0)
    }

    async fn record_inference_output(
        &self,
        job_id: &str,
        provider: &str,
        output: &InferenceOutput,
    ) -> Result<()> {
        let value = serde_json::to_value(output)?;
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE jobs SET inference_result = $3 WHERE id = $1 AND provider_address = $2",
                &[&job_id, &provider, &value],
            )
            .await?;
        if updated == 0 {
            return Err(LedgerError::InvalidData(format!(
                "job {} is not owned by {}",
                job_id, provider
            )));
        }
        Ok(())
    }

    // ========================================================================
    // CLAIMS
    // ========================================================================

    async fn claim_job_fair(&self, job_id: &str, provider: &str) -> Result<bool> {
        let timeout = int4_secs(self.policy.node_timeout_secs);
        self.call_bool(
            "claim_job_fair",
            "SELECT claim_job_fair($1, $2, $3)",
            &[&job_id, &provider, &timeout],
        )
        .await
    }

    async fn claim_job(&self, job_id: &str, provider: &str) -> Result<bool> {
        self.call_bool(
            "claim_job",
            "SELECT claim_job($1, $2)",
            &[&job_id, &provider],
        )
        .await
    }

    async fn conditional_claim(&self, job_id: &str, provider: &str) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE jobs SET status = 'processing', provider_address = $2, claimed_at = NOW()
                 WHERE id = $1 AND status = 'pending'",
                &[&job_id, &provider],
            )
            .await?;
        if updated > 0 {
            client
                .execute(
                    "UPDATE nodes SET current_jobs = current_jobs + 1 WHERE hardware_id = $1",
                    &[&provider],
                )
                .await?;
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
        if status.completion_transition().is_none() {
            return Err(LedgerError::InvalidData(format!(
                "{} is not a completion status",
                status
            )));
        }
        self.call_bool(
            "complete_job",
            "SELECT complete_job($1, $2, $3, $4)",
            &[&job_id, &provider, &result_ref, &status.as_str()],
        )
        .await
    }

    async fn cleanup_stale(&self) -> Result<u64> {
        let staleness = int4_secs(self.policy.staleness_window_secs);
        let node_timeout = int4_secs(self.policy.node_timeout_secs);
        let max_reclaims = self.policy.max_reclaims.map(|m| m.min(i32::MAX as u32) as i32);

        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT cleanup_stale_jobs($1, $2, $3)",
                &[&staleness, &node_timeout, &max_reclaims],
            )
            .await
            .map_err(|e| map_function_error(e, "cleanup_stale_jobs"))?;
        let touched: i32 = row.get(0);
        if touched > 0 {
            info!("Reclaimed {} stale job(s)", touched);
        }
        Ok(touched.max(0) as u64)
    }

    // ========================================================================
    // NODES
    // ========================================================================

    async fn upsert_node(&self, registration: &NodeRegistration) -> Result<Node> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO nodes (hardware_id, wallet_address, status, current_jobs, worker_type, last_seen)
                     VALUES ($1, $2, 'active', 0, $3, NOW())
                     ON CONFLICT (hardware_id) DO UPDATE SET
                        wallet_address = EXCLUDED.wallet_address,
                        worker_type = EXCLUDED.worker_type,
                        status = 'active',
                        current_jobs = 0,
                        last_seen = GREATEST(nodes.last_seen, NOW())
                     RETURNING {}",
                    NODE_COLUMNS
                ),
                &[
                    &registration.hardware_id,
                    &registration.wallet_address,
                    &registration.worker_type.as_str(),
                ],
            )
            .await?;
        row_to_node(&row)
    }

    async fn heartbeat(&self, hardware_id: &str) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE nodes SET status = 'active', last_seen = GREATEST(last_seen, NOW())
                 WHERE hardware_id = $1",
                &[&hardware_id],
            )
            .await?;
        if updated == 0 {
            return Err(LedgerError::NotFound(hardware_id.to_string()));
        }
        Ok(())
    }

    async fn mark_offline(&self, hardware_id: &str) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE nodes SET status = 'offline', current_jobs = 0 WHERE hardware_id = $1",
                &[&hardware_id],
            )
            .await?;
        if updated == 0 {
            return Err(LedgerError::NotFound(hardware_id.to_string()));
        }
        Ok(())
    }

    async fn get_node(&self, hardware_id: &str) -> Result<Option<Node>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM nodes WHERE hardware_id = $1", NODE_COLUMNS),
                &[&hardware_id],
            )
            .await?;
        row.as_ref().map(row_to_node).transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM nodes ORDER BY last_seen DESC",
                    NODE_COLUMNS
                ),
                &[],
            )
            .await?;
        rows.iter().map(row_to_node).collect()
    }
}
