//! Node configuration
//!
//! Loaded from a TOML file with `[worker]`, `[ledger]`, `[storage]` and
//! `[engine]` tables. Every field has a default, so an empty file (or none)
//! is valid. CLI flags and environment variables override file values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::core::ReclaimPolicy;
use crate::engine::EngineConfig;
use crate::fetch::HttpFetcher;
use crate::ledger::PgConfig;
use crate::storage::{
    HttpObjectStore, LocalObjectStore, MemoryObjectStore, ObjectStore, MODEL_BUCKET,
};
use crate::worker::WorkerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub worker: WorkerConfig,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.batch_size == 0 {
            return Err(ConfigError::Invalid("worker.batch_size must be > 0".into()));
        }
        if self.worker.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_concurrent_jobs must be > 0".into(),
            ));
        }
        if self.worker.poll_interval_ms == 0 || self.worker.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker intervals must be > 0".into(),
            ));
        }
        if self.worker.claim_jitter_min_ms > self.worker.claim_jitter_max_ms {
            return Err(ConfigError::Invalid(
                "worker.claim_jitter_min_ms exceeds claim_jitter_max_ms".into(),
            ));
        }
        let engine = &self.engine;
        if engine.input_size == 0 || engine.hidden_size == 0 || engine.output_size == 0 {
            return Err(ConfigError::Invalid("engine layer widths must be > 0".into()));
        }
        if self.ledger.staleness_window_secs <= 0 || self.ledger.node_timeout_secs <= 0 {
            return Err(ConfigError::Invalid("ledger timeouts must be > 0".into()));
        }
        // Postgres binds both as int4 seconds
        let max_secs = i64::from(i32::MAX);
        if self.ledger.staleness_window_secs > max_secs || self.ledger.node_timeout_secs > max_secs
        {
            return Err(ConfigError::Invalid(format!(
                "ledger timeouts must be <= {} seconds",
                max_secs
            )));
        }
        Ok(())
    }
}

// ============================================================================
// LEDGER
// ============================================================================

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// PostgreSQL URL; the in-process ledger is used when unset
    pub database_url: Option<String>,
    pub pool_size: usize,
    pub install_schema: bool,
    pub staleness_window_secs: i64,
    pub node_timeout_secs: i64,
    pub max_reclaims: Option<u32>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let policy = ReclaimPolicy::default();
        Self {
            database_url: None,
            pool_size: 16,
            install_schema: true,
            staleness_window_secs: policy.staleness_window_secs,
            node_timeout_secs: policy.node_timeout_secs,
            max_reclaims: policy.max_reclaims,
        }
    }
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerConfig")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("pool_size", &self.pool_size)
            .field("install_schema", &self.install_schema)
            .field("staleness_window_secs", &self.staleness_window_secs)
            .field("node_timeout_secs", &self.node_timeout_secs)
            .field("max_reclaims", &self.max_reclaims)
            .finish()
    }
}

impl LedgerConfig {
    pub fn policy(&self) -> ReclaimPolicy {
        ReclaimPolicy {
            staleness_window_secs: self.staleness_window_secs,
            node_timeout_secs: self.node_timeout_secs,
            max_reclaims: self.max_reclaims,
        }
    }

    pub fn pg_config(&self) -> Option<PgConfig> {
        self.database_url.as_ref().map(|url| PgConfig {
            url: url.clone(),
            pool_size: self.pool_size,
            install_schema: self.install_schema,
        })
    }
}

// ============================================================================
// STORAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Http,
    Local,
    Memory,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Base URL of the object storage service (http backend)
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub bucket: String,
    /// Root directory (local backend)
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            url: None,
            api_key: None,
            bucket: MODEL_BUCKET.to_string(),
            root: PathBuf::from("artifacts"),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("bucket", &self.bucket)
            .field("root", &self.root)
            .finish()
    }
}

impl StorageConfig {
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        match self.backend {
            StorageBackend::Http => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| ConfigError::Invalid("storage.url is required".into()))?;
                let store = HttpObjectStore::new(
                    url,
                    &self.bucket,
                    self.api_key.as_deref().unwrap_or_default(),
                )
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(store))
            }
            StorageBackend::Local => Ok(Arc::new(LocalObjectStore::new(self.root.clone()))),
            StorageBackend::Memory => Ok(Arc::new(MemoryObjectStore::new())),
        }
    }

    /// Fetcher matching this backend. Only the local backend may read
    /// `file://` references, and only under its root.
    pub fn fetcher(&self) -> Result<HttpFetcher, ConfigError> {
        let fetcher = HttpFetcher::new().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(match self.backend {
            StorageBackend::Local => fetcher.with_local_root(self.root.clone()),
            StorageBackend::Http | StorageBackend::Memory => fetcher,
        })
    }
}
