//! Oblivion Node
//!
//! Runs a compute worker against the shared ledger, and exposes requester
//! and operator commands (submit, cancel, list, export, serve, simulate).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use oblivion_node::api::{self, ApiState};
use oblivion_node::config::StorageBackend;
use oblivion_node::core::short_id;
use oblivion_node::engine::ExecutionEngine;
use oblivion_node::storage::MemoryObjectStore;
use oblivion_node::{
    ArtifactExporter, ArtifactFormat, HttpFetcher, JobPayload, JobStatus, Ledger, MemoryLedger,
    NewJob, NodeConfig, NodeIdentity, PgLedger, WorkerManager, WorkerType,
};

const DEFAULT_CONFIG_FILE: &str = "oblivion.toml";

#[derive(Parser, Debug)]
#[command(name = "oblivion-node")]
#[command(about = "Oblivion compute node - claims and executes decentralized ML jobs")]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, env = "OBLIVION_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL ledger URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Object storage base URL
    #[arg(long, env = "STORAGE_URL")]
    storage_url: Option<String>,

    /// Object storage API key
    #[arg(long, env = "STORAGE_KEY", hide_env_values = true)]
    storage_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a worker until interrupted
    Run {
        /// Owner wallet address
        #[arg(long, env = "OBLIVION_WALLET")]
        wallet: Option<String>,

        /// Derive the node id from the wallet (browser-type worker)
        #[arg(long)]
        browser: bool,

        /// Override the concurrency cap
        #[arg(long)]
        max_jobs: Option<usize>,
    },
    /// Submit a job as a requester
    Submit {
        #[command(subcommand)]
        kind: SubmitKind,
    },
    /// Cancel a pending job
    Cancel {
        job_id: String,
        #[arg(long)]
        requester: String,
    },
    /// List jobs
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Export a job's model artifact
    Export {
        job_id: String,
        /// json|pt|onnx|pkl|h5
        #[arg(short, long, default_value = "json")]
        format: String,
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "0.0.0.0", env = "OBLIVION_HOST")]
        host: String,
        #[arg(short, long, default_value = "8080", env = "OBLIVION_PORT")]
        port: u16,
    },
    /// Race in-process workers for synthetic jobs
    Simulate {
        #[arg(long, default_value = "3")]
        workers: usize,
        #[arg(long, default_value = "10")]
        jobs: usize,
    },
}

#[derive(Subcommand, Debug)]
enum SubmitKind {
    /// Training job over a CSV dataset (synthetic data when omitted)
    Training {
        #[arg(long)]
        requester: String,
        #[arg(long)]
        data_ref: Option<String>,
        #[arg(long)]
        model_ref: Option<String>,
        #[arg(long, default_value = "0")]
        reward: String,
    },
    /// Inference job against a trained model
    Inference {
        #[arg(long)]
        requester: String,
        #[arg(long)]
        model_ref: Option<String>,
        /// `{"data": [...]}` or a bare JSON array
        #[arg(long)]
        input: String,
        #[arg(long, default_value = "0")]
        reward: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("oblivion_node=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            wallet,
            browser,
            max_jobs,
        } => cmd_run(config, wallet, browser, max_jobs).await,
        Commands::Submit { kind } => cmd_submit(&config, kind).await,
        Commands::Cancel { job_id, requester } => cmd_cancel(&config, &job_id, &requester).await,
        Commands::Jobs { status, limit } => cmd_jobs(&config, status, limit).await,
        Commands::Export {
            job_id,
            format,
            out,
        } => cmd_export(&config, &job_id, &format, &out).await,
        Commands::Serve { host, port } => cmd_serve(&config, &host, port).await,
        Commands::Simulate { workers, jobs } => cmd_simulate(config, workers, jobs).await,
    }
}

// ==================== Setup Helpers ====================

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            NodeConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => NodeConfig::default(),
    };

    if let Some(url) = &cli.database_url {
        config.ledger.database_url = Some(url.clone());
    }
    if let Some(url) = &cli.storage_url {
        config.storage.url = Some(url.clone());
        config.storage.backend = StorageBackend::Http;
    }
    if let Some(key) = &cli.storage_key {
        config.storage.api_key = Some(key.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn open_ledger(config: &NodeConfig) -> Result<Arc<dyn Ledger>> {
    let policy = config.ledger.policy();
    match config.ledger.pg_config() {
        Some(pg) => {
            let ledger = PgLedger::connect(&pg, policy)
                .await
                .context("Failed to connect to the ledger database")?;
            Ok(Arc::new(ledger))
        }
        None => {
            warn!("No database URL configured, using a process-local ledger");
            Ok(Arc::new(MemoryLedger::with_policy(policy)))
        }
    }
}

fn status_cell(status: JobStatus) -> Cell {
    let color = match status {
        JobStatus::Pending => Color::Yellow,
        JobStatus::Processing => Color::Cyan,
        JobStatus::Completed => Color::Green,
        JobStatus::Failed => Color::Red,
        JobStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

// ==================== Subcommand Handlers ====================

async fn cmd_run(
    mut config: NodeConfig,
    wallet: Option<String>,
    browser: bool,
    max_jobs: Option<usize>,
) -> Result<()> {
    if let Some(cap) = max_jobs {
        config.worker.max_concurrent_jobs = cap;
        config.validate().context("Invalid --max-jobs")?;
    }
    let wallet = wallet.or_else(|| config.worker.wallet_address.clone());

    let browser = browser || config.worker.worker_type == WorkerType::Browser;
    let identity = match wallet {
        Some(wallet) if browser => NodeIdentity::from_wallet(&wallet),
        wallet => {
            let mut identity = NodeIdentity::load_or_create(&config.worker.identity_file)
                .context("Failed to load node identity")?
                .with_wallet(wallet);
            identity.worker_type = config.worker.worker_type;
            identity
        }
    };

    let ledger = open_ledger(&config).await?;
    let store = config.storage.build()?;
    let engine = Arc::new(ExecutionEngine::new(
        config.engine.clone(),
        Arc::new(config.storage.fetcher()?),
        store,
    ));

    info!("Starting Oblivion node {}", identity.hardware_id);
    let worker = WorkerManager::new(identity, config.worker.clone(), ledger, engine);
    worker.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    worker.stop().await;
    Ok(())
}

async fn cmd_submit(config: &NodeConfig, kind: SubmitKind) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let new_job = match kind {
        SubmitKind::Training {
            requester,
            data_ref,
            model_ref,
            reward,
        } => NewJob {
            payload: JobPayload::Training {
                model_ref,
                data_ref,
            },
            requester,
            reward,
        },
        SubmitKind::Inference {
            requester,
            model_ref,
            input,
            reward,
        } => NewJob::inference(requester, model_ref, input).with_reward(reward),
    };

    let job = ledger.create_job(new_job).await?;
    println!("{} {} job {}", "✓".green(), job.kind(), job.id.as_str().bold());
    Ok(())
}

async fn cmd_cancel(config: &NodeConfig, job_id: &str, requester: &str) -> Result<()> {
    let ledger = open_ledger(config).await?;
    if ledger.cancel_job(job_id, requester).await? {
        println!("{} Cancelled job {}", "✓".green(), job_id);
    } else {
        println!(
            "{} Job {} was not cancelled (already claimed, or not yours)",
            "✗".red(),
            job_id
        );
    }
    Ok(())
}

async fn cmd_jobs(config: &NodeConfig, status: Option<JobStatus>, limit: usize) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let jobs = ledger.list_jobs(status, limit).await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Job", "Kind", "Status", "Provider", "Reward", "Created",
    ]);
    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.short_id()),
            Cell::new(job.kind().as_str()),
            status_cell(job.status),
            Cell::new(job.provider.as_deref().unwrap_or("-")),
            Cell::new(&job.reward),
            Cell::new(job.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }
    println!("{}", table);
    println!("{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_export(config: &NodeConfig, job_id: &str, format: &str, out: &Path) -> Result<()> {
    let format: ArtifactFormat = format.parse()?;
    let ledger = open_ledger(config).await?;
    let exporter = ArtifactExporter::new(
        ledger,
        Arc::new(config.storage.fetcher()?),
        config.engine.shape(),
    );

    let download = exporter.export(job_id, format).await?;
    tokio::fs::create_dir_all(out).await?;
    let path = out.join(&download.filename);
    tokio::fs::write(&path, &download.bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    if download.from_job {
        println!("{} Wrote {}", "✓".green(), path.display());
    } else {
        println!(
            "{} Wrote {} (job artifact unavailable, default model exported)",
            "!".yellow(),
            path.display()
        );
    }
    Ok(())
}

async fn cmd_serve(config: &NodeConfig, host: &str, port: u16) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let exporter = ArtifactExporter::new(
        ledger.clone(),
        Arc::new(config.storage.fetcher()?),
        config.engine.shape(),
    );
    let state = Arc::new(ApiState { ledger, exporter });
    api::run_server(state, host, port).await
}

async fn cmd_simulate(config: NodeConfig, workers: usize, jobs: usize) -> Result<()> {
    let ledger = Arc::new(MemoryLedger::with_policy(config.ledger.policy()));
    let store = Arc::new(MemoryObjectStore::new());
    let fetcher = Arc::new(HttpFetcher::new()?.with_memory_store(store.clone()));
    let engine = Arc::new(ExecutionEngine::new(config.engine.clone(), fetcher, store));

    for i in 0..jobs {
        let job = if i % 3 == 2 {
            NewJob::inference("0xsimulator", None, "[0.1, 0.2, 0.3, 0.4, 0.5]")
        } else {
            NewJob::training("0xsimulator", None)
        };
        ledger.create_job(job.with_reward("0.1")).await?;
    }

    let mut managers = Vec::with_capacity(workers);
    for i in 0..workers {
        let identity = NodeIdentity::new(format!("WORKER-SIM{:04}", i), WorkerType::Native);
        ledger.upsert_node(&identity.registration()).await?;
        managers.push(Arc::new(WorkerManager::new(
            identity,
            config.worker.clone(),
            ledger.clone(),
            engine.clone(),
        )));
    }
    info!("Simulating {} workers racing for {} jobs", workers, jobs);

    let runs = managers.iter().cloned().map(|manager| {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            let mut processed = 0usize;
            loop {
                if manager.poll_once().await.is_some() {
                    processed += 1;
                    continue;
                }
                match ledger.pending_jobs(1).await {
                    Ok(pending) if pending.is_empty() => break,
                    Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                    Err(e) => {
                        warn!("Simulation poll failed: {}", e);
                        break;
                    }
                }
            }
            (manager.hardware_id().to_string(), processed)
        })
    });
    let results = futures::future::join_all(runs).await;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Worker", "Processed", "Completed", "Reputation"]);
    for result in results {
        let (hardware_id, processed) = result.context("Simulated worker panicked")?;
        let node = ledger.get_node(&hardware_id).await?;
        table.add_row(vec![
            Cell::new(&hardware_id),
            Cell::new(processed),
            Cell::new(node.as_ref().map_or(0, |n| n.total_jobs_completed)),
            Cell::new(format!(
                "{:.1}",
                node.as_ref().map_or(0.0, |n| n.reputation)
            )),
        ]);
    }
    println!("{}", table);

    let all = ledger.list_jobs(None, jobs.max(1)).await?;
    let unique_providers = all.iter().filter(|j| j.provider.is_some()).count();
    let completed = all
        .iter()
        .filter(|j| j.status == JobStatus::Completed)
        .count();
    println!(
        "{} {}/{} jobs completed, each by exactly one provider ({} claimed)",
        "✓".green(),
        completed,
        all.len(),
        unique_providers
    );
    for job in all.iter().filter(|j| j.status != JobStatus::Completed) {
        println!(
            "{} job {} ended {}",
            "!".yellow(),
            short_id(&job.id),
            job.status
        );
    }
    Ok(())
}
