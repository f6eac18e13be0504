use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use syncope_scheduler::config::{self, AppConfig, FileConfig};
use syncope_scheduler::job::{
    DelegateRegistry, JobDependencies, JobManager, StoreJobLock, TaskScheduler,
};
use syncope_scheduler::metrics;
use syncope_scheduler::security::SecurityContext;
use syncope_scheduler::store::{JobStore, SqliteJobStore};
use syncope_scheduler::sync::connector::ConnectorRegistry;
use syncope_scheduler::sync::identity::MemoryIdentityRepository;
use syncope_scheduler::sync::provisioning::InMemoryProvisioningManager;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf> {
    let path = parse_path(s)?;
    if path.exists() && !path.is_dir() {
        anyhow::bail!("Not a directory: {:?}", path);
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values there override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the job database.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Domain running the system jobs.
    #[clap(long)]
    pub master_domain: Option<String>,

    /// Additional domain to serve. Can be repeated.
    #[clap(long = "domain")]
    pub domains: Vec<String>,

    /// User the scheduled jobs run as.
    #[clap(long)]
    pub admin_user: Option<String>,

    /// Name this node writes into cluster lock rows.
    #[clap(long)]
    pub node_id: Option<String>,

    /// Start without registering any job.
    #[clap(long)]
    pub standby: bool,
}

impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        Self {
            db_dir: args.db_dir.clone(),
            metrics_port: args.metrics_port,
            master_domain: args.master_domain.clone(),
            domains: args.domains.clone(),
            admin_user: args.admin_user.clone(),
            node_id: args.node_id.clone(),
            standby: args.standby,
        }
    }
}

async fn run_metrics_server(port: u16) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics::metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    Ok(axum::serve(listener, app).await?)
}

/// Waits for running jobs of every domain to return, up to `timeout`.
async fn wait_for_running_jobs(manager: &JobManager, domains: &[String], timeout: Duration) {
    let started = Instant::now();
    loop {
        let running: Vec<String> = domains
            .iter()
            .flat_map(|domain| manager.job_statuses(domain))
            .filter(|status| status.running)
            .map(|status| status.name)
            .collect();
        if running.is_empty() {
            return;
        }
        if started.elapsed() >= timeout {
            warn!("Shutting down with running jobs: {:?}", running);
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening job database at {:?}...", app_config.jobs_db_path());
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(app_config.jobs_db_path())?);
    let lock = Arc::new(StoreJobLock::new(store.clone(), &app_config.node_id));
    lock.release_stale()?;

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(TaskScheduler::new(
        lock,
        SecurityContext::new(&app_config.admin_user),
        tokio::runtime::Handle::current(),
        app_config.scheduler_settings(shutdown.clone()),
    ));

    let identities = Arc::new(MemoryIdentityRepository::new());
    let provisioning = Arc::new(InMemoryProvisioningManager::new(identities.clone()));
    let deps = Arc::new(JobDependencies::new(
        store,
        identities,
        provisioning,
        Arc::new(ConnectorRegistry::new()),
        scheduler.clone(),
    ));
    let manager = JobManager::new(
        deps,
        Arc::new(DelegateRegistry::with_standard_delegates()),
        app_config.job_manager_settings(),
    );

    for domain in &app_config.domains {
        let summary = manager.load(domain);
        info!(
            "Domain {}: {} tasks, {} reports, {} system jobs registered",
            domain, summary.tasks, summary.reports, summary.system_jobs
        );
    }

    let metrics_port = app_config.metrics_port;
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = run_metrics_server(metrics_port) => {
                if let Err(e) = result {
                    error!("Metrics server stopped: {}", e);
                }
            }
            _ = metrics_shutdown.cancelled() => {}
        }
    });
    info!("Metrics available at port {}!", metrics_port);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");

    scheduler.shutdown();
    wait_for_running_jobs(
        &manager,
        &app_config.domains,
        app_config.scheduler.shutdown_timeout,
    )
    .await;
    for domain in &app_config.domains {
        manager.unload(domain);
    }

    info!("Bye");
    Ok(())
}
