use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::config::{resolve_config_path, AnchorBackend, CadenceConfig, LockProviderKind};
use cadence_scheduler::{
    AnchorStore, CompletionBus, FileAnchorStore, JobTypeRegistry, LockProvider,
    ManualTriggerRegistry, MemoryAnchorStore, NamedLockProvider, NoopLockProvider, RunnerDeps,
    RunnerTuning, Scheduler, SingletonLockProvider, SqliteAnchorStore, StatusBoard,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod app;
mod http;
mod jobs;
mod reload;

#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version)]
#[command(about = "Runs cron, manual and chained jobs without double execution")]
struct Cli {
    /// Config file (falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Default)]
enum Command {
    /// Host the configured jobs (default)
    #[default]
    Run,
    /// Validate the configuration and print each job's next occurrence
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_gateway=info,cadence_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());
    let config = CadenceConfig::load(Some(&config_path))
        .with_context(|| format!("failed to load config from {config_path}"))?;
    info!(path = %config_path, jobs = config.jobs.0.len(), "configuration loaded");

    match cli.command.unwrap_or_default() {
        Command::Run => run(config, config_path).await,
        Command::Check => check(&config).await,
    }
}

async fn run(config: CadenceConfig, config_path: String) -> anyhow::Result<()> {
    let anchors = build_anchor_store(&config)?;
    let locks = build_lock_provider(config.locks.provider);
    let job_types = jobs::builtin_registry();
    warn_unknown_types(&config, &job_types);

    let (jobs_tx, jobs_rx) = tokio::sync::watch::channel(Arc::new(config.jobs.clone()));
    let deps = RunnerDeps {
        anchors,
        locks,
        job_types: Arc::new(job_types),
        manual: ManualTriggerRegistry::new(),
        bus: CompletionBus::new(),
        settings: jobs_rx.clone(),
        status: StatusBoard::new(),
        tuning: RunnerTuning::from(&config.runner),
    };
    let manual = deps.manual.clone();
    let status = deps.status.clone();

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(Scheduler::new(deps).run(jobs_rx, shutdown.clone()));

    // The sender must outlive the scheduler even when nothing polls the file.
    let poller = if config.reload.poll_secs > 0 {
        Some(tokio::spawn(reload::poll_config(
            config_path,
            Duration::from_secs(config.reload.poll_secs),
            jobs_tx,
            shutdown.clone(),
        )))
    } else {
        info!("config reload disabled");
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                drop(jobs_tx);
            }
        });
        None
    };

    let server = if config.http.enabled {
        let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port)
            .parse()
            .context("invalid http bind address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("cadence listening on {}", addr);

        let router = app::build_router(Arc::new(app::AppState::new(manual, status)));
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }))
    } else {
        info!("http surface disabled");
        None
    };

    wait_for_shutdown_signal().await;
    shutdown.cancel();

    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => error!(error = %e, "http server failed"),
            Err(e) => error!(error = %e, "http server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    scheduler.await.context("scheduler task panicked")?;
    info!("cadence stopped");
    Ok(())
}

/// Print every job with its triggers and next scheduled occurrence.
async fn check(config: &CadenceConfig) -> anyhow::Result<()> {
    let anchors = build_anchor_store(config)?;
    let job_types = jobs::builtin_registry();
    let now = Utc::now();
    let mut problems = 0usize;

    for name in config.jobs.names() {
        let Some(job) = config.jobs.get(name) else {
            continue;
        };
        let definition = match job.definition(name) {
            Ok(d) => d,
            Err(e) => {
                problems += 1;
                println!("{name}: INVALID ({e})");
                continue;
            }
        };
        if !job_types.contains(&definition.job_type) {
            problems += 1;
            println!("{name}: UNKNOWN TYPE `{}`", definition.job_type);
            continue;
        }

        println!("{definition}");
        let anchor = anchors.get_anchor(name).await?;
        for cron in &definition.triggers.schedules {
            let next = cron
                .next_after(anchor.unwrap_or(now))
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never (exhausted)".to_string());
            println!("  schedule `{cron}` next: {next}");
        }
        if let Some(anchor) = anchor {
            println!("  last run: {}", anchor.to_rfc3339());
        }
    }

    if problems > 0 {
        anyhow::bail!("{problems} job(s) failed validation");
    }
    Ok(())
}

fn build_anchor_store(config: &CadenceConfig) -> anyhow::Result<Arc<dyn AnchorStore>> {
    let path = &config.anchors.path;
    let store: Arc<dyn AnchorStore> = match config.anchors.backend {
        AnchorBackend::File => {
            info!(path = %path, "anchors: file");
            Arc::new(FileAnchorStore::new(path))
        }
        AnchorBackend::Sqlite => {
            info!(path = %path, "anchors: sqlite");
            Arc::new(
                SqliteAnchorStore::open(path)
                    .with_context(|| format!("failed to open anchor database {path}"))?,
            )
        }
        AnchorBackend::Memory => {
            warn!("anchors: memory; last-run times are lost on restart");
            Arc::new(MemoryAnchorStore::new())
        }
    };
    Ok(store)
}

fn build_lock_provider(kind: LockProviderKind) -> Arc<dyn LockProvider> {
    match kind {
        LockProviderKind::None => {
            warn!("locks: none; do not run more than one instance");
            Arc::new(NoopLockProvider)
        }
        LockProviderKind::Singleton => Arc::new(SingletonLockProvider::new()),
        LockProviderKind::Named => Arc::new(NamedLockProvider::new()),
    }
}

fn warn_unknown_types(config: &CadenceConfig, registry: &JobTypeRegistry) {
    for name in config.jobs.names() {
        if let Some(job) = config.jobs.get(name) {
            if !registry.contains(&job.job_type) {
                warn!(
                    job = %name,
                    job_type = %job.job_type,
                    known = ?registry.keys(),
                    "unknown job type; the job will be disabled"
                );
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
