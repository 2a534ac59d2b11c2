use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use loom_core::heartbeat::{find_orphaned_jobs, OrphanReason, HEARTBEAT_TIMEOUT_SECS};
use loom_core::types::now;
use loom_events::{spawn_event_logger, EventBus};
use loom_store::{
    open_run_store, open_worker_registry, NewRun, RunManager, RunStateManifest, RunStore,
    WorkerRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loom_worker::config::{Cli, Command, SubmitArgs, WorkArgs};
use loom_worker::{ProcessExecutor, WorkerConfig, WorkerRunner};

/// Exit status for failures before any work starts.
const STARTUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loom_worker=info,loom_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // --- Stores ---
    let store = match open_run_store(&cli.store).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(store = %cli.store, error = %e, "Failed to open run store");
            return ExitCode::from(STARTUP_FAILURE);
        }
    };
    let registry = match open_worker_registry(cli.worker_store()).await {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(store = %cli.worker_store(), error = %e, "Failed to open worker registry");
            return ExitCode::from(STARTUP_FAILURE);
        }
    };
    let run_state = Arc::new(RunStateManifest::new(Arc::clone(&store)));

    let outcome = match cli.command {
        Command::Work(args) => {
            work(store, registry, &args).await;
            Ok(())
        }
        Command::Submit(args) => submit(store, run_state, &args).await,
        Command::Runs => list_runs(store, &run_state).await,
        Command::Workers => list_workers(registry.as_ref()).await,
        Command::Pause { run_id } => set_paused(store.as_ref(), &run_state, &run_id, true).await,
        Command::Resume { run_id } => set_paused(store.as_ref(), &run_state, &run_id, false).await,
        Command::Priority { run_id, priority } => {
            set_priority(store.as_ref(), &run_state, &run_id, priority).await
        }
        Command::Orphans => list_orphans(store.as_ref(), registry.as_ref()).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// work
// ---------------------------------------------------------------------------

async fn work(store: Arc<dyn RunStore>, registry: Arc<dyn WorkerRegistry>, args: &WorkArgs) {
    let config = WorkerConfig::from(args);
    let executor_timeout = args.executor_timeout();
    let executor = Arc::new(
        ProcessExecutor::new(args.executor.clone(), args.executor_args.clone())
            .with_timeout(executor_timeout),
    );
    tracing::info!(
        worker_id = %config.worker_id,
        executor = %executor.program(),
        executor_timeout_secs = executor_timeout.map(|t| t.as_secs()),
        cache_dir = %config.cache_dir.display(),
        "Loaded worker configuration",
    );

    // --- Event bus ---
    let events = Arc::new(EventBus::default());
    let logger_handle = spawn_event_logger(events.subscribe());

    let runner = WorkerRunner::new(store, registry, executor, config).with_events(Arc::clone(&events));

    // --- Shutdown ---
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    runner.run(cancel).await;
    signal_handle.abort();

    // Dropping every sender closes the channel and ends the logger.
    drop(runner);
    drop(events);
    let _ = tokio::time::timeout(Duration::from_secs(5), logger_handle).await;
}

/// Wait for SIGINT or SIGTERM. A job in flight finishes before the worker
/// exits.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), finishing current job");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, finishing current job");
        }
    }
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

async fn submit(
    store: Arc<dyn RunStore>,
    run_state: Arc<RunStateManifest>,
    args: &SubmitArgs,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read(&args.configs)
        .await
        .with_context(|| format!("Failed to read {}", args.configs.display()))?;
    let configs: Vec<serde_json::Value> = serde_json::from_slice(&raw)
        .with_context(|| format!("{} must hold a JSON array of render configs", args.configs.display()))?;
    if configs.is_empty() {
        bail!("{} contains no render configs", args.configs.display());
    }

    let mut manager = RunManager::new(store, run_state);
    if let Some(path) = &args.host_counter {
        manager = manager.with_host_counter(path);
    }
    let created = manager
        .create_run(NewRun {
            note: args.note.clone(),
            mode: args.mode.clone(),
            garment: args.garment.clone(),
            fabrics: args.fabrics.clone(),
            assets: args.assets.clone(),
            views: args.views.clone(),
            configs,
            extra: None,
            priority: args.priority,
        })
        .await
        .context("Failed to create run")?;

    println!("{} ({} jobs)", created.run_id, created.jobs.len());
    Ok(())
}

async fn list_runs(store: Arc<dyn RunStore>, run_state: &Arc<RunStateManifest>) -> anyhow::Result<()> {
    let run_ids = store.list_run_ids().await.context("Failed to list runs")?;
    let document = run_state.load().await.context("Failed to load run state")?;
    let manager = RunManager::new(Arc::clone(&store), Arc::clone(run_state));

    println!(
        "{:<6} {:<10} {:>5} {:>5} {:>5} {:>5} {:>8} {:<6} NOTE",
        "RUN", "STATUS", "TOTAL", "DONE", "FAIL", "PEND", "PRIORITY", "PAUSED"
    );
    for run_id in run_ids {
        let meta = manager
            .summarize_run(&run_id)
            .await
            .with_context(|| format!("Failed to read run {run_id}"))?;
        println!(
            "{:<6} {:<10} {:>5} {:>5} {:>5} {:>5} {:>8} {:<6} {}",
            run_id,
            meta.status,
            meta.total_jobs,
            meta.completed_jobs,
            meta.failed_jobs,
            meta.pending_jobs,
            document.priority_of(&run_id),
            if document.is_paused(&run_id) { "yes" } else { "no" },
            meta.note,
        );
    }
    Ok(())
}

async fn list_workers(registry: &dyn WorkerRegistry) -> anyhow::Result<()> {
    let workers = registry.list_workers().await.context("Failed to list workers")?;
    let at = now();

    println!(
        "{:<20} {:<7} {:<6} {:>8} {:<20} HOST",
        "WORKER", "STATUS", "ALIVE", "AGE_S", "ACTIVE_JOB"
    );
    for worker in workers {
        let alive = if worker.is_stale(at, HEARTBEAT_TIMEOUT_SECS) { "stale" } else { "yes" };
        println!(
            "{:<20} {:<7} {:<6} {:>8} {:<20} {}",
            worker.worker_id,
            worker.status,
            alive,
            worker.age_secs(at),
            worker.active_job_id.as_deref().unwrap_or("-"),
            worker.hostname,
        );
    }
    Ok(())
}

async fn list_orphans(store: &dyn RunStore, registry: &dyn WorkerRegistry) -> anyhow::Result<()> {
    let mut jobs = Vec::new();
    for run_id in store.list_run_ids().await.context("Failed to list runs")? {
        jobs.extend(
            store
                .load_jobs(&run_id)
                .await
                .with_context(|| format!("Failed to read ledger of run {run_id}"))?,
        );
    }
    let workers = registry.list_workers().await.context("Failed to list workers")?;
    let orphans = find_orphaned_jobs(&jobs, &workers, now(), HEARTBEAT_TIMEOUT_SECS);

    if orphans.is_empty() {
        println!("No orphaned jobs");
        return Ok(());
    }
    for orphan in orphans {
        let reason = match orphan.reason {
            OrphanReason::NoHeartbeat => "owner never sent a heartbeat".to_string(),
            OrphanReason::StaleHeartbeat { age_secs } => format!("owner silent for {age_secs}s"),
            OrphanReason::OwnerMovedOn { active_job_id } => format!(
                "owner now on {}",
                active_job_id.as_deref().unwrap_or("nothing")
            ),
        };
        println!(
            "{} {} worker={} {}",
            orphan.run_id,
            orphan.job_id,
            orphan.worker.as_deref().unwrap_or("-"),
            reason
        );
    }
    Ok(())
}

async fn set_paused(
    store: &dyn RunStore,
    run_state: &RunStateManifest,
    run_id: &str,
    paused: bool,
) -> anyhow::Result<()> {
    require_run(store, run_id).await?;
    run_state
        .pause_run(run_id, paused)
        .await
        .context("Failed to update run state")
}

async fn set_priority(
    store: &dyn RunStore,
    run_state: &RunStateManifest,
    run_id: &str,
    priority: i64,
) -> anyhow::Result<()> {
    require_run(store, run_id).await?;
    run_state
        .set_run_priority(run_id, priority)
        .await
        .context("Failed to update run priority")
}

async fn require_run(store: &dyn RunStore, run_id: &str) -> anyhow::Result<()> {
    let known = store.list_run_ids().await.context("Failed to list runs")?;
    if !known.iter().any(|id| id == run_id) {
        bail!("Unknown run {run_id}");
    }
    Ok(())
}
