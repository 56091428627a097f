use anyhow::{Context, Result, bail};
use slotrunner::cli::{
    Args, BatchLoader, CliMode, ConfigDiscovery, RunConfig, ScheduleConfig,
};
use slotrunner::automation::{ItemScript, SimulationScript};
use slotrunner::scheduler::AdaptiveScheduler;
use slotrunner::task::{BatchParams, BatchSnapshot, ChannelEventSink, EventKind, TracingEventSink};
use slotrunner::{BatchStatus, Engine, ScheduleOutcome, SimulatedBackend, TaskStatus, WorkItem, env};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    init_logging(args.verbose);

    match mode {
        CliMode::Run(config) => run_batch(config).await,
        CliMode::Schedule(config) => run_schedule(config).await,
        CliMode::Windows => show_windows(args.config.as_deref()),
        CliMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            let config = ConfigDiscovery::load(args.config.as_deref())?;
            println!();
            println!("Effective configuration:");
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
        CliMode::InitConfig => {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("Configuration file: {}", path.display());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "slotrunner=debug"
    } else {
        env::DEFAULT_LOG_FILTER
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_batch(config: RunConfig) -> Result<()> {
    let engine_config = ConfigDiscovery::load(config.config_override.as_deref())?;
    let batch = BatchLoader::load(&config.batch_file)?;

    if config.verbose {
        println!("📝 Loaded {} items for principal {}", batch.items.len(), batch.principal);
        for (i, item) in batch.items.iter().enumerate() {
            println!("  📋 {}: {}", i + 1, item.label);
        }
    }

    let backend = Arc::new(SimulatedBackend::new(batch.simulation.clone()));
    let engine = Engine::new(engine_config, backend)
        .await
        .context("failed to start engine")?;

    let (sink, mut events) = ChannelEventSink::channel();
    let batch_id = engine
        .start_batch(
            batch.principal,
            batch.items.clone(),
            batch.batch_params(),
            Arc::new(sink),
        )
        .await
        .context("batch was rejected")?;
    info!("Started batch {}", batch_id);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[{}] {:?}: {}", event.timestamp.format("%H:%M:%S"), event.kind, event.text);
            if event.kind == EventKind::BatchSummary {
                break;
            }
        }
    });

    let snapshot = tokio::select! {
        snapshot = engine.wait_for_batch(batch_id) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling batch {}", batch_id);
            engine.cancel_batch(batch_id).await?;
            engine.wait_for_batch(batch_id).await?
        }
    };
    if let Err(e) = printer.await {
        warn!("Event printer stopped unexpectedly: {}", e);
    }

    print_snapshot(&snapshot);
    engine.shutdown().await;

    if snapshot.batch.status == BatchStatus::Failed {
        bail!("batch {} failed", batch_id);
    }
    Ok(())
}

fn print_snapshot(snapshot: &BatchSnapshot) {
    println!();
    println!("📊 Batch {} ({:?})", snapshot.batch.id, snapshot.batch.status);
    for task in &snapshot.tasks {
        let marker = match task.status {
            TaskStatus::Completed => "✅",
            TaskStatus::Failed => "❌",
            TaskStatus::Cancelled => "⏹",
            TaskStatus::Pending | TaskStatus::Running => "…",
        };
        match &task.error {
            Some(error) => println!("  {} {} - {}", marker, task.item.label, error),
            None => println!(
                "  {} {} ({} attempts)",
                marker, task.item.label, task.attempts
            ),
        }
    }
}

async fn run_schedule(config: ScheduleConfig) -> Result<()> {
    let engine_config = ConfigDiscovery::load(config.config_override.as_deref())?;

    let script = SimulationScript::default().with_item(
        config.item.clone(),
        ItemScript {
            transient_failures: config.transient_failures,
            ..Default::default()
        },
    );
    let engine = Engine::new(engine_config, Arc::new(SimulatedBackend::new(script)))
        .await
        .context("failed to start engine")?;

    println!("🕐 {}", engine.window_status());

    let job = engine.schedule_item(
        config.principal,
        WorkItem::labelled(config.item.clone()),
        BatchParams::default(),
        Arc::new(TracingEventSink),
    );
    let job_id = job.id();
    let join = job.join();
    tokio::pin!(join);

    let outcome = tokio::select! {
        outcome = &mut join => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping scheduled run");
            engine.cancel_job(job_id);
            join.await?
        }
    };
    engine.shutdown().await;

    match outcome {
        ScheduleOutcome::Succeeded { attempts, .. } => {
            println!("✅ {} booked after {} attempts", config.item, attempts);
            Ok(())
        }
        ScheduleOutcome::Cancelled { attempts } => {
            println!("⏹ Cancelled after {} attempts", attempts);
            Ok(())
        }
        ScheduleOutcome::Exhausted {
            attempts,
            last_error,
        } => bail!("gave up after {} attempts: {}", attempts, last_error),
        ScheduleOutcome::Aborted { attempts, error } => {
            bail!("aborted on attempt {}: {}", attempts, error)
        }
    }
}

fn show_windows(config_override: Option<&std::path::Path>) -> Result<()> {
    let config = ConfigDiscovery::load(config_override)?;
    let scheduler = AdaptiveScheduler::with_system_clock(
        config.scheduler.scheduler_config(),
        config.scheduler.offset()?,
    );

    let status = scheduler.window_status();
    println!("Now: {}", status.now.format("%Y-%m-%d %H:%M %:z"));
    println!("Windows:");
    for window in &scheduler.config().windows {
        let marker = if status.active_window == Some(*window) {
            "▶"
        } else {
            " "
        };
        println!("  {} {}", marker, window);
    }
    println!("{}", status);
    Ok(())
}
