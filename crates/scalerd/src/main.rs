//! scalerd — the scaler daemon.
//!
//! Runs the reconcile loop and the rectification sweep against a cluster.
//! The `simulate` command drives an in-memory cluster loaded from a TOML
//! fixture and prints the resulting workloads, registry, and events as JSON.
//!
//! # Usage
//!
//! ```text
//! scalerd simulate --cluster fixtures/cluster.toml --config fixtures/scaler.toml --cycles 3
//! scalerd check-config fixtures/scaler.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scaler_core::{EngineConfig, ScalingItem};
use scaler_engine::{
    ClusterFixture, EngineContext, EngineError, Event, EventSink, MemoryCluster,
    RecordingEventSink, Reconciler, RectificationSweep, ReconcileReport, SweepReport,
    TracingEventSink,
};
use scaler_registry::RegistrySummary;

#[derive(Parser)]
#[command(name = "scalerd", about = "State-driven replica scaler")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine against an in-memory cluster fixture.
    Simulate {
        /// Cluster fixture (states, definitions, quotas, workloads).
        #[arg(long)]
        cluster: PathBuf,

        /// Engine configuration; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Run this many reconcile + sweep cycles back to back and exit.
        /// Without it the loops run on their configured intervals until Ctrl-C.
        #[arg(long)]
        cycles: Option<u32>,
    },
    /// Validate an engine configuration file.
    CheckConfig {
        path: PathBuf,
    },
}

/// Final view printed by `simulate`.
#[derive(Serialize)]
struct SimulationOutput {
    cycles: Vec<CycleOutput>,
    workloads: Vec<ScalingItem>,
    registry: RegistrySummary,
    failures: Vec<ScalingItem>,
    events: Vec<Event>,
}

#[derive(Serialize)]
struct CycleOutput {
    reconciled: Vec<ReconcileReport>,
    sweep: SweepReport,
}

/// Logs every event and keeps a copy for the final output.
struct SimulationSink {
    log: TracingEventSink,
    recorded: RecordingEventSink,
}

impl EventSink for SimulationSink {
    fn emit(&self, event: Event) {
        self.log.emit(event.clone());
        self.recorded.emit(event);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Simulate {
            cluster,
            config,
            cycles,
        } => simulate(&cluster, config.as_deref(), cycles).await,
        Command::CheckConfig { path } => check_config(&path),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,scalerd=debug,scaler_engine=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::from_file(path)?;
    info!(?path, "config is valid");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn simulate(
    cluster_path: &Path,
    config_path: Option<&Path>,
    cycles: Option<u32>,
) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let fixture = ClusterFixture::from_file(cluster_path)?;
    info!(
        path = ?cluster_path,
        workloads = fixture.workloads.len(),
        definitions = fixture.definitions.len(),
        "cluster fixture loaded"
    );

    let cluster = MemoryCluster::from_fixture(fixture);
    let recorded = RecordingEventSink::new();
    let sink = SimulationSink {
        log: TracingEventSink,
        recorded: recorded.clone(),
    };
    let adapters = cluster.adapters(&config.platform.kinds());
    let ctx = EngineContext::new(
        config,
        adapters,
        cluster.clone(),
        cluster.clone(),
        Arc::new(sink),
    )?;

    let reconciler = Reconciler::new(ctx.clone());
    let sweep = RectificationSweep::new(ctx.clone());
    let namespaces = cluster.namespaces();

    let cycle_outputs = match cycles {
        Some(count) => run_cycles(&reconciler, &sweep, &namespaces, count).await,
        None => {
            run_until_shutdown(reconciler, sweep, namespaces, &ctx).await?;
            Vec::new()
        }
    };

    let output = SimulationOutput {
        cycles: cycle_outputs,
        workloads: cluster.workloads(),
        registry: ctx.registry.summary(),
        failures: ctx.registry.failures(),
        events: recorded.events(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    info!(uptime_ms = ctx.uptime().as_millis() as u64, "simulation finished");
    Ok(())
}

/// Run `count` cycles, waiting for every launched scaler before sweeping.
async fn run_cycles(
    reconciler: &Reconciler,
    sweep: &RectificationSweep,
    namespaces: &[String],
    count: u32,
) -> Vec<CycleOutput> {
    let mut outputs = Vec::new();

    for cycle in 1..=count {
        info!(cycle, "simulation cycle");
        let mut reconciled = Vec::new();

        for namespace in namespaces {
            match reconciler.reconcile_namespace(namespace).await {
                Ok(mut report) => {
                    let handles = std::mem::take(&mut report.handles);
                    for (key, handle) in handles {
                        match handle.await {
                            Ok(Ok(outcome)) => info!(item = %key, ?outcome, "scaler finished"),
                            Ok(Err(e)) => warn!(item = %key, error = %e, "scaler failed"),
                            Err(e) => warn!(item = %key, error = %e, "scaler task aborted"),
                        }
                    }
                    reconciled.push(report);
                }
                Err(EngineError::NotFound(reason)) => {
                    info!(%namespace, %reason, "nothing to reconcile");
                }
                Err(e) => warn!(%namespace, error = %e, "reconcile cycle aborted"),
            }
        }

        let sweep = sweep.sweep_once().await;
        outputs.push(CycleOutput { reconciled, sweep });
    }

    outputs
}

/// Run both loops on their configured intervals until Ctrl-C.
async fn run_until_shutdown(
    reconciler: Reconciler,
    sweep: RectificationSweep,
    namespaces: Vec<String>,
    ctx: &EngineContext,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_shutdown = shutdown_rx.clone();
    let sweep_shutdown = shutdown_rx;

    let reconcile_interval = ctx.timings.reconcile_interval;
    let rectify_interval = ctx.timings.rectify_interval;

    let reconcile_handle = tokio::spawn(async move {
        reconciler
            .run(namespaces, reconcile_interval, reconcile_shutdown)
            .await;
    });
    let sweep_handle = tokio::spawn(async move {
        sweep.run(rectify_interval, sweep_shutdown).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reconcile_handle.await;
    let _ = sweep_handle.await;
    Ok(())
}
