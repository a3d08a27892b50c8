//! obs-scheduler - check and run observing schedules.
//!
//! Usage:
//!   obs-scheduler check <schedule.json>   Print the predicted plan and its status
//!   obs-scheduler run <schedule.json>     Execute against the simulated equipment
//!
//! During `run`, Enter releases a `wait_for_prompt` step and Ctrl-C requests a
//! stop. The equipment is released whichever way the run ends.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use obs_scheduler::config::Settings;
use obs_scheduler::engine::{cancel_pair, ExecutionOutcome, Plan, ScheduleEngine};
use obs_scheduler::hardware::catalog::Catalog;
use obs_scheduler::hardware::mock::{CallLog, MockEquipment, MockRecorder};
use obs_scheduler::hardware::snapshot::{DiscardSnapshots, JsonSnapshotPublisher};
use obs_scheduler::hardware::{
    PlanPublisher, PromptGate, Services, Severity, SkyPosition, StatusReporter, StatusSink,
};
use obs_scheduler::schedule::{file, ExecutionContext};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// obs-scheduler - schedule execution for shared observing equipment
#[derive(Parser)]
#[command(name = "obs-scheduler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = "scheduler.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Selection {
    /// Schedule file to load
    #[arg(value_name = "SCHEDULE")]
    schedule: PathBuf,

    /// Equipment to use, comma separated
    #[arg(short, long, value_delimiter = ',')]
    equipment: Vec<String>,

    /// Recorder targets in node.instance form, comma separated
    #[arg(short, long, value_delimiter = ',')]
    recorders: Vec<String>,

    /// JSON table of source positions: {"casa": {"ra_hours": 23.39, "dec_deg": 58.8}}
    #[arg(short, long)]
    sources: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict the schedule's timeline without moving anything
    Check {
        #[command(flatten)]
        selection: Selection,
    },

    /// Execute the schedule against the simulated equipment
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Operator in charge
        #[arg(short, long)]
        operator: String,

        /// Simulated latency of every equipment call, in milliseconds
        #[arg(long, default_value = "0")]
        latency_ms: u64,
    },
}

/// Prints status lines for the operator.
struct ConsoleStatusSink;

impl StatusSink for ConsoleStatusSink {
    fn report(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Info => println!("{text}"),
            Severity::Warning => println!("WARNING: {text}"),
            Severity::Error => eprintln!("ERROR: {text}"),
        }
    }
}

fn load_sources(path: Option<&Path>) -> anyhow::Result<BTreeMap<String, SkyPosition>> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source table {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse source table {}", path.display()))
}

fn load_catalog(settings: &Settings) -> anyhow::Result<Catalog> {
    let paths = &settings.catalog;
    if !paths.backends.exists() || !paths.postprocessors.exists() {
        warn!(
            backends = %paths.backends.display(),
            postprocessors = %paths.postprocessors.display(),
            "Catalog tables not found, no backend can be selected"
        );
        return Ok(Catalog::new());
    }
    let projects = paths.projects.as_deref().filter(|p| p.exists());
    let catalog = Catalog::from_files(&paths.backends, &paths.postprocessors, projects)
        .context("Failed to load backend catalog")?;
    if let Err(err) = catalog.check_consistency() {
        warn!(%err, "Backend catalog is inconsistent");
    }
    Ok(catalog)
}

fn build_engine(
    settings: &Settings,
    selection: &Selection,
    latency: Duration,
) -> anyhow::Result<ScheduleEngine> {
    let log = CallLog::new();
    let equipment = MockEquipment::new(log.clone())
        .with_sources(load_sources(selection.sources.as_deref())?)
        .with_delay(latency);
    let plans: Arc<dyn PlanPublisher> = match &settings.output.snapshot_path {
        Some(path) => Arc::new(JsonSnapshotPublisher::new(path)),
        None => Arc::new(DiscardSnapshots),
    };

    let services = Services {
        equipment: Arc::new(equipment),
        recorder: Arc::new(MockRecorder::new(log)),
        catalog: Arc::new(load_catalog(settings)?),
        status: StatusReporter::new(Arc::new(ConsoleStatusSink)),
        plans,
        prompt: PromptGate::new(),
    };
    Ok(ScheduleEngine::new(services, settings.engine_settings()))
}

fn print_plan(plan: &Plan) {
    println!("Plan status: {}", plan.status);
    for entry in &plan.entries {
        println!(
            "  {:<12} RA {:>8.4}h  Dec {:>+8.3}  {} -> {}",
            entry.source_id,
            entry.right_ascension,
            entry.declination,
            entry.start_time.format("%Y-%m-%d %H:%M:%S"),
            entry.end_time.format("%H:%M:%S"),
        );
    }
    for note in &plan.notes {
        println!("  [{}] {}: {}", note.index, note.severity, note.message);
    }
    println!("Predicted end: {}", plan.end.format("%Y-%m-%d %H:%M:%S UTC"));
}

/// Enter on stdin releases the prompt.
fn spawn_prompt_reader(prompt: PromptGate) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if !prompt.release() {
                println!("No step is waiting for the operator");
            }
        }
    });
}

async fn run(engine: &ScheduleEngine, selection: &Selection, operator: &str) -> anyhow::Result<()> {
    let schedule = file::load(&selection.schedule)
        .with_context(|| format!("Failed to load schedule {}", selection.schedule.display()))?;
    let ctx = ExecutionContext::new(operator)
        .with_equipment(selection.equipment.clone())
        .with_recorder_targets(selection.recorders.clone());

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current step");
            handle.request();
        }
    });
    spawn_prompt_reader(engine.services().prompt.clone());

    let report = engine.execute(&schedule, &ctx, signal).await?;
    match report.outcome {
        ExecutionOutcome::Completed => {
            info!(attempt = %report.attempt_id, steps = report.steps_completed, "Schedule completed")
        }
        ExecutionOutcome::Cancelled { next_step } => {
            info!(attempt = %report.attempt_id, next_step, "Schedule stopped")
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    obs_scheduler::logging::init(&settings.output.log_level, settings.output.log_json)?;

    match cli.command {
        Commands::Check { selection } => {
            let engine = build_engine(&settings, &selection, Duration::ZERO)?;
            let schedule = file::load(&selection.schedule)
                .with_context(|| format!("Failed to load schedule {}", selection.schedule.display()))?;
            let ctx = ExecutionContext::new("check")
                .with_equipment(selection.equipment.clone())
                .with_recorder_targets(selection.recorders.clone());

            if let Err(err) = engine.validate(&schedule, &ctx) {
                bail!("Schedule is invalid: {err}");
            }
            let plan = engine.check(&schedule, &ctx).await?;
            print_plan(&plan);
            if plan.is_rejected() {
                bail!("Schedule would be rejected");
            }
        }
        Commands::Run {
            selection,
            operator,
            latency_ms,
        } => {
            let engine = build_engine(&settings, &selection, Duration::from_millis(latency_ms))?;
            run(&engine, &selection, &operator).await?;
        }
    }
    Ok(())
}
