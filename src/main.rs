use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use tether_core::ids::SessionId;
use tether_engine::{CompressRequest, ContextWindowManager, QualityValidator, ResponseNormalizer, ValidationContext};
use tether_settings::{load_settings, load_settings_from_path, sessions_root, TetherSettings};
use tether_store::{SessionStore, StoreLimits};
use tether_telemetry::{init_telemetry, TelemetryConfig};

/// Operator tools for the tether sub-agent pipeline.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    /// Settings file to use instead of ~/.tether/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect and maintain persisted sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Normalize a captured provider response and score it.
    Normalize {
        #[arg(long)]
        role: String,
        /// File holding the raw response text.
        file: PathBuf,
    },
    /// Compress a task and its background into a context block.
    Compress {
        #[arg(long)]
        task: PathBuf,
        #[arg(long)]
        background: Option<PathBuf>,
        #[arg(long)]
        deliverables: Option<PathBuf>,
        /// Token budget; defaults to the configured budget.
        #[arg(long)]
        budget: Option<usize>,
        /// Comma-separated domain keywords.
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    List {
        /// List archived sessions instead of active ones.
        #[arg(long)]
        completed: bool,
    },
    Show {
        id: String,
    },
    /// Archive sessions idle longer than the threshold.
    Sweep {
        /// Defaults to the configured idle timeout.
        #[arg(long)]
        idle_secs: Option<u64>,
    },
    Complete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;

    let _telemetry = init_telemetry(TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));

    match cli.command {
        Command::Sessions { action } => run_sessions(&settings, action),
        Command::Normalize { role, file } => run_normalize(&settings, &role, &file),
        Command::Compress {
            task,
            background,
            deliverables,
            budget,
            keywords,
        } => run_compress(
            &settings,
            &task,
            background.as_deref(),
            deliverables.as_deref(),
            budget,
            &keywords,
        ),
    }
}

fn open_store(settings: &TetherSettings) -> Result<SessionStore> {
    let root = sessions_root(settings);
    SessionStore::open(&root, StoreLimits::from_settings(&settings.sessions, &settings.refinement))
        .with_context(|| format!("failed to open session store at {}", root.display()))
}

fn run_sessions(settings: &TetherSettings, action: SessionsAction) -> Result<()> {
    let store = open_store(settings)?;
    match action {
        SessionsAction::List { completed } => {
            let records = if completed {
                store.list_completed()?
            } else {
                store.list_active()
            };
            for r in &records {
                println!(
                    "{}  depth={} calls={} status={} last_activity={}",
                    r.id,
                    r.depth,
                    r.total_calls,
                    r.status.as_str(),
                    r.last_activity.to_rfc3339()
                );
            }
            tracing::info!(count = records.len(), completed, "listed sessions");
        }
        SessionsAction::Show { id } => {
            let record = store.get(&SessionId::from_raw(id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        SessionsAction::Sweep { idle_secs } => {
            let idle = Duration::from_secs(idle_secs.unwrap_or(settings.sessions.idle_timeout_secs));
            let removed = store.sweep(idle)?;
            for id in &removed {
                println!("{id}");
            }
            tracing::info!(count = removed.len(), "sweep finished");
        }
        SessionsAction::Complete { id } => {
            let record = store.complete(&SessionId::from_raw(id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

fn run_normalize(settings: &TetherSettings, role: &str, file: &Path) -> Result<()> {
    let raw = read(file)?;
    let normalized = ResponseNormalizer::new(settings.normalizer.clone()).normalize_offline(&raw, role);
    let assessment = QualityValidator::new(settings.quality.clone()).validate(
        &normalized.result,
        ValidationContext {
            role,
            stage: normalized.stage,
        },
    );
    let out = json!({
        "stage": normalized.stage,
        "result": normalized.result,
        "assessment": assessment,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn run_compress(
    settings: &TetherSettings,
    task: &Path,
    background: Option<&Path>,
    deliverables: Option<&Path>,
    budget: Option<usize>,
    keywords: &[String],
) -> Result<()> {
    let task = read(task)?;
    let background = background.map(read).transpose()?.unwrap_or_default();
    let deliverables = deliverables.map(read).transpose()?.unwrap_or_default();

    let manager = ContextWindowManager::new(settings.context.clone());
    let compressed = manager.compress(CompressRequest {
        task: &task,
        background: &background,
        deliverable_spec: &deliverables,
        budget_tokens: budget.unwrap_or(settings.context.default_budget_tokens),
        domain_keywords: keywords,
    });

    println!("{}", compressed.text);
    eprintln!(
        "tokens: {} of {} original, ratio {:.3}",
        compressed.estimated_tokens, compressed.original_tokens, compressed.compression_ratio
    );
    for warning in &compressed.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
