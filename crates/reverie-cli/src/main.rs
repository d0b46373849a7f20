//! Reverie CLI
//!
//! Command-line interface for importing history and running insight analysis.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use directories::ProjectDirs;
use futures::StreamExt;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use reverie_core::{
    AnalysisEvent, AnalysisOutcome, AnalysisParameters, AnalysisResult, EngineConfig,
    HistoryRecord, HttpInferenceClient, InMemoryMetrics, InsightEngine, ResponseFormat,
    SqliteHistoryStore, StreamingOutcome,
};

/// Reverie - Insight Discovery CLI
#[derive(Parser)]
#[command(name = "reverie")]
#[command(author = "Reverie Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Find non-obvious connections and patterns in your history")]
#[command(long_about = "Reverie analyses your accumulated history with a language model and reports \
connections between entries, recurring patterns and recommendations.\n\n\
Inference endpoint: REVERIE_API_BASE (default https://api.openai.com/v1) and REVERIE_API_KEY.")]
struct Cli {
    /// Engine configuration file (JSON). Defaults to the platform config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// History database path. Defaults to the platform data dir.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import history records from a JSON array or JSONL file
    Import {
        /// Records file (.json or .jsonl)
        file: PathBuf,
        /// User the records belong to
        #[arg(long)]
        user: String,
    },

    /// Analyse a user's history
    Analyze {
        /// User to analyse
        #[arg(long)]
        user: String,
        /// Print partial results as they arrive
        #[arg(long)]
        stream: bool,
        /// Bypass the finished-result cache
        #[arg(long)]
        force_refresh: bool,
        /// Response format: detailed or concise
        #[arg(long, default_value = "detailed")]
        format: ResponseFormat,
        /// Focus hint (e.g. "sleep")
        #[arg(long)]
        focus: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Print engine and metrics statistics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// Show recorded analysis runs
    Runs {
        /// Only runs for this user
        #[arg(long)]
        user: Option<String>,
        /// Maximum number of runs
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries results
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Import { file, user } => run_import(cli.db, &file, &user),
        Commands::Analyze {
            user,
            stream,
            force_refresh,
            format,
            focus,
            json,
            stats,
        } => {
            let params = AnalysisParameters {
                force_refresh,
                response_format: format,
                focus,
            };
            run_analyze(config, cli.db, &user, params, stream, json, stats).await
        }
        Commands::Runs { user, limit, json } => run_runs(cli.db, user.as_deref(), limit, json),
        Commands::Config => run_config(&config),
    }
}

/// Explicit file, else the default config file if present, else defaults.
/// Environment overrides apply last.
fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => EngineConfig::from_json_file(&path)?,
            None => EngineConfig::default(),
        },
    };
    let config = config.with_env_overrides();
    config.validate()?;
    tracing::debug!(model = %config.orchestrator.model, "Loaded engine configuration");
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "reverie", "core").map(|dirs| dirs.config_dir().join("config.json"))
}

/// Parse a records file: a JSON array, or one record per line for `.jsonl`
fn read_records(path: &Path) -> anyhow::Result<Vec<HistoryRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let is_jsonl = path.extension().is_some_and(|ext| ext == "jsonl");
    if is_jsonl {
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid record on line {}", i + 1))
            })
            .collect()
    } else {
        serde_json::from_str(&raw).context("Expected a JSON array of records")
    }
}

/// Run import command
fn run_import(db: Option<PathBuf>, file: &Path, user: &str) -> anyhow::Result<()> {
    let records = read_records(file)?;
    let store = SqliteHistoryStore::new(db)?;
    let inserted = store.append_records(user, &records)?;
    let total = store.count_records(user)?;

    println!(
        "{} {} of {} records for {} ({} total)",
        "Imported".green().bold(),
        inserted,
        records.len(),
        user.cyan(),
        total
    );
    if inserted < records.len() {
        println!(
            "{}",
            format!("{} already present and skipped", records.len() - inserted).dimmed()
        );
    }
    Ok(())
}

/// Run analyze command
async fn run_analyze(
    config: EngineConfig,
    db: Option<PathBuf>,
    user: &str,
    params: AnalysisParameters,
    stream: bool,
    json: bool,
    show_stats: bool,
) -> anyhow::Result<()> {
    let history = Arc::new(SqliteHistoryStore::new(db)?);
    let inference = Arc::new(HttpInferenceClient::from_env(config.orchestrator.model.clone())?);
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = InsightEngine::with_metrics(config, history, inference, metrics.clone())?;

    let outcome = if stream {
        analyze_streaming(&engine, user, &params, json).await
    } else {
        engine
            .request_analysis(user, &params)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|outcome| report_outcome(outcome, json))
    };

    if show_stats {
        println!();
        println!("{}", "=== Engine Statistics ===".cyan().bold());
        println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        println!("{}", "=== Metrics ===".cyan().bold());
        println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }

    engine.shutdown().await;
    outcome
}

async fn analyze_streaming(
    engine: &InsightEngine,
    user: &str,
    params: &AnalysisParameters,
    json: bool,
) -> anyhow::Result<()> {
    let mut events = match engine.request_analysis_streaming(user, params).await? {
        StreamingOutcome::Streaming(events) => events,
        StreamingOutcome::InsufficientData(data) => {
            return report_outcome(AnalysisOutcome::InsufficientData(data), json);
        }
        StreamingOutcome::CapacityExceeded(busy) => {
            return report_outcome(AnalysisOutcome::CapacityExceeded(busy), json);
        }
    };

    while let Some(event) = events.next().await {
        match event {
            AnalysisEvent::Partial(partial) => {
                if json {
                    println!("{}", serde_json::to_string(&partial)?);
                } else {
                    eprintln!(
                        "{} {} connections, {} patterns (part {} of {})",
                        "...".dimmed(),
                        partial.connections.len(),
                        partial.meta_patterns.len(),
                        partial.chunks_completed + 1,
                        partial.chunk_count
                    );
                }
            }
            AnalysisEvent::Final(result) => return report_outcome(AnalysisOutcome::Completed(result), json),
            AnalysisEvent::Failed(error) => {
                eprintln!("{} {}", "Error:".red().bold(), error.user_message());
                return Err(error.into());
            }
        }
    }
    Ok(())
}

fn report_outcome(outcome: AnalysisOutcome, json: bool) -> anyhow::Result<()> {
    match outcome {
        AnalysisOutcome::Completed(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
        }
        AnalysisOutcome::InsufficientData(data) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!("{}", "Not enough history yet".yellow().bold());
                println!("{}", data.message);
            }
        }
        AnalysisOutcome::CapacityExceeded(busy) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&busy)?);
            } else {
                println!("{}", "Analysis is busy".yellow().bold());
                println!("{} Retry in {}s.", busy.message, busy.retry_after_secs);
            }
        }
    }
    Ok(())
}

fn print_result(result: &AnalysisResult) {
    println!("{}", "=== Insights ===".cyan().bold());
    if result.is_degraded() {
        println!("{}", "Reduced results".yellow().bold());
    }
    println!("{}", result.summary);

    if !result.connections.is_empty() {
        println!();
        println!("{}", "Connections".white().bold());
        for connection in &result.connections {
            println!(
                "  {} {} {}",
                format!("[{}]", connection.category).magenta(),
                connection.description,
                format!(
                    "(surprise {:.2}, relevance {:.2}; {})",
                    connection.surprise,
                    connection.relevance,
                    connection.entry_ids.join(", ")
                )
                .dimmed()
            );
        }
    }

    if !result.meta_patterns.is_empty() {
        println!();
        println!("{}", "Patterns".white().bold());
        for pattern in &result.meta_patterns {
            println!(
                "  {} {}",
                pattern.description,
                format!(
                    "(confidence {:.2}; {} entries)",
                    pattern.confidence,
                    pattern.supporting_entry_ids.len()
                )
                .dimmed()
            );
        }
    }

    if !result.recommendations.is_empty() {
        println!();
        println!("{}", "Recommendations".white().bold());
        for recommendation in &result.recommendations {
            println!("  - {}", recommendation);
        }
    }

    let meta = &result.metadata;
    println!();
    println!(
        "{}",
        format!(
            "{} | {} | {}ms | retries {} | {}",
            meta.model,
            meta.cache_hit,
            meta.duration_ms,
            meta.retry_count,
            meta.completed_at.format("%Y-%m-%d %H:%M:%S")
        )
        .dimmed()
    );
}

/// Run runs command
fn run_runs(db: Option<PathBuf>, user: Option<&str>, limit: usize, json: bool) -> anyhow::Result<()> {
    let store = SqliteHistoryStore::new(db)?;
    let runs = store.recent_runs(user, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!("{}", "=== Analysis Runs ===".cyan().bold());
    if runs.is_empty() {
        println!("{}", "No runs recorded.".dimmed());
        return Ok(());
    }
    for run in runs {
        let m = &run.metadata;
        let status = if m.degraded {
            "degraded".yellow()
        } else {
            "ok".green()
        };
        println!(
            "  {} {:12} {:8} {:>7}ms retries {} {}",
            m.completed_at.format("%Y-%m-%d %H:%M"),
            run.user_id,
            status,
            m.duration_ms,
            m.retry_count,
            m.model.dimmed()
        );
    }
    Ok(())
}

/// Run config command
fn run_config(config: &EngineConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
