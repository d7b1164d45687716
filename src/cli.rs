//! Binary entry points: `serve` (the axum API surface, §6) and the
//! run/inspect commands (§10), one binary with several `clap::Parser` +
//! `Subcommand` modes.

use crate::api::AppState;
use crate::config::RunSettings;
use crate::contract::CategoryContract;
use crate::engine::{Run, RunHandles};
use crate::events::{EventSink, FanoutSink, NdjsonSink};
use crate::evidence_index::EvidenceIndex;
use crate::fetch::{FetchScheduler, ReqwestFetcher};
use crate::frontier::UrlFrontier;
use crate::identity::ProductTarget;
use crate::learning::LearningStores;
use crate::queue::AutomationQueue;
use crate::round::RunSummary;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(about = "Product-specification convergence engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the read-only query API plus action hooks (§6) over HTTP.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a single product to convergence and print the final field table.
    Run {
        /// Path to a category contract, JSON or TOML (by extension).
        #[arg(long)]
        contract: PathBuf,
        #[arg(long)]
        category: String,
        #[arg(long)]
        brand: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        variant: Option<String>,
        #[arg(long)]
        sku: Option<String>,
        #[arg(long = "alias")]
        aliases: Vec<String>,
        /// Known-good product page URL to fetch on round 0, ahead of any
        /// search query (§276 Product job `seed_urls?`). Repeatable.
        #[arg(long = "seed-url")]
        seed_urls: Vec<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory run artifacts are written under (one subdirectory per run_id, §6).
        #[arg(long, default_value = "./run-artifacts")]
        out_dir: PathBuf,
    },
    /// Print the persisted field table for a completed run (§10).
    InspectRun {
        run_id: String,
        #[arg(long, default_value = "./run-artifacts")]
        out_dir: PathBuf,
    },
}

fn load_settings(path: &Option<PathBuf>) -> Result<RunSettings> {
    match path {
        Some(p) => RunSettings::from_toml_file(p).with_context(|| format!("loading config from {}", p.display())),
        None => RunSettings::from_env().context("loading config from environment"),
    }
}

fn load_contract(path: &PathBuf) -> Result<CategoryContract> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading contract file {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents).context("parsing TOML category contract"),
        _ => serde_json::from_str(&contents).context("parsing JSON category contract"),
    }
}

fn open_stores(settings: &RunSettings) -> Result<(Arc<UrlFrontier>, AutomationQueue, LearningStores)> {
    std::fs::create_dir_all(&settings.database_dir)?;
    let dir = PathBuf::from(&settings.database_dir);
    let frontier = Arc::new(UrlFrontier::open(dir.join("frontier.db"))?);
    let queue = AutomationQueue::open(dir.join("queue.db"))?;
    let learning = LearningStores::open(dir.join("learning.db"))?;
    Ok((frontier, queue, learning))
}

pub async fn execute() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Run { contract, category, brand, model, variant, sku, aliases, seed_urls, config, out_dir } => {
            run_one(contract, category, brand, model, variant, sku, aliases, seed_urls, config, out_dir).await
        }
        Command::InspectRun { run_id, out_dir } => inspect_run(run_id, out_dir),
    }
}

async fn serve(config: Option<PathBuf>) -> Result<()> {
    let settings = load_settings(&config)?;
    let (frontier, queue, learning) = open_stores(&settings)?;
    let api_port = settings.api_port;
    let metrics_handle = crate::telemetry::init_metrics().ok();
    let state = AppState::new(settings, frontier, queue, learning);
    let router = crate::api::router(state).merge(crate::api::metrics_router(metrics_handle));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", api_port)).await?;
    tracing::info!(port = api_port, "serving convergence engine API");
    axum::serve(listener, router).await.context("axum server exited")
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    contract_path: PathBuf,
    category: String,
    brand: String,
    model: String,
    variant: Option<String>,
    sku: Option<String>,
    aliases: Vec<String>,
    seed_urls: Vec<String>,
    config: Option<PathBuf>,
    out_dir: PathBuf,
) -> Result<()> {
    let settings = load_settings(&config)?;
    let contract = load_contract(&contract_path)?;
    let target = ProductTarget::new(category.clone(), brand, model, variant, sku, aliases);
    let run_id = format!("{}-{}", settings.run_id_prefix, target.identity_fingerprint);

    let (frontier, queue, learning) = open_stores(&settings)?;
    let index_path = PathBuf::from(&settings.database_dir).join(format!("evidence_{category}.db"));
    let index = EvidenceIndex::open(index_path)?;

    let run_dir = out_dir.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    sinks.push(Arc::new(NdjsonSink::create(run_dir.join("events.ndjson"))?));
    let events = Arc::new(FanoutSink::new(sinks));

    let scheduler = FetchScheduler::new(
        frontier.clone(),
        vec![Arc::new(ReqwestFetcher::new(std::time::Duration::from_secs(settings.fetch_timeout_secs))?)],
        settings.lane_configs(),
    );

    let mut handles = RunHandles::new(run_id.clone(), contract, target, index, frontier, queue, learning, scheduler, events)
        .with_seed_urls(seed_urls);
    handles.convergence_config = settings.convergence.clone();

    let run = Run::new(handles);
    let summary = run.run_to_convergence().await.map_err(|e| anyhow::anyhow!("run failed: {e}"))?;

    write_artifacts(&run_dir, &run_id, &summary)?;
    print_field_table(&summary);
    Ok(())
}

fn write_artifacts(run_dir: &PathBuf, run_id: &str, summary: &RunSummary) -> Result<()> {
    std::fs::write(
        run_dir.join("run.json"),
        serde_json::to_string_pretty(&serde_json::json!({
            "run_id": run_id,
            "final_stop_reason": summary.final_stop_reason,
            "rounds": summary.rounds,
        }))?,
    )?;
    std::fs::write(run_dir.join("summary.json"), serde_json::to_string_pretty(summary)?)?;
    std::fs::write(run_dir.join("prime_sources.json"), serde_json::to_string_pretty(&summary.prime_sources)?)?;
    Ok(())
}

fn print_field_table(summary: &RunSummary) {
    println!("{:<28} {:<10} {:<10} {}", "field", "value", "confidence", "unknown_reason");
    let mut keys: Vec<_> = summary.field_values.keys().chain(summary.unknown_reasons.keys()).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        let value = summary.field_values.get(key).map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        let unknown = summary.unknown_reasons.get(key).map(|r| format!("{r:?}")).unwrap_or_default();
        println!("{key:<28} {value:<10} {:<10} {unknown}", "");
    }
    println!("stop_reason: {:?}", summary.final_stop_reason);
}

fn inspect_run(run_id: String, out_dir: PathBuf) -> Result<()> {
    let summary_path = out_dir.join(&run_id).join("summary.json");
    let contents = std::fs::read_to_string(&summary_path).with_context(|| format!("reading {}", summary_path.display()))?;
    let summary: RunSummary = serde_json::from_str(&contents)?;
    print_field_table(&summary);
    Ok(())
}
