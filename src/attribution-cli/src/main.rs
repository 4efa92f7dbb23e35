//! Touchpoint attribution — builds customer journeys from an event table and
//! compares how rule-based, Markov-chain, and Shapley models credit channels.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::Context;
use attribution_core::{AttributionConfig, ModelKind};
use attribution_journey::{BuildReport, EventTable, JourneyBuilder, JourneyStats};
use attribution_models::{AttributionEngine, ComparisonTable, ModelAttribution};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

const TOP_PATHS: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "touchpoint-attribution")]
#[command(about = "Multi-touch marketing attribution across rule-based, Markov-chain, and Shapley models")]
#[command(version)]
struct Cli {
    /// Event table as JSON: {"columns": [...], "rows": [[...], ...]}
    #[arg(long, short)]
    input: PathBuf,

    /// TOML configuration file (environment variables prefixed ATTRIBUTION__ override it)
    #[arg(long, env = "ATTRIBUTION_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated models to run (overrides config)
    #[arg(long, value_delimiter = ',')]
    models: Option<Vec<ModelKind>>,

    /// Position-based weight of the first touch (overrides config)
    #[arg(long)]
    first_weight: Option<f64>,

    /// Position-based weight of the last touch (overrides config)
    #[arg(long)]
    last_weight: Option<f64>,

    /// Time-decay half-life in days (overrides config)
    #[arg(long)]
    half_life_days: Option<f64>,

    /// Largest Shapley coalition to enumerate; results become approximate
    #[arg(long)]
    max_combination_size: Option<usize>,

    /// Include per-journey credit for rule-based models
    #[arg(long, default_value_t = false)]
    per_journey: bool,

    /// Include descriptive journey statistics
    #[arg(long, default_value_t = false)]
    stats: bool,
}

#[derive(Serialize)]
struct Report {
    build: BuildReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<JourneyStats>,
    run_id: String,
    results: BTreeMap<ModelKind, ModelAttribution>,
    failures: BTreeMap<ModelKind, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comparison: Option<ComparisonTable>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attribution=info,touchpoint_attribution=info".into()),
        )
        .with_writer(io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AttributionConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Apply CLI overrides
    if let Some(models) = cli.models {
        config.models = models;
    }
    if let Some(weight) = cli.first_weight {
        config.position_based.first_weight = weight;
    }
    if let Some(weight) = cli.last_weight {
        config.position_based.last_weight = weight;
    }
    if let Some(days) = cli.half_life_days {
        config.time_decay.half_life_days = days;
    }
    if let Some(cap) = cli.max_combination_size {
        config.shapley.max_combination_size = Some(cap);
    }
    if cli.per_journey {
        config.per_journey = true;
    }

    info!(
        models = ?config.models,
        first_weight = config.position_based.first_weight,
        last_weight = config.position_based.last_weight,
        half_life_days = config.time_decay.half_life_days,
        max_combination_size = ?config.shapley.max_combination_size,
        "Configuration loaded"
    );

    let file = File::open(&cli.input)
        .with_context(|| format!("opening event table {}", cli.input.display()))?;
    let table: EventTable = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing event table {}", cli.input.display()))?;

    let engine = AttributionEngine::new(config.clone()).context("validating configuration")?;
    let output = JourneyBuilder::new(config.columns.clone())
        .build(&table)
        .context("building journeys")?;

    let stats = cli
        .stats
        .then(|| JourneyStats::compute(&output.journeys, TOP_PATHS));
    let run = engine.run(&output.journeys);

    let comparison = match run.comparison() {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(error = %e, "No comparison available");
            None
        }
    };

    let report = Report {
        build: output.report,
        stats,
        run_id: run.run_id.to_string(),
        results: run.results,
        failures: run.failures,
        comparison,
    };

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer_pretty(&mut handle, &report).context("writing report")?;
    writeln!(handle)?;

    Ok(())
}
