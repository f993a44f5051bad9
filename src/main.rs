//! CLI entry point for the municipality attractiveness scorer.
//!
//! Provides subcommands for downloading the boundary layer, counting transit
//! stops per municipality, scoring municipalities from the tabular sources,
//! and running the whole chain in one go.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use commune_scorer::{
    config::PipelineConfig,
    fetch::{BasicClient, download_if_missing},
    output,
    pipeline::{self, RunSummary},
    tables,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "commune_scorer")]
#[command(
    about = "Rank French municipalities by income, population and transit stop density",
    long_about = None
)]
struct Cli {
    /// TOML configuration file; built-in defaults apply when omitted
    #[arg(short, long, global = true, env = "COMMUNE_SCORER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the commune boundary layer if it is not already on disk
    FetchBoundaries {
        /// Source URL of the GeoJSON layer
        #[arg(long)]
        url: Option<String>,

        /// Where to store the layer
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Count deduplicated transit stops per municipality
    CountStops {
        #[command(flatten)]
        geo: GeoInputs,

        /// CSV file to write the counts to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge population, income and stop counts, then rank by score
    Score {
        #[command(flatten)]
        tables: TableInputs,

        /// Stop counts written by `count-stops`
        #[arg(long)]
        stop_counts: Option<PathBuf>,

        /// CSV file to write the ranking to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch, count and score in a single run
    Run {
        #[command(flatten)]
        geo: GeoInputs,

        #[command(flatten)]
        tables: TableInputs,

        #[command(flatten)]
        outputs: RunOutputs,

        /// Fail instead of downloading a missing boundary layer
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
}

#[derive(Args)]
struct GeoInputs {
    /// GeoJSON boundary layer
    #[arg(long)]
    boundaries: Option<PathBuf>,

    /// GTFS stops CSV (needs stop_lat and stop_lon)
    #[arg(long)]
    stops: Option<PathBuf>,
}

impl GeoInputs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(path) = self.boundaries {
            config.inputs.boundaries = path;
        }
        if let Some(path) = self.stops {
            config.inputs.stops = path;
        }
    }
}

#[derive(Args)]
struct TableInputs {
    /// Commune population CSV
    #[arg(long)]
    population: Option<PathBuf>,

    /// Department names CSV
    #[arg(long)]
    departments: Option<PathBuf>,

    /// Income CSV (CODGEO, Q221)
    #[arg(long)]
    income: Option<PathBuf>,
}

impl TableInputs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(path) = self.population {
            config.inputs.population = path;
        }
        if self.departments.is_some() {
            config.inputs.departments = self.departments;
        }
        if let Some(path) = self.income {
            config.inputs.income = path;
        }
    }
}

#[derive(Args)]
struct RunOutputs {
    /// Stop counts CSV
    #[arg(long)]
    stop_counts: Option<PathBuf>,

    /// Ranked CSV
    #[arg(long)]
    ranked: Option<PathBuf>,

    /// JSON run summary
    #[arg(long)]
    summary: Option<PathBuf>,

    /// GeoJSON layer with scores attached, for map rendering
    #[arg(long)]
    scored_layer: Option<PathBuf>,
}

impl RunOutputs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(path) = self.stop_counts {
            config.outputs.stop_counts = path;
        }
        if let Some(path) = self.ranked {
            config.outputs.ranked = path;
        }
        if self.summary.is_some() {
            config.outputs.summary = self.summary;
        }
        if self.scored_layer.is_some() {
            config.outputs.scored_layer = self.scored_layer;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/commune_scorer.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("commune_scorer.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::FetchBoundaries { url, output } => {
            if let Some(url) = url {
                config.boundaries.source_url = url;
            }
            if let Some(path) = output {
                config.inputs.boundaries = path;
            }
            fetch_boundaries(&config).await?;
        }
        Commands::CountStops { geo, output } => {
            geo.apply(&mut config);
            if let Some(path) = output {
                config.outputs.stop_counts = path;
            }

            let stage = pipeline::count_stops(&config).context("Stop counting failed")?;
            output::write_stop_counts(&config.outputs.stop_counts, &stage.counts)?;
        }
        Commands::Score {
            tables: inputs,
            stop_counts,
            output,
        } => {
            inputs.apply(&mut config);
            if let Some(path) = stop_counts {
                config.outputs.stop_counts = path;
            }
            if let Some(path) = output {
                config.outputs.ranked = path;
            }

            let counts = tables::load_stop_counts(&config.outputs.stop_counts).with_context(|| {
                format!(
                    "Failed to read stop counts {}",
                    config.outputs.stop_counts.display()
                )
            })?;
            let stage =
                pipeline::score_municipalities(&config, &counts).context("Scoring failed")?;
            output::write_ranked(&config.outputs.ranked, &stage.table.records)?;

            let summary = RunSummary::new(None, &stage, config.scoring.top);
            output::log_top(&summary.top, config.scoring.top);
        }
        Commands::Run {
            geo,
            tables: inputs,
            outputs,
            offline,
        } => {
            geo.apply(&mut config);
            inputs.apply(&mut config);
            outputs.apply(&mut config);

            if !offline {
                fetch_boundaries(&config).await?;
            }

            let (counting, scoring) = pipeline::run(&config).context("Pipeline failed")?;
            let summary = pipeline::export_run(&config, &counting, &scoring)?;

            output::log_top(&summary.top, config.scoring.top);
            info!(
                municipalities = summary.municipalities,
                unique_stops = summary.unique_stops,
                stops_matched = summary.stops_matched,
                ranked = %config.outputs.ranked.display(),
                "Run complete"
            );
        }
    }

    Ok(())
}

/// Downloads the boundary layer unless it is already present.
async fn fetch_boundaries(config: &PipelineConfig) -> Result<()> {
    let client = BasicClient::new()?;
    download_if_missing(
        &client,
        &config.boundaries.source_url,
        &config.inputs.boundaries,
    )
    .await?;
    Ok(())
}
