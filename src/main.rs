use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pm_forecast::data_loader::{load_hotspots, load_sources};
use pm_forecast::{
    AssemblerConfig, Config, DatasetAssembler, FireParameters, LagParameters, Overrides,
    TemporalAligner, TrainingOrchestrator, TrainingReport,
};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pm_forecast", about = "Trains the PM2.5 forecast model for one city")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full search and save the model.
    Train {
        /// Fixed fire parameters as `wind_speed,shift,roll`; skips fire tuning.
        #[arg(long)]
        fire: Option<String>,
        /// Fixed lag parameters as `max_lag,step`; skips lag tuning and lag pruning.
        #[arg(long)]
        lag: Option<String>,
    },
    /// Refit the saved model on fresh data without searching.
    Update,
}

fn parse_numbers(text: &str, expected: usize, what: &str) -> Result<Vec<f64>> {
    let values = text
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("--{what} expects comma separated numbers, got `{text}`"))?;
    if values.len() != expected {
        bail!("--{what} expects {expected} values, got {}", values.len());
    }
    Ok(values)
}

fn parse_fire(text: &str) -> Result<FireParameters> {
    let v = parse_numbers(text, 3, "fire")?;
    Ok(FireParameters::new(v[0], v[1] as i64, v[2] as usize)?)
}

fn parse_lag(text: &str) -> Result<LagParameters> {
    let v = parse_numbers(text, 2, "lag")?;
    Ok(LagParameters::new(v[0] as usize, v[1] as usize, true)?)
}

fn build_assembler(config: &Config) -> Result<DatasetAssembler> {
    let sources = load_sources(config).context("Failed to load sources")?;
    let hotspots = match &config.data.hotspot_pattern {
        Some(pattern) => load_hotspots(pattern)?,
        None => Vec::new(),
    };
    let aligner = TemporalAligner::new(&config.site.timezone)?;
    let assembler = DatasetAssembler::new(
        &aligner,
        &sources,
        &hotspots,
        AssemblerConfig::from_config(config),
    )
    .context("Failed to assemble the base dataset")?;
    Ok(assembler)
}

fn report(report: &TrainingReport) {
    info!(
        stages = ?report.stages_run,
        scores = ?report.metadata.rf_score,
        n_features = report.metadata.x_cols.len(),
        model = %report.model_path.display(),
        meta = %report.meta_path.display(),
        "done"
    );
    for item in report.collapsed_importance.iter().take(10) {
        info!(column = %item.column, importance = item.importance, std = item.std, "importance");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    debug!(?config, "Config loaded successfully");
    info!(city = %config.site.city, pollutant = %config.feature_params.pollutant, "starting");

    let assembler = build_assembler(&config)?;
    let mut orchestrator = TrainingOrchestrator::new(config, assembler);
    let outcome = match cli.command {
        Command::Train { fire, lag } => {
            let overrides = Overrides {
                fire: fire.as_deref().map(parse_fire).transpose()?,
                lag: lag.as_deref().map(parse_lag).transpose()?,
                ..Overrides::default()
            };
            orchestrator.run(overrides).context("Training failed")?
        }
        Command::Update => orchestrator.update().context("Update failed")?,
    };
    report(&outcome);
    Ok(())
}
