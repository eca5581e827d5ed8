//! Demflow CLI
//!
//! Reconstructs DEMs from ASTER archives, merges them and aligns them to
//! reference elevation sources.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use demflow::config::{DemflowConfig, JobConfig};
use demflow::coregistration::CoregistrationMethod;
use demflow::crs::ProjectionChoice;
use demflow::events::LoggingEventSink;
use demflow::merge::MergeMode;
use demflow::observability::{init_tracing, LogFormat};
use demflow::pipeline::{Job, JobMode, JobSummary, PipelineOrchestrator};
use demflow::stages::StereoAlgorithm;
use demflow::tools::{ProcessToolRunner, API_KEY_VAR};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "demflow")]
#[command(about = "Stereo DEM reconstruction and coregistration", long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Override the number of inputs processed at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ReconstructionArgs {
    /// Output pixel size in metres
    #[arg(long)]
    resolution: Option<f64>,

    /// Output projection: auto, geographic or EPSG:<code>
    #[arg(long)]
    projection: Option<ProjectionChoice>,

    /// Correlation algorithm: asp_bm, asp_sgm or asp_mgm
    #[arg(long)]
    algorithm: Option<StereoAlgorithm>,

    /// Subpixel refinement level (1-3)
    #[arg(long)]
    subpixel_mode: Option<u8>,

    /// Which rasters a multi-input job delivers
    #[arg(long, value_enum)]
    merge_mode: Option<MergeArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MergeArg {
    IndividualOnly,
    IndividualAndMerged,
    MergedOnly,
}

impl From<MergeArg> for MergeMode {
    fn from(arg: MergeArg) -> Self {
        match arg {
            MergeArg::IndividualOnly => Self::IndividualOnly,
            MergeArg::IndividualAndMerged => Self::IndividualAndMerged,
            MergeArg::MergedOnly => Self::MergedOnly,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct DEMs from archives
    Reconstruct {
        /// Input archives or extracted directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Directory receiving the deliverables
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        reconstruction: ReconstructionArgs,
    },

    /// Align existing GeoTIFF DEMs to reference sources
    Coregister {
        /// Input DEMs
        #[arg(required = true)]
        dems: Vec<PathBuf>,

        /// Directory receiving the deliverables
        #[arg(short, long)]
        output: PathBuf,

        /// cop30, icesat2 or ensemble
        #[arg(long)]
        method: Option<CoregistrationMethod>,
    },

    /// Reconstruct, merge and coregister in one job
    Run {
        /// Input archives or extracted directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Directory receiving the deliverables
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        reconstruction: ReconstructionArgs,

        /// cop30, icesat2 or ensemble
        #[arg(long)]
        method: Option<CoregistrationMethod>,
    },

    /// Validate configuration
    ValidateConfig,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "demflow.json")]
        output: PathBuf,
    },

    /// Check that the toolchain can be launched
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Pretty };
    init_tracing(format).context("failed to initialize logging")?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(n) = cli.concurrency {
        config.job.max_concurrent_inputs = n;
    }

    match cli.command {
        Commands::Reconstruct {
            inputs,
            output,
            reconstruction,
        } => {
            reconstruction.apply(&mut config.job);
            run_job(config, JobMode::Reconstruction, inputs, output).await
        }
        Commands::Coregister { dems, output, method } => {
            if let Some(method) = method {
                config.job.coregistration.method = method;
            }
            run_job(config, JobMode::Coregistration, dems, output).await
        }
        Commands::Run {
            inputs,
            output,
            reconstruction,
            method,
        } => {
            reconstruction.apply(&mut config.job);
            if let Some(method) = method {
                config.job.coregistration.method = method;
            }
            run_job(config, JobMode::EndToEnd, inputs, output).await
        }
        Commands::ValidateConfig => {
            config.validate()?;
            tracing::info!("Configuration is valid");
            Ok(())
        }
        Commands::GenerateConfig { output } => {
            DemflowConfig::default()
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Sample configuration written to: {}", output.display());
            Ok(())
        }
        Commands::Doctor => doctor(&config).await,
    }
}

impl ReconstructionArgs {
    fn apply(self, job: &mut JobConfig) {
        if let Some(resolution) = self.resolution {
            job.resolution = resolution;
        }
        if let Some(projection) = self.projection {
            job.projection = projection;
        }
        if let Some(algorithm) = self.algorithm {
            job.stereo_algorithm = algorithm;
        }
        if let Some(mode) = self.subpixel_mode {
            job.subpixel_mode = mode;
        }
        if let Some(mode) = self.merge_mode {
            job.merge_mode = mode.into();
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<DemflowConfig> {
    let mut config = match path {
        Some(path) => DemflowConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DemflowConfig::default(),
    };
    // The credential is only ever taken from the environment.
    if let Ok(key) = std::env::var(API_KEY_VAR) {
        config.tools.environment = config.tools.environment.clone().with_api_key(key);
    }
    Ok(config)
}

async fn run_job(config: DemflowConfig, mode: JobMode, inputs: Vec<PathBuf>, output: PathBuf) -> Result<()> {
    config.validate().context("invalid configuration")?;
    if mode.coregisters() && !config.tools.environment.has_api_key() {
        tracing::warn!("{API_KEY_VAR} is not set; reference data downloads may fail");
    }

    let runner = Arc::new(ProcessToolRunner::new(config.tools.environment.clone()));
    let orchestrator = PipelineOrchestrator::new(runner, config.tools)
        .with_event_sink(Arc::new(LoggingEventSink::default()));
    let job = Job::new(mode, inputs, config.job, &output).context("failed to create job")?;

    let summary = orchestrator.run(job).await.context("job failed")?;
    write_summary(&summary, &output)?;
    print_summary(&summary);

    if !summary.succeeded() {
        bail!("no raster was delivered");
    }
    Ok(())
}

fn write_summary(summary: &JobSummary, output: &Path) -> Result<()> {
    let path = output.join("job_summary.json");
    std::fs::write(&path, summary.to_json_pretty()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "Job summary written");
    Ok(())
}

fn print_summary(summary: &JobSummary) {
    println!("\n=== Job {} ({}) ===", summary.job_id, summary.mode);
    for input in &summary.inputs {
        match (&input.error_code, &input.error_message) {
            (Some(code), Some(message)) => {
                println!("{} {}: FAILED [{code}] {message}", input.label(), input.input.display());
            }
            _ => println!("{} {}: ok", input.label(), input.input.display()),
        }
    }
    println!("\n=== Deliverables ===");
    for artifact in &summary.artifacts {
        let stats = artifact.statistics.first().copied().unwrap_or_default();
        println!(
            "{}\n  {}x{} px, {}, elevation {:.1}..{:.1} m (mean {:.1}, std {:.1}), {:.1}% valid",
            artifact.path.display(),
            artifact.width,
            artifact.height,
            artifact.crs.as_deref().unwrap_or("unknown CRS"),
            stats.min,
            stats.max,
            stats.mean,
            stats.std,
            stats.coverage() * 100.0,
        );
        println!("  sha256 {}", artifact.sha256);
    }
    for warning in &summary.warnings {
        println!("warning: {warning}");
    }
}

async fn doctor(config: &DemflowConfig) -> Result<()> {
    let runner = ProcessToolRunner::new(config.tools.environment.clone());
    let probes = config.tools.probe(&runner).await;
    let mut missing = 0;
    for probe in &probes {
        if probe.available {
            println!(
                "[ok]      {:<22} {} {}",
                probe.role,
                probe.program,
                probe.version.as_deref().unwrap_or("")
            );
        } else {
            missing += 1;
            println!(
                "[missing] {:<22} {} {}",
                probe.role,
                probe.program,
                probe.error.as_deref().unwrap_or("")
            );
        }
    }
    println!(
        "{API_KEY_VAR}: {}",
        if config.tools.environment.has_api_key() { "set" } else { "not set" }
    );
    if missing > 0 {
        bail!("{missing} tool(s) unavailable");
    }
    Ok(())
}
