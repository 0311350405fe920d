use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use diagnostics::*;
use relabel::{ConfigOverrides, RelabelError, create_example_config, load_config};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "relabel")]
#[command(args_conflicts_with_subcommands = true)]
/// Replace a window of a measurement with a constant-valued measurement
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Relabel one window (default action)
    Run(RunArgs),
    /// Create an example configuration file
    Init {
        /// Where to write the configuration
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,
    },
    /// Check that the store is reachable and the token is accepted
    Test {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Bucket holding both measurements
    #[arg(long)]
    bucket: Option<String>,

    /// Measurement to read timestamps from
    #[arg(long)]
    source_measurement: Option<String>,

    /// Field of the source measurement to read
    #[arg(long)]
    field: Option<String>,

    /// New measurement name
    #[arg(long)]
    measurement: Option<String>,

    /// Value written at every timestamp
    #[arg(long, allow_negative_numbers = true)]
    value: Option<f64>,

    /// Window start, RFC 3339 or "YYYY-MM-DD HH:MM:SS" local time
    #[arg(long)]
    start: Option<String>,

    /// Window end, RFC 3339 or "YYYY-MM-DD HH:MM:SS" local time
    #[arg(long)]
    end: Option<String>,

    /// Points per write request
    #[arg(long)]
    batch_size: Option<usize>,

    /// Create the bucket if it does not exist
    #[arg(long)]
    create_bucket: bool,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bucket: self.bucket.clone(),
            source_measurement: self.source_measurement.clone(),
            field: self.field.clone(),
            measurement: self.measurement.clone(),
            value: self.value,
            start: self.start.clone(),
            end: self.end.clone(),
            batch_size: self.batch_size,
            create_bucket: self.create_bucket,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_diagnostics();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Init { path }) => init_config(&path),
        Some(Commands::Test { config }) => test_connection(&config).await,
        Some(Commands::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}

fn init_config(path: &Path) -> Result<()> {
    create_example_config(path)
        .with_context(|| format!("Failed to create configuration file: {}", path.display()))?;

    let config_path = path.display().to_string();
    info!(
        "Created example configuration file: {config_path}",
        config_path: config_path
    );
    info!("Edit the influxdb url, org and token, the bucket, measurements and window before running.");
    Ok(())
}

async fn test_connection(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)
        .with_context(|| format!("Failed to load configuration from: {}", config_path.display()))?;
    let client = relabel::connect(&config)?;

    println!("Checking {} ...", config.influxdb.url);
    let health = client.health().await.context("Store is not reachable")?;
    println!(
        "Store status: {} (version {})",
        health.status,
        health.version.as_deref().unwrap_or("unknown")
    );

    let org = client
        .test_authentication()
        .await
        .context("Authentication test failed")?;
    println!("Token accepted for organization {} ({})", org.name, org.id);
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config_path = args.config.display().to_string();
    debug!(
        "Loading configuration from: {config_path}",
        config_path: config_path.as_str()
    );
    let mut config = load_config(&args.config)
        .with_context(|| format!("Failed to load configuration from: {config_path}"))?;
    config.apply_overrides(args.overrides());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the current stage");
            on_interrupt.cancel();
        }
    });

    match relabel::relabel_from_config(&config, cancel).await {
        Ok(report) => {
            let read = report.samples_read;
            let clipped = report.samples_clipped;
            let written = report.points_written;
            info!(
                "Relabeling completed: {read} samples read, {clipped} clipped, {written} points written",
                read: read,
                clipped: clipped,
                written: written
            );
            Ok(())
        }
        Err(e) => {
            let summary = match e.downcast_ref::<RelabelError>() {
                Some(relabel_error) => format!(
                    "Relabeling failed in stage {} ({} error)",
                    relabel_error.stage(),
                    relabel_error.kind()
                ),
                None => "Relabeling failed".to_string(),
            };
            Err(e.context(summary))
        }
    }
}
