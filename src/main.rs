use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use segviz::{
    CancellationToken, CommandPredictor, Config, PatientInfo, Pipeline, ResultCache, VolumeAnalyzer,
    VolumeLoader,
};

/// Organ metrics, surface meshes and viewer delivery for segmented volumes
#[derive(Debug, Parser)]
#[command(name = "segviz", version)]
struct Cli {
    /// Configuration file (TOML); defaults are used when it does not exist
    #[arg(short, long, global = true, default_value = "segviz.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Segment an image (or reuse cached results), analyze it and build meshes
    Run(RunArgs),
    /// Compute metrics for an existing label volume
    Metrics {
        /// NIfTI label volume
        label_volume: PathBuf,
    },
    /// Remove every entry from the result cache
    ClearCache,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Input image
    image: PathBuf,

    /// Ignore and do not update the result cache
    #[arg(long)]
    no_cache: bool,

    /// Override the output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Send the results to the viewer after processing
    #[arg(long)]
    send: bool,

    /// Viewer host
    #[arg(long)]
    host: Option<String>,

    /// Viewer port
    #[arg(long)]
    port: Option<u16>,

    /// Patient metadata forwarded to the viewer, e.g. `--patient name="Jane Doe"`
    #[arg(long = "patient", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    patient: Vec<(String, String)>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Run(args) => run(&mut config, args).await,
        Command::Metrics { label_volume } => metrics(&config, label_volume),
        Command::ClearCache => clear_cache(&config),
    }
}

async fn run(config: &mut Config, args: RunArgs) -> ExitCode {
    if args.no_cache {
        config.cache.enabled = false;
    }
    if let Some(dir) = args.output_dir {
        config.paths.output_dir = dir;
    }
    if let Some(host) = args.host {
        config.delivery.host = host;
    }
    if let Some(port) = args.port {
        config.delivery.port = port;
    }
    let patient: Option<PatientInfo> = args.send.then(|| {
        args.patient
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect()
    });

    let predictor = CommandPredictor::new(
        config.predictor.program.clone(),
        config.predictor.args.clone(),
        config.predictor.env.clone(),
    );
    let mut pipeline = match Pipeline::new(config.clone(), predictor) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(error = %err, "cannot start pipeline");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let image = args.image;
    let mut worker = tokio::task::spawn_blocking(move || {
        pipeline.run(&image, patient.as_ref(), &worker_cancel)
    });

    let result = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, stopping after the current stage");
            cancel.cancel();
            worker.await
        }
    };

    match result {
        Ok(Ok(outcome)) => {
            if let Some(metrics) = &outcome.metrics {
                match serde_json::to_string_pretty(metrics) {
                    Ok(json) => println!("{json}"),
                    Err(err) => warn!(error = %err, "cannot print metrics"),
                }
            }
            for (label, path) in &outcome.mesh_assets {
                info!(label, path = %path.display(), "mesh ready");
            }
            if outcome.delivered == Some(false) {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Ok(Err(err)) => {
            error!(error = %err, "processing failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "pipeline worker panicked");
            ExitCode::FAILURE
        }
    }
}

fn metrics(config: &Config, label_volume: PathBuf) -> ExitCode {
    let volume = match VolumeLoader::load_from_nifti(&label_volume) {
        Ok(volume) => volume,
        Err(err) => {
            error!(error = %err, "cannot load label volume");
            return ExitCode::FAILURE;
        }
    };
    let metrics = VolumeAnalyzer::new(config.labels.liver, config.labels.tumor).analyze(&volume);
    match serde_json::to_string_pretty(&metrics) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "cannot encode metrics");
            ExitCode::FAILURE
        }
    }
}

fn clear_cache(config: &Config) -> ExitCode {
    let result = ResultCache::open(&config.paths.cache_dir).and_then(|mut cache| {
        let removed = cache.len();
        cache.clear().map(|()| removed)
    });
    match result {
        Ok(removed) => {
            info!(removed, "cache cleared");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "cannot clear cache");
            ExitCode::FAILURE
        }
    }
}
