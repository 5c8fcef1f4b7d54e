use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use superres_core::backend::{load_upscaler, InferenceBackend};
use superres_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use superres_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use superres_core::pipeline::UpscalePipeline;
use superres_core::server::{app_router, AppState};
use superres_core::tile::{TileGeometry, CHANNELS};

#[derive(Parser, Debug)]
#[command(
    name = "superres",
    about = "Streaming tile super-resolution server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale a raw RGB file through the same pipeline the server uses.
    Upscale(UpscaleArgs),
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(help = "Raw RGB input (width*height*3 bytes, row-major)")]
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[arg(long, help = "cpu, cuda, tensorrt or nearest (overrides config)")]
    backend: Option<InferenceBackend>,
    #[arg(long, help = "ONNX model path (overrides config)")]
    model: Option<PathBuf>,
    #[arg(long, help = "Model scale factor (overrides config)")]
    scale: Option<usize>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Some(Commands::Upscale(args)) => {
            let config = load_config(&resolved_data_dir);
            upscale_file(args, config).await
        }
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::compose_log_filter(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filter, "console"));

    let fallback = match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filter, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
            None
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
            Some((attempted_log_dir, reason))
        }
    };

    if let Some((attempted_log_dir, reason)) = fallback {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.resolve_paths(data_dir)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let engine = load_upscaler(&config.model).context("failed to load upscaling model")?;
    let app = app_router(AppState::new(engine, config.pipeline.clone()));

    let addr = format!("{host}:{port}");
    info!(
        %addr,
        backend = %config.model.backend,
        scale = config.model.scale,
        max_tile_pixels = config.pipeline.max_tile_pixels,
        "Starting superres server"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn upscale_file(args: UpscaleArgs, mut config: AppConfig) -> Result<()> {
    if let Some(backend) = args.backend {
        config.model.backend = backend;
    }
    if let Some(model) = args.model {
        config.model.path = model;
    }
    if let Some(scale) = args.scale {
        config.model.scale = scale;
    }
    if args.width == 0 || args.height == 0 {
        bail!("--width and --height must be positive");
    }

    let expected_len = args
        .width
        .checked_mul(args.height)
        .and_then(|pixels| pixels.checked_mul(CHANNELS))
        .map(|len| len as u64)
        .with_context(|| format!("{}x{} image is too large", args.width, args.height))?;
    let input = tokio::fs::File::open(&args.input)
        .await
        .with_context(|| format!("failed to open input: {}", args.input.display()))?;
    let input_len = input.metadata().await?.len();
    if input_len != expected_len {
        bail!(
            "{} holds {input_len} bytes, a {}x{} RGB image needs {expected_len}",
            args.input.display(),
            args.width,
            args.height
        );
    }

    let engine = load_upscaler(&config.model).context("failed to load upscaling model")?;
    let geometry = TileGeometry::strip(args.width, args.height, config.pipeline.max_tile_pixels);
    let pipeline = UpscalePipeline::new(engine, geometry, config.pipeline.options(Some(expected_len)))?;
    let output_geometry = TileGeometry::new(args.width, args.height).scaled(config.model.scale);

    let started = Instant::now();
    let mut tiles = Box::pin(pipeline.spawn(ReaderStream::new(input)).into_stream());
    let mut output = tokio::fs::File::create(&args.output)
        .await
        .with_context(|| format!("failed to create output: {}", args.output.display()))?;

    let mut written = 0u64;
    while let Some(tile) = tiles.next().await {
        let tile = tile.context("upscale pipeline failed")?;
        output.write_all(&tile).await?;
        written += tile.len() as u64;
    }
    output.flush().await?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        size = %output_geometry,
        bytes = written,
        elapsed_ms = format!("{:.0}", started.elapsed().as_secs_f64() * 1000.0),
        "Upscale finished"
    );
    Ok(())
}
