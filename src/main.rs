use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uvc_capture::config::CaptureConfig;
use uvc_capture::sink::FramePipeline;
use uvc_capture::video::{CapturerState, VideoCapturer};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// uvc-capture command line arguments
#[derive(Parser, Debug)]
#[command(name = "uvc-capture")]
#[command(version, about = "Capture H.264 and raw video from UVC cameras", long_about = None)]
struct CliArgs {
    /// Video device
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<PathBuf>,

    /// Requested width
    #[arg(short = 'w', long, value_name = "PIXELS")]
    width: Option<u32>,

    /// Requested height (defaults to the device's current height)
    #[arg(short = 'H', long, value_name = "PIXELS")]
    height: Option<u32>,

    /// Requested pixel format as FourCC (e.g. H264, MJPG, YUYV)
    #[arg(short = 'f', long, value_name = "FOURCC")]
    format: Option<String>,

    /// Append every delivered frame to this file
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Keep the latest delivered frame in this file
    #[arg(short = 's', long, value_name = "FILE")]
    snapshot: Option<PathBuf>,

    /// Bitstream dump level (1 = NAL types, 2 = with byte preview)
    #[arg(short = 'x', long, value_name = "LEVEL")]
    dump: Option<u8>,

    /// Deliver one frame out of every N
    #[arg(short = 'k', long, value_name = "N")]
    skip: Option<u32>,

    /// Stop after this many frames
    #[arg(short = 'n', long, value_name = "FRAMES")]
    count: Option<u64>,

    /// Number of capture buffers
    #[arg(long, value_name = "N")]
    buffers: Option<u32>,

    /// Skip hardware encoder negotiation
    #[arg(long)]
    no_encoder: bool,

    /// Encoder I-frame period in milliseconds
    #[arg(long, value_name = "MS")]
    iframe_period: Option<u16>,

    /// JSON configuration file (command line values take precedence)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-D for debug, -DD for trace)
    #[arg(short = 'D', long = "debug", action = clap::ArgAction::Count)]
    debug: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.debug);

    tracing::info!("Starting uvc-capture v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    tracing::debug!("Configuration: {:?}", config);

    let pipeline = FramePipeline::from_config(&config.sink)?;
    let capturer = VideoCapturer::new(config);
    let mut state_rx = capturer.state_watch();
    capturer.start(pipeline).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping after the current frame");
        }
        _ = state_rx.wait_for(|s| matches!(s, CapturerState::Stopped | CapturerState::Error)) => {}
    }

    match capturer.stop().await? {
        Some(stats) => tracing::info!(
            "Captured {} frames ({} delivered, {} lost, last sequence {:?})",
            stats.frames,
            stats.delivered,
            stats.dropped,
            stats.last_sequence
        ),
        None => tracing::info!("Capture was not running"),
    }
    Ok(())
}

/// Merge the optional configuration file with command line overrides
fn build_config(args: &CliArgs) -> anyhow::Result<CaptureConfig> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::load(path)?,
        None => CaptureConfig::default(),
    };

    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if args.width.is_some() {
        config.width = args.width;
    }
    if args.height.is_some() {
        config.height = args.height;
    }
    if args.format.is_some() {
        config.pixel_format = args.format.clone();
    }
    if args.output.is_some() {
        config.sink.output = args.output.clone();
    }
    if args.snapshot.is_some() {
        config.sink.snapshot = args.snapshot.clone();
    }
    if let Some(level) = args.dump {
        config.sink.dump_level = level;
    }
    if let Some(skip) = args.skip {
        config.sink.skip_interval = skip;
    }
    if args.count.is_some() {
        config.max_frames = args.count;
    }
    if let Some(buffers) = args.buffers {
        config.buffer_count = buffers;
    }
    if args.no_encoder {
        config.encoder.enabled = false;
    }
    if args.iframe_period.is_some() {
        config.encoder.iframe_period = args.iframe_period;
    }

    config.validate()?;
    Ok(config)
}

/// Initialize logging with the specified level
fn init_logging(level: LogLevel, debug_count: u8) {
    // Debug count overrides log level
    let effective_level = match debug_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "uvc_capture=error",
        LogLevel::Warn => "uvc_capture=warn",
        LogLevel::Info => "uvc_capture=info",
        LogLevel::Verbose => "uvc_capture=debug,uvc_capture::video::capture=info",
        LogLevel::Debug => "uvc_capture=debug",
        LogLevel::Trace => "uvc_capture=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
