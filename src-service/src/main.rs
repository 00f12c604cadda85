//! framebus video source daemon
//!
//! Captures one video stream and shares it with any number of clients on
//! the session bus. Usually started on demand through D-Bus activation.

mod capture;
mod config;
mod crash;
mod fault;
mod producer;

use clap::Parser;
use framebus_common::directory::{service_name, BusDirectory};
use framebus_common::logging;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use capture::{CaptureError, FfmpegSource, FrameSource, Pattern, TestPattern};
use config::{ServiceConfig, SourceKind};
use crash::CrashHandle;
use producer::{FaultPoints, Producer, ProducerSettings};

#[derive(Parser, Debug)]
#[command(name = "framebus-service")]
#[command(version, about = "Share a video stream with framebus clients")]
struct Args {
    /// Config file (default: ~/.config/framebus/service.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Caps of the produced stream
    #[arg(long)]
    caps: Option<String>,

    /// Frame source
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// Test pattern to generate
    #[arg(long, value_enum)]
    pattern: Option<Pattern>,

    /// FFmpeg input for the ffmpeg source
    #[arg(long)]
    input: Option<String>,

    /// Serve as org.framebus.VideoSource.<SUFFIX>
    #[arg(long)]
    bus_name_suffix: Option<String>,

    /// Abort when no frame arrives for this long
    #[arg(long)]
    watchdog_timeout_ms: Option<u64>,

    /// Frames buffered per client
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Emit some frames one byte short or long
    #[arg(long)]
    size_jitter: bool,

    /// End the stream after this many frames
    #[arg(long)]
    num_frames: Option<u64>,

    /// Produce frames as fast as clients take them
    #[arg(long)]
    not_live: bool,

    /// Also log to a daily file in the log directory
    #[arg(long)]
    log_file: bool,

    /// Bus address to use instead of the session bus
    #[arg(long)]
    bus_address: Option<String>,
}

impl Args {
    /// Overlay command-line values on `config`.
    fn apply(&self, mut config: ServiceConfig) -> ServiceConfig {
        if let Some(caps) = &self.caps {
            config.caps = caps.clone();
        }
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(pattern) = self.pattern {
            config.pattern = pattern;
        }
        if let Some(input) = &self.input {
            config.input = Some(input.clone());
        }
        if let Some(suffix) = &self.bus_name_suffix {
            config.bus_name_suffix = suffix.clone();
        }
        if let Some(ms) = self.watchdog_timeout_ms {
            config.watchdog_timeout_ms = ms;
        }
        if let Some(depth) = self.queue_depth {
            config.queue_depth = depth;
        }
        if let Some(n) = self.num_frames {
            config.num_frames = Some(n);
        }
        config.size_jitter |= self.size_jitter;
        config.log_file |= self.log_file;
        if self.not_live {
            config.live = false;
        }
        config
    }
}

/// Initialize logging with RUST_LOG env var support. Returns the guard
/// that flushes the log file, if one is written.
fn init_logging(log_file: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if log_file {
        match logging::ensure_log_dir() {
            Ok(()) => {
                let appender =
                    tracing_appender::rolling::daily(logging::log_dir(), logging::SERVICE_LOG_NAME);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("Failed to create log directory: {}", e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

/// Cancel `shutdown` on SIGTERM, SIGINT or SIGHUP.
fn setup_signal_handlers(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to start signal handler: {}", e);
                return;
            }
        };
        rt.block_on(async {
            let (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::hangup()),
            ) else {
                error!("Failed to install signal handlers");
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP");
                }
            }

            shutdown.cancel();
        });
    });
}

fn build_source(
    config: &ServiceConfig,
    format: &framebus_common::VideoFormat,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match config.source {
        SourceKind::Pattern => Ok(Box::new(
            TestPattern::new(*format, config.pattern)
                .live(config.live)
                .size_jitter(config.size_jitter)
                .num_frames(config.num_frames),
        )),
        SourceKind::Ffmpeg => {
            let input = config.input.as_deref().ok_or_else(|| {
                CaptureError::StartFailed("the ffmpeg source needs --input".to_string())
            })?;
            if config.size_jitter || config.num_frames.is_some() {
                warn!("--size-jitter and --num-frames only apply to the pattern source");
            }
            Ok(Box::new(FfmpegSource::spawn(input, format, config.live)?))
        }
    }
}

/// Run the daemon; returns the process exit code.
async fn serve(config: ServiceConfig, bus_address: Option<String>) -> i32 {
    let format = match config.format() {
        Ok(format) => format,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let directory = match BusDirectory::connect(bus_address.as_deref()).await {
        Ok(directory) => directory,
        Err(e) => {
            error!("Failed to connect to the bus: {}", e);
            return 1;
        }
    };

    let source = match build_source(&config, &format) {
        Ok(source) => source,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let settings = ProducerSettings {
        name: service_name(&config.bus_name_suffix),
        format,
        watchdog_timeout: config.watchdog_timeout(),
        queue_depth: config.queue_depth,
    };
    let producer = Producer::new(settings, source, FaultPoints::from_env());

    match producer
        .run(&directory, shutdown, CrashHandle::aborting())
        .await
    {
        Ok(stats) => {
            info!(
                frames = stats.frames,
                dropped = stats.dropped,
                skipped = stats.skipped,
                "Stream finished"
            );
            0
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

fn main() {
    let args = Args::parse();
    let config = args.apply(config::load_config(args.config.as_deref()));

    let _log_guard = init_logging(config.log_file);

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(2);
    }

    info!("framebus service starting (pid: {})...", std::process::id());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(serve(config, args.bus_address));
    info!("framebus service stopped");

    // Flush the file log before exiting
    drop(_log_guard);
    std::process::exit(code);
}
