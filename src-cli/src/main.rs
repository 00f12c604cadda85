//! framebus Command-Line Interface
//!
//! Attaches to a framebus video source (starting it on demand) and
//! consumes its frames: raw output, per-frame checksums or a frame count.

mod client;
mod colors;
mod commands;
mod exit_codes;

use clap::{Parser, Subcommand};
use client::SourceOptions;
use commands::Output;
use exit_codes::ExitCode;
use framebus_common::directory::DEFAULT_SUFFIX;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// framebus - shared video source consumer
#[derive(Parser, Debug)]
#[command(name = "framebus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Full bus name of the video source (overrides --bus-name-suffix)
    #[arg(long, global = true)]
    bus_name: Option<String>,

    /// Attach to org.framebus.VideoSource.<SUFFIX>
    #[arg(long, global = true, default_value = DEFAULT_SUFFIX)]
    bus_name_suffix: String,

    /// Requested caps, e.g. video/x-raw,format=RGB,width=640
    #[arg(long, global = true, default_value = "")]
    caps: String,

    /// Seconds to wait for the video source to start
    #[arg(long, global = true, default_value_t = 25)]
    activation_timeout: u64,

    /// Seconds to wait for an attach call
    #[arg(long, global = true, default_value_t = 25)]
    call_timeout: u64,

    /// Start/attach attempts before giving up
    #[arg(long, global = true, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: u32,

    /// Bus address to use instead of the session bus
    #[arg(long, global = true)]
    bus_address: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write raw frames to stdout or a file
    Stream {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many frames
        #[arg(short = 'n', long)]
        num_frames: Option<u64>,
    },
    /// Print "pts checksum" for every frame
    Checksum {
        /// Stop after this many frames
        #[arg(short = 'n', long)]
        num_frames: Option<u64>,
    },
    /// Count frames until the stream ends
    Count {
        /// Stop after this many frames
        #[arg(short = 'n', long)]
        num_frames: Option<u64>,
    },
    /// Show whether the video source is running
    Status,
    /// Show version information
    Version,
}

impl Cli {
    fn source_options(&self) -> SourceOptions {
        SourceOptions {
            bus_name: self.bus_name.clone(),
            bus_name_suffix: self.bus_name_suffix.clone(),
            caps: self.caps.clone(),
            activation_timeout: Duration::from_secs(self.activation_timeout),
            call_timeout: Duration::from_secs(self.call_timeout),
            max_attempts: self.max_attempts,
            bus_address: self.bus_address.clone(),
        }
    }

    fn output(&self) -> Output {
        Output {
            json: self.json,
            quiet: self.quiet,
            verbose: self.verbose,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Build the async runtime
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}", colors::error(&format!("Failed to create Tokio runtime: {}", e)));
            std::process::exit(ExitCode::GeneralError.as_i32());
        }
    };

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code.as_i32());
}

async fn run(cli: Cli) -> ExitCode {
    let options = cli.source_options();
    let out = cli.output();

    match &cli.command {
        Commands::Stream { output, num_frames } => {
            commands::stream(&options, output.as_deref(), *num_frames, out).await
        }
        Commands::Checksum { num_frames } => commands::checksum(&options, *num_frames, out).await,
        Commands::Count { num_frames } => commands::count(&options, *num_frames, out).await,
        Commands::Status => commands::status(&options, out).await,
        Commands::Version => {
            commands::version(cli.json);
            ExitCode::Success
        }
    }
}
