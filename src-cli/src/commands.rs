//! CLI command implementations.

use framebus_common::client::{ClientError, ClientSource, ClientState};
use framebus_common::directory::{BusDirectory, ServiceDirectory};
use framebus_common::transport::ReceivedFrame;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::debug;

use crate::client::{self, SourceOptions};
use crate::colors;
use crate::exit_codes::ExitCode;

#[derive(Serialize)]
struct ChecksumRecord<'a> {
    sequence: u64,
    pts: u64,
    duration: u64,
    checksum: &'a str,
}

#[derive(Serialize)]
struct CountReport {
    frames: u64,
    attachments: u64,
    state: ClientState,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    name: &'a str,
    running: bool,
}

/// Output flags shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
    pub verbose: bool,
}

/// One line of JSON for `value`.
fn json_line<T: Serialize>(value: &T) -> io::Result<String> {
    serde_json::to_string(value).map_err(io::Error::from)
}

/// Print `value` as JSON on stdout, or report why it could not be.
fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match json_line(value) {
        Ok(line) => {
            println!("{}", line);
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("{}", colors::error(&format!("Failed to serialize output: {}", e)));
            ExitCode::GeneralError
        }
    }
}

fn report_failure(error: &ClientError, quiet: bool) -> ExitCode {
    if !quiet {
        eprintln!("{}", colors::error(&error.to_string()));
    }
    client::exit_code(error)
}

async fn open(options: &SourceOptions, out: Output) -> Result<ClientSource<BusDirectory>, ExitCode> {
    match client::open_source(options).await {
        Ok(source) => {
            client::stop_on_signals(source.stop_token());
            if out.verbose && !out.quiet {
                eprintln!("{}", colors::note(&format!("Waiting for {}...", options.name())));
            }
            Ok(source)
        }
        Err(e) => Err(report_failure(&e, out.quiet)),
    }
}

/// Pull frames until the stream ends or `limit` frames were handled.
/// Returns the number of frames handed to `handle`.
async fn for_each_frame<F>(
    source: &mut ClientSource<BusDirectory>,
    limit: Option<u64>,
    out: Output,
    mut handle: F,
) -> Result<u64, ExitCode>
where
    F: FnMut(&ReceivedFrame) -> io::Result<()>,
{
    let mut handled = 0u64;
    loop {
        if limit.is_some_and(|n| handled >= n) {
            source.stop();
            // Settles the source into end-of-stream
            let _ = source.next_frame().await;
            break;
        }
        match source.next_frame().await {
            Ok(Some(frame)) => {
                if let Err(e) = handle(&frame) {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        debug!("Output closed, stopping");
                        source.stop();
                        let _ = source.next_frame().await;
                        break;
                    }
                    if !out.quiet {
                        eprintln!("{}", colors::error(&format!("Failed to write output: {}", e)));
                    }
                    return Err(ExitCode::GeneralError);
                }
                handled += 1;
            }
            Ok(None) => break,
            Err(e) => return Err(report_failure(&e, out.quiet)),
        }
    }

    if out.verbose && !out.quiet {
        eprintln!(
            "{}",
            colors::note(&format!(
                "Stream ended after {} frames ({} attachments, state {})",
                handled,
                source.attachments(),
                source.state()
            ))
        );
    }
    Ok(handled)
}

/// Write raw frame payloads to `output` or stdout.
pub async fn stream(
    options: &SourceOptions,
    output: Option<&Path>,
    num_frames: Option<u64>,
    out: Output,
) -> ExitCode {
    let sink: Box<dyn Write> = match output {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(file),
            Err(e) => {
                if !out.quiet {
                    eprintln!(
                        "{}",
                        colors::error(&format!("Cannot create {}: {}", path.display(), e))
                    );
                }
                return ExitCode::InvalidArguments;
            }
        },
        None => Box::new(io::stdout()),
    };
    let mut sink = BufWriter::new(sink);

    let mut source = match open(options, out).await {
        Ok(source) => source,
        Err(code) => return code,
    };

    let result = for_each_frame(&mut source, num_frames, out, |frame| {
        sink.write_all(frame.data())
    })
    .await;

    match (result, sink.flush()) {
        (Err(code), _) => code,
        (Ok(_), Ok(())) => ExitCode::Success,
        (Ok(_), Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => ExitCode::Success,
        (Ok(_), Err(e)) => {
            if !out.quiet {
                eprintln!("{}", colors::error(&format!("Failed to write output: {}", e)));
            }
            ExitCode::GeneralError
        }
    }
}

/// Checksum of a frame payload.
pub fn frame_checksum(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(data);
    hasher.finish()
}

fn checksum_line(frame: &ReceivedFrame, json: bool) -> io::Result<String> {
    let checksum = format!("{:016x}", frame_checksum(frame.data()));
    if json {
        let record = ChecksumRecord {
            sequence: frame.sequence,
            pts: frame.pts,
            duration: frame.duration,
            checksum: &checksum,
        };
        json_line(&record)
    } else {
        Ok(format!("{} {}", frame.pts, checksum))
    }
}

/// Print one `pts checksum` line per frame.
pub async fn checksum(options: &SourceOptions, num_frames: Option<u64>, out: Output) -> ExitCode {
    let mut source = match open(options, out).await {
        Ok(source) => source,
        Err(code) => return code,
    };

    let stdout = io::stdout();
    let result = for_each_frame(&mut source, num_frames, out, |frame| {
        writeln!(stdout.lock(), "{}", checksum_line(frame, out.json)?)
    })
    .await;

    match result {
        Ok(_) => ExitCode::Success,
        Err(code) => code,
    }
}

/// Count frames until the stream ends.
pub async fn count(options: &SourceOptions, num_frames: Option<u64>, out: Output) -> ExitCode {
    let mut source = match open(options, out).await {
        Ok(source) => source,
        Err(code) => return code,
    };

    let frames = match for_each_frame(&mut source, num_frames, out, |_| Ok(())).await {
        Ok(frames) => frames,
        Err(code) => return code,
    };

    if out.json {
        let report = CountReport {
            frames,
            attachments: source.attachments(),
            state: source.state(),
        };
        return print_json(&report);
    } else if out.quiet {
        println!("{}", frames);
    } else {
        println!("{} {}", colors::bold("Frames:"), colors::number(&frames.to_string()));
        println!(
            "{} {}",
            colors::bold("Attachments:"),
            colors::number(&source.attachments().to_string())
        );
    }
    ExitCode::Success
}

/// Show whether a video source currently owns its name.
pub async fn status(options: &SourceOptions, out: Output) -> ExitCode {
    let name = options.name();

    let directory = match client::connect(options).await {
        Ok(directory) => directory,
        Err(e) => {
            if out.json {
                println!(
                    "{}",
                    serde_json::json!({ "status": "bus_unavailable", "error": e.to_string() })
                );
            } else {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            return ExitCode::ServiceConnectionFailed;
        }
    };

    match directory.is_owned(&name).await {
        Ok(owned) => {
            if out.json {
                let report = StatusReport {
                    name: &name,
                    running: owned,
                };
                return print_json(&report);
            }
            println!("{} {}", colors::bold("Name:"), name);
            println!("{} {}", colors::bold("State:"), colors::owned(owned));
            ExitCode::Success
        }
        Err(e) => {
            if out.json {
                println!("{}", serde_json::json!({ "error": e.to_string() }));
            } else {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            ExitCode::ServiceConnectionFailed
        }
    }
}

/// Show version information.
pub fn version(json: bool) {
    let version = env!("CARGO_PKG_VERSION");
    if json {
        println!("{}", serde_json::json!({ "version": version }));
    } else {
        println!("{} {}", colors::bold("framebus"), version);
    }
}
