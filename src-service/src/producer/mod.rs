//! The video source: capture, registration, fan-out and watchdog.

mod attachment;
mod service;
mod watchdog;

#[cfg(test)]
mod tests;

pub use attachment::{AttachmentTable, FanOut};
pub use service::AttachHandler;
pub use watchdog::Watchdog;

use framebus_common::directory::{DirectoryError, ServiceDirectory};
use framebus_common::transport::{FrameHeader, FrameMemory};
use framebus_common::{FormatError, VideoFormat};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::capture::{self, CaptureError, CaptureEvent, FrameSource};
use crate::crash::CrashHandle;
use crate::fault::{FaultPoint, CAPTURE_FRAME, PRE_ATTACH};

/// How long each client gets to take its last frames on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Error ending [`Producer::run`].
#[derive(Debug)]
pub enum ProducerError {
    /// Frames of the configured format cannot be sent
    Format(FormatError),
    Capture(CaptureError),
    Directory(DirectoryError),
    /// The capture pipeline failed mid-stream
    Stream(String),
    /// Watchdog lapse or injected abort
    Crashed,
}

impl std::fmt::Display for ProducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerError::Format(e) => write!(f, "Unusable format: {}", e),
            ProducerError::Capture(e) => write!(f, "{}", e),
            ProducerError::Directory(e) => write!(f, "{}", e),
            ProducerError::Stream(msg) => write!(f, "Internal data stream error: {}", msg),
            ProducerError::Crashed => write!(f, "Video source crashed"),
        }
    }
}

impl std::error::Error for ProducerError {}

impl From<CaptureError> for ProducerError {
    fn from(e: CaptureError) -> Self {
        ProducerError::Capture(e)
    }
}

impl From<DirectoryError> for ProducerError {
    fn from(e: DirectoryError) -> Self {
        ProducerError::Directory(e)
    }
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Well-known name to own
    pub name: String,
    pub format: VideoFormat,
    pub watchdog_timeout: Duration,
    pub queue_depth: usize,
}

/// Fault injection points used by the producer.
#[derive(Debug, Clone)]
pub struct FaultPoints {
    pub pre_attach: Arc<FaultPoint>,
    pub capture_frame: Arc<FaultPoint>,
}

impl FaultPoints {
    pub fn disabled() -> Self {
        Self {
            pre_attach: Arc::new(FaultPoint::disabled(PRE_ATTACH)),
            capture_frame: Arc::new(FaultPoint::disabled(CAPTURE_FRAME)),
        }
    }

    pub fn from_env() -> Self {
        Self {
            pre_attach: Arc::new(FaultPoint::from_env(PRE_ATTACH)),
            capture_frame: Arc::new(FaultPoint::from_env(CAPTURE_FRAME)),
        }
    }
}

/// Counters reported when a run ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProducerStats {
    /// Frames handed to fan-out
    pub frames: u64,
    /// Frames dropped for having the wrong size
    pub dropped: u64,
    /// Client queue overflows
    pub skipped: u64,
}

/// How the main loop ended.
enum Outcome {
    Shutdown,
    Eos,
    Error(String),
    Crashed,
}

pub struct Producer {
    settings: ProducerSettings,
    source: Box<dyn FrameSource>,
    faults: FaultPoints,
    attachments: AttachmentTable,
}

impl Producer {
    pub fn new(settings: ProducerSettings, source: Box<dyn FrameSource>, faults: FaultPoints) -> Self {
        let attachments = AttachmentTable::new(settings.queue_depth);
        Self {
            settings,
            source,
            faults,
            attachments,
        }
    }

    /// Handle on the attachment table, for observing clients.
    pub fn attachments(&self) -> AttachmentTable {
        self.attachments.clone()
    }

    /// Start capture, own the name and serve clients until `shutdown` is
    /// cancelled, the source ends, or the pipeline fails.
    ///
    /// A graceful end sends end-of-stream to every client and returns `Ok`.
    /// A capture error or crash drops every client without end-of-stream.
    pub async fn run<D: ServiceDirectory>(
        self,
        directory: &D,
        shutdown: CancellationToken,
        crash: CrashHandle,
    ) -> Result<ProducerStats, ProducerError> {
        let Producer {
            settings,
            source,
            faults,
            attachments,
        } = self;
        settings.format.validate().map_err(ProducerError::Format)?;
        let length = settings
            .format
            .frame_length()
            .ok_or_else(|| ProducerError::Stream("frame size does not fit the header".to_string()))?;
        let frame_size = length as usize;
        let framerate = settings.format.framerate;

        let (mut events, stop_capture) =
            capture::start_capture(source, faults.capture_frame, crash.clone())?;

        let handler = Arc::new(AttachHandler::new(
            settings.format,
            attachments.clone(),
            faults.pre_attach,
            crash.clone(),
        ));
        let registration = match directory.register(&settings.name, handler).await {
            Ok(registration) => registration,
            Err(e) => {
                stop_capture.store(true, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        info!(name = %settings.name, format = %settings.format, "Video source ready");

        let mut watchdog = Watchdog::new(settings.watchdog_timeout);
        let mut stats = ProducerStats::default();

        let outcome = loop {
            let deadline = watchdog.deadline();
            tokio::select! {
                biased;
                _ = crash.crashed() => break Outcome::Crashed,
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break Outcome::Shutdown;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    crash.crash(&format!(
                        "Watchdog triggered: no frame for {} ms",
                        watchdog.timeout().as_millis()
                    ));
                    break Outcome::Crashed;
                }
                event = events.recv() => match event {
                    Some(CaptureEvent::Frame(data)) => {
                        if data.len() != frame_size {
                            debug!(len = data.len(), expected = frame_size, "Dropping frame with unexpected size");
                            stats.dropped += 1;
                            continue;
                        }
                        let memory = match FrameMemory::from_bytes(&data) {
                            Ok(memory) => Arc::new(memory),
                            Err(e) => break Outcome::Error(format!("cannot allocate frame: {}", e)),
                        };
                        let sequence = stats.frames;
                        let header = FrameHeader {
                            sequence,
                            pts: framerate.frame_pts(sequence),
                            duration: framerate.frame_duration(sequence),
                            length,
                        };
                        let result = attachments.fan_out(header, &memory);
                        stats.skipped += result.skipped as u64;
                        stats.frames += 1;
                        watchdog.renew();
                    }
                    Some(CaptureEvent::Eos) => {
                        info!("Capture reached end-of-stream");
                        break Outcome::Eos;
                    }
                    Some(CaptureEvent::Error(msg)) => break Outcome::Error(msg),
                    None => break Outcome::Error("capture thread exited".to_string()),
                },
            }
        };

        stop_capture.store(true, Ordering::Relaxed);
        drop(events);

        match outcome {
            Outcome::Shutdown | Outcome::Eos => {
                attachments.finish(DRAIN_TIMEOUT).await;
                drop(registration);
                info!(frames = stats.frames, dropped = stats.dropped, "Video source stopped");
                Ok(stats)
            }
            Outcome::Error(msg) => {
                error!("Internal data stream error: {}", msg);
                attachments.abort_all();
                drop(registration);
                Err(ProducerError::Stream(msg))
            }
            Outcome::Crashed => {
                attachments.abort_all();
                drop(registration);
                Err(ProducerError::Crashed)
            }
        }
    }
}
