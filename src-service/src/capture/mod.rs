//! Frame capture for the video source daemon.
//!
//! A [`FrameSource`] produces raw frames on a dedicated blocking thread;
//! [`start_capture`] wraps it in that thread and forwards frames to the
//! async side over a bounded channel.

pub mod ffmpeg;
pub mod testsrc;

pub use ffmpeg::FfmpegSource;
pub use testsrc::{Pattern, TestPattern};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::crash::CrashHandle;
use crate::fault::{FaultAction, FaultPoint};

/// Frames buffered between the capture thread and the main loop.
const CAPTURE_QUEUE_DEPTH: usize = 4;

/// Error raised by a frame source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The source could not be started
    StartFailed(String),
    /// Reading from the source failed
    ReadFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::StartFailed(msg) => write!(f, "Failed to start capture: {}", msg),
            CaptureError::ReadFailed(msg) => write!(f, "Capture failed: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Handle to stop an ongoing capture.
pub type StopHandle = Arc<AtomicBool>;

/// Output of the capture thread.
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(Vec<u8>),
    /// Source ran out of frames
    Eos,
    Error(String),
}

/// Receiver for capture output.
pub type CaptureReceiver = mpsc::Receiver<CaptureEvent>;

/// A blocking producer of raw frames.
pub trait FrameSource: Send + 'static {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Block until the next frame is available. `Ok(None)` at end of input.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;
}

/// Run `source` on its own thread.
///
/// The `capture_frame` fault point runs before each frame. The thread ends
/// when the stop handle is set, the source ends, or the receiver is dropped.
pub fn start_capture(
    mut source: Box<dyn FrameSource>,
    fault: Arc<FaultPoint>,
    crash: CrashHandle,
) -> Result<(CaptureReceiver, StopHandle), CaptureError> {
    let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
    let stop_flag: StopHandle = Arc::new(AtomicBool::new(false));
    let stop = Arc::clone(&stop_flag);

    info!("Starting capture from {}", source.describe());

    thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match fault.inject() {
                    FaultAction::Continue => {}
                    FaultAction::Fail(msg) => {
                        let _ = tx.blocking_send(CaptureEvent::Error(msg));
                        break;
                    }
                    FaultAction::Abort => {
                        crash.crash(&format!("Fault injected from {}: abort", fault.name()));
                        break;
                    }
                }
                if stop.load(Ordering::Relaxed) {
                    break;
                }

                let event = match source.next_frame() {
                    Ok(Some(data)) => CaptureEvent::Frame(data),
                    Ok(None) => CaptureEvent::Eos,
                    Err(e) => CaptureEvent::Error(e.to_string()),
                };
                let last = !matches!(event, CaptureEvent::Frame(_));
                if tx.blocking_send(event).is_err() || last {
                    break;
                }
            }
            debug!("Capture thread exiting");
        })
        .map_err(|e| CaptureError::StartFailed(format!("cannot spawn capture thread: {}", e)))?;

    Ok((rx, stop_flag))
}
