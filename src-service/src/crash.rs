//! Abnormal termination of the producer.
//!
//! The daemon aborts the process, so clients observe a real crash: the name
//! vanishes and every channel breaks without an end-of-stream marker. An
//! embedded producer (tests, in-process use) instead trips a token that makes
//! [`crate::producer::Producer::run`] tear everything down the same way and
//! return an error.

use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrashMode {
    Abort,
    Return,
}

#[derive(Debug, Clone)]
pub struct CrashHandle {
    mode: CrashMode,
    token: CancellationToken,
}

impl CrashHandle {
    /// Crashing aborts the process.
    pub fn aborting() -> Self {
        Self {
            mode: CrashMode::Abort,
            token: CancellationToken::new(),
        }
    }

    /// Crashing only trips [`CrashHandle::crashed`].
    pub fn returning() -> Self {
        Self {
            mode: CrashMode::Return,
            token: CancellationToken::new(),
        }
    }

    pub fn crash(&self, reason: &str) {
        error!("{}", reason);
        match self.mode {
            CrashMode::Abort => {
                eprintln!("framebus-service: {}", reason);
                std::process::abort();
            }
            CrashMode::Return => self.token.cancel(),
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once [`CrashHandle::crash`] was called.
    pub async fn crashed(&self) {
        self.token.cancelled().await
    }
}
