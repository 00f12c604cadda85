//! Stall detection for the capture pipeline.

use std::time::Duration;
use tokio::time::Instant;

/// Deadline pushed forward every time a frame reaches fan-out. The main
/// loop treats reaching it as a fatal stall.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Instant,
}

impl Watchdog {
    /// Armed from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn renew(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
