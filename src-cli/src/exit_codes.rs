//! Exit codes for the CLI.
//!
//! These codes enable scripting integration by providing structured
//! feedback about how a stream ended.

/// Exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Stream ended cleanly (including a stop request)
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Invalid command-line arguments
    InvalidArguments = 2,
    /// Failed to connect to the bus
    ServiceConnectionFailed = 3,
    /// The video source has no activation record or could not be started
    ServiceNotAvailable = 4,
    /// The video source did not come up in time
    ActivationTimeout = 5,
    /// The video source refused the requested caps
    AttachRejected = 6,
    /// No stream could be established
    StreamError = 7,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::Success => write!(f, "success"),
            ExitCode::GeneralError => write!(f, "general error"),
            ExitCode::InvalidArguments => write!(f, "invalid arguments"),
            ExitCode::ServiceConnectionFailed => write!(f, "service connection failed"),
            ExitCode::ServiceNotAvailable => write!(f, "service not available"),
            ExitCode::ActivationTimeout => write!(f, "activation timeout"),
            ExitCode::AttachRejected => write!(f, "attach rejected"),
            ExitCode::StreamError => write!(f, "stream error"),
        }
    }
}
