//! Client states, configuration and errors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::directory::{service_name, DirectoryError, DEFAULT_SUFFIX};
use crate::types::FormatError;

/// State of a [`super::ClientSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Idle,
    Discovering,
    Attaching,
    Streaming,
    Recovering,
    Eos,
    Failed,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Discovering => "discovering",
            ClientState::Attaching => "attaching",
            ClientState::Streaming => "streaming",
            ClientState::Recovering => "recovering",
            ClientState::Eos => "eos",
            ClientState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Eos | ClientState::Failed)
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for a [`super::ClientSource`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Well-known name of the producer
    pub bus_name: String,
    /// Requested caps; empty accepts whatever the producer makes
    pub caps: String,
    /// How long to wait for an activated producer to own its name
    pub activation_timeout: Duration,
    /// Bound on a single `Attach` call
    pub call_timeout: Duration,
    /// Activation/attach attempts allowed between two delivered frames
    pub max_attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// How long buffered frames are still read after the owner died
    pub drain_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bus_name: service_name(DEFAULT_SUFFIX),
            caps: String::new(),
            activation_timeout: Duration::from_secs(25),
            call_timeout: Duration::from_secs(25),
            max_attempts: 5,
            retry_delay: Duration::from_millis(100),
            drain_grace: Duration::from_millis(500),
        }
    }
}

/// Terminal error of a [`super::ClientSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Requested caps could not be parsed
    InvalidCaps(FormatError),
    /// Producer has no activation record
    NotAvailable(String),
    /// Producer did not come up in time
    ActivationTimeout(String),
    /// Every activation attempt failed
    ActivationFailed(String),
    /// Producer refused the requested format
    AttachRejected(String),
    /// Every attach attempt failed
    AttachFailed(String),
    /// Name service failure
    Directory(DirectoryError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::InvalidCaps(e) => write!(f, "Invalid caps: {}", e),
            ClientError::NotAvailable(name) => write!(f, "Video source {} is not available", name),
            ClientError::ActivationTimeout(name) => {
                write!(f, "Timed out waiting for video source {}", name)
            }
            ClientError::ActivationFailed(msg) => write!(f, "Could not start video source: {}", msg),
            ClientError::AttachRejected(msg) => write!(f, "Attach rejected: {}", msg),
            ClientError::AttachFailed(msg) => write!(f, "Attach failed: {}", msg),
            ClientError::Directory(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<FormatError> for ClientError {
    fn from(e: FormatError) -> Self {
        ClientError::InvalidCaps(e)
    }
}
