//! Connection to a framebus video source.
//!
//! Wraps [`ClientSource`] over the session bus and maps its errors to exit
//! codes.

use framebus_common::client::{ClientConfig, ClientError, ClientSource};
use framebus_common::directory::{service_name, BusDirectory, DirectoryError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::exit_codes::ExitCode;

/// Where and how to reach the video source.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Full well-known name; overrides `bus_name_suffix`
    pub bus_name: Option<String>,
    pub bus_name_suffix: String,
    pub caps: String,
    pub activation_timeout: Duration,
    pub call_timeout: Duration,
    pub max_attempts: u32,
    /// Bus address to use instead of the session bus
    pub bus_address: Option<String>,
}

impl SourceOptions {
    /// The name the producer owns.
    pub fn name(&self) -> String {
        self.bus_name
            .clone()
            .unwrap_or_else(|| service_name(&self.bus_name_suffix))
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            bus_name: self.name(),
            caps: self.caps.clone(),
            activation_timeout: self.activation_timeout,
            call_timeout: self.call_timeout,
            max_attempts: self.max_attempts,
            ..ClientConfig::default()
        }
    }
}

/// Connect to the bus.
pub async fn connect(options: &SourceOptions) -> Result<BusDirectory, DirectoryError> {
    let directory = BusDirectory::connect(options.bus_address.as_deref()).await?;
    debug!("Connected to the bus");
    Ok(directory)
}

/// Connect to the bus and set up a client for the configured source.
/// Nothing is activated until the first frame is requested.
pub async fn open_source(options: &SourceOptions) -> Result<ClientSource<BusDirectory>, ClientError> {
    let directory = connect(options).await.map_err(ClientError::Directory)?;
    ClientSource::new(directory, options.client_config())
}

/// Cancel `stop` on SIGINT or SIGTERM.
pub fn stop_on_signals(stop: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            warn!("Failed to set up signal handlers");
            return;
        };

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }

        debug!("Stop requested by signal");
        stop.cancel();
    });
}

/// Exit code for a failed stream.
pub fn exit_code(error: &ClientError) -> ExitCode {
    match error {
        ClientError::InvalidCaps(_) => ExitCode::InvalidArguments,
        ClientError::NotAvailable(_) | ClientError::ActivationFailed(_) => {
            ExitCode::ServiceNotAvailable
        }
        ClientError::ActivationTimeout(_) => ExitCode::ActivationTimeout,
        ClientError::AttachRejected(_) => ExitCode::AttachRejected,
        ClientError::AttachFailed(_) => ExitCode::StreamError,
        ClientError::Directory(DirectoryError::Bus(_)) => ExitCode::ServiceConnectionFailed,
        ClientError::Directory(_) => ExitCode::GeneralError,
    }
}
