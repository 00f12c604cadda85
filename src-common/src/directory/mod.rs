//! Service discovery, activation and remote calls.
//!
//! [`ServiceDirectory`] is the narrow surface the producer and the client
//! state machine need from a session-wide name service. [`BusDirectory`]
//! implements it on the D-Bus session bus; [`LocalDirectory`] is an
//! in-process implementation for tests and for embedding producer and
//! consumers in one process.

mod bus;
mod local;

pub use bus::{BusDirectory, BusRegistration};
pub use local::{Activator, LocalDirectory, LocalRegistration};

use futures_util::future::BoxFuture;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Prefix of every producer's well-known name.
pub const SERVICE_NAMESPACE: &str = "org.framebus.VideoSource";

/// Suffix used when none is configured.
pub const DEFAULT_SUFFIX: &str = "default";

/// Object path the producer serves its interface at.
pub const OBJECT_PATH: &str = "/org/framebus/VideoSource";

/// Interface carrying the `Attach` method.
pub const INTERFACE_NAME: &str = "org.framebus.VideoSource1";

/// The producer's single remote method.
pub const ATTACH_METHOD: &str = "Attach";

/// Well-known name for a producer with the given suffix.
pub fn service_name(suffix: &str) -> String {
    format!("{}.{}", SERVICE_NAMESPACE, suffix)
}

/// Error returned by directory operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Name is already owned by another process
    AlreadyOwned(String),
    /// No activation record exists for the name
    NotAvailable(String),
    /// Activation was requested but the name did not appear in time
    ActivationTimeout(String),
    /// The activated process exited or failed before owning the name
    ActivationFailed(String),
    /// The remote side refused the call's arguments
    Rejected(String),
    /// The call failed for a reason other than its arguments (owner vanished,
    /// internal error, malformed reply)
    CallFailed(String),
    /// The call did not complete within its timeout
    CallTimeout,
    /// Connection to the name service failed
    Bus(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::AlreadyOwned(name) => write!(f, "Name {} is already owned", name),
            DirectoryError::NotAvailable(name) => {
                write!(f, "Service {} is not available (no activation record)", name)
            }
            DirectoryError::ActivationTimeout(name) => {
                write!(f, "Timed out waiting for {} to start", name)
            }
            DirectoryError::ActivationFailed(msg) => write!(f, "Activation failed: {}", msg),
            DirectoryError::Rejected(msg) => write!(f, "Request rejected: {}", msg),
            DirectoryError::CallFailed(msg) => write!(f, "Remote call failed: {}", msg),
            DirectoryError::CallTimeout => write!(f, "Remote call timed out"),
            DirectoryError::Bus(msg) => write!(f, "Bus error: {}", msg),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Error returned by a served method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Arguments were understood but cannot be satisfied
    InvalidArgs(String),
    /// Anything else
    Failed(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            RemoteError::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for DirectoryError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::InvalidArgs(msg) => DirectoryError::Rejected(msg),
            RemoteError::Failed(msg) => DirectoryError::CallFailed(msg),
        }
    }
}

/// Reply to a remote call: a string value plus transferred descriptors.
#[derive(Debug)]
pub struct Reply {
    pub value: String,
    pub fds: Vec<OwnedFd>,
}

/// Current owner of a well-known name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    /// The well-known name
    pub name: String,
    /// Unique connection name of the owning process
    pub unique_name: String,
}

/// Serves remote calls addressed to a registered name.
pub trait MethodHandler: Send + Sync + 'static {
    fn call(&self, method: &str, args: String) -> BoxFuture<'static, Result<Reply, RemoteError>>;
}

/// Callback fired when a watched owner goes away.
pub type DeathCallback = Box<dyn FnOnce() + Send + 'static>;

/// Keeps an owner-death watch alive. Dropping it cancels the watch.
#[derive(Debug)]
pub struct DeathWatch {
    cancel: CancellationToken,
}

impl DeathWatch {
    fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

impl Drop for DeathWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Session-wide name service.
pub trait ServiceDirectory: Send + Sync + 'static {
    /// Held by the owner of a name. Dropping it releases the name.
    type Registration: Send + 'static;

    /// Claim `name` and route calls for it to `handler`.
    fn register(
        &self,
        name: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> impl Future<Output = Result<Self::Registration, DirectoryError>> + Send;

    /// Whether some process currently owns `name`.
    fn is_owned(&self, name: &str) -> impl Future<Output = Result<bool, DirectoryError>> + Send;

    /// Return the owner of `name`, starting it through its activation record
    /// if needed and waiting up to `timeout` for it to appear.
    fn activate_and_wait(
        &self,
        name: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<OwnerInfo, DirectoryError>> + Send;

    /// Invoke `method` on the owner of `name`. Dropping the returned future
    /// abandons the call.
    fn call(
        &self,
        name: &str,
        method: &str,
        args: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Reply, DirectoryError>> + Send;

    /// Run `callback` once when `owner` stops owning its name. If it already
    /// has, the callback runs immediately.
    fn watch_owner_death(
        &self,
        owner: &OwnerInfo,
        callback: DeathCallback,
    ) -> impl Future<Output = Result<DeathWatch, DirectoryError>> + Send;
}
