//! D-Bus session bus implementation of [`ServiceDirectory`].
//!
//! Producers own a well-known name and serve `org.framebus.VideoSource1` at
//! `/org/framebus/VideoSource`. Activation relies on standard `.service`
//! files found by the bus daemon.

use futures_util::StreamExt;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::names::{BusName, UniqueName, WellKnownName};
use zbus::zvariant;
use zbus::Connection;

use super::{
    DeathCallback, DeathWatch, DirectoryError, MethodHandler, OwnerInfo, RemoteError, Reply,
    ServiceDirectory, ATTACH_METHOD, INTERFACE_NAME, OBJECT_PATH,
};

const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

fn bus_error(e: impl std::fmt::Display) -> DirectoryError {
    DirectoryError::Bus(e.to_string())
}

/// Map a D-Bus error reply to the directory taxonomy. Only `InvalidArgs`
/// means the producer refused the request.
fn method_error(error_name: &str, detail: Option<String>) -> DirectoryError {
    let detail = detail.unwrap_or_else(|| error_name.to_string());
    if error_name == ERROR_INVALID_ARGS {
        DirectoryError::Rejected(detail)
    } else {
        DirectoryError::CallFailed(format!("{}: {}", error_name, detail))
    }
}

/// Outcome of a method call raced against its timeout.
fn call_outcome<T>(
    result: Result<zbus::Result<T>, tokio::time::error::Elapsed>,
) -> Result<T, DirectoryError> {
    match result {
        Err(_) => Err(DirectoryError::CallTimeout),
        Ok(Ok(value)) => Ok(value),
        Ok(Err(zbus::Error::MethodError(error_name, detail, _))) => {
            Err(method_error(error_name.as_str(), detail))
        }
        Ok(Err(e)) => Err(DirectoryError::CallFailed(e.to_string())),
    }
}

fn bus_name(name: &str) -> Result<BusName<'_>, DirectoryError> {
    BusName::try_from(name).map_err(|e| bus_error(format!("invalid bus name {}: {}", name, e)))
}

fn well_known_name(name: &str) -> Result<WellKnownName<'_>, DirectoryError> {
    WellKnownName::try_from(name)
        .map_err(|e| bus_error(format!("invalid bus name {}: {}", name, e)))
}

/// Object served at [`OBJECT_PATH`], forwarding to a [`MethodHandler`].
struct VideoSourceInterface {
    handler: Arc<dyn MethodHandler>,
}

#[zbus::interface(name = "org.framebus.VideoSource1")]
impl VideoSourceInterface {
    /// Attach a new client. Returns the client end of a fresh frame channel
    /// and the concrete caps of the stream.
    async fn attach(&self, caps: String) -> zbus::fdo::Result<(zvariant::OwnedFd, String)> {
        let reply = self
            .handler
            .call(ATTACH_METHOD, caps)
            .await
            .map_err(|e| match e {
                RemoteError::InvalidArgs(msg) => zbus::fdo::Error::InvalidArgs(msg),
                RemoteError::Failed(msg) => zbus::fdo::Error::Failed(msg),
            })?;

        let fd = reply
            .fds
            .into_iter()
            .next()
            .ok_or_else(|| zbus::fdo::Error::Failed("attach produced no channel".to_string()))?;
        Ok((zvariant::OwnedFd::from(fd), reply.value))
    }
}

/// Directory backed by a D-Bus connection.
#[derive(Clone)]
pub struct BusDirectory {
    connection: Connection,
}

impl std::fmt::Debug for BusDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusDirectory")
            .field("unique_name", &self.connection.unique_name())
            .finish()
    }
}

impl BusDirectory {
    /// Connect to the session bus, or to `address` when given.
    pub async fn connect(address: Option<&str>) -> Result<Self, DirectoryError> {
        let connection = match address {
            Some(address) => zbus::connection::Builder::address(address)
                .map_err(bus_error)?
                .build()
                .await
                .map_err(bus_error)?,
            None => Connection::session().await.map_err(bus_error)?,
        };
        debug!(unique_name = ?connection.unique_name(), "Connected to bus");
        Ok(Self { connection })
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    async fn dbus(&self) -> Result<DBusProxy<'static>, DirectoryError> {
        DBusProxy::new(&self.connection).await.map_err(bus_error)
    }

    async fn current_owner(
        &self,
        dbus: &DBusProxy<'_>,
        name: &str,
    ) -> Result<Option<String>, DirectoryError> {
        match dbus.get_name_owner(bus_name(name)?).await {
            Ok(owner) => Ok(Some(owner.to_string())),
            Err(zbus::fdo::Error::NameHasNoOwner(_)) => Ok(None),
            Err(e) => Err(bus_error(e)),
        }
    }
}

/// Ownership of a name on the bus. Dropping it releases the name and
/// removes the served object.
pub struct BusRegistration {
    connection: Option<Connection>,
    name: String,
}

impl BusRegistration {
    /// Release the name and wait for the bus to confirm.
    pub async fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            release_name(&connection, &self.name).await;
        }
    }
}

async fn release_name(connection: &Connection, name: &str) {
    if let Err(e) = connection.release_name(name).await {
        warn!(name, "Failed to release bus name: {}", e);
    }
    let _ = connection
        .object_server()
        .remove::<VideoSourceInterface, _>(OBJECT_PATH)
        .await;
    info!(name, "Bus name released");
}

impl Drop for BusRegistration {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        // Without a runtime the name goes away with the connection
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let name = self.name.clone();
            handle.spawn(async move { release_name(&connection, &name).await });
        }
    }
}

impl ServiceDirectory for BusDirectory {
    type Registration = BusRegistration;

    async fn register(
        &self,
        name: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<BusRegistration, DirectoryError> {
        self.connection
            .object_server()
            .at(OBJECT_PATH, VideoSourceInterface { handler })
            .await
            .map_err(bus_error)?;

        let reply = self
            .connection
            .request_name_with_flags(well_known_name(name)?, RequestNameFlags::DoNotQueue.into())
            .await;
        match reply {
            Ok(RequestNameReply::PrimaryOwner) | Ok(RequestNameReply::AlreadyOwner) => {
                info!(name, "Bus name acquired");
                Ok(BusRegistration {
                    connection: Some(self.connection.clone()),
                    name: name.to_string(),
                })
            }
            Ok(RequestNameReply::Exists)
            | Ok(RequestNameReply::InQueue)
            | Err(zbus::Error::NameTaken) => {
                let _ = self
                    .connection
                    .object_server()
                    .remove::<VideoSourceInterface, _>(OBJECT_PATH)
                    .await;
                Err(DirectoryError::AlreadyOwned(name.to_string()))
            }
            Err(e) => Err(bus_error(e)),
        }
    }

    async fn is_owned(&self, name: &str) -> Result<bool, DirectoryError> {
        self.dbus()
            .await?
            .name_has_owner(bus_name(name)?)
            .await
            .map_err(bus_error)
    }

    async fn activate_and_wait(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<OwnerInfo, DirectoryError> {
        let dbus = self.dbus().await?;

        if let Some(unique_name) = self.current_owner(&dbus, name).await? {
            return Ok(OwnerInfo {
                name: name.to_string(),
                unique_name,
            });
        }

        let activatable = dbus.list_activatable_names().await.map_err(bus_error)?;
        if !activatable.iter().any(|n| n.as_str() == name) {
            return Err(DirectoryError::NotAvailable(name.to_string()));
        }

        info!(name, "Activating service");
        let started =
            tokio::time::timeout(timeout, dbus.start_service_by_name(well_known_name(name)?, 0))
                .await;
        match started {
            Err(_) => return Err(DirectoryError::ActivationTimeout(name.to_string())),
            Ok(Ok(reply)) => debug!(name, ?reply, "StartServiceByName returned"),
            Ok(Err(zbus::fdo::Error::ServiceUnknown(_))) => {
                return Err(DirectoryError::NotAvailable(name.to_string()))
            }
            Ok(Err(zbus::fdo::Error::NoReply(_)))
            | Ok(Err(zbus::fdo::Error::TimedOut(_)))
            | Ok(Err(zbus::fdo::Error::Timeout(_))) => {
                return Err(DirectoryError::ActivationTimeout(name.to_string()))
            }
            Ok(Err(e)) => {
                warn!(name, "Activated service failed: {}", e);
                return Err(DirectoryError::ActivationFailed(e.to_string()));
            }
        }

        match self.current_owner(&dbus, name).await? {
            Some(unique_name) => Ok(OwnerInfo {
                name: name.to_string(),
                unique_name,
            }),
            None => Err(DirectoryError::ActivationFailed(format!(
                "{} started but no longer owns its name",
                name
            ))),
        }
    }

    async fn call(
        &self,
        name: &str,
        method: &str,
        args: &str,
        timeout: Duration,
    ) -> Result<Reply, DirectoryError> {
        let body = (args,);
        let pending = self.connection.call_method(
            Some(name),
            OBJECT_PATH,
            Some(INTERFACE_NAME),
            method,
            &body,
        );

        let message = call_outcome(tokio::time::timeout(timeout, pending).await)?;

        let (fd, value): (zvariant::OwnedFd, String) = message
            .body()
            .deserialize()
            .map_err(|e| DirectoryError::CallFailed(format!("malformed reply: {}", e)))?;

        let fd = fd
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| DirectoryError::CallFailed(format!("unusable descriptor: {}", e)))?;

        Ok(Reply {
            value,
            fds: vec![fd],
        })
    }

    async fn watch_owner_death(
        &self,
        owner: &OwnerInfo,
        callback: DeathCallback,
    ) -> Result<DeathWatch, DirectoryError> {
        let dbus = self.dbus().await?;
        let mut changes = dbus
            .receive_name_owner_changed_with_args(&[(0, owner.name.as_str())])
            .await
            .map_err(bus_error)?;

        let cancel = CancellationToken::new();

        // Subscribe first, then check, so an exit in between is not missed
        let still_owner = self.current_owner(&dbus, &owner.name).await?;
        if still_owner.as_deref() != Some(owner.unique_name.as_str()) {
            callback();
            return Ok(DeathWatch::new(cancel));
        }

        let watch_cancel = cancel.clone();
        let unique_name = owner.unique_name.clone();
        let name = owner.name.clone();
        tokio::spawn(async move {
            let died = async {
                while let Some(signal) = changes.next().await {
                    let Ok(args) = signal.args() else {
                        continue;
                    };
                    let new_owner: &Option<UniqueName<'_>> = args.new_owner();
                    if new_owner.as_ref().map(|n| n.as_str()) != Some(unique_name.as_str()) {
                        return;
                    }
                }
            };
            tokio::select! {
                biased;
                _ = watch_cancel.cancelled() => {}
                _ = died => {
                    debug!(name, owner = %unique_name, "Name owner gone");
                    callback();
                }
            }
        });

        Ok(DeathWatch::new(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_args_is_rejection() {
        assert_eq!(
            method_error(ERROR_INVALID_ARGS, Some("format not supported".into())),
            DirectoryError::Rejected("format not supported".into())
        );
        assert_eq!(
            method_error(ERROR_INVALID_ARGS, None),
            DirectoryError::Rejected(ERROR_INVALID_ARGS.into())
        );
    }

    #[test]
    fn test_other_errors_are_retryable() {
        assert_eq!(
            method_error("org.freedesktop.DBus.Error.Failed", Some("pipeline down".into())),
            DirectoryError::CallFailed("org.freedesktop.DBus.Error.Failed: pipeline down".into())
        );
        assert!(matches!(
            method_error("org.freedesktop.DBus.Error.NoReply", None),
            DirectoryError::CallFailed(_)
        ));
        assert!(matches!(
            call_outcome::<()>(Ok(Err(zbus::Error::Failure("connection lost".into())))),
            Err(DirectoryError::CallFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_elapsed_call_is_timeout() {
        let elapsed = tokio::time::timeout(
            Duration::from_millis(1),
            std::future::pending::<zbus::Result<()>>(),
        )
        .await;
        assert_eq!(call_outcome(elapsed), Err(DirectoryError::CallTimeout));

        let answered = tokio::time::timeout(Duration::from_secs(1), async { zbus::Result::Ok(7u32) }).await;
        assert_eq!(call_outcome(answered), Ok(7));
    }
}
