//! In-process name service.
//!
//! Mirrors the session bus semantics the rest of the crate relies on: names
//! are owned exclusively, activation records start a "process" (a spawned
//! task) on demand, and owner death is observed when a registration is
//! dropped. A task that ends before registering counts as a failed
//! activation, exactly like a bus-activated process that exits early.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    DeathCallback, DeathWatch, DirectoryError, MethodHandler, OwnerInfo, Reply, ServiceDirectory,
};

/// Starts the service for a name. The returned future is the lifetime of
/// the started "process".
pub type Activator = Arc<dyn Fn(LocalDirectory) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct NameStatus {
    owner: Option<String>,
    /// Number of activated instances that have ended
    exits: u64,
}

struct Owner {
    unique_name: String,
    handler: Arc<dyn MethodHandler>,
    gone: CancellationToken,
}

struct NameEntry {
    owner: Option<Owner>,
    activator: Option<Activator>,
    activating: bool,
    status: watch::Sender<NameStatus>,
}

impl NameEntry {
    fn new() -> Self {
        let (status, _) = watch::channel(NameStatus::default());
        Self {
            owner: None,
            activator: None,
            activating: false,
            status,
        }
    }
}

#[derive(Default)]
struct Inner {
    names: Mutex<HashMap<String, NameEntry>>,
    next_unique: AtomicU64,
}

/// Name service living inside the current process.
#[derive(Clone, Default)]
pub struct LocalDirectory {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LocalDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDirectory").finish_non_exhaustive()
    }
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn names(&self) -> MutexGuard<'_, HashMap<String, NameEntry>> {
        // A panic while holding the lock cannot leave an entry half-updated
        self.inner
            .names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install an activation record for `name`.
    pub fn add_activatable(&self, name: &str, activator: Activator) {
        let mut names = self.names();
        names
            .entry(name.to_string())
            .or_insert_with(NameEntry::new)
            .activator = Some(activator);
    }

    /// Remove the activation record for `name`, if any.
    pub fn remove_activatable(&self, name: &str) {
        if let Some(entry) = self.names().get_mut(name) {
            entry.activator = None;
        }
    }

    /// Current owner of `name`.
    pub fn owner(&self, name: &str) -> Option<OwnerInfo> {
        let names = self.names();
        let owner = names.get(name)?.owner.as_ref()?;
        Some(OwnerInfo {
            name: name.to_string(),
            unique_name: owner.unique_name.clone(),
        })
    }

    fn release(&self, name: &str, unique_name: &str) {
        let mut names = self.names();
        let Some(entry) = names.get_mut(name) else {
            return;
        };
        if entry
            .owner
            .as_ref()
            .is_some_and(|o| o.unique_name == unique_name)
        {
            if let Some(owner) = entry.owner.take() {
                owner.gone.cancel();
            }
            entry.status.send_modify(|s| s.owner = None);
            info!(name, owner = unique_name, "Name released");
        }
    }

    fn activation_ended(&self, name: &str) {
        let mut names = self.names();
        if let Some(entry) = names.get_mut(name) {
            entry.activating = false;
            entry.status.send_modify(|s| s.exits += 1);
        }
    }

    fn spawn_activation(&self, name: &str, activator: Activator) {
        struct EndGuard {
            directory: LocalDirectory,
            name: String,
        }

        impl Drop for EndGuard {
            fn drop(&mut self) {
                debug!(name = %self.name, "Activated instance ended");
                self.directory.activation_ended(&self.name);
            }
        }

        info!(name, "Activating service");
        let guard = EndGuard {
            directory: self.clone(),
            name: name.to_string(),
        };
        let instance = activator(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            instance.await;
        });
    }
}

/// Ownership of a name in a [`LocalDirectory`]. Dropping it releases the
/// name and fires owner-death watches.
pub struct LocalRegistration {
    directory: LocalDirectory,
    name: String,
    unique_name: String,
}

impl LocalRegistration {
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }
}

impl Drop for LocalRegistration {
    fn drop(&mut self) {
        self.directory.release(&self.name, &self.unique_name);
    }
}

impl ServiceDirectory for LocalDirectory {
    type Registration = LocalRegistration;

    async fn register(
        &self,
        name: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<LocalRegistration, DirectoryError> {
        let mut names = self.names();
        let entry = names.entry(name.to_string()).or_insert_with(NameEntry::new);
        if entry.owner.is_some() {
            return Err(DirectoryError::AlreadyOwned(name.to_string()));
        }

        let unique_name = format!(
            ":local.{}",
            self.inner.next_unique.fetch_add(1, Ordering::Relaxed)
        );
        entry.owner = Some(Owner {
            unique_name: unique_name.clone(),
            handler,
            gone: CancellationToken::new(),
        });
        entry
            .status
            .send_modify(|s| s.owner = Some(unique_name.clone()));
        info!(name, owner = %unique_name, "Name acquired");

        Ok(LocalRegistration {
            directory: self.clone(),
            name: name.to_string(),
            unique_name,
        })
    }

    async fn is_owned(&self, name: &str) -> Result<bool, DirectoryError> {
        Ok(self.owner(name).is_some())
    }

    async fn activate_and_wait(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<OwnerInfo, DirectoryError> {
        let (mut status, start) = {
            let mut names = self.names();
            let entry = names.entry(name.to_string()).or_insert_with(NameEntry::new);
            if let Some(owner) = &entry.owner {
                return Ok(OwnerInfo {
                    name: name.to_string(),
                    unique_name: owner.unique_name.clone(),
                });
            }
            let Some(activator) = entry.activator.clone() else {
                return Err(DirectoryError::NotAvailable(name.to_string()));
            };
            let start = if entry.activating {
                None
            } else {
                entry.activating = true;
                Some(activator)
            };
            (entry.status.subscribe(), start)
        };

        let exits_before = status.borrow().exits;
        if let Some(activator) = start {
            self.spawn_activation(name, activator);
        }

        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|s| s.owner.is_some() || s.exits > exits_before),
        )
        .await;
        let owner = match waited {
            Ok(Ok(s)) => s.owner.clone(),
            Ok(Err(_)) => return Err(DirectoryError::Bus("directory closed".to_string())),
            Err(_) => {
                warn!(name, ?timeout, "Activation timed out");
                return Err(DirectoryError::ActivationTimeout(name.to_string()));
            }
        };

        match owner {
            Some(unique_name) => Ok(OwnerInfo {
                name: name.to_string(),
                unique_name,
            }),
            None => {
                warn!(name, "Activated service exited before owning its name");
                Err(DirectoryError::ActivationFailed(format!(
                    "activated service {} exited before owning its name",
                    name
                )))
            }
        }
    }

    async fn call(
        &self,
        name: &str,
        method: &str,
        args: &str,
        timeout: Duration,
    ) -> Result<Reply, DirectoryError> {
        let (handler, gone) = {
            let names = self.names();
            match names.get(name).and_then(|e| e.owner.as_ref()) {
                Some(owner) => (owner.handler.clone(), owner.gone.clone()),
                None => {
                    return Err(DirectoryError::CallFailed(format!(
                        "name {} has no owner",
                        name
                    )))
                }
            }
        };

        let pending = handler.call(method, args.to_string());
        tokio::select! {
            result = tokio::time::timeout(timeout, pending) => match result {
                Ok(reply) => reply.map_err(DirectoryError::from),
                Err(_) => Err(DirectoryError::CallTimeout),
            },
            _ = gone.cancelled() => Err(DirectoryError::CallFailed(format!(
                "owner of {} exited during the call",
                name
            ))),
        }
    }

    async fn watch_owner_death(
        &self,
        owner: &OwnerInfo,
        callback: DeathCallback,
    ) -> Result<DeathWatch, DirectoryError> {
        let gone = {
            let names = self.names();
            names
                .get(&owner.name)
                .and_then(|e| e.owner.as_ref())
                .filter(|o| o.unique_name == owner.unique_name)
                .map(|o| o.gone.clone())
        };

        let cancel = CancellationToken::new();
        match gone {
            Some(gone) => {
                let watch_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = watch_cancel.cancelled() => {}
                        _ = gone.cancelled() => callback(),
                    }
                });
            }
            None => callback(),
        }
        Ok(DeathWatch::new(cancel))
    }
}
