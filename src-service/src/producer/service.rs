//! The `Attach` method.

use framebus_common::directory::{MethodHandler, RemoteError, Reply, ATTACH_METHOD};
use framebus_common::transport::channel_pair;
use framebus_common::{CapsFilter, VideoFormat};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{info, warn};

use super::attachment::AttachmentTable;
use crate::crash::CrashHandle;
use crate::fault::{FaultAction, FaultPoint};

/// Serves `Attach(requested_caps) -> (channel, caps)`.
pub struct AttachHandler {
    format: VideoFormat,
    attachments: AttachmentTable,
    fault: Arc<FaultPoint>,
    crash: CrashHandle,
}

impl AttachHandler {
    pub fn new(
        format: VideoFormat,
        attachments: AttachmentTable,
        fault: Arc<FaultPoint>,
        crash: CrashHandle,
    ) -> Self {
        Self {
            format,
            attachments,
            fault,
            crash,
        }
    }
}

impl MethodHandler for AttachHandler {
    fn call(&self, method: &str, args: String) -> BoxFuture<'static, Result<Reply, RemoteError>> {
        if method != ATTACH_METHOD {
            let method = method.to_string();
            return Box::pin(async move {
                Err(RemoteError::Failed(format!("unknown method {}", method)))
            });
        }

        let format = self.format;
        let attachments = self.attachments.clone();
        let fault = Arc::clone(&self.fault);
        let crash = self.crash.clone();

        Box::pin(async move {
            let requested = CapsFilter::parse(&args).map_err(|e| {
                RemoteError::InvalidArgs(format!("cannot parse caps {:?}: {}", args, e))
            })?;
            if !requested.matches(&format) {
                warn!(requested = %args, produced = %format, "Rejecting attach");
                return Err(RemoteError::InvalidArgs(format!(
                    "requested {} but this source produces {}",
                    args, format
                )));
            }

            let (sender, client_end) = channel_pair()
                .map_err(|e| RemoteError::Failed(format!("cannot create channel: {}", e)))?;
            let id = attachments
                .attach(sender)
                .ok_or_else(|| RemoteError::Failed("video source is shutting down".to_string()))?;

            match fault.inject_async().await {
                FaultAction::Continue => {}
                FaultAction::Fail(msg) => {
                    attachments.remove(id);
                    return Err(RemoteError::Failed(msg));
                }
                FaultAction::Abort => {
                    crash.crash(&format!("Fault injected from {}: abort", fault.name()));
                    attachments.remove(id);
                    return Err(RemoteError::Failed("video source crashed".to_string()));
                }
            }

            info!(attachment = id, clients = attachments.len(), "Client attached");
            Ok(Reply {
                value: format.to_caps(),
                fds: vec![client_end],
            })
        })
    }
}
