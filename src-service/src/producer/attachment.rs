//! Attached clients and frame fan-out.
//!
//! Every attachment owns a bounded queue drained by its own sender task, so
//! a slow client only ever loses its own frames.

use framebus_common::transport::{FrameHeader, FrameMemory, FrameSender};
use std::collections::HashMap;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Outgoing {
    Frame(FrameHeader, Arc<FrameMemory>),
    Eos,
}

struct Attachment {
    queue: mpsc::Sender<Outgoing>,
    task: JoinHandle<()>,
}

struct TableInner {
    next_id: u64,
    entries: HashMap<u64, Attachment>,
    closed: bool,
}

/// Result of handing one frame to every attachment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Queued for sending
    pub queued: usize,
    /// Skipped because the client's queue was full
    pub skipped: usize,
    /// Attachments found gone and removed
    pub removed: usize,
}

/// Shared table of attachments.
#[derive(Clone)]
pub struct AttachmentTable {
    inner: Arc<Mutex<TableInner>>,
    queue_depth: usize,
}

impl AttachmentTable {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                next_id: 0,
                entries: HashMap::new(),
                closed: false,
            })),
            queue_depth: queue_depth.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of live attachments.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a client channel. Returns its id, or `None` once the table has
    /// been closed by shutdown.
    pub fn attach(&self, sender: FrameSender) -> Option<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let (queue, rx) = mpsc::channel(self.queue_depth);
        let task = tokio::spawn(run_sender(id, sender, rx));
        inner.entries.insert(id, Attachment { queue, task });
        debug!(attachment = id, "Attachment added");
        Some(id)
    }

    /// Drop an attachment immediately, closing its channel without
    /// end-of-stream.
    pub fn remove(&self, id: u64) {
        if let Some(attachment) = self.lock().entries.remove(&id) {
            attachment.task.abort();
            debug!(attachment = id, "Attachment removed");
        }
    }

    /// Queue a frame for every attachment without waiting on any of them.
    pub fn fan_out(&self, header: FrameHeader, memory: &Arc<FrameMemory>) -> FanOut {
        let mut result = FanOut::default();
        let mut inner = self.lock();
        inner.entries.retain(|id, attachment| {
            match attachment
                .queue
                .try_send(Outgoing::Frame(header, Arc::clone(memory)))
            {
                Ok(()) => {
                    result.queued += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    debug!(attachment = id, sequence = header.sequence, "Client queue full, skipping frame");
                    result.skipped += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    info!(attachment = id, "Client detached");
                    result.removed += 1;
                    false
                }
            }
        });
        result
    }

    /// Close the table and end every stream with end-of-stream. Waits up to
    /// `timeout` for each client to take its remaining frames.
    pub async fn finish(&self, timeout: Duration) {
        let entries: Vec<(u64, Attachment)> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.entries.drain().collect()
        };

        for (id, attachment) in entries {
            let Attachment { queue, task } = attachment;
            let abort = task.abort_handle();
            let ended = tokio::time::timeout(timeout, async move {
                if queue.send(Outgoing::Eos).await.is_ok() {
                    drop(queue);
                    let _ = task.await;
                }
            })
            .await;
            if ended.is_err() {
                warn!(attachment = id, "Client did not drain in time, dropping it");
                abort.abort();
            }
        }
    }

    /// Close the table and drop every channel without end-of-stream.
    pub fn abort_all(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for (_, attachment) in inner.entries.drain() {
            attachment.task.abort();
        }
    }
}

async fn run_sender(id: u64, mut sender: FrameSender, mut queue: mpsc::Receiver<Outgoing>) {
    while let Some(outgoing) = queue.recv().await {
        match outgoing {
            Outgoing::Frame(header, memory) => {
                let sent = sender.send(header, memory.as_fd()).await;
                // Our reference to the payload goes away with the send
                drop(memory);
                if let Err(e) = sent {
                    debug!(attachment = id, "Send failed: {}", e);
                    return;
                }
            }
            Outgoing::Eos => {
                if let Err(e) = sender.send_eos().await {
                    debug!(attachment = id, "Failed to send end-of-stream: {}", e);
                }
                return;
            }
        }
    }
}
