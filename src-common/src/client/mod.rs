//! Consumer-side state machine.
//!
//! A [`ClientSource`] finds (or activates) a producer, attaches to it, and
//! yields frames until the stream ends. When the producer dies mid-stream
//! it re-activates and re-attaches transparently. Once a stream has been
//! delivered, running out of ways to reconnect ends it with a clean
//! end-of-stream instead of an error.

mod state;

pub use state::{ClientConfig, ClientError, ClientState};

use std::future::Future;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::{
    DeathWatch, DirectoryError, OwnerInfo, ServiceDirectory, ATTACH_METHOD,
};
use crate::transport::{FrameReceiver, ReceivedFrame};
use crate::types::{CapsFilter, VideoFormat};

/// An attachment to one producer instance.
struct Session {
    receiver: FrameReceiver,
    format: VideoFormat,
    owner: OwnerInfo,
    death: oneshot::Receiver<()>,
    /// Set once the owner is gone; buffered frames are read until then
    drain_until: Option<Instant>,
    _watch: DeathWatch,
}

/// Why a connection attempt did not produce a session.
enum Setback {
    /// Stop was requested
    Stopped,
    /// No further attempts are possible
    Fatal(ClientError),
}

/// Result of waiting on a streaming session.
enum StreamEvent {
    Stop,
    Frame(ReceivedFrame),
    Ended(String),
    OwnerGone,
    DrainExpired,
}

/// Run `fut` unless `stop` fires first.
async fn unless_stopped<F: Future>(stop: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Receives frames from a producer found through a [`ServiceDirectory`].
pub struct ClientSource<D: ServiceDirectory> {
    directory: D,
    config: ClientConfig,
    filter: CapsFilter,
    stop: CancellationToken,
    state: ClientState,
    session: Option<Session>,
    failure: Option<ClientError>,
    delivered: u64,
    attachments: u64,
    /// Activate+attach rounds since the last delivered frame
    attempts: u32,
}

impl<D: ServiceDirectory> ClientSource<D> {
    pub fn new(directory: D, config: ClientConfig) -> Result<Self, ClientError> {
        let filter = CapsFilter::parse(&config.caps)?;
        Ok(Self {
            directory,
            config,
            filter,
            stop: CancellationToken::new(),
            state: ClientState::Idle,
            session: None,
            failure: None,
            delivered: 0,
            attachments: 0,
            attempts: 0,
        })
    }

    /// Token that stops the source when cancelled. Any pending wait inside
    /// [`ClientSource::next_frame`] returns promptly and the source ends
    /// with end-of-stream.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Frames handed out so far, across all attachments.
    pub fn frames_delivered(&self) -> u64 {
        self.delivered
    }

    /// Successful attaches so far. More than one means the producer was
    /// replaced at least once.
    pub fn attachments(&self) -> u64 {
        self.attachments
    }

    /// Format of the current attachment.
    pub fn format(&self) -> Option<VideoFormat> {
        self.session.as_ref().map(|s| s.format)
    }

    /// Terminal error, once the source has failed.
    pub fn failure(&self) -> Option<&ClientError> {
        self.failure.as_ref()
    }

    fn set_state(&mut self, next: ClientState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Client state change");
            self.state = next;
        }
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` once the stream has ended (stop requested, or the
    /// producer could not be reached again after frames were delivered) and
    /// keeps returning it. A failure before any frame was delivered is
    /// returned as an error, and repeated on later calls.
    pub async fn next_frame(&mut self) -> Result<Option<ReceivedFrame>, ClientError> {
        loop {
            if self.stop.is_cancelled() && !self.state.is_terminal() {
                self.finish_stopped();
            }

            match self.state {
                ClientState::Eos => return Ok(None),
                ClientState::Failed => {
                    return Err(self
                        .failure
                        .clone()
                        .unwrap_or_else(|| ClientError::AttachFailed("source failed".into())))
                }
                ClientState::Idle | ClientState::Recovering => match self.connect().await {
                    Ok(session) => {
                        info!(
                            name = %session.owner.name,
                            owner = %session.owner.unique_name,
                            format = %session.format,
                            "Attached to video source"
                        );
                        self.attachments += 1;
                        self.session = Some(session);
                        self.set_state(ClientState::Streaming);
                    }
                    Err(Setback::Stopped) => self.finish_stopped(),
                    Err(Setback::Fatal(e)) => return self.conclude(e),
                },
                ClientState::Discovering | ClientState::Attaching | ClientState::Streaming => {
                    if self.session.is_none() {
                        self.set_state(ClientState::Recovering);
                        continue;
                    }
                    match self.wait_stream().await {
                        StreamEvent::Frame(frame) => {
                            self.delivered += 1;
                            self.attempts = 0;
                            return Ok(Some(frame));
                        }
                        StreamEvent::Stop => self.finish_stopped(),
                        StreamEvent::OwnerGone => {
                            let grace = self.config.drain_grace;
                            if let Some(session) = self.session.as_mut() {
                                debug!(owner = %session.owner.unique_name, "Producer gone, draining");
                                session.drain_until = Some(Instant::now() + grace);
                            }
                        }
                        StreamEvent::Ended(reason) => {
                            warn!("Stream interrupted: {}", reason);
                            self.session = None;
                            self.set_state(ClientState::Recovering);
                        }
                        StreamEvent::DrainExpired => {
                            warn!("Stream interrupted: producer gone");
                            self.session = None;
                            self.set_state(ClientState::Recovering);
                        }
                    }
                }
            }
        }
    }

    async fn wait_stream(&mut self) -> StreamEvent {
        let Some(session) = self.session.as_mut() else {
            return StreamEvent::Ended("no attachment".to_string());
        };
        let draining = session.drain_until.is_some();
        let deadline = session.drain_until.unwrap_or_else(Instant::now);

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => StreamEvent::Stop,
            received = session.receiver.receive() => match received {
                Ok(Some(frame)) => StreamEvent::Frame(frame),
                Ok(None) => StreamEvent::Ended("end-of-stream".to_string()),
                Err(e) => StreamEvent::Ended(e.to_string()),
            },
            _ = &mut session.death, if !draining => StreamEvent::OwnerGone,
            _ = tokio::time::sleep_until(deadline), if draining => StreamEvent::DrainExpired,
        }
    }

    fn finish_stopped(&mut self) {
        if self.session.take().is_some() {
            debug!("Detached on stop");
        }
        self.set_state(ClientState::Eos);
    }

    /// Turn a fatal setback into the terminal state.
    ///
    /// Running out of attempts after frames were delivered ends the stream
    /// cleanly. `AttachRejected` is terminal even then: a producer that
    /// refuses the requested caps will refuse them on every reconnect.
    fn conclude(&mut self, error: ClientError) -> Result<Option<ReceivedFrame>, ClientError> {
        self.session = None;
        let rejected = matches!(error, ClientError::AttachRejected(_));
        if self.delivered > 0 && !rejected {
            info!("Video source unreachable ({}), ending stream", error);
            self.set_state(ClientState::Eos);
            return Ok(None);
        }
        warn!("Video source failed: {}", error);
        self.failure = Some(error.clone());
        self.set_state(ClientState::Failed);
        Err(error)
    }

    /// Activate and attach, spending what is left of `max_attempts`.
    ///
    /// The budget is shared by every round since the last delivered frame,
    /// so a producer that accepts attaches but never sends anything cannot
    /// keep the client reconnecting forever.
    async fn connect(&mut self) -> Result<Session, Setback> {
        let name = self.config.bus_name.clone();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        while self.attempts < max_attempts {
            self.attempts += 1;
            let attempt = self.attempts;
            if attempt > 1 {
                debug!(attempt, "Retrying video source");
                if unless_stopped(&self.stop, tokio::time::sleep(self.config.retry_delay))
                    .await
                    .is_none()
                {
                    return Err(Setback::Stopped);
                }
            }

            self.set_state(ClientState::Discovering);
            let activated = unless_stopped(
                &self.stop,
                self.directory
                    .activate_and_wait(&name, self.config.activation_timeout),
            )
            .await
            .ok_or(Setback::Stopped)?;

            let owner = match activated {
                Ok(owner) => owner,
                Err(DirectoryError::NotAvailable(n)) => {
                    return Err(Setback::Fatal(ClientError::NotAvailable(n)))
                }
                Err(DirectoryError::ActivationTimeout(n)) => {
                    return Err(Setback::Fatal(ClientError::ActivationTimeout(n)))
                }
                Err(DirectoryError::ActivationFailed(msg)) => {
                    warn!(attempt, "Activation failed: {}", msg);
                    last_error = Some(ClientError::ActivationFailed(msg));
                    continue;
                }
                Err(e) => return Err(Setback::Fatal(ClientError::Directory(e))),
            };

            self.set_state(ClientState::Attaching);
            match self.attach(owner).await {
                Ok(session) => return Ok(session),
                Err(Setback::Stopped) => return Err(Setback::Stopped),
                Err(Setback::Fatal(ClientError::AttachFailed(msg))) => {
                    warn!(attempt, "Attach failed: {}", msg);
                    last_error = Some(ClientError::AttachFailed(msg));
                }
                Err(fatal) => return Err(fatal),
            }
        }

        Err(Setback::Fatal(last_error.unwrap_or_else(|| {
            ClientError::AttachFailed(format!(
                "no frames after {} attempts",
                max_attempts
            ))
        })))
    }

    /// Attach to `owner`. Retryable failures come back as `AttachFailed`.
    async fn attach(&self, owner: OwnerInfo) -> Result<Session, Setback> {
        let called = unless_stopped(
            &self.stop,
            self.directory.call(
                &owner.name,
                ATTACH_METHOD,
                &self.config.caps,
                self.config.call_timeout,
            ),
        )
        .await
        .ok_or(Setback::Stopped)?;

        let reply = match called {
            Ok(reply) => reply,
            Err(DirectoryError::Rejected(msg)) => {
                return Err(Setback::Fatal(ClientError::AttachRejected(msg)))
            }
            Err(e @ DirectoryError::CallFailed(_)) | Err(e @ DirectoryError::CallTimeout) => {
                return Err(Setback::Fatal(ClientError::AttachFailed(e.to_string())))
            }
            Err(e) => return Err(Setback::Fatal(ClientError::Directory(e))),
        };

        let format: VideoFormat = reply.value.parse().map_err(|e| {
            Setback::Fatal(ClientError::AttachRejected(format!(
                "producer sent unusable caps {:?}: {}",
                reply.value, e
            )))
        })?;
        if !self.filter.matches(&format) {
            return Err(Setback::Fatal(ClientError::AttachRejected(format!(
                "producer format {} does not match {}",
                format, self.config.caps
            ))));
        }

        let Some(fd) = reply.fds.into_iter().next() else {
            return Err(Setback::Fatal(ClientError::AttachFailed(
                "reply carried no channel".to_string(),
            )));
        };
        let receiver = FrameReceiver::from_fd(fd, Some(format.frame_size())).map_err(|e| {
            Setback::Fatal(ClientError::AttachFailed(format!("unusable channel: {}", e)))
        })?;

        let (notify, death) = oneshot::channel();
        let watch = unless_stopped(
            &self.stop,
            self.directory.watch_owner_death(
                &owner,
                Box::new(move || {
                    let _ = notify.send(());
                }),
            ),
        )
        .await
        .ok_or(Setback::Stopped)?
        .map_err(|e| Setback::Fatal(ClientError::Directory(e)))?;

        Ok(Session {
            receiver,
            format,
            owner,
            death,
            drain_until: None,
            _watch: watch,
        })
    }
}
