//! Connection lifecycle for a single detection-server socket.
//!
//! [`Session`] owns at most one live WebSocket. Commands (`connect`,
//! `disconnect`, `request_stream`) return immediately; the socket itself is
//! driven by a background task that feeds [`LinkEvent`]s into one transition
//! function. Every mutation, from commands or from the task, happens under
//! the same lock, and each one republishes the latest state on `watch`
//! channels so observers only ever see the newest value.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use facefy_core::models::{ConnectionPhase, DetectionEvent, Endpoint, SessionSnapshot};
use facefy_core::protocol::{decode_inbound, ControlMessage};
use facefy_core::FacefyError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::transport::{self, WsMessage};

/// Reported when the transport fails without a message of its own.
const FALLBACK_TRANSPORT_ERROR: &str = "Connection error";

/// Upper bound on the backoff doubling exponent.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// How long a cancelled link may spend on the close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ── Configuration ─────────────────────────────────────────────────────────────

/// Automatic reconnection after an established socket fails.
///
/// With `max_attempts == 0` (the default) a failure moves the session
/// straight to [`ConnectionPhase::Error`]. A first handshake that never
/// succeeds is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for every further attempt.
    pub initial_backoff: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff: Duration::from_millis(500),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.initial_backoff.saturating_mul(1 << shift)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Handshake timeout; `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Everything the transport can report to the state machine.
#[derive(Debug)]
enum LinkEvent {
    Opened,
    Message(String),
    Closed,
    Failed(Option<String>),
    Retrying { attempt: u32, error: String },
}

/// The background task serving one connection attempt.
struct Link {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

struct SessionState {
    phase: ConnectionPhase,
    last_error: Option<String>,
    streaming: bool,
    /// Bumped by every `connect`/`disconnect`; events from older links are dropped.
    generation: u64,
    link: Option<Link>,
}

type Listener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct Shared {
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionSnapshot>,
    detection_tx: watch::Sender<Option<DetectionEvent>>,
    streaming_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `state` to every observer. Must be called with the state lock held.
    fn publish(&self, state: &SessionState) {
        let snapshot = SessionSnapshot {
            phase: state.phase,
            last_error: state.last_error.clone(),
        };

        let streaming = state.streaming;
        self.streaming_tx.send_if_modified(|current| {
            let changed = *current != streaming;
            *current = streaming;
            changed
        });

        let changed = self.status_tx.send_if_modified(|current| {
            let changed = *current != snapshot;
            if changed {
                *current = snapshot.clone();
            }
            changed
        });

        if changed {
            let listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for listener in listeners.iter() {
                listener(&snapshot);
            }
        }
    }

    /// The single transition function for transport events.
    fn apply(&self, generation: u64, event: LinkEvent) {
        let mut state = self.lock();
        if state.generation != generation {
            tracing::trace!(generation, ?event, "dropping event from superseded link");
            return;
        }

        match event {
            LinkEvent::Opened => {
                tracing::info!("connected");
                state.phase = ConnectionPhase::Connected;
            }
            LinkEvent::Message(text) => match decode_inbound(&text) {
                Ok(Some(detection)) => {
                    let event = detection.into_event(Utc::now(), state.streaming);
                    tracing::trace!(faces = event.face_count, "detection received");
                    self.detection_tx.send_replace(Some(event));
                }
                Ok(None) => tracing::trace!("ignoring message without face count"),
                Err(e) => {
                    tracing::debug!(error = %e, "inbound message rejected");
                    state.last_error = Some(e.to_string());
                }
            },
            LinkEvent::Closed => {
                tracing::info!("connection closed");
                state.phase = ConnectionPhase::Disconnected;
                state.streaming = false;
                state.link = None;
            }
            LinkEvent::Failed(message) => {
                let message = message
                    .map(|m| FacefyError::Transport(m).to_string())
                    .unwrap_or_else(|| FALLBACK_TRANSPORT_ERROR.to_string());
                tracing::warn!(error = %message, "connection failed");
                state.phase = ConnectionPhase::Error;
                state.last_error = Some(message);
                state.link = None;
            }
            LinkEvent::Retrying { attempt, error } => {
                tracing::warn!(attempt, error = %error, "connection lost; retrying");
                state.phase = ConnectionPhase::Reconnecting;
                state.last_error = Some(FacefyError::Transport(error).to_string());
                // The server forgets the stream with the socket.
                state.streaming = false;
            }
        }

        self.publish(&state);
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One outbound connection to a detection server.
///
/// Commands must be issued from within a Tokio runtime; the socket is driven
/// by a task spawned on it.
pub struct Session {
    shared: Arc<Shared>,
    config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (status_tx, _) = watch::channel(SessionSnapshot::default());
        let (detection_tx, _) = watch::channel(None);
        let (streaming_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    phase: ConnectionPhase::Disconnected,
                    last_error: None,
                    streaming: false,
                    generation: 0,
                    link: None,
                }),
                status_tx,
                detection_tx,
                streaming_tx,
                listeners: Mutex::new(Vec::new()),
            }),
            config,
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────

    /// Open a socket to `endpoint`.
    ///
    /// A no-op while `Connected`. Any pending attempt (connecting or waiting
    /// to reconnect) is abandoned in favour of the new one, so at most one
    /// socket exists at a time. A malformed endpoint fails synchronously.
    pub fn connect(&self, endpoint: &Endpoint) {
        let mut state = self.shared.lock();
        if state.phase == ConnectionPhase::Connected {
            tracing::debug!(%endpoint, "already connected; ignoring connect");
            return;
        }

        if let Some(stale) = state.link.take() {
            stale.cancel.cancel();
        }
        state.generation += 1;
        state.phase = ConnectionPhase::Connecting;
        state.last_error = None;

        let uri = endpoint.uri();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("no async runtime: {e}"));
        match runtime.and_then(|rt| transport::prepare(&uri).map(|_| rt)) {
            Ok(runtime) => {
                tracing::info!(%uri, "connecting");
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let cancel = CancellationToken::new();
                state.link = Some(Link {
                    outbound: outbound_tx,
                    cancel: cancel.clone(),
                });
                runtime.spawn(run_link(
                    Arc::clone(&self.shared),
                    state.generation,
                    uri,
                    outbound_rx,
                    cancel,
                    self.config.clone(),
                ));
            }
            Err(e) => {
                let message = FacefyError::Setup(format!("{e:#}")).to_string();
                tracing::warn!(%uri, error = %message, "could not start connection");
                state.phase = ConnectionPhase::Error;
                state.last_error = Some(message);
            }
        }

        self.shared.publish(&state);
    }

    /// Close the socket, if any, and reset to `Disconnected`.
    ///
    /// Safe in every phase. Events still in flight from the closed socket are
    /// discarded.
    pub fn disconnect(&self) {
        let mut state = self.shared.lock();
        state.generation += 1;
        if let Some(link) = state.link.take() {
            tracing::info!("disconnecting");
            link.cancel.cancel();
        }
        state.phase = ConnectionPhase::Disconnected;
        state.last_error = None;
        state.streaming = false;
        self.shared.publish(&state);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().phase == ConnectionPhase::Connected
    }

    /// Ask the server to start or stop streaming frames.
    ///
    /// Ignored unless connected. Returns whether the request was sent; no
    /// acknowledgement is awaited.
    pub fn request_stream(&self, start: bool) -> bool {
        let mut state = self.shared.lock();
        if state.phase != ConnectionPhase::Connected {
            tracing::debug!(start, phase = %state.phase, "not connected; ignoring stream request");
            return false;
        }
        let Some(link) = state.link.as_ref() else {
            return false;
        };

        let json = match ControlMessage::for_stream(start).to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode stream request");
                return false;
            }
        };
        if link.outbound.send(json).is_err() {
            tracing::warn!("connection task has exited; stream request dropped");
            return false;
        }

        tracing::info!(start, "stream request sent");
        state.streaming = start;
        self.shared.publish(&state);
        true
    }

    // ── Observation ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.status_tx.subscribe()
    }

    pub fn latest_detection(&self) -> Option<DetectionEvent> {
        self.shared.detection_tx.borrow().clone()
    }

    pub fn subscribe_detections(&self) -> watch::Receiver<Option<DetectionEvent>> {
        self.shared.detection_tx.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        *self.shared.streaming_tx.borrow()
    }

    pub fn subscribe_streaming(&self) -> watch::Receiver<bool> {
        self.shared.streaming_tx.subscribe()
    }

    /// Register a callback invoked synchronously on every snapshot change.
    ///
    /// Callbacks run while the session lock is held, in transition order, and
    /// must not call back into the session.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(link) = self.shared.lock().link.take() {
            link.cancel.cancel();
        }
    }
}

// ── Connection task ───────────────────────────────────────────────────────────

/// Drive one connection until it closes, fails for good, or is cancelled.
async fn run_link(
    shared: Arc<Shared>,
    generation: u64,
    uri: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    config: SessionConfig,
) {
    let mut attempt = 0u32;
    let mut established = false;

    loop {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = open_link(&uri, config.connect_timeout) => opened,
        };

        let failure = match opened {
            Err(e) => format!("{e:#}"),
            Ok((mut writer, mut reader)) => {
                attempt = 0;
                established = true;
                shared.apply(generation, LinkEvent::Opened);

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            match tokio::time::timeout(CLOSE_GRACE, writer.close()).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => tracing::debug!(error = %e, "close handshake failed"),
                                Err(_) => tracing::debug!("close handshake timed out"),
                            }
                            return;
                        }
                        Some(text) = outbound.recv() => {
                            if let Err(e) = writer.send_text(&text).await {
                                break format!("{e:#}");
                            }
                        }
                        message = reader.recv() => match message {
                            Some(Ok(WsMessage::Text(text))) => {
                                shared.apply(generation, LinkEvent::Message(text));
                            }
                            Some(Ok(WsMessage::Binary(data))) => {
                                tracing::debug!(len = data.len(), "ignoring binary frame");
                            }
                            Some(Ok(WsMessage::Close { code, reason })) => {
                                tracing::debug!(code, %reason, "server closed connection");
                                shared.apply(generation, LinkEvent::Closed);
                                return;
                            }
                            None => {
                                shared.apply(generation, LinkEvent::Closed);
                                return;
                            }
                            Some(Err(e)) => break format!("{e:#}"),
                        },
                    }
                }
            }
        };

        attempt += 1;
        if !established || attempt > config.reconnect.max_attempts {
            shared.apply(generation, LinkEvent::Failed(Some(failure)));
            return;
        }

        let delay = config.reconnect.backoff_for(attempt);
        shared.apply(
            generation,
            LinkEvent::Retrying {
                attempt,
                error: failure,
            },
        );
        // Requests queued for the dead socket are stale.
        while outbound.try_recv().is_ok() {}

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn open_link(
    uri: &str,
    timeout: Option<Duration>,
) -> anyhow::Result<(transport::WsWriter, transport::WsReader)> {
    let request = transport::prepare(uri)?;
    transport::open(request, timeout).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
