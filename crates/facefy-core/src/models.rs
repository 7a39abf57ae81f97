use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FacefyError, Result};

/// Host used when nothing has been persisted yet.
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when nothing has been persisted yet.
pub const DEFAULT_PORT: u16 = 8000;

/// Path component the detection server serves its client socket on.
pub const SOCKET_PATH: &str = "/ws/android";

/// Characters that would move a host into another part of the URI.
const URI_DELIMITERS: &[char] = &['/', ':', '@', '?', '#', '[', ']', '\\', '%'];

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// The (host, port) pair identifying the detection server.
///
/// Endpoints are immutable: changing the server always produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Build a validated endpoint.
    ///
    /// The host is trimmed and must be a bare name or IPv4 address: empty
    /// hosts, whitespace and URI delimiters are rejected. The port must lie
    /// in `1..=65535`.
    pub fn new(host: impl AsRef<str>, port: u32) -> Result<Self> {
        let host = host.as_ref().trim();
        if host.is_empty() {
            return Err(FacefyError::InvalidEndpoint(
                "host must not be empty".to_string(),
            ));
        }
        if let Some(bad) = host
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || URI_DELIMITERS.contains(c))
        {
            return Err(FacefyError::InvalidEndpoint(format!(
                "host {host:?} contains {bad:?}"
            )));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                FacefyError::InvalidEndpoint(format!("port {port} is outside 1-65535"))
            })?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Canonical connection URI, e.g. `ws://localhost:8000/ws/android`.
    pub fn uri(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, SOCKET_PATH)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── ConnectionPhase ───────────────────────────────────────────────────────────

/// Lifecycle phase of a session's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff before retrying; only entered when a reconnect
    /// policy is enabled.
    Reconnecting,
    Error,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── DetectionEvent ────────────────────────────────────────────────────────────

/// One decoded face-detection result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// Number of faces the server reported.
    pub face_count: u32,
    /// Local wall-clock time at which the message was decoded.
    pub observed_at: DateTime<Utc>,
    /// Base64-encoded frame, when the server attached one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    /// Whether streaming was requested when the event was decoded.
    pub streaming: bool,
}

impl DetectionEvent {
    /// Decode the attached frame into raw image bytes.
    ///
    /// Returns `Ok(None)` when the event carries no frame.
    pub fn frame_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.frame
            .as_deref()
            .map(|frame| {
                STANDARD
                    .decode(frame)
                    .map_err(|e| FacefyError::Decode(format!("invalid frame payload: {e}")))
            })
            .transpose()
    }
}

// ── Snapshots ─────────────────────────────────────────────────────────────────

/// The phase and last error of a session, always published together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: ConnectionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Session state combined with the configured endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSnapshot {
    pub phase: ConnectionPhase,
    pub endpoint: Endpoint,
    /// Moment the phase last became `Connected`; absent whenever it is not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AggregateSnapshot {
    /// Derive the next snapshot from the previous one and the current inputs.
    ///
    /// `last_connected_at` is stamped with `now` on a transition into
    /// `Connected`, carried while the phase stays `Connected`, and cleared
    /// otherwise.
    pub fn derive(
        previous: &AggregateSnapshot,
        session: &SessionSnapshot,
        endpoint: &Endpoint,
        now: DateTime<Utc>,
    ) -> AggregateSnapshot {
        let last_connected_at = match (previous.phase, session.phase) {
            (ConnectionPhase::Connected, ConnectionPhase::Connected) => {
                previous.last_connected_at.or(Some(now))
            }
            (_, ConnectionPhase::Connected) => Some(now),
            _ => None,
        };

        AggregateSnapshot {
            phase: session.phase,
            endpoint: endpoint.clone(),
            last_connected_at,
            last_error: session.last_error.clone(),
        }
    }
}
