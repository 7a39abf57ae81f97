//! Wire format spoken with the detection server.
//!
//! Outbound traffic is a single JSON object per message carrying an
//! `action`. Inbound traffic is a JSON object that may carry `num_faces`
//! and, while streaming, a base64 `video_frame`. Anything else is ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{FacefyError, Result};
use crate::models::DetectionEvent;

const FIELD_FACE_COUNT: &str = "num_faces";
const FIELD_FRAME: &str = "video_frame";

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Control messages sent from the client to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    StartStream,
    StopStream,
}

impl ControlMessage {
    pub fn for_stream(start: bool) -> Self {
        if start {
            Self::StartStream
        } else {
            Self::StopStream
        }
    }

    /// Serialize to the JSON text frame sent over the socket.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// The payload of a detection message, before local context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDetection {
    pub face_count: u32,
    pub frame: Option<String>,
}

impl InboundDetection {
    /// Complete the event with the decode-time clock and streaming flag.
    pub fn into_event(self, observed_at: DateTime<Utc>, streaming: bool) -> DetectionEvent {
        DetectionEvent {
            face_count: self.face_count,
            observed_at,
            frame: self.frame,
            streaming,
        }
    }
}

/// Decode one inbound text message.
///
/// Returns `Ok(None)` for well-formed messages without a face count, and a
/// [`FacefyError::Decode`] when the text is not a JSON object or the face
/// count is not a non-negative number. A `video_frame` that is not a string
/// is treated as absent.
pub fn decode_inbound(text: &str) -> Result<Option<InboundDetection>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FacefyError::Decode(e.to_string()))?;

    let Value::Object(map) = value else {
        return Err(FacefyError::Decode(
            "expected a JSON object".to_string(),
        ));
    };

    let count = match map.get(FIELD_FACE_COUNT) {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v.as_f64().ok_or_else(|| {
            FacefyError::Decode(format!("'{FIELD_FACE_COUNT}' must be a number"))
        })?,
    };

    if !count.is_finite() || count < 0.0 || count > f64::from(u32::MAX) {
        return Err(FacefyError::Decode(format!(
            "'{FIELD_FACE_COUNT}' out of range: {count}"
        )));
    }

    let frame = map
        .get(FIELD_FRAME)
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Some(InboundDetection {
        // Fractional counts truncate toward zero.
        face_count: count as u32,
        frame,
    }))
}
