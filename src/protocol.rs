//! Session wire protocol.
//!
//! Control frames are JSON objects discriminated by a `type` field. Anything
//! arriving on the socket that is not a recognisable control frame is raw
//! terminal output and goes to the emulator untouched.
//!
//! # Client → server
//!
//! ```json
//! {"type": "auth"}
//! {"type": "data", "data": "ls -la\r"}
//! {"type": "resize", "cols": 120, "rows": 30}
//! ```
//!
//! # Server → client
//!
//! `vm_creating`, `vm_ready`, `connected`, `data`, `error`,
//! `environment_terminated`, `closed`. `error` and `environment_terminated`
//! may carry a `cooldown` object:
//!
//! ```json
//! {"type": "error", "message": "Session expired",
//!  "cooldown": {"expiryTimestamp": 1735689600000, "formattedTime": "14:00"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every socket; the token travels in the URL.
    Auth,
    /// User input.
    Data {
        /// Input bytes as typed.
        data: String,
    },
    /// Terminal geometry change.
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
}

impl ClientFrame {
    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Server frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrameType {
    /// Remote environment is being allocated.
    VmCreating,
    /// Remote environment is ready for a terminal.
    VmReady,
    /// Shell connection established.
    Connected,
    /// Terminal output.
    Data,
    /// Failure report, possibly fatal.
    Error,
    /// Remote environment was shut down.
    EnvironmentTerminated,
    /// Shell connection closed.
    Closed,
}

impl ServerFrameType {
    const WIRE_NAMES: [&'static str; 7] = [
        "vm_creating",
        "vm_ready",
        "connected",
        "data",
        "error",
        "environment_terminated",
        "closed",
    ];

    fn is_known(name: &str) -> bool {
        Self::WIRE_NAMES.contains(&name)
    }
}

/// Server-supplied expiry, epoch milliseconds or a date string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ExpiryTimestamp {
    /// Milliseconds since the Unix epoch.
    Millis(i64),
    /// Date string, RFC 3339 when parseable.
    Text(String),
}

/// `cooldown` object attached to `error` / `environment_terminated` frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cooldown {
    /// When a new session may be requested.
    #[serde(default)]
    pub expiry_timestamp: Option<ExpiryTimestamp>,
    /// Display-ready expiry time, preferred over formatting locally.
    #[serde(default)]
    pub formatted_time: Option<String>,
}

/// Decoded server control frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerFrame {
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: ServerFrameType,
    /// Human-readable message (`error` frames).
    #[serde(default)]
    pub message: Option<String>,
    /// Terminal output (`data` frames).
    #[serde(default)]
    pub data: Option<String>,
    /// Cooldown details.
    #[serde(default)]
    pub cooldown: Option<Cooldown>,
}

impl ServerFrame {
    /// Message text, empty when absent.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Classification of one inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A control frame.
    Control(ServerFrame),
    /// Raw terminal output.
    Raw(Vec<u8>),
    /// A JSON object whose `type` this client does not handle.
    Ignored(String),
}

/// Decode a text payload as a control frame.
///
/// # Errors
///
/// [`SessionError::MalformedFrame`] when the payload is not a JSON object
/// with a known string `type`, or its fields have the wrong shape.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, SessionError> {
    serde_json::from_str(text).map_err(|e| {
        log::trace!("[Protocol] Not a control frame: {e}");
        SessionError::MalformedFrame
    })
}

/// Classify a text payload. Never fails.
#[must_use]
pub fn classify_text(text: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Inbound::Raw(text.as_bytes().to_vec());
    };
    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Inbound::Raw(text.as_bytes().to_vec());
    };
    if !ServerFrameType::is_known(kind) {
        return Inbound::Ignored(kind.to_string());
    }

    match serde_json::from_value::<ServerFrame>(value) {
        Ok(frame) => Inbound::Control(frame),
        Err(e) => {
            log::debug!("[Protocol] {}: {e}, forwarding as raw", SessionError::MalformedFrame);
            Inbound::Raw(text.as_bytes().to_vec())
        }
    }
}

/// Classify a binary payload. Binary frames are always terminal output.
#[must_use]
pub fn classify_binary(data: Vec<u8>) -> Inbound {
    Inbound::Raw(data)
}
