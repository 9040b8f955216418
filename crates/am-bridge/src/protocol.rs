//! Wire messages exchanged with a terminal viewer.
//!
//! Raw terminal bytes travel in both directions untouched. Control messages
//! are JSON objects tagged by `type`, and an inbound frame is only treated
//! as control when it starts with [`ENVELOPE_PREFIX`]; anything else is
//! keyboard input for the process.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Byte prefix every control envelope starts with.
pub const ENVELOPE_PREFIX: &[u8] = br#"{"type":"#;

/// Client -> server control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    Pause,
    Resume,
}

/// Server -> client notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake sent once the viewer is attached.
    Session {
        id: Uuid,
        name: String,
        takeover: bool,
    },
    /// Server-side backpressure state changed.
    Status { paused: bool },
    /// Another viewer took over this session; the connection closes next.
    Takeover,
    /// The process exited; the connection closes next.
    Exit { code: Option<u32> },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: no maps, no non-string keys.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"error"}"#))
    }
}

/// Classification of one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Control(ControlMessage),
    /// Bytes to write to the process as-is.
    Raw(&'a [u8]),
    /// An envelope that failed to parse or has an unknown type.
    Ignored,
}

impl<'a> Inbound<'a> {
    pub fn parse(frame: &'a [u8]) -> Self {
        if !frame.starts_with(ENVELOPE_PREFIX) {
            return Inbound::Raw(frame);
        }
        match serde_json::from_slice::<ControlMessage>(frame) {
            Ok(msg) => Inbound::Control(msg),
            Err(e) => {
                tracing::debug!(error = %e, bytes = frame.len(), "ignoring malformed control envelope");
                Inbound::Ignored
            }
        }
    }
}
