//! Line-frame envelope for the bundled newline-delimited JSON channel.
//!
//! The transport contract the executor relies on is small: reliable in-order
//! request/reply plus one-way notification over a persistent connection.
//! This frame is the minimal envelope that provides it; requests carry a
//! sequence number the responder echoes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame on the wire, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// A request expecting exactly one response with the same sequence.
    Req {
        /// Sender-assigned sequence number.
        seq: u64,
        /// Request payload.
        body: Value,
    },

    /// The response to the request with the same sequence number.
    Rsp {
        /// Echoed sequence number.
        seq: u64,
        /// Reply payload.
        body: Value,
    },

    /// A one-way notification.
    Notify {
        /// Notification payload.
        body: Value,
    },
}

impl Frame {
    /// Encodes the frame as one JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a frame from one line.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
