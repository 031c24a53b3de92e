//! Reply shapes.
//!
//! Every command is answered with exactly one of these objects. The original
//! protocol is asymmetric about failure carriers: unknown ids and unsupported
//! commands travel in an `error` field, while stop/restart/destroy failures
//! travel in `message`. Both shapes are kept.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply to a scheduler command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// Deploy acknowledgement with driver metadata.
    Deploy {
        /// Driver-specific metadata; empty for the direct driver.
        #[serde(rename = "driverMeta")]
        driver_meta: Value,
        /// Executor identification.
        container: ContainerMeta,
    },

    /// Success (or a stop-phase failure carried as a message).
    Message {
        /// `"ok"`, `"shutting down"`, or a stop failure description.
        message: String,
    },

    /// Failure: unknown id, unsupported command, or start failure.
    Error {
        /// Failure description.
        error: String,
    },
}

/// Executor identification in deploy replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMeta {
    /// Executor implementation name.
    #[serde(rename = "type")]
    pub kind: String,

    /// Executor version.
    pub version: String,
}

impl Reply {
    /// The plain `{"message":"ok"}` success reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::Message {
            message: "ok".to_owned(),
        }
    }

    /// A success reply with a custom message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// An error reply.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// The deploy acknowledgement for this executor build.
    #[must_use]
    pub fn deploy(kind: impl Into<String>, version: impl Into<String>) -> Self {
        Self::Deploy {
            driver_meta: Value::Object(serde_json::Map::new()),
            container: ContainerMeta {
                kind: kind.into(),
                version: version.into(),
            },
        }
    }

    /// Serialises the reply to its wire value.
    #[must_use]
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Null)
    }
}
