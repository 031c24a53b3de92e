//! One-way notifications from executor to scheduler.

use serde::{Deserialize, Serialize};

use crate::types::{ContainerId, ExitReason};

/// A notification sent on the control channel without expecting a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Notification {
    /// Sent once when the channel connects.
    Starting {
        /// Executor host name.
        hostname: String,
        /// CPU count on the host.
        cpus: usize,
        /// Driver name (e.g. `"direct"`).
        driver: String,
        /// Advertised address, when configured.
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },

    /// Sent on every supervised process termination, expected or not.
    ContainerExit {
        /// Container whose process exited.
        id: ContainerId,
        /// Signal name or numeric exit code.
        reason: ExitReason,
        /// Pid of the exited process.
        pid: u32,
    },
}
