//! Inbound command set.
//!
//! Commands arrive as JSON objects discriminated by a `cmd` field. Parsing
//! distinguishes an *unsupported* command name (answered with the
//! `unsupported command "<name>"` reply, no state change) from a known
//! command with malformed fields (answered with the parse failure).

use serde::Deserialize;
use serde_json::Value;

use crate::types::{ContainerId, Env, StartOptions};

/// Command names the executor understands, in wire form.
const KNOWN_COMMANDS: &[&str] = &[
    "shutdown",
    "container-deploy",
    "container-set-options",
    "container-set-env",
    "container-start",
    "container-stop",
    "container-soft-stop",
    "container-restart",
    "container-soft-restart",
    "container-destroy",
];

/// A command from the central scheduler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    /// Close the channel and exit the executor process.
    Shutdown,

    /// Ensure the given deployment runs for the given id, replacing any
    /// container already registered under it.
    ContainerDeploy(DeployRequest),

    /// Replace a container's start options; takes effect on its next run.
    ContainerSetOptions {
        /// Target container.
        id: ContainerId,
        /// New start options.
        #[serde(default)]
        options: StartOptions,
    },

    /// Replace a container's environment; takes effect on its next run.
    ContainerSetEnv {
        /// Target container.
        id: ContainerId,
        /// New environment. A missing `PORT` is defaulted by the executor;
        /// an explicit one wins.
        #[serde(default)]
        env: Env,
    },

    /// Explicitly (re)spawn an existing container.
    ContainerStart {
        /// Target container.
        id: ContainerId,
    },

    /// Terminate a container's process with a signal.
    ContainerStop {
        /// Target container.
        id: ContainerId,
    },

    /// Ask the container to exit gracefully, escalating to a hard stop
    /// after the grace period.
    ContainerSoftStop {
        /// Target container.
        id: ContainerId,
        /// Grace period override in milliseconds.
        #[serde(default)]
        timeout: Option<u64>,
    },

    /// Hard stop then fresh start.
    ContainerRestart {
        /// Target container.
        id: ContainerId,
    },

    /// Graceful stop (with escalation) then fresh start.
    ContainerSoftRestart {
        /// Target container.
        id: ContainerId,
        /// Grace period override in milliseconds.
        #[serde(default)]
        timeout: Option<u64>,
    },

    /// Hard stop and remove from the registry.
    ContainerDestroy {
        /// Target container.
        id: ContainerId,
    },
}

/// Payload of `container-deploy`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeployRequest {
    /// Container id to (re)install.
    pub id: ContainerId,

    /// Artifact version to download and run.
    #[serde(rename = "deploymentId")]
    pub deployment_id: String,

    /// Environment for the process. A missing `PORT` is defaulted.
    #[serde(default)]
    pub env: Env,

    /// Start options for the process.
    #[serde(default)]
    pub options: StartOptions,

    /// Execution token used to authenticate the artifact download.
    pub token: String,
}

impl Command {
    /// Parses a raw request object.
    pub fn parse(value: &Value) -> Result<Self, CommandError> {
        let name = value
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or(CommandError::MissingDiscriminator)?;

        if !KNOWN_COMMANDS.contains(&name) {
            return Err(CommandError::Unsupported(name.to_owned()));
        }

        serde_json::from_value(value.clone()).map_err(|source| CommandError::Malformed {
            cmd: name.to_owned(),
            source,
        })
    }

    /// Returns the target container id for per-id commands.
    #[must_use]
    pub fn container_id(&self) -> Option<&ContainerId> {
        match self {
            Self::Shutdown => None,
            Self::ContainerDeploy(req) => Some(&req.id),
            Self::ContainerSetOptions { id, .. }
            | Self::ContainerSetEnv { id, .. }
            | Self::ContainerStart { id }
            | Self::ContainerStop { id }
            | Self::ContainerSoftStop { id, .. }
            | Self::ContainerRestart { id }
            | Self::ContainerSoftRestart { id, .. }
            | Self::ContainerDestroy { id } => Some(id),
        }
    }
}

/// Failure to interpret a request object as a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The request has no `cmd` field.
    #[error("request has no cmd field")]
    MissingDiscriminator,

    /// The command name is not one the executor supports.
    #[error("unsupported command {0:?}")]
    Unsupported(String),

    /// A known command with missing or ill-typed fields.
    #[error("malformed {cmd} command: {source}")]
    Malformed {
        /// Command name.
        cmd: String,
        /// Underlying parse failure.
        source: serde_json::Error,
    },
}
