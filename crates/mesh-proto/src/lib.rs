//! Wire protocol types for the mesh executor control channel.
//!
//! The central scheduler drives each executor over a persistent channel.
//! Inbound commands are JSON objects discriminated by a `cmd` field; every
//! command is answered with exactly one reply object. The executor emits
//! one-way notifications (`starting`, `container-exit`) on the same channel.
//!
//! This crate defines those shapes plus the [`ControlUrl`] type from which
//! the artifact download URL and each container's own control URL are
//! derived. Wire framing and transport policy live with whichever channel
//! implementation carries these values.

pub mod command;
pub mod frame;
pub mod notification;
pub mod reply;
pub mod types;
pub mod url;

pub use command::{Command, CommandError, DeployRequest};
pub use frame::Frame;
pub use notification::Notification;
pub use reply::{ContainerMeta, Reply};
pub use types::{ClusterSize, ContainerId, ExitReason, StartOptions};
pub use url::{ControlUrl, ControlUrlError};
