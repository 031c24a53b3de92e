//! Host-resident executor agent.
//!
//! A central scheduler directs this agent over a persistent control channel
//! to deploy, supervise, stop, restart, and destroy supervised child
//! processes ("containers"). Each container downloads its artifact, runs
//! under a supervisor binary, and is respawned when it exits unexpectedly.
//!
//! The crate is organised around two seams so the lifecycle logic is
//! testable without touching the host: [`process::ProcessRuntime`] spawns
//! and signals processes, and [`download::ArtifactFetcher`] materialises
//! artifacts. [`executor::Executor`] owns the registry and the dispatcher;
//! [`container::Container`] owns one deployment's state machine.

pub mod channel;
pub mod config;
pub mod container;
pub mod download;
pub mod error;
pub mod executor;
pub mod ports;
pub mod process;

pub use channel::{ControlChannel, Inbound, JsonLinesChannel, MockChannel};
pub use config::ExecutorConfig;
pub use container::{Container, ContainerExit, ContainerState, StopOptions};
pub use download::{ArtifactFetcher, HttpFetcher, MockFetcher};
pub use error::{ExecutorError, ExecutorResult};
pub use executor::Executor;
pub use process::{DirectRuntime, MockRuntime, ProcessRuntime};
