//! Configuration for the executor.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ExecutorError, ExecutorResult};

/// Top-level configuration for the executor service.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Scheduler control URL, with the execution token as userinfo.
    #[serde(default = "default_control_url")]
    pub control_url: String,

    /// Driver name reported to the scheduler.
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Base port for container `PORT` defaulting; allocation scans upward
    /// from base+1.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Working directory; container directories are created beneath it.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Supervisor binary spawned for each container.
    #[serde(default = "default_supervisor")]
    pub supervisor: PathBuf,

    /// Soft-stop grace period in milliseconds before escalation.
    #[serde(default = "default_grace_ms")]
    pub soft_stop_grace_ms: u64,

    /// Address advertised in the `starting` notification, when the
    /// channel-local address is not reachable from the scheduler.
    #[serde(default)]
    pub advertised_address: Option<String>,
}

fn default_control_url() -> String {
    "http://127.0.0.1:8701".to_owned()
}

fn default_driver() -> String {
    "direct".to_owned()
}

const fn default_base_port() -> u16 {
    3000
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".mesh-executor")
}

fn default_supervisor() -> PathBuf {
    PathBuf::from("mesh-supervisor")
}

const fn default_grace_ms() -> u64 {
    5000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            control_url: default_control_url(),
            driver: default_driver(),
            base_port: default_base_port(),
            base_dir: default_base_dir(),
            supervisor: default_supervisor(),
            soft_stop_grace_ms: default_grace_ms(),
            advertised_address: None,
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources
    /// override earlier):
    /// 1. Default values
    /// 2. `executor.toml` in the current directory (if present)
    /// 3. Environment variables with `MESH_EXECUTOR_` prefix
    pub fn load() -> ExecutorResult<Self> {
        Figment::new()
            .merge(Toml::file("executor.toml"))
            .merge(Env::prefixed("MESH_EXECUTOR_"))
            .extract()
            .map_err(|e| ExecutorError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ExecutorResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MESH_EXECUTOR_"))
            .extract()
            .map_err(|e| ExecutorError::Config(e.to_string()))
    }

    /// The soft-stop grace period as a [`Duration`].
    #[must_use]
    pub const fn soft_stop_grace(&self) -> Duration {
        Duration::from_millis(self.soft_stop_grace_ms)
    }

    /// Directory that holds all container directories.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.base_dir.join("containers")
    }
}
