//! Shared value types carried in commands and notifications.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Scheduler-assigned container identifier.
///
/// Opaque to the executor; only uniqueness within one executor's registry
/// matters. Schedulers have been observed sending both numbers and strings,
/// so both are accepted and the textual form is kept for error messages and
/// path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates an id from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for ContainerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Round-trip numeric ids as numbers so replies match what the
        // scheduler sent.
        if let Ok(n) = self.0.parse::<i64>() {
            serializer.serialize_i64(n)
        } else {
            serializer.serialize_str(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for ContainerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl de::Visitor<'_> for IdVisitor {
            type Value = ContainerId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or integer container id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ContainerId, E> {
                Ok(ContainerId::new(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ContainerId, E> {
                Ok(ContainerId::new(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ContainerId, E> {
                Ok(ContainerId::new(v.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// Environment mapping for a container's next run.
pub type Env = HashMap<String, String>;

/// Options consumed on the next process start, not the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StartOptions {
    /// Cluster size passed to the supervisor as `--cluster=<size>`.
    pub size: ClusterSize,

    /// Whether to pass `--trace` to the supervisor.
    pub trace: bool,
}

/// Cluster sizing for a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterSize {
    /// One worker per CPU (`--cluster=CPU`).
    #[default]
    Cpu,

    /// Fixed worker count.
    Fixed(u64),
}

impl fmt::Display for ClusterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("CPU"),
            Self::Fixed(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for ClusterSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Cpu => serializer.serialize_str("CPU"),
            Self::Fixed(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for ClusterSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = ClusterSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"CPU\" or a worker count")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ClusterSize, E> {
                if v.eq_ignore_ascii_case("cpu") {
                    return Ok(ClusterSize::Cpu);
                }
                v.parse::<u64>()
                    .map(ClusterSize::Fixed)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ClusterSize, E> {
                Ok(ClusterSize::Fixed(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ClusterSize, E> {
                u64::try_from(v)
                    .map(ClusterSize::Fixed)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

/// Why a supervised process terminated.
///
/// Serialises as the signal name (`"SIGTERM"`) or the numeric exit code, the
/// form the scheduler expects in `container-exit` notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Terminated by a signal.
    Signal(String),

    /// Exited with a status code.
    Code(i32),
}

impl ExitReason {
    /// Creates a signal reason from a signal name.
    pub fn signal(name: impl Into<String>) -> Self {
        Self::Signal(name.into())
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => f.write_str(name),
            Self::Code(code) => write!(f, "{code}"),
        }
    }
}

impl Serialize for ExitReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Signal(name) => serializer.serialize_str(name),
            Self::Code(code) => serializer.serialize_i32(*code),
        }
    }
}

impl<'de> Deserialize<'de> for ExitReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ReasonVisitor;

        impl de::Visitor<'_> for ReasonVisitor {
            type Value = ExitReason;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a signal name or exit code")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ExitReason, E> {
                Ok(ExitReason::signal(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ExitReason, E> {
                i32::try_from(v)
                    .map(ExitReason::Code)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ExitReason, E> {
                i32::try_from(v)
                    .map(ExitReason::Code)
                    .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
            }
        }

        deserializer.deserialize_any(ReasonVisitor)
    }
}
