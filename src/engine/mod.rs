//! Container engine interface.
//!
//! The session never talks to a container runtime directly. Everything goes
//! through the [`ContainerEngine`] trait, which mirrors the handful of calls a
//! Docker-compatible daemon exposes: create, start, status, exec, put-archive,
//! get-archive, remove, and a stats sample for diagnostics.
//!
//! [`DockerCli`] is the production implementation. Tests substitute their own.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_env::engine::{ContainerEngine, ContainerSpec, DockerCli};
//!
//! let docker = DockerCli::connect().unwrap();
//! let id = docker.create_container(&ContainerSpec::new("alpine:3.20")).unwrap();
//! docker.start(&id).unwrap();
//! let output = docker.exec(&id, "echo hi", "/").unwrap();
//! assert_eq!(output.output.trim(), "hi");
//! docker.remove(&id, true).unwrap();
//! ```

mod docker;

pub use docker::DockerCli;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Opaque identifier of a container, as returned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wraps an engine-provided identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the 12-character short form used in logs.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container status as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// A status string this crate does not know about.
    Unknown(String),
}

impl ContainerStatus {
    /// Parses an engine status string (case-insensitive, surrounding whitespace ignored).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns `true` only for the ready state.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown(raw) => write!(f, "unknown ({raw})"),
        }
    }
}

/// Parameters for creating a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference, e.g. `python:3.11.9-bookworm`.
    pub image: String,
    /// Allocate a pseudo-TTY so the image's default shell stays alive.
    pub tty: bool,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Creates a TTY-allocated spec for `image`.
    ///
    /// Containers are always created detached; the session drives them via exec.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tty: true,
            labels: BTreeMap::new(),
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Output from a command executed in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout and stderr, in the order the command wrote them.
    pub output: String,
    /// Exit code from the command (0 typically indicates success).
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns `true` if the command exited successfully (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The operations a session needs from a container runtime.
///
/// Implementations must be usable from several threads at once, so one
/// engine handle can back many sessions.
pub trait ContainerEngine: Send + Sync + fmt::Debug {
    /// Creates (but does not necessarily start) a container.
    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

    /// Starts a created or stopped container.
    fn start(&self, id: &ContainerId) -> Result<(), EngineError>;

    /// Queries the current status. Every call reflects the engine's latest view.
    fn status(&self, id: &ContainerId) -> Result<ContainerStatus, EngineError>;

    /// Runs a shell command inside the container and waits for it.
    ///
    /// A non-zero exit code is a successful call. Errors are reserved for the
    /// engine failing to run the command at all.
    fn exec(
        &self,
        id: &ContainerId,
        command: &str,
        workdir: &str,
    ) -> Result<CommandOutput, EngineError>;

    /// Extracts an uncompressed tar archive into directory `dest`.
    fn put_archive(
        &self,
        id: &ContainerId,
        dest: &str,
        archive: &[u8],
    ) -> Result<(), EngineError>;

    /// Returns a tar archive containing `path`.
    fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>, EngineError>;

    /// Removes the container, killing it first when `force` is set.
    fn remove(&self, id: &ContainerId, force: bool) -> Result<(), EngineError>;

    /// Returns one resource-usage sample. Diagnostic only.
    fn stats(&self, id: &ContainerId) -> Result<serde_json::Value, EngineError>;
}
