//! Session state and the serializable status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{ContainerId, ContainerStatus};
use crate::session::SessionId;

/// State of a session in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No container has been created yet.
    #[default]
    Uninitialized,
    /// A container exists but has not (yet) reported `running`.
    Provisioning,
    /// The container is running and accepts exec/copy operations.
    Ready,
    /// The engine reported the container not running after it was ready.
    Stopped,
    /// The container has been removed.
    Destroyed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Point-in-time snapshot of a session, suitable for logging or JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier (also the container's session label).
    pub session_id: SessionId,

    /// Container currently held, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,

    /// Image the container is created from.
    pub image: String,

    /// Working directory created inside the container.
    pub working_dir: String,

    /// Local lifecycle state.
    pub state: SessionState,

    /// Last status the engine reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ContainerStatus>,

    /// When the current container finished provisioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<DateTime<Utc>>,
}
