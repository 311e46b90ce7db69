//! Single-use sandbox sessions.
//!
//! A [`SandboxSession`] owns exactly one container from creation to removal:
//!
//! ```text
//! connect ─► provision ─► (copy_files | run_command | get_file)* ─► cleanup
//!               │  create container
//!               │  ensure_ready (start + poll with backoff)
//!               └─ mkdir -p <working_dir>
//! ```
//!
//! `restart` removes the container and provisions a fresh one. `cleanup` is
//! idempotent and also runs on drop, so a container is released on every
//! exit path, including a provisioning failure halfway through.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_env::session::{SandboxSession, SessionConfig};
//! use sandbox_env::transfer::FileTransfer;
//!
//! let mut session = SandboxSession::new(SessionConfig::default()).unwrap();
//!
//! session
//!     .copy_files(FileTransfer::new().with_contents("test_python.py", "print('Hello, World!')"))
//!     .unwrap();
//! let output = session.run_command("python test_python.py", None).unwrap();
//! assert_eq!(output.output.trim(), "Hello, World!");
//!
//! session.cleanup();
//! ```

mod backoff;
mod lifecycle;
mod meta;

pub use backoff::{Backoff, BackoffPolicy};
pub use lifecycle::SandboxSession;
pub use meta::{SessionInfo, SessionState};

use std::collections::BTreeMap;
use std::time::Duration;

/// Image used when none is configured.
pub const DEFAULT_IMAGE: &str = "python:3.11.9-bookworm";

/// Working directory created inside every container.
pub const DEFAULT_WORKING_DIR: &str = "/project";

/// How long provisioning waits for the container to report `running`.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Label carrying the owning session's id on every container.
pub const SESSION_LABEL: &str = "sandbox-env.session";

/// Unique identifier for a session.
pub type SessionId = uuid::Uuid;

/// Configuration for a sandbox session.
///
/// # Example
///
/// ```
/// use sandbox_env::session::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::default()
///     .with_image("python:3.12-slim")
///     .with_working_dir("/work")
///     .with_readiness_timeout(Duration::from_secs(10))
///     .with_verbose(true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Image the container is created from.
    pub image: String,

    /// Directory created inside the container during provisioning.
    pub working_dir: String,

    /// Promote lifecycle diagnostics from `debug` to `info`.
    pub verbose: bool,

    /// Deadline for the container to report `running`.
    pub readiness_timeout: Duration,

    /// Poll intervals used while waiting for readiness.
    pub backoff: BackoffPolicy,

    /// Extra labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image: String::from(DEFAULT_IMAGE),
            working_dir: String::from(DEFAULT_WORKING_DIR),
            verbose: false,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            backoff: BackoffPolicy::default(),
            labels: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Sets the working directory created inside the container.
    #[must_use]
    pub fn with_working_dir(mut self, path: impl Into<String>) -> Self {
        self.working_dir = path.into();
        self
    }

    /// Enables or disables verbose diagnostics.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets the readiness deadline.
    #[must_use]
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Sets the readiness poll intervals.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds a container label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}
