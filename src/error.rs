//! Error types for sandbox sessions.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! Teardown failures have no variant here: cleanup runs from `Drop` and only
//! logs them.

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::engine::ContainerStatus;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Sandbox session lifecycle error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    /// Container engine error outside of a session
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(sandbox_env::io))]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`SandboxSession`](crate::session::SandboxSession) operations.
#[derive(Error, Debug, Diagnostic)]
pub enum SessionError {
    /// Container creation, start, or initial setup failed.
    #[error("Failed to provision sandbox container: {context}")]
    #[diagnostic(code(sandbox_env::session::provisioning))]
    Provisioning {
        context: String,
        #[source]
        source: EngineError,
    },

    /// Container did not report `running` before the deadline.
    #[error(
        "Container did not become ready within {}ms (waited {}ms, last status: {last_status})",
        .timeout.as_millis(),
        .elapsed.as_millis()
    )]
    #[diagnostic(
        code(sandbox_env::session::readiness_timeout),
        help("The session keeps the container handle; call cleanup() before retrying")
    )]
    ReadinessTimeout {
        timeout: Duration,
        elapsed: Duration,
        last_status: ContainerStatus,
    },

    /// Archive upload or download failed.
    #[error("File transfer failed: {context}")]
    #[diagnostic(code(sandbox_env::session::transfer))]
    Transfer {
        context: String,
        #[source]
        source: TransferError,
    },

    /// The exec call itself failed. A non-zero exit code is never reported here.
    #[error("Failed to execute command `{command}` in sandbox")]
    #[diagnostic(
        code(sandbox_env::session::execution),
        help("The container state is uncertain; tear the session down")
    )]
    Execution {
        command: String,
        #[source]
        source: EngineError,
    },

    /// The session holds no container (never provisioned, or torn down).
    #[error("Sandbox session has no container")]
    #[diagnostic(
        code(sandbox_env::session::not_provisioned),
        help("Call provision() or restart() first")
    )]
    NotProvisioned,
}

/// Errors reported by a [`ContainerEngine`](crate::engine::ContainerEngine).
#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    /// The engine client binary could not be located or started.
    #[error("Container engine `{binary}` is unavailable: {reason}")]
    #[diagnostic(
        code(sandbox_env::engine::unavailable),
        help("Install Docker (or a CLI-compatible engine) and make sure the daemon is running")
    )]
    Unavailable { binary: String, reason: String },

    /// An engine command ran but reported failure.
    #[error("Engine operation `{operation}` failed (exit code {code:?}): {stderr}")]
    #[diagnostic(code(sandbox_env::engine::command_failed))]
    CommandFailed {
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    /// The referenced container or path does not exist.
    #[error("Not found: {what}")]
    #[diagnostic(code(sandbox_env::engine::not_found))]
    NotFound { what: String },

    /// The engine answered with something we could not interpret.
    #[error("Invalid engine response for `{operation}`: {reason}")]
    #[diagnostic(code(sandbox_env::engine::invalid_response))]
    InvalidResponse {
        operation: &'static str,
        reason: String,
    },

    /// Failed to talk to the engine process.
    #[error("I/O error while running `{operation}`")]
    #[diagnostic(code(sandbox_env::engine::io))]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Errors building or reading transfer archives.
#[derive(Error, Debug, Diagnostic)]
pub enum TransferError {
    /// Reading a host file for upload failed.
    #[error("Failed to read host path {}", .path.display())]
    #[diagnostic(code(sandbox_env::transfer::host_io))]
    HostIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Entry path cannot be stored in an archive.
    #[error("Invalid archive entry path `{path}`: {reason}")]
    #[diagnostic(code(sandbox_env::transfer::invalid_path))]
    InvalidPath { path: String, reason: String },

    /// Tar encoding or decoding failed.
    #[error("Archive error: {context}")]
    #[diagnostic(code(sandbox_env::transfer::archive))]
    Archive {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The archive did not contain the requested entry.
    #[error("Archive has no entry named `{name}`")]
    #[diagnostic(code(sandbox_env::transfer::missing_entry))]
    MissingEntry { name: String },

    /// The entry is not valid UTF-8 text.
    #[error("Entry `{name}` is not valid UTF-8")]
    #[diagnostic(
        code(sandbox_env::transfer::not_text),
        help("Use get_file_bytes() for binary content")
    )]
    NotText { name: String },

    /// The engine rejected the upload or download.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
