//! Sandbox session lifecycle.
//!
//! This module provides [`SandboxSession`], which provisions one container,
//! waits for it to become ready, runs commands and moves files through it,
//! and guarantees the container is removed afterwards.
//!
//! # Readiness
//!
//! Container start is asynchronous at the engine level. `ensure_ready` issues
//! a start when needed and then polls the status with exponential backoff
//! (10ms doubling up to 200ms by default) until the container reports
//! `running` or the readiness deadline passes. No sleep extends past the
//! deadline.
//!
//! # Self-healing exec
//!
//! Before every exec the container status is checked. A container that
//! stopped out-of-band is started again once via `ensure_ready`; only if
//! that fails does `run_command` return an error.
//!
//! # Teardown
//!
//! `cleanup` force-removes the container and logs (never returns) removal
//! failures. It runs on drop as a safety net; `SandboxSession::scope` is the
//! primary way to bound a session's lifetime.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::engine::{
    CommandOutput, ContainerEngine, ContainerId, ContainerSpec, ContainerStatus, DockerCli,
};
use crate::error::{EngineError, SessionError, TransferError};
use crate::session::{SESSION_LABEL, SessionConfig, SessionId, SessionInfo, SessionState};
use crate::transfer::{FileEntry, FileTransfer, archive};

/// Directory commands run in when the caller does not pick one.
const DEFAULT_EXEC_DIR: &str = "/";

/// Logs at `info` when the session is verbose, at `debug` otherwise.
macro_rules! lifecycle_event {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Quotes `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// One container, owned end-to-end.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use sandbox_env::engine::DockerCli;
/// use sandbox_env::session::{SandboxSession, SessionConfig};
/// use sandbox_env::transfer::FileTransfer;
///
/// let engine = Arc::new(DockerCli::connect().unwrap());
///
/// let exit_code = SandboxSession::scope(engine, SessionConfig::default(), |session| {
///     session.copy_files(FileTransfer::new().with_contents("main.py", "print(6 * 7)"))?;
///     let output = session.run_command("python main.py", None)?;
///     Ok::<_, sandbox_env::error::SessionError>(output.exit_code)
/// })
/// .unwrap();
/// assert_eq!(exit_code, 0);
/// ```
pub struct SandboxSession {
    id: SessionId,
    engine: Arc<dyn ContainerEngine>,
    config: SessionConfig,
    container: Option<ContainerId>,
    state: SessionState,
    last_status: Option<ContainerStatus>,
    provisioned_at: Option<DateTime<Utc>>,
}

impl SandboxSession {
    /// Connects to Docker and provisions a ready container.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Provisioning` if the engine is unreachable or
    /// the container cannot be created or set up, and
    /// `SessionError::ReadinessTimeout` if it never reports `running`. No
    /// container is left behind in either case.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let engine = DockerCli::connect().map_err(|source| SessionError::Provisioning {
            context: "container engine is unreachable".to_string(),
            source,
        })?;
        Self::with_engine(Arc::new(engine), config)
    }

    /// Provisions a ready container on the given engine.
    ///
    /// # Errors
    ///
    /// Same as [`SandboxSession::new`], minus the engine connection.
    pub fn with_engine(
        engine: Arc<dyn ContainerEngine>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut session = Self::connect(engine, config);
        // On failure `session` is dropped here, which removes any container
        // created before the failing step.
        session.provision()?;
        Ok(session)
    }

    /// Creates an unprovisioned session. Call [`provision`](Self::provision) next.
    #[must_use]
    pub fn connect(engine: Arc<dyn ContainerEngine>, config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        debug!(session = %id, image = %config.image, "Created sandbox session");
        Self {
            id,
            engine,
            config,
            container: None,
            state: SessionState::Uninitialized,
            last_status: None,
            provisioned_at: None,
        }
    }

    /// Provisions a session, runs `f` with it, and tears it down whatever `f` returns.
    ///
    /// # Errors
    ///
    /// Returns provisioning errors (converted into `E`) or whatever `f` returns.
    pub fn scope<T, E, F>(
        engine: Arc<dyn ContainerEngine>,
        config: SessionConfig,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut SandboxSession) -> Result<T, E>,
        E: From<SessionError>,
    {
        let mut session = Self::with_engine(engine, config)?;
        let result = f(&mut session);
        session.cleanup();
        result
    }

    /// Returns the session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the container currently held, if any.
    #[must_use]
    pub fn container_id(&self) -> Option<&ContainerId> {
        self.container.as_ref()
    }

    /// Returns the last status the engine reported.
    #[must_use]
    pub fn last_status(&self) -> Option<&ContainerStatus> {
        self.last_status.as_ref()
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns a serializable snapshot of the session.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            container_id: self.container.clone(),
            image: self.config.image.clone(),
            working_dir: self.config.working_dir.clone(),
            state: self.state,
            last_status: self.last_status.clone(),
            provisioned_at: self.provisioned_at,
        }
    }

    /// Creates a fresh container, waits for it, and creates the working directory.
    ///
    /// Any container already held is removed first. The new container's id is
    /// kept even if a later step fails, so `cleanup` can still reach it.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Provisioning` or `SessionError::ReadinessTimeout`.
    #[instrument(skip(self), fields(session = %self.id, image = %self.config.image))]
    pub fn provision(&mut self) -> Result<(), SessionError> {
        self.release_container();
        self.state = SessionState::Provisioning;
        self.provisioned_at = None;

        let spec = self.container_spec();
        let id = self
            .engine
            .create_container(&spec)
            .map_err(|source| SessionError::Provisioning {
                context: format!("failed to create container from image {}", spec.image),
                source,
            })?;
        debug!(container = %id.short(), "Container created");
        self.container = Some(id.clone());

        self.ensure_ready(self.config.readiness_timeout)?;

        if let Err(e) = self.create_working_dir(&id) {
            // Running, but not usable without its working directory.
            self.state = SessionState::Provisioning;
            return Err(e);
        }

        self.provisioned_at = Some(Utc::now());
        lifecycle_event!(
            self.config.verbose,
            container = %id.short(),
            working_dir = %self.config.working_dir,
            "Sandbox ready"
        );
        Ok(())
    }

    /// Waits until the container reports `running`, starting it if necessary.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `SessionError::NotProvisioned` if no container is held
    /// - `SessionError::Provisioning` if querying or starting the container fails
    /// - `SessionError::ReadinessTimeout` if `timeout` passes first; the
    ///   session then stays in `Provisioning` and keeps the container handle
    #[instrument(skip(self), fields(session = %self.id, timeout_ms = %timeout.as_millis()))]
    pub fn ensure_ready(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let id = self.require_container()?;
        let started = Instant::now();

        let mut status = self.refresh_status(&id)?;
        if status.is_running() {
            self.state = SessionState::Ready;
            trace!("Container already running");
            return Ok(());
        }

        self.state = SessionState::Provisioning;
        debug!(%status, "Container not running, starting it");
        self.engine
            .start(&id)
            .map_err(|source| SessionError::Provisioning {
                context: format!("failed to start container {}", id.short()),
                source,
            })?;

        let mut delays = self.config.backoff.delays();
        loop {
            status = self.refresh_status(&id)?;
            if status.is_running() {
                break;
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(elapsed_ms = %elapsed.as_millis(), %status, "Container start timeout exceeded");
                return Err(SessionError::ReadinessTimeout {
                    timeout,
                    elapsed,
                    last_status: status,
                });
            }

            let delay = delays.next_delay().min(timeout - elapsed);
            trace!(delay_ms = %delay.as_millis(), %status, "Waiting for container");
            thread::sleep(delay);
        }

        self.state = SessionState::Ready;
        let elapsed = started.elapsed();
        if self.config.verbose {
            self.report_started(&id, elapsed, &status);
        } else {
            debug!(elapsed_ms = %elapsed.as_millis(), "Container started");
        }
        Ok(())
    }

    /// Removes the current container and provisions a fresh one.
    ///
    /// # Errors
    ///
    /// Same as [`provision`](Self::provision).
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn restart(&mut self) -> Result<(), SessionError> {
        lifecycle_event!(
            self.config.verbose,
            container = ?self.container.as_ref().map(ContainerId::short),
            "Restarting sandbox"
        );
        self.provision()
    }

    /// Uploads every file of `transfer` in a single archive.
    ///
    /// An empty transfer uploads an empty archive and succeeds. The
    /// destination directory must exist.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotProvisioned` without a container and
    /// `SessionError::Transfer` if reading, packing, or uploading fails.
    #[instrument(skip(self, transfer), fields(session = %self.id))]
    pub fn copy_files(&self, transfer: FileTransfer) -> Result<(), SessionError> {
        let id = self.require_container()?;
        let dest = transfer.destination();

        let archive = transfer
            .into_archive()
            .map_err(|source| SessionError::Transfer {
                context: "failed to build upload archive".to_string(),
                source,
            })?;

        lifecycle_event!(
            self.config.verbose,
            container = %id.short(),
            %dest,
            bytes = archive.len(),
            "Uploading files"
        );

        self.engine
            .put_archive(&id, &dest, &archive)
            .map_err(|source| SessionError::Transfer {
                context: format!("failed to upload archive to {dest}"),
                source: source.into(),
            })
    }

    /// Runs `command` through `sh -c` in `workdir` (default `/`).
    ///
    /// The returned exit code is not interpreted: a failing command is still
    /// `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotProvisioned` without a container,
    /// readiness errors if a stopped container cannot be brought back, and
    /// `SessionError::Execution` if the engine cannot run the command.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn run_command(
        &mut self,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, SessionError> {
        let id = self.require_container()?;

        let status = self
            .engine
            .status(&id)
            .map_err(|source| SessionError::Execution {
                command: command.to_string(),
                source,
            })?;
        self.last_status = Some(status.clone());

        if !status.is_running() {
            warn!(%status, "Container is not running, trying to start it again");
            self.state = SessionState::Stopped;
            self.ensure_ready(self.config.readiness_timeout)?;
        }

        let workdir = workdir.unwrap_or(DEFAULT_EXEC_DIR);
        lifecycle_event!(self.config.verbose, %workdir, "exec {command}");

        let output = self
            .engine
            .exec(&id, command, workdir)
            .map_err(|source| SessionError::Execution {
                command: command.to_string(),
                source,
            })?;

        lifecycle_event!(
            self.config.verbose,
            exit_code = output.exit_code,
            "exec status={}",
            if output.success() { "OK" } else { "FAILED" }
        );
        Ok(output)
    }

    /// Reads a single text file from the container.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Transfer` if the path is missing, the archive
    /// is unreadable, or the content is not UTF-8.
    pub fn get_file(&self, path: &str) -> Result<String, SessionError> {
        let entry = self.fetch_file(path)?;
        String::from_utf8(entry.contents).map_err(|_| SessionError::Transfer {
            context: format!("failed to read {path} as text"),
            source: TransferError::NotText { name: entry.path },
        })
    }

    /// Reads a single file from the container as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Transfer` if the path is missing or the archive
    /// is unreadable.
    pub fn get_file_bytes(&self, path: &str) -> Result<Vec<u8>, SessionError> {
        self.fetch_file(path).map(|entry| entry.contents)
    }

    /// Reads every regular file under `path` (a file or a directory).
    ///
    /// Entry paths are relative to the parent of `path`, so fetching
    /// `/project/out` yields entries like `out/result.json`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Transfer` if the path is missing or the archive
    /// is unreadable.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn get_archive_entries(&self, path: &str) -> Result<Vec<FileEntry>, SessionError> {
        let bytes = self.download(path)?;
        archive::unpack(&bytes).map_err(|source| SessionError::Transfer {
            context: format!("failed to unpack archive for {path}"),
            source,
        })
    }

    /// Force-removes the container. Safe to call any number of times.
    ///
    /// Removal failures are logged, never returned.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn cleanup(&mut self) {
        if self.container.is_none() {
            trace!(state = %self.state, "Nothing to clean up");
            return;
        }
        self.release_container();
        self.state = SessionState::Destroyed;
        debug!("Sandbox destroyed");
    }

    fn container_spec(&self) -> ContainerSpec {
        let mut spec = ContainerSpec::new(&self.config.image);
        spec.labels = self.config.labels.clone();
        spec.with_label(SESSION_LABEL, self.id.to_string())
    }

    fn create_working_dir(&self, id: &ContainerId) -> Result<(), SessionError> {
        let context = || format!("failed to create working directory {}", self.config.working_dir);
        let mkdir = format!("mkdir -p {}", shell_quote(&self.config.working_dir));

        let output = self
            .engine
            .exec(id, &mkdir, DEFAULT_EXEC_DIR)
            .map_err(|source| SessionError::Provisioning {
                context: context(),
                source,
            })?;
        if !output.success() {
            return Err(SessionError::Provisioning {
                context: context(),
                source: EngineError::CommandFailed {
                    operation: "exec",
                    code: Some(output.exit_code),
                    stderr: output.output.trim().to_string(),
                },
            });
        }
        Ok(())
    }

    fn require_container(&self) -> Result<ContainerId, SessionError> {
        self.container.clone().ok_or(SessionError::NotProvisioned)
    }

    fn refresh_status(&mut self, id: &ContainerId) -> Result<ContainerStatus, SessionError> {
        let status = self
            .engine
            .status(id)
            .map_err(|source| SessionError::Provisioning {
                context: format!("failed to query status of container {}", id.short()),
                source,
            })?;
        self.last_status = Some(status.clone());
        Ok(status)
    }

    /// Emits the verbose start-up snapshot: elapsed time, status, one stats sample.
    fn report_started(&self, id: &ContainerId, elapsed: Duration, status: &ContainerStatus) {
        match self.engine.stats(id) {
            Ok(sample) => {
                let stats = serde_json::to_string_pretty(&sample).unwrap_or_default();
                info!(
                    elapsed_ms = %elapsed.as_millis(),
                    %status,
                    "Container started @{:.2}s:\n{stats}",
                    elapsed.as_secs_f64()
                );
            }
            Err(e) => {
                info!(elapsed_ms = %elapsed.as_millis(), %status, "Container started");
                warn!(error = %e, "Failed to sample container stats");
            }
        }
    }

    fn download(&self, path: &str) -> Result<Vec<u8>, SessionError> {
        let id = self.require_container()?;
        self.engine
            .get_archive(&id, path)
            .map_err(|source| SessionError::Transfer {
                context: format!("failed to download {path}"),
                source: source.into(),
            })
    }

    fn fetch_file(&self, path: &str) -> Result<FileEntry, SessionError> {
        let bytes = self.download(path)?;
        archive::extract_file(&bytes, path).map_err(|source| SessionError::Transfer {
            context: format!("failed to extract {path}"),
            source,
        })
    }

    /// Drops the held container reference, force-removing it on the engine.
    fn release_container(&mut self) {
        let Some(id) = self.container.take() else {
            return;
        };
        self.last_status = None;
        match self.engine.remove(&id, true) {
            Ok(()) => debug!(container = %id.short(), "Container removed"),
            Err(e) => warn!(container = %id.short(), error = %e, "Error during cleanup"),
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("image", &self.config.image)
            .field("state", &self.state)
            .field("container", &self.container.as_ref().map(ContainerId::short))
            .finish()
    }
}
