//! Docker engine driven through the `docker` command-line client.
//!
//! Every trait call maps to one CLI invocation:
//!
//! | Operation | Invocation |
//! |---|---|
//! | create | `docker create --tty --label k=v <image>` |
//! | start | `docker start <id>` |
//! | status | `docker inspect --format {{.State.Status}} <id>` |
//! | exec | `docker exec --workdir <dir> <id> sh -c <command>` |
//! | put archive | `docker cp - <id>:<dest>` (tar on stdin) |
//! | get archive | `docker cp <id>:<path> -` (tar on stdout) |
//! | remove | `docker rm [--force] <id>` |
//! | stats | `docker stats --no-stream --format {{json .}} <id>` |
//!
//! Any binary with the same CLI surface (e.g. `podman`) can be used via
//! [`DockerCli::with_binary`].
//!
//! # Notes on exec output
//!
//! The command runs as `exec 2>&1` followed by the user command, so the
//! container's stderr is folded into stdout inside the container and the two
//! streams keep their relative order. The client's own stderr then only ever
//! carries engine complaints ("No such container", "is not running", OCI
//! runtime errors), which is how an engine failure is told apart from a
//! command that merely exited non-zero.

use std::ffi::OsStr;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::{debug, instrument, trace};

use super::{CommandOutput, ContainerEngine, ContainerId, ContainerSpec, ContainerStatus};
use crate::error::EngineError;

/// Default client binary name, looked up on `PATH`.
pub const DEFAULT_BINARY: &str = "docker";

/// Stderr fragments that mean the object addressed does not exist.
const NOT_FOUND_MARKERS: [&str; 3] = [
    "No such container",
    "Could not find the file",
    "No such file or directory",
];

/// A [`ContainerEngine`] backed by the Docker CLI.
///
/// Holds nothing but the resolved path of the client binary, so it is cheap
/// to clone and safe to share between sessions.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    /// Connects using `docker` from `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unavailable` if the binary is missing or the
    /// daemon does not answer.
    pub fn connect() -> Result<Self, EngineError> {
        Self::with_binary(DEFAULT_BINARY)
    }

    /// Connects using a specific client binary (name on `PATH` or a path).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unavailable` if the binary cannot be resolved or
    /// the daemon does not answer a version query.
    #[instrument]
    pub fn with_binary(binary: impl AsRef<OsStr> + std::fmt::Debug) -> Result<Self, EngineError> {
        let name = binary.as_ref().to_string_lossy().into_owned();
        let resolved = which::which(binary.as_ref()).map_err(|e| EngineError::Unavailable {
            binary: name.clone(),
            reason: e.to_string(),
        })?;
        debug!(binary = %resolved.display(), "Resolved engine client");

        let cli = Self { binary: resolved };
        let version = cli.server_version().map_err(|e| EngineError::Unavailable {
            binary: name,
            reason: e.to_string(),
        })?;
        debug!(%version, "Container engine reachable");

        Ok(cli)
    }

    /// Returns the resolved client binary path.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Queries the daemon's version string.
    ///
    /// # Errors
    ///
    /// Fails if the daemon is not reachable.
    pub fn server_version(&self) -> Result<String, EngineError> {
        let output = self.run(
            "version",
            &[
                "version".to_string(),
                "--format".to_string(),
                "{{.Server.Version}}".to_string(),
            ],
            None,
        )?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Runs the client with `args`, optionally feeding `stdin`, and checks the exit status.
    fn run(
        &self,
        operation: &'static str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<Output, EngineError> {
        let output = self.spawn(operation, args, stdin)?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify_failure(operation, &output))
        }
    }

    /// Runs the client and returns its raw output whatever the exit status.
    fn spawn(
        &self,
        operation: &'static str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<Output, EngineError> {
        trace!(operation, ?args, "Invoking engine client");
        let io_err = |source| EngineError::Io { operation, source };

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(io_err)?;

        // Dropping the handle closes the pipe so the client sees EOF.
        let write_result = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => pipe.write_all(bytes),
            _ => Ok(()),
        };

        // Always reap the child, even when feeding it failed.
        let output = child.wait_with_output().map_err(io_err)?;

        match write_result {
            Ok(()) => Ok(output),
            // The client quit before reading everything; its status and stderr say why.
            Err(e) if e.kind() == ErrorKind::BrokenPipe && !output.status.success() => {
                trace!(operation, "Engine client closed stdin early");
                Ok(output)
            }
            Err(e) => Err(io_err(e)),
        }
    }
}

/// Turns a failed client invocation into the matching engine error.
fn classify_failure(operation: &'static str, output: &Output) -> EngineError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if NOT_FOUND_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        return EngineError::NotFound { what: stderr };
    }
    EngineError::CommandFailed {
        operation,
        code: output.status.code(),
        stderr,
    }
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    if spec.tty {
        args.push("--tty".to_string());
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args
}

fn exec_args(id: &ContainerId, command: &str, workdir: &str) -> Vec<String> {
    vec![
        "exec".to_string(),
        "--workdir".to_string(),
        workdir.to_string(),
        id.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        format!("exec 2>&1\n{command}"),
    ]
}

fn remove_args(id: &ContainerId, force: bool) -> Vec<String> {
    let mut args = vec!["rm".to_string()];
    if force {
        args.push("--force".to_string());
    }
    args.push(id.to_string());
    args
}

impl ContainerEngine for DockerCli {
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let output = self.run("create", &create_args(spec), None)?;
        let id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .last()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(EngineError::InvalidResponse {
                operation: "create",
                reason: "engine returned no container id".to_string(),
            });
        }
        let id = ContainerId::new(id);
        debug!(container = %id.short(), "Container created");
        Ok(id)
    }

    #[instrument(skip(self), fields(container = %id.short()))]
    fn start(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run("start", &["start".to_string(), id.to_string()], None)?;
        Ok(())
    }

    fn status(&self, id: &ContainerId) -> Result<ContainerStatus, EngineError> {
        let output = self.run(
            "inspect",
            &[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}}".to_string(),
                id.to_string(),
            ],
            None,
        )?;
        let status = ContainerStatus::parse(&String::from_utf8_lossy(&output.stdout));
        trace!(container = %id.short(), %status, "Inspected container");
        Ok(status)
    }

    #[instrument(skip(self), fields(container = %id.short()))]
    fn exec(
        &self,
        id: &ContainerId,
        command: &str,
        workdir: &str,
    ) -> Result<CommandOutput, EngineError> {
        let output = self.spawn("exec", &exec_args(id, command, workdir), None)?;

        let client_stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !client_stderr.trim().is_empty() {
            return Err(classify_failure("exec", &output));
        }

        Ok(CommandOutput {
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    #[instrument(skip(self, archive), fields(container = %id.short(), bytes = archive.len()))]
    fn put_archive(
        &self,
        id: &ContainerId,
        dest: &str,
        archive: &[u8],
    ) -> Result<(), EngineError> {
        self.run(
            "cp",
            &["cp".to_string(), "-".to_string(), format!("{id}:{dest}")],
            Some(archive),
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(container = %id.short()))]
    fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>, EngineError> {
        let output = self.run(
            "cp",
            &["cp".to_string(), format!("{id}:{path}"), "-".to_string()],
            None,
        )?;
        Ok(output.stdout)
    }

    #[instrument(skip(self), fields(container = %id.short()))]
    fn remove(&self, id: &ContainerId, force: bool) -> Result<(), EngineError> {
        self.run("rm", &remove_args(id, force), None)?;
        Ok(())
    }

    fn stats(&self, id: &ContainerId) -> Result<serde_json::Value, EngineError> {
        let output = self.run(
            "stats",
            &[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format".to_string(),
                "{{json .}}".to_string(),
                id.to_string(),
            ],
            None,
        )?;
        serde_json::from_slice(&output.stdout).map_err(|e| EngineError::InvalidResponse {
            operation: "stats",
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    use super::*;

    fn failed_output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_create_args_tty_and_labels_precede_image() {
        let spec = ContainerSpec::new("python:3.11.9-bookworm")
            .with_label("sandbox-env.session", "abc")
            .with_label("owner", "tests");
        let args = create_args(&spec);

        assert_eq!(args.first().map(String::as_str), Some("create"));
        assert!(args.contains(&"--tty".to_string()));
        assert!(args.contains(&"sandbox-env.session=abc".to_string()));
        assert!(args.contains(&"owner=tests".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("python:3.11.9-bookworm"),
            "image must be the final argument"
        );
    }

    #[test]
    fn test_create_args_without_tty() {
        let mut spec = ContainerSpec::new("alpine");
        spec.tty = false;
        assert_eq!(create_args(&spec), vec!["create", "alpine"]);
    }

    #[test]
    fn test_exec_args_merge_stderr_and_keep_command_intact() {
        let id = ContainerId::new("c0ffee");
        let args = exec_args(&id, "python test.py && echo 'done'", "/project");

        assert_eq!(
            args,
            vec![
                "exec",
                "--workdir",
                "/project",
                "c0ffee",
                "sh",
                "-c",
                "exec 2>&1\npython test.py && echo 'done'",
            ]
        );
    }

    #[test]
    fn test_remove_args_force() {
        let id = ContainerId::new("c0ffee");
        assert_eq!(remove_args(&id, true), vec!["rm", "--force", "c0ffee"]);
        assert_eq!(remove_args(&id, false), vec!["rm", "c0ffee"]);
    }

    #[test]
    fn test_classify_not_found() {
        let output = failed_output(1, "Error response from daemon: No such container: c0ffee\n");
        assert!(matches!(
            classify_failure("rm", &output),
            EngineError::NotFound { .. }
        ));

        let output = failed_output(
            1,
            "Error response from daemon: Could not find the file /missing in container c0ffee",
        );
        assert!(matches!(
            classify_failure("cp", &output),
            EngineError::NotFound { .. }
        ));
    }

    #[test]
    fn test_classify_other_failure_keeps_code_and_stderr() {
        let output = failed_output(125, "Error response from daemon: container is not running");
        match classify_failure("exec", &output) {
            EngineError::CommandFailed {
                operation,
                code,
                stderr,
            } => {
                assert_eq!(operation, "exec");
                assert_eq!(code, Some(125));
                assert!(stderr.contains("not running"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// Writes an executable shell script standing in for the engine client.
    fn stub_client(dir: &Path, body: &str) -> DockerCli {
        use std::os::unix::fs::PermissionsExt;

        let binary = dir.join("docker");
        std::fs::write(&binary, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        DockerCli { binary }
    }

    #[test]
    fn test_upload_refused_before_reading_stdin_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let cli = stub_client(
            dir.path(),
            "echo 'Error response from daemon: Could not find the file /nope in container c0ffee' >&2\nexit 1",
        );

        // Larger than any pipe buffer, so the write hits a closed pipe.
        let archive = vec![0u8; 4 * 1024 * 1024];
        let result = cli.put_archive(&ContainerId::new("c0ffee"), "/nope/", &archive);

        assert!(
            matches!(result, Err(EngineError::NotFound { .. })),
            "unexpected result: {result:?}"
        );
    }

    #[test]
    fn test_upload_consumed_by_client_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let cli = stub_client(dir.path(), "cat > /dev/null");

        let archive = vec![0u8; 256 * 1024];
        cli.put_archive(&ContainerId::new("c0ffee"), "/project/", &archive)
            .unwrap();
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let result = DockerCli::with_binary("definitely-not-a-container-engine-binary");
        assert!(matches!(result, Err(EngineError::Unavailable { .. })));
    }
}
