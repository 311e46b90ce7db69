//! In-memory container engine shared by the integration tests.
//!
//! Containers are map entries, the filesystem is a path -> bytes map, and
//! exec answers from canned responses. Knobs simulate slow starts, engines
//! that never start a container, and failing calls.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sandbox_env::engine::{
    CommandOutput, ContainerEngine, ContainerId, ContainerSpec, ContainerStatus,
};
use sandbox_env::error::EngineError;
use sandbox_env::session::{BackoffPolicy, SessionConfig};
use sandbox_env::transfer::{FileEntry, archive};

/// Session configuration with a short readiness deadline.
pub fn fast_config() -> SessionConfig {
    SessionConfig::new()
        .with_image("python:3.11.9-bookworm")
        .with_readiness_timeout(Duration::from_millis(300))
        .with_backoff(BackoffPolicy::default())
}

#[derive(Debug)]
struct FakeContainer {
    status: ContainerStatus,
    /// Status queries left before a started container reports `running`.
    starting: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    containers: BTreeMap<String, FakeContainer>,
    files: BTreeMap<String, Vec<u8>>,
    specs: Vec<ContainerSpec>,
    removed: Vec<String>,
    execs: Vec<(String, String)>,
    uploads: Vec<(String, Vec<u8>)>,
    responses: Vec<(String, CommandOutput)>,
    starts: usize,
    stats_calls: usize,
    polls_until_running: u32,
    never_starts: bool,
    fail_create: bool,
    fail_start: bool,
    fail_exec: bool,
    fail_put: bool,
    fail_remove: bool,
}

/// A [`ContainerEngine`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake engine lock poisoned")
    }

    // =========================================================================
    // Knobs
    // =========================================================================

    /// Started containers report `running` only after `polls` status queries.
    pub fn set_polls_until_running(&self, polls: u32) {
        self.lock().polls_until_running = polls;
    }

    /// `start` succeeds but the container never reaches `running`.
    pub fn set_never_starts(&self, never: bool) {
        self.lock().never_starts = never;
    }

    pub fn fail_create(&self) {
        self.lock().fail_create = true;
    }

    pub fn fail_start(&self) {
        self.lock().fail_start = true;
    }

    pub fn fail_exec(&self) {
        self.lock().fail_exec = true;
    }

    pub fn fail_put(&self) {
        self.lock().fail_put = true;
    }

    pub fn fail_remove(&self) {
        self.lock().fail_remove = true;
    }

    /// Commands starting with `prefix` answer with `output` and `exit_code`.
    pub fn respond(&self, prefix: &str, output: &str, exit_code: i32) {
        self.lock().responses.push((
            prefix.to_string(),
            CommandOutput {
                output: output.to_string(),
                exit_code,
            },
        ));
    }

    /// Simulates the container exiting out-of-band.
    pub fn stop_container(&self, id: &ContainerId) {
        if let Some(container) = self.lock().containers.get_mut(id.as_str()) {
            container.status = ContainerStatus::Exited;
            container.starting = None;
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn live_containers(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.lock().specs.clone()
    }

    /// Every `(command, workdir)` pair passed to exec.
    pub fn execs(&self) -> Vec<(String, String)> {
        self.lock().execs.clone()
    }

    /// Every `(destination, archive)` pair passed to put_archive.
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().uploads.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts
    }

    pub fn stats_calls(&self) -> usize {
        self.lock().stats_calls
    }
}

fn not_found(id: &ContainerId) -> EngineError {
    EngineError::NotFound {
        what: format!("container {id}"),
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

fn default_response(command: &str) -> CommandOutput {
    if let Some(text) = command.strip_prefix("echo ") {
        return CommandOutput {
            output: format!("{text}\n"),
            exit_code: 0,
        };
    }
    if let Some(code) = command.strip_prefix("exit ") {
        return CommandOutput {
            output: String::new(),
            exit_code: code.trim().parse().unwrap_or(1),
        };
    }
    CommandOutput {
        output: String::new(),
        exit_code: 0,
    }
}

impl ContainerEngine for FakeEngine {
    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let mut state = self.lock();
        if state.fail_create {
            return Err(EngineError::CommandFailed {
                operation: "create",
                code: Some(125),
                stderr: format!("Unable to find image '{}' locally", spec.image),
            });
        }

        state.next_id += 1;
        let id = format!("{:064x}", 0xfa4e_0000_u64 + state.next_id);
        state.specs.push(spec.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                status: ContainerStatus::Created,
                starting: None,
            },
        );
        Ok(ContainerId::new(id))
    }

    fn start(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.fail_start {
            return Err(EngineError::CommandFailed {
                operation: "start",
                code: Some(1),
                stderr: "OCI runtime create failed".to_string(),
            });
        }
        state.starts += 1;

        let polls = state.polls_until_running;
        let never = state.never_starts;
        let container = state.containers.get_mut(id.as_str()).ok_or_else(|| not_found(id))?;
        if never {
            return Ok(());
        }
        if polls == 0 {
            container.status = ContainerStatus::Running;
        } else {
            container.starting = Some(polls);
        }
        Ok(())
    }

    fn status(&self, id: &ContainerId) -> Result<ContainerStatus, EngineError> {
        let mut state = self.lock();
        let container = state.containers.get_mut(id.as_str()).ok_or_else(|| not_found(id))?;
        if let Some(left) = container.starting {
            let left = left.saturating_sub(1);
            if left == 0 {
                container.status = ContainerStatus::Running;
                container.starting = None;
            } else {
                container.starting = Some(left);
            }
        }
        Ok(container.status.clone())
    }

    fn exec(
        &self,
        id: &ContainerId,
        command: &str,
        workdir: &str,
    ) -> Result<CommandOutput, EngineError> {
        let mut state = self.lock();
        let container = state.containers.get(id.as_str()).ok_or_else(|| not_found(id))?;
        if !container.status.is_running() {
            return Err(EngineError::CommandFailed {
                operation: "exec",
                code: Some(1),
                stderr: format!("container {id} is not running"),
            });
        }
        if state.fail_exec {
            return Err(EngineError::CommandFailed {
                operation: "exec",
                code: Some(126),
                stderr: "OCI runtime exec failed".to_string(),
            });
        }

        state.execs.push((command.to_string(), workdir.to_string()));
        let output = state
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| default_response(command));
        Ok(output)
    }

    fn put_archive(&self, id: &ContainerId, dest: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let mut state = self.lock();
        if !state.containers.contains_key(id.as_str()) {
            return Err(not_found(id));
        }
        if state.fail_put {
            return Err(EngineError::CommandFailed {
                operation: "cp",
                code: Some(1),
                stderr: "Error response from daemon: read-only file system".to_string(),
            });
        }

        let entries = archive::unpack(bytes).map_err(|e| EngineError::InvalidResponse {
            operation: "cp",
            reason: e.to_string(),
        })?;
        state.uploads.push((dest.to_string(), bytes.to_vec()));
        for entry in entries {
            state.files.insert(format!("{dest}{}", entry.path), entry.contents);
        }
        Ok(())
    }

    fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>, EngineError> {
        let state = self.lock();
        if !state.containers.contains_key(id.as_str()) {
            return Err(not_found(id));
        }

        let base = base_name(path);
        let entries: Vec<FileEntry> = match state.files.get(path) {
            Some(contents) => vec![FileEntry::new(base, contents.clone())],
            None => {
                let prefix = format!("{}/", path.trim_end_matches('/'));
                state
                    .files
                    .iter()
                    .filter_map(|(name, contents)| {
                        let rest = name.strip_prefix(&prefix)?;
                        Some(FileEntry::new(format!("{base}/{rest}"), contents.clone()))
                    })
                    .collect()
            }
        };
        if entries.is_empty() {
            return Err(EngineError::NotFound {
                what: format!("{path} in container {id}"),
            });
        }

        archive::pack(&entries).map_err(|e| EngineError::InvalidResponse {
            operation: "cp",
            reason: e.to_string(),
        })
    }

    fn remove(&self, id: &ContainerId, _force: bool) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.fail_remove {
            return Err(EngineError::CommandFailed {
                operation: "rm",
                code: Some(1),
                stderr: "removal of container is already in progress".to_string(),
            });
        }
        state.containers.remove(id.as_str()).ok_or_else(|| not_found(id))?;
        state.removed.push(id.as_str().to_string());
        Ok(())
    }

    fn stats(&self, id: &ContainerId) -> Result<serde_json::Value, EngineError> {
        let mut state = self.lock();
        if !state.containers.contains_key(id.as_str()) {
            return Err(not_found(id));
        }
        state.stats_calls += 1;
        Ok(serde_json::json!({
            "ID": id.short(),
            "CPUPerc": "0.00%",
            "MemUsage": "1.2MiB / 7.7GiB",
        }))
    }
}
