//! Work routed into a running sandbox: execs, sessions, files and artifacts.
//!
//! Every call here requires the sandbox to be `running` and touches its
//! `last_activity_at`, which is what the idle-shutdown job reads.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::Stream;
use serde::{Deserialize, Serialize};

use super::{SandboxManager, best_effort};
use crate::error::{ControlError, Result};
use crate::events::{EventKey, append_to_log, exit_payload, output_payload, sse};
use crate::ids;
use crate::model::{Artifact, Exec, ExecStatus, Sandbox, SandboxStatus, Session, SessionStatus};
use crate::node_client::{
    CreateSessionRequest, ExecRequest, ExecResult, FileEntry, OutputStream, SessionExecRequest,
};
use crate::object_store::exec_log_key;

const DEFAULT_SHELL: &str = "/bin/bash";

/// Interval at which followed event streams poll the buffer.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecParams {
    /// Program and arguments.
    pub cmd: Vec<String>,
    /// Working directory inside the guest.
    pub cwd: Option<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// Deadline. Defaults to the configured default exec timeout.
    pub timeout_seconds: Option<u64>,
}

/// A command line run inside an open session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionExecParams {
    /// Shell command line.
    pub cmd: String,
    /// Deadline. Defaults to the configured default exec timeout.
    pub timeout_seconds: Option<u64>,
}

/// Parameters for opening a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// Shell binary. Defaults to `/bin/bash`.
    pub shell: Option<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
}

/// Outcome of a completed exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutcome {
    /// The exec row id; also the key its output is buffered under.
    pub exec_id: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Collected standard output.
    pub stdout: String,
    /// Collected standard error.
    pub stderr: String,
    /// Wall-clock runtime.
    pub duration_ms: u64,
    /// Whether the deadline killed the process.
    pub timed_out: bool,
}

/// Result of writing a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    /// Bytes written.
    pub bytes: u64,
}

impl SandboxManager {
    // ---------------------------------------------------------------------
    // Exec
    // ---------------------------------------------------------------------

    /// Run a command to completion in a running sandbox.
    ///
    /// Output is buffered under the exec id as it is returned, followed by an
    /// exit event. A node failure marks the exec `failed` and is returned.
    pub async fn exec(
        &self,
        org_id: &str,
        sandbox_id: &str,
        params: ExecParams,
    ) -> Result<ExecOutcome> {
        if params.cmd.first().is_none_or(|program| program.is_empty()) {
            return Err(ControlError::Validation("cmd must not be empty".to_string()));
        }
        let timeout_seconds = self.exec_timeout(params.timeout_seconds)?;
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;

        let exec = self.record_exec(&sandbox, None, params.cmd.clone()).await?;
        let request = ExecRequest {
            sandbox_id: sandbox.id.clone(),
            exec_id: exec.id.clone(),
            cmd: params.cmd,
            cwd: params.cwd,
            env: params.env,
            timeout_seconds,
        };
        let result = self
            .backends
            .node_client
            .exec(&node_id, &request)
            .await
            .map_err(ControlError::from);

        let outcome = self
            .finish_exec(exec, EventKey::Exec(request.exec_id.clone()), result)
            .await;
        self.touch(&sandbox.id).await;
        outcome
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Open an interactive shell.
    ///
    /// Rejected with a conflict once the org's per-sandbox session limit of
    /// running sessions is reached.
    pub async fn create_session(
        &self,
        org_id: &str,
        sandbox_id: &str,
        params: SessionParams,
    ) -> Result<Session> {
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;
        let quota = self.backends.quotas.get_org_quota(org_id).await?;
        let shell = params.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let now = self.backends.clock.now();
        let session = self
            .backends
            .activity
            .create_session(
                Session {
                    id: ids::session_id(),
                    sandbox_id: sandbox.id.clone(),
                    shell: shell.clone(),
                    status: SessionStatus::Running,
                    created_at: now,
                    destroyed_at: None,
                },
                quota.max_sessions_per_sandbox,
            )
            .await?
            .ok_or_else(|| {
                ControlError::Conflict(format!(
                    "sandbox {} already has {} running sessions",
                    sandbox.id, quota.max_sessions_per_sandbox
                ))
            })?;

        let request = CreateSessionRequest {
            sandbox_id: sandbox.id.clone(),
            session_id: session.id.clone(),
            shell,
            env: params.env,
        };
        if let Err(err) = self
            .backends
            .node_client
            .create_session(&node_id, &request)
            .await
        {
            // Free the slot; the shell never existed.
            self.backends
                .activity
                .destroy_session(&session.id, self.backends.clock.now())
                .await?;
            return Err(err.into());
        }

        tracing::info!(sandbox_id = %sandbox.id, session_id = %session.id, "session opened");
        self.touch(&sandbox.id).await;
        Ok(session)
    }

    /// Run a command line inside an open session.
    pub async fn session_exec(
        &self,
        org_id: &str,
        sandbox_id: &str,
        session_id: &str,
        params: SessionExecParams,
    ) -> Result<ExecOutcome> {
        if params.cmd.trim().is_empty() {
            return Err(ControlError::Validation("cmd must not be empty".to_string()));
        }
        let timeout_seconds = self.exec_timeout(params.timeout_seconds)?;
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;
        let session = self.get_open_session(&sandbox, session_id).await?;

        let exec = self
            .record_exec(&sandbox, Some(session.id.clone()), vec![params.cmd.clone()])
            .await?;
        let request = SessionExecRequest {
            sandbox_id: sandbox.id.clone(),
            session_id: session.id.clone(),
            exec_id: exec.id.clone(),
            cmd: params.cmd,
            timeout_seconds,
        };
        let result = self
            .backends
            .node_client
            .session_exec(&node_id, &request)
            .await
            .map_err(ControlError::from);

        let outcome = self
            .finish_exec(exec, EventKey::Session(session.id), result)
            .await;
        self.touch(&sandbox.id).await;
        outcome
    }

    /// Write raw input to an open session.
    pub async fn session_input(
        &self,
        org_id: &str,
        sandbox_id: &str,
        session_id: &str,
        data: &str,
    ) -> Result<()> {
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;
        let session = self.get_open_session(&sandbox, session_id).await?;
        self.backends
            .node_client
            .session_input(&node_id, &sandbox.id, &session.id, data)
            .await?;
        self.touch(&sandbox.id).await;
        Ok(())
    }

    /// Close a session. Idempotent.
    pub async fn destroy_session(
        &self,
        org_id: &str,
        sandbox_id: &str,
        session_id: &str,
    ) -> Result<Session> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        let session = self.find_session(&sandbox, session_id).await?;
        if session.status == SessionStatus::Destroyed {
            return Ok(session);
        }

        if let Some(node_id) = sandbox.node_id.as_deref()
            && sandbox.status == SandboxStatus::Running
        {
            best_effort(
                "session destroy",
                &sandbox.id,
                self.backends
                    .node_client
                    .destroy_session(node_id, &sandbox.id, &session.id),
            )
            .await;
        }

        let now = self.backends.clock.now();
        self.backends
            .activity
            .destroy_session(&session.id, now)
            .await?
            .ok_or_else(|| ControlError::NotFound {
                resource: "session",
                id: session_id.to_string(),
            })
    }

    /// Sessions of a sandbox, oldest first.
    pub async fn list_sessions(&self, org_id: &str, sandbox_id: &str) -> Result<Vec<Session>> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        self.backends.activity.list_sessions(&sandbox.id).await
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    /// Write a file into the guest.
    pub async fn put_file(
        &self,
        org_id: &str,
        sandbox_id: &str,
        path: &str,
        data: Vec<u8>,
    ) -> Result<FileWrite> {
        validate_path(path)?;
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;
        let bytes = self
            .backends
            .node_client
            .put_file(&node_id, &sandbox.id, path, data)
            .await?;
        self.touch(&sandbox.id).await;
        Ok(FileWrite { bytes })
    }

    /// Read a file from the guest.
    pub async fn get_file(&self, org_id: &str, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;
        let data = self
            .backends
            .node_client
            .get_file(&node_id, &sandbox.id, path)
            .await?;
        self.touch(&sandbox.id).await;
        Ok(data)
    }

    /// List a directory in the guest.
    pub async fn list_files(
        &self,
        org_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>> {
        validate_path(path)?;
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;
        let entries = self
            .backends
            .node_client
            .list_files(&node_id, &sandbox.id, path)
            .await?;
        self.touch(&sandbox.id).await;
        Ok(entries)
    }

    /// Delete a file in the guest.
    pub async fn delete_file(&self, org_id: &str, sandbox_id: &str, path: &str) -> Result<()> {
        validate_path(path)?;
        let (sandbox, node_id) = self.get_running(org_id, sandbox_id).await?;
        self.backends
            .node_client
            .delete_file(&node_id, &sandbox.id, path)
            .await?;
        self.touch(&sandbox.id).await;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Artifacts
    // ---------------------------------------------------------------------

    /// Register guest paths to collect when the sandbox stops.
    ///
    /// Paths already registered are skipped; only new rows are returned.
    pub async fn register_artifacts(
        &self,
        org_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> Result<Vec<Artifact>> {
        if paths.is_empty() {
            return Err(ControlError::Validation("paths must not be empty".to_string()));
        }
        for path in paths {
            validate_path(path)?;
        }
        let (sandbox, _) = self.get_running(org_id, sandbox_id).await?;
        let now = self.backends.clock.now();
        self.backends
            .artifacts
            .register_artifacts(&sandbox.id, paths, now)
            .await
    }

    /// Artifacts of a sandbox, oldest first.
    pub async fn list_artifacts(&self, org_id: &str, sandbox_id: &str) -> Result<Vec<Artifact>> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        self.backends.artifacts.list_artifacts(&sandbox.id).await
    }

    /// Upload every not-yet-collected artifact and record where it went.
    ///
    /// Returns how many rows were updated.
    pub(crate) async fn collect_artifacts(&self, sandbox: &Sandbox, node_id: &str) -> Result<usize> {
        let pending: Vec<Artifact> = self
            .backends
            .artifacts
            .list_artifacts(&sandbox.id)
            .await?
            .into_iter()
            .filter(|artifact| artifact.storage_ref.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let names: Vec<String> = pending.iter().map(|a| a.name.clone()).collect();
        let collected = self
            .backends
            .node_client
            .collect_artifacts(node_id, &sandbox.id, &names)
            .await?;

        let quota = self.backends.quotas.get_org_quota(&sandbox.org_id).await?;
        let retention_until = self.backends.clock.now() + quota.replay_retention();
        let mut updated = 0;
        for mut artifact in pending {
            let Some(found) = collected.iter().find(|c| c.name == artifact.name) else {
                continue;
            };
            artifact.bytes = found.bytes;
            artifact.sha256 = Some(found.sha256.clone());
            artifact.storage_ref = Some(found.storage_ref.clone());
            artifact.retention_until = Some(retention_until);
            self.backends.artifacts.update_artifact(artifact).await?;
            updated += 1;
        }
        tracing::info!(sandbox_id = %sandbox.id, collected = updated, "artifacts collected");
        Ok(updated)
    }

    // ---------------------------------------------------------------------
    // Streams
    // ---------------------------------------------------------------------

    /// Follow a buffer as SSE frames, resuming after `last_event_id`.
    ///
    /// Exec and session keys must belong to `sandbox_id`.
    pub async fn stream(
        &self,
        org_id: &str,
        sandbox_id: &str,
        key: EventKey,
        last_event_id: Option<&str>,
    ) -> Result<impl Stream<Item = Result<String>> + Send + 'static> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        let owned = match &key {
            EventKey::Sandbox(id) => *id == sandbox.id,
            EventKey::Exec(id) => self
                .backends
                .activity
                .list_execs(&sandbox.id)
                .await?
                .iter()
                .any(|exec| exec.id == *id),
            EventKey::Session(id) => self
                .backends
                .activity
                .find_session(id)
                .await?
                .is_some_and(|session| session.sandbox_id == sandbox.id),
        };
        if !owned {
            return Err(ControlError::NotFound {
                resource: "event stream",
                id: key.store_key(),
            });
        }

        let after = sse::parse_last_event_id(last_event_id);
        Ok(sse::frames(self.events.follow(&key, after, STREAM_POLL_INTERVAL)))
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn get_running(&self, org_id: &str, sandbox_id: &str) -> Result<(Sandbox, String)> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        match (sandbox.status, sandbox.node_id.clone()) {
            (SandboxStatus::Running, Some(node_id)) => Ok((sandbox, node_id)),
            _ => Err(ControlError::NotRunning {
                id: sandbox.id,
                status: sandbox.status,
            }),
        }
    }

    async fn find_session(&self, sandbox: &Sandbox, session_id: &str) -> Result<Session> {
        self.backends
            .activity
            .find_session(session_id)
            .await?
            .filter(|session| session.sandbox_id == sandbox.id)
            .ok_or_else(|| ControlError::NotFound {
                resource: "session",
                id: session_id.to_string(),
            })
    }

    async fn get_open_session(&self, sandbox: &Sandbox, session_id: &str) -> Result<Session> {
        let session = self.find_session(sandbox, session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(ControlError::Conflict(format!(
                "session {session_id} has been destroyed"
            )));
        }
        Ok(session)
    }

    fn exec_timeout(&self, requested: Option<u64>) -> Result<u64> {
        let max = self.config.max_exec_timeout.as_secs();
        let timeout = requested.unwrap_or(self.config.default_exec_timeout.as_secs());
        if timeout == 0 || timeout > max {
            return Err(ControlError::Validation(format!(
                "timeout_seconds must be between 1 and {max}"
            )));
        }
        Ok(timeout)
    }

    async fn record_exec(
        &self,
        sandbox: &Sandbox,
        session_id: Option<String>,
        cmd: Vec<String>,
    ) -> Result<Exec> {
        let now = self.backends.clock.now();
        self.backends
            .activity
            .create_exec(Exec {
                id: ids::exec_id(),
                sandbox_id: sandbox.id.clone(),
                session_id,
                seq: 0,
                cmd,
                status: ExecStatus::Running,
                exit_code: None,
                resource_usage: None,
                log_ref: None,
                created_at: now,
                started_at: Some(now),
                ended_at: None,
            })
            .await
    }

    /// Buffer the node's output, persist it to the exec's log and settle the
    /// exec row.
    async fn finish_exec(
        &self,
        mut exec: Exec,
        key: EventKey,
        result: Result<ExecResult>,
    ) -> Result<ExecOutcome> {
        exec.ended_at = Some(self.backends.clock.now());
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(sandbox_id = %exec.sandbox_id, exec_id = %exec.id, error = %err, "exec failed");
                exec.status = ExecStatus::Failed;
                self.backends.activity.update_exec(exec).await?;
                return Err(err);
            }
        };

        let mut logged = Vec::with_capacity(result.output.len() + 1);
        for chunk in &result.output {
            logged.extend(
                best_effort(
                    "output event",
                    &exec.sandbox_id,
                    self.events.push(&key, output_payload(chunk.stream, &chunk.data)),
                )
                .await,
            );
        }
        logged.extend(
            best_effort(
                "exit event",
                &exec.sandbox_id,
                self.events
                    .push(&key, exit_payload(result.exit_code, result.duration_ms)),
            )
            .await,
        );

        exec.status = if result.timed_out {
            ExecStatus::TimedOut
        } else {
            ExecStatus::Done
        };
        exec.exit_code = Some(result.exit_code);
        exec.resource_usage = Some(result.resource_usage);
        let log_key = exec_log_key(&exec.sandbox_id, &exec.id);
        exec.log_ref = best_effort(
            "exec log write",
            &exec.sandbox_id,
            append_to_log(self.backends.objects.as_ref(), &log_key, &logged),
        )
        .await
        .map(|_| log_key);
        let exec_id = exec.id.clone();
        self.backends.activity.update_exec(exec).await?;

        Ok(ExecOutcome {
            exec_id,
            exit_code: result.exit_code,
            stdout: result.collect(OutputStream::Stdout),
            stderr: result.collect(OutputStream::Stderr),
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
        })
    }

    async fn touch(&self, sandbox_id: &str) {
        let now = self.backends.clock.now();
        best_effort(
            "activity touch",
            sandbox_id,
            self.backends.sandboxes.touch_activity(sandbox_id, now),
        )
        .await;
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(ControlError::Validation(format!(
            "path must be absolute: {path:?}"
        )));
    }
    Ok(())
}
