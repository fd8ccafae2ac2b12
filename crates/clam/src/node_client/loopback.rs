//! In-process stand-in for an execution node.
//!
//! [`LoopbackNodeClient`] keeps a tiny model of each VM (a file map and open
//! sessions) and interprets a handful of commands (`echo`, `cat`, `true`,
//! `false`, `exit N`, `sleep N`) so lifecycle flows can run end to end without
//! a hypervisor. Failures can be injected per operation or per node.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{
    CollectedArtifact, CreateSandboxRequest, CreateSessionRequest, ExecRequest, ExecResult,
    FileEntry, ForkSandboxRequest, NodeClient, NodeResult, OutputChunk, OutputStream,
    SessionExecRequest,
};
use crate::error::NodeError;
use crate::model::ResourceUsage;

/// Exit code reported for a command killed at its deadline.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Every RPC the client exposes, for counting calls and injecting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum NodeOp {
    CreateSandbox,
    ForkSandbox,
    StopSandbox,
    DestroySandbox,
    Exec,
    CreateSession,
    SessionExec,
    SessionInput,
    DestroySession,
    PutFile,
    GetFile,
    ListFiles,
    DeleteFile,
    CollectArtifacts,
}

#[derive(Debug, Clone, Default)]
struct Vm {
    node_id: String,
    files: BTreeMap<String, Vec<u8>>,
    sessions: BTreeSet<String>,
    session_input: BTreeMap<String, String>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct State {
    vms: HashMap<String, Vm>,
    calls: HashMap<NodeOp, usize>,
    failing: HashSet<NodeOp>,
    unreachable: HashSet<String>,
}

/// In-memory [`NodeClient`].
#[derive(Debug, Default)]
pub struct LoopbackNodeClient {
    state: Mutex<State>,
}

impl LoopbackNodeClient {
    /// Creates a client with no VMs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call of `op` fail with [`NodeError::Rejected`].
    pub fn fail(&self, op: NodeOp) {
        self.lock().failing.insert(op);
    }

    /// Undo [`fail`](Self::fail).
    pub fn recover(&self, op: NodeOp) {
        self.lock().failing.remove(&op);
    }

    /// Make every call to `node_id` fail with [`NodeError::Unreachable`].
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(node_id.to_string());
        } else {
            state.unreachable.remove(node_id);
        }
    }

    /// How many times `op` has been called, including failed calls.
    pub fn calls(&self, op: NodeOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Whether a live (not stopped, not destroyed) VM backs `sandbox_id`.
    pub fn is_running(&self, sandbox_id: &str) -> bool {
        self.lock()
            .vms
            .get(sandbox_id)
            .is_some_and(|vm| !vm.stopped)
    }

    /// The node a VM lives on.
    pub fn node_of(&self, sandbox_id: &str) -> Option<String> {
        self.lock().vms.get(sandbox_id).map(|vm| vm.node_id.clone())
    }

    /// Everything written to a session's input so far.
    pub fn session_input(&self, sandbox_id: &str, session_id: &str) -> Option<String> {
        self.lock()
            .vms
            .get(sandbox_id)
            .and_then(|vm| vm.session_input.get(session_id).cloned())
    }

    fn enter(&self, node_id: &str, op: NodeOp) -> NodeResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if state.unreachable.contains(node_id) {
            return Err(NodeError::Unreachable {
                node_id: node_id.to_string(),
                message: "connection refused".to_string(),
            });
        }
        if state.failing.contains(&op) {
            return Err(NodeError::Rejected(format!("{op:?} failed")));
        }
        Ok(state)
    }
}

fn vm_mut<'a>(state: &'a mut State, sandbox_id: &str) -> NodeResult<&'a mut Vm> {
    state
        .vms
        .get_mut(sandbox_id)
        .ok_or_else(|| NodeError::NotFound(format!("sandbox {sandbox_id}")))
}

fn live_vm<'a>(state: &'a mut State, sandbox_id: &str) -> NodeResult<&'a mut Vm> {
    let vm = vm_mut(state, sandbox_id)?;
    if vm.stopped {
        return Err(NodeError::Rejected(format!("sandbox {sandbox_id} is stopped")));
    }
    Ok(vm)
}

fn finished(exit_code: i32, output: Vec<OutputChunk>, duration_ms: u64) -> ExecResult {
    ExecResult {
        exit_code,
        output,
        resource_usage: ResourceUsage {
            cpu_ms: 1,
            peak_memory_bytes: 1 << 20,
        },
        duration_ms,
        timed_out: false,
    }
}

fn chunk(stream: OutputStream, data: impl Into<String>) -> OutputChunk {
    OutputChunk {
        stream,
        data: data.into(),
    }
}

fn run_command(vm: &Vm, cmd: &[String], timeout_seconds: u64) -> NodeResult<ExecResult> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(NodeError::Rejected("empty command".to_string()));
    };

    let result = match program.as_str() {
        "true" => finished(0, Vec::new(), 1),
        "false" => finished(1, Vec::new(), 1),
        "echo" => finished(
            0,
            vec![chunk(OutputStream::Stdout, format!("{}\n", args.join(" ")))],
            1,
        ),
        "exit" => {
            let code = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            finished(code, Vec::new(), 1)
        }
        "cat" => {
            let mut output = Vec::new();
            let mut code = 0;
            for path in args {
                match vm.files.get(path) {
                    Some(data) => output.push(chunk(
                        OutputStream::Stdout,
                        String::from_utf8_lossy(data).into_owned(),
                    )),
                    None => {
                        output.push(chunk(
                            OutputStream::Stderr,
                            format!("cat: {path}: No such file or directory\n"),
                        ));
                        code = 1;
                    }
                }
            }
            finished(code, output, 1)
        }
        "sleep" => {
            let secs: u64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            if secs > timeout_seconds {
                ExecResult {
                    timed_out: true,
                    ..finished(TIMEOUT_EXIT_CODE, Vec::new(), timeout_seconds * 1000)
                }
            } else {
                finished(0, Vec::new(), secs * 1000)
            }
        }
        other => finished(
            127,
            vec![chunk(
                OutputStream::Stderr,
                format!("{other}: command not found\n"),
            )],
            1,
        ),
    };
    Ok(result)
}

#[async_trait]
impl NodeClient for LoopbackNodeClient {
    async fn create_sandbox(
        &self,
        node_id: &str,
        request: &CreateSandboxRequest,
    ) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::CreateSandbox)?;
        if state.vms.contains_key(&request.sandbox_id) {
            return Err(NodeError::Rejected(format!(
                "sandbox {} already exists",
                request.sandbox_id
            )));
        }
        state.vms.insert(
            request.sandbox_id.clone(),
            Vm {
                node_id: node_id.to_string(),
                ..Vm::default()
            },
        );
        Ok(())
    }

    async fn fork_sandbox(&self, node_id: &str, request: &ForkSandboxRequest) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::ForkSandbox)?;
        let source = live_vm(&mut state, &request.source_sandbox_id)?;
        let child = Vm {
            node_id: node_id.to_string(),
            files: source.files.clone(),
            ..Vm::default()
        };
        state.vms.insert(request.new_sandbox_id.clone(), child);
        Ok(())
    }

    async fn stop_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::StopSandbox)?;
        let vm = vm_mut(&mut state, sandbox_id)?;
        vm.stopped = true;
        vm.sessions.clear();
        Ok(())
    }

    async fn destroy_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::DestroySandbox)?;
        state
            .vms
            .remove(sandbox_id)
            .map(|_| ())
            .ok_or_else(|| NodeError::NotFound(format!("sandbox {sandbox_id}")))
    }

    async fn exec(&self, node_id: &str, request: &ExecRequest) -> NodeResult<ExecResult> {
        let mut state = self.enter(node_id, NodeOp::Exec)?;
        let vm = live_vm(&mut state, &request.sandbox_id)?;
        run_command(vm, &request.cmd, request.timeout_seconds)
    }

    async fn create_session(
        &self,
        node_id: &str,
        request: &CreateSessionRequest,
    ) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::CreateSession)?;
        let vm = live_vm(&mut state, &request.sandbox_id)?;
        vm.sessions.insert(request.session_id.clone());
        Ok(())
    }

    async fn session_exec(
        &self,
        node_id: &str,
        request: &SessionExecRequest,
    ) -> NodeResult<ExecResult> {
        let mut state = self.enter(node_id, NodeOp::SessionExec)?;
        let vm = live_vm(&mut state, &request.sandbox_id)?;
        if !vm.sessions.contains(&request.session_id) {
            return Err(NodeError::NotFound(format!(
                "session {}",
                request.session_id
            )));
        }
        let cmd: Vec<String> = request
            .cmd
            .split_whitespace()
            .map(str::to_string)
            .collect();
        run_command(vm, &cmd, request.timeout_seconds)
    }

    async fn session_input(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        data: &str,
    ) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::SessionInput)?;
        let vm = live_vm(&mut state, sandbox_id)?;
        if !vm.sessions.contains(session_id) {
            return Err(NodeError::NotFound(format!("session {session_id}")));
        }
        vm.session_input
            .entry(session_id.to_string())
            .or_default()
            .push_str(data);
        Ok(())
    }

    async fn destroy_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
    ) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::DestroySession)?;
        let vm = vm_mut(&mut state, sandbox_id)?;
        vm.sessions.remove(session_id);
        Ok(())
    }

    async fn put_file(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
        data: Vec<u8>,
    ) -> NodeResult<u64> {
        let mut state = self.enter(node_id, NodeOp::PutFile)?;
        let vm = live_vm(&mut state, sandbox_id)?;
        let written = data.len() as u64;
        vm.files.insert(path.to_string(), data);
        Ok(written)
    }

    async fn get_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<Vec<u8>> {
        let mut state = self.enter(node_id, NodeOp::GetFile)?;
        let vm = live_vm(&mut state, sandbox_id)?;
        vm.files
            .get(path)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("file {path}")))
    }

    async fn list_files(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> NodeResult<Vec<FileEntry>> {
        let mut state = self.enter(node_id, NodeOp::ListFiles)?;
        let vm = live_vm(&mut state, sandbox_id)?;
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        Ok(vm
            .files
            .iter()
            .filter(|(file, _)| file.starts_with(&prefix))
            .map(|(file, data)| FileEntry {
                path: file.clone(),
                size: data.len() as u64,
                is_dir: false,
            })
            .collect())
    }

    async fn delete_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<()> {
        let mut state = self.enter(node_id, NodeOp::DeleteFile)?;
        let vm = live_vm(&mut state, sandbox_id)?;
        vm.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| NodeError::NotFound(format!("file {path}")))
    }

    async fn collect_artifacts(
        &self,
        node_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> NodeResult<Vec<CollectedArtifact>> {
        let mut state = self.enter(node_id, NodeOp::CollectArtifacts)?;
        let vm = vm_mut(&mut state, sandbox_id)?;
        Ok(paths
            .iter()
            .filter_map(|path| {
                let data = vm.files.get(path)?;
                let file_name = Path::new(path)
                    .file_name()
                    .map_or_else(|| path.clone(), |n| n.to_string_lossy().into_owned());
                Some(CollectedArtifact {
                    name: path.clone(),
                    bytes: data.len() as u64,
                    sha256: hex::encode(Sha256::digest(data)),
                    storage_ref: format!("{sandbox_id}/artifacts/{file_name}"),
                })
            })
            .collect())
    }
}
