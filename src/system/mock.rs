//! In-memory sandbox host for testing
//!
//! `MockHost` keeps a process table and a small file tree in memory and lets a
//! test script every host behavior Tether depends on: whether ports open,
//! what the loopback probe returns, how shell commands exit, and whether
//! writes under a path silently vanish (an unreliable bucket mount).

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tether_host_interface::{
    ExecOutput, HostError, HttpResponse, ProcessId, ProcessInfo, ProcessLogs, ProcessStatus,
    Result, SandboxHost, StorageCredentials,
};

/// What the loopback HTTP probe returns
#[derive(Debug, Clone)]
pub enum HttpBehavior {
    Body(String),
    Fail(String),
}

type ExecResponder = Arc<dyn Fn(&str) -> ExecOutput + Send + Sync>;

#[derive(Debug, Clone)]
struct MockProcess {
    info: ProcessInfo,
    logs: ProcessLogs,
    port_ready: bool,
    port_opens_at: Option<tokio::time::Instant>,
}

struct MockState {
    next_id: u64,
    processes: Vec<MockProcess>,
    files: HashMap<PathBuf, String>,
    dirs: HashSet<PathBuf>,

    start_port_ready: bool,
    start_port_delay: Option<Duration>,
    start_rival: Option<String>,
    start_logs: ProcessLogs,
    start_failure: Option<String>,
    started: Vec<(String, HashMap<String, String>)>,

    kill_failures: HashSet<ProcessId>,
    killed: Vec<ProcessId>,

    port_checks: Vec<ProcessId>,
    http: HttpBehavior,
    http_probes: usize,

    exec_responder: ExecResponder,
    executed: Vec<String>,

    drop_writes_under: Option<PathBuf>,
    writes: Vec<PathBuf>,

    mount_failure: Option<String>,
    mounts: Vec<(String, PathBuf)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            next_id: 1,
            processes: Vec::new(),
            files: HashMap::new(),
            dirs: HashSet::new(),
            start_port_ready: true,
            start_port_delay: None,
            start_rival: None,
            start_logs: ProcessLogs::default(),
            start_failure: None,
            started: Vec::new(),
            kill_failures: HashSet::new(),
            killed: Vec::new(),
            port_checks: Vec::new(),
            http: HttpBehavior::Body("<html>gateway</html>".to_string()),
            http_probes: 0,
            exec_responder: Arc::new(|_| ExecOutput::ok("")),
            executed: Vec::new(),
            drop_writes_under: None,
            writes: Vec::new(),
            mount_failure: None,
            mounts: Vec::new(),
        }
    }
}

/// Scriptable in-memory [`SandboxHost`]
///
/// # Example
///
/// ```rust
/// use tether::system::MockHost;
/// use tether_host_interface::{ProcessStatus, SandboxHost};
///
/// # async fn example() {
/// let host = MockHost::new();
/// let id = host.add_process("agentd gateway", ProcessStatus::Running);
/// assert!(host.process(&id).await.is_ok());
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<RwLock<MockState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, command: &str, status: ProcessStatus, logs: ProcessLogs, port_ready: bool) -> ProcessInfo {
        let mut state = self.state.write().unwrap();
        let id = ProcessId::new(format!("proc-{}", state.next_id));
        state.next_id += 1;

        let info = ProcessInfo {
            id,
            command: command.to_string(),
            status,
            start_time: SystemTime::now(),
            exit_code: match status {
                ProcessStatus::Completed => Some(0),
                ProcessStatus::Failed => Some(1),
                _ => None,
            },
        };
        state.processes.push(MockProcess {
            info: info.clone(),
            logs,
            port_ready,
            port_opens_at: None,
        });
        info
    }

    /// Insert a row into the process table; its port counts as open
    pub fn add_process(&self, command: &str, status: ProcessStatus) -> ProcessId {
        self.allocate(command, status, ProcessLogs::default(), true).id
    }

    pub fn set_status(&self, id: &ProcessId, status: ProcessStatus) {
        let mut state = self.state.write().unwrap();
        if let Some(p) = state.processes.iter_mut().find(|p| &p.info.id == id) {
            p.info.status = status;
        }
    }

    pub fn set_port_ready(&self, id: &ProcessId, ready: bool) {
        let mut state = self.state.write().unwrap();
        if let Some(p) = state.processes.iter_mut().find(|p| &p.info.id == id) {
            p.port_ready = ready;
        }
    }

    /// Whether processes started from now on open their port
    pub fn set_start_port_ready(&self, ready: bool) {
        self.state.write().unwrap().start_port_ready = ready;
    }

    /// Processes started from now on open their port only after `delay`
    pub fn set_start_port_delay(&self, delay: Duration) {
        self.state.write().unwrap().start_port_delay = Some(delay);
    }

    /// Have another starter win the next `start_process` by a hair
    ///
    /// A live `command` row is inserted just before the requested process.
    pub fn race_next_start(&self, command: &str) {
        self.state.write().unwrap().start_rival = Some(command.to_string());
    }

    /// Logs attached to processes started from now on
    pub fn set_start_logs(&self, stdout: &str, stderr: &str) {
        self.state.write().unwrap().start_logs = ProcessLogs {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
    }

    pub fn fail_next_start(&self, reason: &str) {
        self.state.write().unwrap().start_failure = Some(reason.to_string());
    }

    /// Make kills of `id` fail without touching the process
    pub fn fail_kill(&self, id: &ProcessId) {
        self.state.write().unwrap().kill_failures.insert(id.clone());
    }

    pub fn set_http(&self, behavior: HttpBehavior) {
        self.state.write().unwrap().http = behavior;
    }

    /// Answer every `exec` with `responder`
    pub fn on_exec<F>(&self, responder: F)
    where
        F: Fn(&str) -> ExecOutput + Send + Sync + 'static,
    {
        self.state.write().unwrap().exec_responder = Arc::new(responder);
    }

    /// Silently discard writes below `prefix`
    pub fn drop_writes_under(&self, prefix: impl Into<PathBuf>) {
        self.state.write().unwrap().drop_writes_under = Some(prefix.into());
    }

    pub fn fail_mount(&self, reason: &str) {
        self.state.write().unwrap().mount_failure = Some(reason.to_string());
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, contents: &str) {
        self.state
            .write()
            .unwrap()
            .files
            .insert(path.into(), contents.to_string());
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        self.state.write().unwrap().dirs.insert(path.into());
    }

    pub fn remove_file(&self, path: &Path) {
        self.state.write().unwrap().files.remove(path);
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.read().unwrap().files.get(path.as_ref()).cloned()
    }

    /// Commands passed to `start_process`, in order
    pub fn started(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .started
            .iter()
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }

    pub fn last_start_env(&self) -> Option<HashMap<String, String>> {
        self.state.read().unwrap().started.last().map(|(_, env)| env.clone())
    }

    /// Processes whose kill the host acknowledged
    pub fn killed(&self) -> Vec<ProcessId> {
        self.state.read().unwrap().killed.clone()
    }

    pub fn port_checks(&self) -> Vec<ProcessId> {
        self.state.read().unwrap().port_checks.clone()
    }

    pub fn http_probes(&self) -> usize {
        self.state.read().unwrap().http_probes
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.read().unwrap().executed.clone()
    }

    /// Paths passed to `write_file`, including dropped ones
    pub fn writes(&self) -> Vec<PathBuf> {
        self.state.read().unwrap().writes.clone()
    }

    pub fn mounts(&self) -> Vec<(String, PathBuf)> {
        self.state.read().unwrap().mounts.clone()
    }
}

impl MockHost {
    fn alive<'a>(&self, state: &'a MockState, id: &ProcessId) -> Result<&'a MockProcess> {
        let process = state
            .processes
            .iter()
            .find(|p| &p.info.id == id)
            .ok_or_else(|| HostError::ProcessNotFound(id.clone()))?;
        if !process.info.status.is_alive() {
            return Err(HostError::System(format!("process {} exited", id)));
        }
        Ok(process)
    }
}

#[async_trait]
impl SandboxHost for MockHost {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let state = self.state.read().unwrap();
        Ok(state.processes.iter().map(|p| p.info.clone()).collect())
    }

    async fn start_process(
        &self,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<ProcessInfo> {
        let (port_ready, logs, rival) = {
            let mut state = self.state.write().unwrap();
            if let Some(reason) = state.start_failure.take() {
                return Err(HostError::SpawnFailed {
                    command: command.to_string(),
                    reason,
                });
            }
            state.started.push((command.to_string(), env.clone()));
            (state.start_port_ready, state.start_logs.clone(), state.start_rival.take())
        };

        if let Some(rival) = rival {
            self.allocate(&rival, ProcessStatus::Running, ProcessLogs::default(), true);
        }

        let info = self.allocate(command, ProcessStatus::Running, logs, port_ready);
        let mut state = self.state.write().unwrap();
        let opens_at = state
            .start_port_delay
            .map(|delay| tokio::time::Instant::now() + delay);
        if let Some(p) = state.processes.iter_mut().find(|p| p.info.id == info.id) {
            p.port_opens_at = opens_at;
        }
        Ok(info)
    }

    async fn process(&self, id: &ProcessId) -> Result<ProcessInfo> {
        let state = self.state.read().unwrap();
        state
            .processes
            .iter()
            .find(|p| &p.info.id == id)
            .map(|p| p.info.clone())
            .ok_or_else(|| HostError::ProcessNotFound(id.clone()))
    }

    async fn kill_process(&self, id: &ProcessId) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.kill_failures.contains(id) {
            return Err(HostError::System(format!("kill of {} refused", id)));
        }
        let before = state.processes.len();
        state.processes.retain(|p| &p.info.id != id);
        if state.processes.len() == before {
            return Err(HostError::ProcessNotFound(id.clone()));
        }
        state.killed.push(id.clone());
        Ok(())
    }

    async fn wait_for_port(&self, id: &ProcessId, port: u16, timeout: Duration) -> Result<()> {
        let (ready, opens_at) = {
            let mut state = self.state.write().unwrap();
            state.port_checks.push(id.clone());
            let process = self.alive(&state, id)?;
            (process.port_ready, process.port_opens_at)
        };

        if !ready {
            tokio::time::sleep(timeout).await;
            return Err(HostError::PortTimeout { port, timeout });
        }
        match opens_at {
            Some(at) if at > tokio::time::Instant::now() + timeout => {
                tokio::time::sleep(timeout).await;
                Err(HostError::PortTimeout { port, timeout })
            }
            Some(at) => {
                tokio::time::sleep_until(at).await;
                // Killed or crashed while booting
                self.alive(&self.state.read().unwrap(), id).map(|_| ())
            }
            None => Ok(()),
        }
    }

    async fn process_logs(&self, id: &ProcessId) -> Result<ProcessLogs> {
        let state = self.state.read().unwrap();
        state
            .processes
            .iter()
            .find(|p| &p.info.id == id)
            .map(|p| p.logs.clone())
            .ok_or_else(|| HostError::ProcessNotFound(id.clone()))
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        let responder = {
            let mut state = self.state.write().unwrap();
            state.executed.push(command.to_string());
            state.exec_responder.clone()
        };
        Ok(responder(command))
    }

    async fn exists(&self, path: &Path) -> bool {
        let state = self.state.read().unwrap();
        state.files.contains_key(path)
            || state.dirs.contains(path)
            || state.files.keys().any(|f| f.starts_with(path))
            || state.dirs.iter().any(|d| d.starts_with(path))
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.state.read().unwrap().files.get(path).cloned())
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.writes.push(path.to_path_buf());
        let dropped = state
            .drop_writes_under
            .as_ref()
            .map(|prefix| path.starts_with(prefix))
            .unwrap_or(false);
        if !dropped {
            state.files.insert(path.to_path_buf(), contents.to_string());
        }
        Ok(())
    }

    async fn mount_bucket(
        &self,
        bucket: &str,
        path: &Path,
        _credentials: &StorageCredentials,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(ref reason) = state.mount_failure {
            return Err(HostError::Mount(reason.clone()));
        }
        let entry = (bucket.to_string(), path.to_path_buf());
        if !state.mounts.contains(&entry) {
            state.mounts.push(entry);
        }
        state.dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn http_get(&self, port: u16, path: &str, _timeout: Duration) -> Result<HttpResponse> {
        let mut state = self.state.write().unwrap();
        state.http_probes += 1;
        match state.http {
            HttpBehavior::Body(ref body) => Ok(HttpResponse {
                status: 200,
                body: body.clone(),
            }),
            HttpBehavior::Fail(ref reason) => Err(HostError::Http(format!(
                "GET 127.0.0.1:{}{} failed: {}",
                port, path, reason
            ))),
        }
    }
}
