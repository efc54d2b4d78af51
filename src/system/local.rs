//! Local implementation of SandboxHost
//!
//! Used when Tether runs inside the sandbox itself. Processes it starts are
//! tracked with their captured output; everything else in the process table
//! comes from `sysinfo`. The bucket is expected to be mounted by the sandbox
//! image, so `mount_bucket` only checks that the mount point is there.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tether_host_interface::{
    ExecOutput, HostError, HttpResponse, ProcessId, ProcessInfo, ProcessLogs, ProcessStatus,
    Result, SandboxHost, StorageCredentials,
};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output kept per stream
const MAX_LOG_BYTES: usize = 64 * 1024;

/// Delay between TCP connect attempts while waiting for a port
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct TrackedState {
    status: ProcessStatus,
    exit_code: Option<i32>,
    logs: ProcessLogs,
}

#[derive(Debug, Clone)]
struct Tracked {
    command: String,
    start_time: SystemTime,
    state: Arc<Mutex<TrackedState>>,
}

impl Tracked {
    fn info(&self, id: &ProcessId) -> ProcessInfo {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        ProcessInfo {
            id: id.clone(),
            command: self.command.clone(),
            status: state.status,
            start_time: self.start_time,
            exit_code: state.exit_code,
        }
    }
}

/// SandboxHost backed by the machine Tether runs on
#[derive(Clone)]
pub struct LocalHost {
    tracked: Arc<RwLock<HashMap<ProcessId, Tracked>>>,
    http: reqwest::Client,
    shell: String,
}

impl LocalHost {
    pub fn new() -> Self {
        Self {
            tracked: Arc::new(RwLock::new(HashMap::new())),
            http: reqwest::Client::new(),
            shell: "sh".to_string(),
        }
    }

    fn tracked(&self, id: &ProcessId) -> Option<Tracked> {
        self.tracked
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    fn shell_command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        cmd
    }

    /// One pass over the OS process table merged with tracked children
    async fn snapshot(&self) -> Result<Vec<ProcessInfo>> {
        let tracked: Vec<(ProcessId, Tracked)> = self
            .tracked
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();

        let system_rows = tokio::task::spawn_blocking(|| {
            let mut sys = System::new();
            sys.refresh_processes(ProcessesToUpdate::All, true);
            sys.processes()
                .iter()
                .map(|(pid, process)| {
                    let args: Vec<String> = process
                        .cmd()
                        .iter()
                        .map(|a| a.to_string_lossy().into_owned())
                        .collect();
                    let command = if args.is_empty() {
                        process.name().to_string_lossy().into_owned()
                    } else {
                        args.join(" ")
                    };
                    ProcessInfo {
                        id: ProcessId::new(pid.as_u32().to_string()),
                        command,
                        status: map_status(process.status()),
                        start_time: UNIX_EPOCH + Duration::from_secs(process.start_time()),
                        exit_code: None,
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| HostError::System(format!("process scan failed: {}", e)))?;

        let mut rows: Vec<ProcessInfo> = system_rows
            .into_iter()
            .filter(|row| !tracked.iter().any(|(id, _)| id == &row.id))
            .collect();
        rows.extend(tracked.iter().map(|(id, t)| t.info(id)));
        Ok(rows)
    }

    fn pid_of(id: &ProcessId) -> Result<Pid> {
        id.as_str()
            .parse::<u32>()
            .map(Pid::from_u32)
            .map_err(|_| HostError::ProcessNotFound(id.clone()))
    }

    async fn is_alive(&self, id: &ProcessId) -> bool {
        match self.process(id).await {
            Ok(info) => info.status.is_alive(),
            Err(_) => false,
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

fn map_status(status: sysinfo::ProcessStatus) -> ProcessStatus {
    match status {
        sysinfo::ProcessStatus::Zombie | sysinfo::ProcessStatus::Dead => ProcessStatus::Completed,
        _ => ProcessStatus::Running,
    }
}

/// Append lines from `stream` into one of the tracked log buffers
fn capture<R>(stream: R, state: Arc<Mutex<TrackedState>>, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
            let buf = if is_stderr {
                &mut state.logs.stderr
            } else {
                &mut state.logs.stdout
            };
            if buf.len() + line.len() < MAX_LOG_BYTES {
                buf.push_str(&line);
                buf.push('\n');
            }
        }
    });
}

#[async_trait]
impl SandboxHost for LocalHost {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.snapshot().await
    }

    async fn start_process(
        &self,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<ProcessInfo> {
        let mut cmd = self.shell_command(command);
        cmd.envs(env).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| HostError::SpawnFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| HostError::SpawnFailed {
            command: command.to_string(),
            reason: "process exited before reporting a pid".to_string(),
        })?;

        let id = ProcessId::new(pid.to_string());
        let state = Arc::new(Mutex::new(TrackedState {
            status: ProcessStatus::Running,
            exit_code: None,
            logs: ProcessLogs::default(),
        }));

        if let Some(stdout) = child.stdout.take() {
            capture(stdout, state.clone(), false);
        }
        if let Some(stderr) = child.stderr.take() {
            capture(stderr, state.clone(), true);
        }

        let waiter_state = state.clone();
        let waiter_id = id.clone();
        tokio::spawn(async move {
            let outcome = child.wait().await;
            let mut state = waiter_state.lock().unwrap_or_else(|p| p.into_inner());
            match outcome {
                Ok(status) => {
                    state.exit_code = status.code();
                    state.status = if status.success() {
                        ProcessStatus::Completed
                    } else {
                        ProcessStatus::Failed
                    };
                }
                Err(e) => {
                    warn!(id = %waiter_id, error = %e, "Lost track of child process");
                    state.status = ProcessStatus::Failed;
                }
            }
            debug!(id = %waiter_id, status = %state.status, exit_code = ?state.exit_code, "Process exited");
        });

        let tracked = Tracked {
            command: command.to_string(),
            start_time: SystemTime::now(),
            state,
        };
        let info = tracked.info(&id);
        self.tracked
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tracked);
        Ok(info)
    }

    async fn process(&self, id: &ProcessId) -> Result<ProcessInfo> {
        if let Some(tracked) = self.tracked(id) {
            return Ok(tracked.info(id));
        }
        self.snapshot()
            .await?
            .into_iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| HostError::ProcessNotFound(id.clone()))
    }

    async fn kill_process(&self, id: &ProcessId) -> Result<()> {
        // Exited tracked children are only table rows; dropping them is the kill
        if let Some(tracked) = self.tracked(id) {
            if !tracked.info(id).status.is_alive() {
                self.tracked
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(id);
                return Ok(());
            }
        }

        let pid = Self::pid_of(id)?;
        let killed = tokio::task::spawn_blocking(move || {
            let mut sys = System::new();
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| p.kill())
        })
        .await
        .map_err(|e| HostError::System(format!("kill failed: {}", e)))?;

        match killed {
            Some(true) => Ok(()),
            Some(false) => Err(HostError::System(format!("signal to {} was not delivered", id))),
            None => Err(HostError::ProcessNotFound(id.clone())),
        }
    }

    async fn wait_for_port(&self, id: &ProcessId, port: u16, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if !self.is_alive(id).await {
                return Err(HostError::System(format!(
                    "process {} exited before port {} opened",
                    id, port
                )));
            }

            let attempt =
                tokio::time::timeout(PORT_POLL_INTERVAL, TcpStream::connect(("127.0.0.1", port)));
            if let Ok(Ok(_stream)) = attempt.await {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(HostError::PortTimeout { port, timeout });
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }

    async fn process_logs(&self, id: &ProcessId) -> Result<ProcessLogs> {
        match self.tracked(id) {
            Some(tracked) => Ok(tracked
                .state
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .logs
                .clone()),
            // Output of processes we did not spawn is not observable
            None => {
                self.process(id).await?;
                Ok(ProcessLogs::default())
            }
        }
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let mut cmd = self.shell_command(command);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| HostError::Timeout(timeout))??;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or_else(|_| path.exists())
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostError::Io(e)),
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, contents).await?;
        Ok(())
    }

    async fn mount_bucket(
        &self,
        bucket: &str,
        path: &Path,
        _credentials: &StorageCredentials,
    ) -> Result<()> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                debug!(bucket, path = %path.display(), "Bucket mount point present");
                Ok(())
            }
            Ok(_) => Err(HostError::Mount(format!(
                "{} exists but is not a directory",
                path.display()
            ))),
            Err(e) => Err(HostError::Mount(format!(
                "bucket {} is not mounted at {}: {}",
                bucket,
                path.display(),
                e
            ))),
        }
    }

    async fn http_get(&self, port: u16, path: &str, timeout: Duration) -> Result<HttpResponse> {
        let url = format!("http://127.0.0.1:{}{}", port, path);
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| HostError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HostError::Http(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}
