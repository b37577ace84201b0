//! Process backend driver.
//!
//! Runs the IDE as a native host process instead of a container. Each
//! workspace gets its own user-data profile directory so several IDE
//! instances can coexist.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::error::{BackendError, BackendResult};
use super::{BackendDriver, BackendSpec, BackendStatus, ManagedBackend, validate_handle};

/// Configuration for the process driver.
#[derive(Debug, Clone)]
pub struct ProcessDriverConfig {
    /// IDE binary to launch (e.g. "code").
    pub ide_binary: String,
    /// Directory holding per-workspace user-data profiles.
    pub data_dir: PathBuf,
}

impl Default for ProcessDriverConfig {
    fn default() -> Self {
        Self {
            ide_binary: "code".to_string(),
            data_dir: std::env::temp_dir().join("orca-profiles"),
        }
    }
}

/// Handle to a spawned IDE process.
#[derive(Debug)]
struct ProcessHandle {
    /// Process ID.
    pid: u32,
    /// The underlying child process.
    child: Child,
}

impl ProcessHandle {
    fn new(child: Child) -> Option<Self> {
        let pid = child.id()?;
        Some(Self { pid, child })
    }

    /// Check if the process is still running.
    fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,     // Still running
            Ok(Some(_)) => false, // Exited
            Err(_) => false,      // Error checking status
        }
    }

    /// Kill the process and wait for it to be reaped.
    ///
    /// This both sends SIGKILL and waits for the process to exit,
    /// preventing zombie processes.
    async fn kill(&mut self) -> BackendResult<()> {
        if let Err(e) = self.child.kill().await {
            // Process might already be dead, check
            if self.is_running() {
                return Err(BackendError::CommandFailed {
                    command: "kill".to_string(),
                    message: e.to_string(),
                });
            }
        }

        // Wait for the process to be reaped, with a timeout to avoid
        // hanging forever on a stuck process.
        match tokio::time::timeout(std::time::Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                warn!("Error waiting for process {}: {:?}", self.pid, e);
                Ok(())
            }
            Err(_) => {
                warn!("Timeout waiting for process {} to exit", self.pid);
                Ok(())
            }
        }
    }
}

/// One managed workspace process plus the spec it was spawned from.
///
/// The spec is kept so `start` can respawn after the process dies.
#[derive(Debug)]
struct ProcEntry {
    spec: BackendSpec,
    handle: Option<ProcessHandle>,
}

/// Backend driver that spawns the IDE as a host process.
#[derive(Debug, Clone)]
pub struct ProcessDriver {
    config: ProcessDriverConfig,
    /// Map of workspace name -> managed process entry.
    entries: Arc<Mutex<HashMap<String, ProcEntry>>>,
}

impl Default for ProcessDriver {
    fn default() -> Self {
        Self::new(ProcessDriverConfig::default())
    }
}

impl ProcessDriver {
    /// Create a new process driver.
    pub fn new(config: ProcessDriverConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the IDE for a spec and return the handle.
    async fn spawn_ide(&self, spec: &BackendSpec) -> BackendResult<ProcessHandle> {
        let profile_dir = self.config.data_dir.join(&spec.name);
        std::fs::create_dir_all(&profile_dir)?;

        debug!(
            "Spawning {} for {} on debug port {}",
            self.config.ide_binary, spec.name, spec.debug_port
        );

        let mut cmd = Command::new(&self.config.ide_binary);
        cmd.arg(format!("--remote-debugging-port={}", spec.debug_port))
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg(&spec.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| BackendError::CommandFailed {
            command: self.config.ide_binary.clone(),
            message: e.to_string(),
        })?;

        // Drain output so the pipes never fill up and stall the IDE.
        if let Some(stdout) = child.stdout.take() {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", name, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", name, line);
                }
            });
        }

        ProcessHandle::new(child).ok_or_else(|| BackendError::CommandFailed {
            command: self.config.ide_binary.clone(),
            message: "failed to get PID".to_string(),
        })
    }
}

#[async_trait]
impl BackendDriver for ProcessDriver {
    async fn create(&self, spec: &BackendSpec) -> BackendResult<String> {
        validate_handle(&spec.name)?;

        let handle = self.spawn_ide(spec).await?;
        debug!("{} spawned with PID {}", spec.name, handle.pid);

        let mut entries = self.entries.lock().await;
        entries.insert(
            spec.name.clone(),
            ProcEntry {
                spec: spec.clone(),
                handle: Some(handle),
            },
        );

        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> BackendResult<()> {
        validate_handle(handle)?;

        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        if let Some(ref mut proc) = entry.handle {
            if proc.is_running() {
                return Ok(());
            }
        }

        let spec = entry.spec.clone();
        drop(entries);

        let proc = self.spawn_ide(&spec).await?;

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(handle) {
            entry.handle = Some(proc);
        }
        Ok(())
    }

    async fn stop(&self, handle: &str) -> BackendResult<()> {
        validate_handle(handle)?;

        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        if let Some(mut proc) = entry.handle.take() {
            debug!("Killing {} (PID {})", handle, proc.pid);
            proc.kill().await?;
        }
        Ok(())
    }

    async fn remove(&self, handle: &str) -> BackendResult<()> {
        validate_handle(handle)?;

        let mut entries = self.entries.lock().await;
        if let Some(mut entry) = entries.remove(handle) {
            if let Some(ref mut proc) = entry.handle {
                if let Err(e) = proc.kill().await {
                    warn!("Failed to kill {} (PID {}): {:?}", handle, proc.pid, e);
                }
            }
        }
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> BackendResult<Option<BackendStatus>> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(handle) else {
            return Ok(None);
        };

        let child_alive = entry
            .handle
            .as_mut()
            .map(|p| p.is_running())
            .unwrap_or(false);

        // Port-bound fallback: the child handle can go stale while the IDE
        // keeps the debug port open (e.g. it forked).
        let running = child_alive || !is_port_available(entry.spec.debug_port);

        Ok(Some(BackendStatus {
            running,
            address: Some(format!("127.0.0.1:{}", entry.spec.debug_port)),
            workdir: Some(entry.spec.workdir.clone()),
        }))
    }

    async fn exec(&self, handle: &str, command: &[&str]) -> BackendResult<String> {
        validate_handle(handle)?;

        let workdir = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(handle)
                .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;
            entry.spec.workdir.clone()
        };

        let (binary, args) = command
            .split_first()
            .ok_or_else(|| BackendError::InvalidInput("empty command".to_string()))?;

        let output = Command::new(binary)
            .args(args)
            .current_dir(&workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackendError::CommandFailed {
                command: binary.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::CommandFailed {
                command: binary.to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn exec_detached(&self, handle: &str, command: &[&str]) -> BackendResult<()> {
        validate_handle(handle)?;

        let workdir = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(handle)
                .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;
            entry.spec.workdir.clone()
        };

        let (binary, args) = command
            .split_first()
            .ok_or_else(|| BackendError::InvalidInput("empty command".to_string()))?;

        Command::new(binary)
            .args(args)
            .current_dir(&workdir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BackendError::CommandFailed {
                command: binary.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn list_managed(&self) -> BackendResult<Vec<ManagedBackend>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .keys()
            .map(|name| ManagedBackend {
                handle: name.clone(),
                name: name.clone(),
            })
            .collect())
    }
}

/// Check if a port is available for binding.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}
