//! Container backend driver.
//!
//! Drives workspace containers via the Docker or Podman CLI. The runtime is
//! auto-detected or can be configured explicitly.

use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;

use super::error::{BackendError, BackendResult};
use super::{
    BackendDriver, BackendSpec, BackendStatus, CONTAINER_DEBUG_PORT, ManagedBackend,
    validate_handle, validate_image_name,
};

/// Mount point of the workspace directory inside the container.
const CONTAINER_WORKDIR: &str = "/workspace";

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    Docker,
    /// Podman runtime (default for Linux prod)
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Shape of one entry in `inspect --format {{json .Mounts}}` output.
#[derive(Debug, Deserialize)]
struct MountEntry {
    #[serde(rename = "Source")]
    source: String,
    #[serde(rename = "Destination")]
    destination: String,
}

/// Shape of one host binding in `{{json .HostConfig.PortBindings}}` output.
#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

/// Container driver shelling out to docker/podman.
///
/// Supports both runtimes with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerDriver {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerDriver {
    /// Create a new driver with runtime auto-detection.
    ///
    /// Tries Docker first (for macOS dev), then falls back to Podman.
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self {
                    runtime_type: RuntimeType::Docker,
                    binary: "docker".to_string(),
                };
            }
        }

        if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else {
            // Fall back to podman, will fail at runtime
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        }
    }

    /// Create a driver with a specific runtime type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a driver with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check that the container runtime answers at all.
    pub async fn health_check(&self) -> BackendResult<String> {
        let output = self.run(&["version", "--format", "json"], "version").await?;
        Ok(output)
    }

    /// Run the container binary with args, failing on non-zero exit.
    async fn run(&self, args: &[&str], command: &str) -> BackendResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackendError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::CommandFailed {
                command: command.to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Get the container state status string (e.g. "running", "exited").
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn state_status(&self, handle: &str) -> BackendResult<Option<String>> {
        validate_handle(handle)?;

        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Status}}", handle])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackendError::CommandFailed {
                command: "inspect".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if status.is_empty() {
            return Ok(None);
        }

        Ok(Some(status))
    }

    /// The host directory bound at the workspace mount point, if any.
    async fn bound_workdir(&self, handle: &str) -> BackendResult<Option<String>> {
        let output = self
            .run(
                &["inspect", "--format", "{{json .Mounts}}", handle],
                "inspect",
            )
            .await?;

        let mounts: Vec<MountEntry> = serde_json::from_str(output.trim())
            .map_err(|e| BackendError::ParseError(e.to_string()))?;

        Ok(mounts
            .into_iter()
            .find(|m| m.destination == CONTAINER_WORKDIR)
            .map(|m| m.source))
    }

    /// The host port mapped to the in-container debug port, if any.
    async fn debug_host_port(&self, handle: &str) -> BackendResult<Option<u16>> {
        let output = self
            .run(
                &[
                    "inspect",
                    "--format",
                    "{{json .HostConfig.PortBindings}}",
                    handle,
                ],
                "inspect",
            )
            .await?;

        let bindings: std::collections::HashMap<String, Option<Vec<PortBinding>>> =
            serde_json::from_str(output.trim())
                .map_err(|e| BackendError::ParseError(e.to_string()))?;

        let key = format!("{}/tcp", CONTAINER_DEBUG_PORT);
        let port = bindings
            .get(&key)
            .and_then(|b| b.as_ref())
            .and_then(|b| b.first())
            .and_then(|b| b.host_port.parse::<u16>().ok());

        Ok(port)
    }
}

#[async_trait]
impl BackendDriver for ContainerDriver {
    async fn create(&self, spec: &BackendSpec) -> BackendResult<String> {
        validate_handle(&spec.name)?;
        validate_image_name(&spec.image)?;

        let mut owned_args: Vec<String> = Vec::new();

        owned_args.push("run".to_string());
        owned_args.push("-d".to_string());

        owned_args.push("--name".to_string());
        owned_args.push(spec.name.clone());

        // Debug port mapping
        owned_args.push("-p".to_string());
        owned_args.push(format!("{}:{}", spec.debug_port, CONTAINER_DEBUG_PORT));

        // Workspace mount - handle SELinux labels for Podman
        owned_args.push("-v".to_string());
        if self.runtime_type.needs_selinux_labels() {
            owned_args.push(format!("{}:{}:Z", spec.workdir, CONTAINER_WORKDIR));
        } else {
            owned_args.push(format!("{}:{}", spec.workdir, CONTAINER_WORKDIR));
        }

        // Environment variables
        for (key, value) in &spec.env {
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        owned_args.push("-w".to_string());
        owned_args.push(CONTAINER_WORKDIR.to_string());

        owned_args.push(spec.image.clone());

        let args_refs: Vec<&str> = owned_args.iter().map(|s| s.as_str()).collect();
        let output = self.run(&args_refs, "run").await?;

        // Return container ID (trimmed)
        Ok(output.trim().to_string())
    }

    async fn start(&self, handle: &str) -> BackendResult<()> {
        validate_handle(handle)?;
        self.run(&["start", handle], "start").await?;
        Ok(())
    }

    async fn stop(&self, handle: &str) -> BackendResult<()> {
        validate_handle(handle)?;
        self.run(&["stop", "-t", "10", handle], "stop").await?;
        Ok(())
    }

    async fn remove(&self, handle: &str) -> BackendResult<()> {
        validate_handle(handle)?;
        self.run(&["rm", "-f", handle], "rm").await?;
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> BackendResult<Option<BackendStatus>> {
        let Some(status) = self.state_status(handle).await? else {
            return Ok(None);
        };

        let running = status == "running";

        // Mount and port queries are best-effort; a container in a weird
        // state can answer the status query but reject the json ones.
        let workdir = match self.bound_workdir(handle).await {
            Ok(dir) => dir,
            Err(e) => {
                debug!("inspect mounts failed for {}: {:?}", handle, e);
                None
            }
        };

        let address = match self.debug_host_port(handle).await {
            Ok(Some(port)) => Some(format!("127.0.0.1:{}", port)),
            Ok(None) => None,
            Err(e) => {
                debug!("inspect ports failed for {}: {:?}", handle, e);
                None
            }
        };

        Ok(Some(BackendStatus {
            running,
            address,
            workdir,
        }))
    }

    async fn exec(&self, handle: &str, command: &[&str]) -> BackendResult<String> {
        validate_handle(handle)?;

        let mut args = vec!["exec", handle];
        args.extend(command);

        self.run(&args, "exec").await
    }

    async fn exec_detached(&self, handle: &str, command: &[&str]) -> BackendResult<()> {
        validate_handle(handle)?;

        let mut args = vec!["exec", "-d", handle];
        args.extend(command);

        self.run(&args, "exec").await?;
        Ok(())
    }

    async fn list_managed(&self) -> BackendResult<Vec<ManagedBackend>> {
        let output = Command::new(&self.binary)
            .args(["ps", "-a", "--format", "{{.ID}}\t{{.Names}}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackendError::CommandFailed {
                command: "ps".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::CommandFailed {
                command: "ps".to_string(),
                message: stderr.to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut backends = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.splitn(2, '\t');
            let (Some(id), Some(names)) = (parts.next(), parts.next()) else {
                warn!("unparseable ps line: {:?}", line);
                continue;
            };
            // Podman can report several names; the first is the created one.
            let name = names.split(',').next().unwrap_or(names).trim();
            backends.push(ManagedBackend {
                handle: id.trim().to_string(),
                name: name.to_string(),
            });
        }

        Ok(backends)
    }
}
