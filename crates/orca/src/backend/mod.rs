//! Workspace backend drivers.
//!
//! A backend is whatever actually hosts one IDE instance: a Docker/Podman
//! container or a locally spawned process. The lifecycle orchestrator only
//! talks to the [`BackendDriver`] trait; the handle it gets back from
//! `create` is opaque and never interpreted outside the owning driver.

mod container;
mod error;
mod process;

pub use container::{ContainerDriver, RuntimeType};
pub use error::{BackendError, BackendResult};
pub use process::{ProcessDriver, ProcessDriverConfig, is_port_available};

use async_trait::async_trait;

/// Port the IDE's debug endpoint listens on inside a container. The host
/// side of the mapping is allocated per workspace.
pub const CONTAINER_DEBUG_PORT: u16 = 9222;

/// Everything a driver needs to materialize one backend.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    /// Backend name (also the container name); validated, prefix-scoped.
    pub name: String,
    /// Container image (ignored by the process driver).
    pub image: String,
    /// Host directory bound into the backend as its working directory.
    pub workdir: String,
    /// Host port the CDP endpoint must be reachable on.
    pub debug_port: u16,
    /// Extra environment for the IDE process.
    pub env: Vec<(String, String)>,
}

/// Ground-truth state of a backend, as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    /// Whether the backend is currently alive.
    pub running: bool,
    /// Address the CDP endpoint is reachable on, when known.
    pub address: Option<String>,
    /// The working directory actually bound into the backend. Used by the
    /// orchestrator to detect mount drift against the stored record.
    pub workdir: Option<String>,
}

/// A backend known to a driver, for orphan sweeps at startup.
#[derive(Debug, Clone)]
pub struct ManagedBackend {
    pub handle: String,
    pub name: String,
}

/// Driver abstraction over the two backend kinds.
///
/// `inspect` returns `Ok(None)` when the backend no longer exists; callers
/// treat that as missing, not as an error.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Materialize a backend for the spec and return its opaque handle.
    /// The backend comes up running (container `run -d` semantics).
    async fn create(&self, spec: &BackendSpec) -> BackendResult<String>;

    /// Start a previously created (stopped) backend.
    async fn start(&self, handle: &str) -> BackendResult<()>;

    /// Stop a running backend.
    async fn stop(&self, handle: &str) -> BackendResult<()>;

    /// Tear the backend down entirely.
    async fn remove(&self, handle: &str) -> BackendResult<()>;

    /// Report ground-truth state, or `None` when the backend is gone.
    async fn inspect(&self, handle: &str) -> BackendResult<Option<BackendStatus>>;

    /// Run a command inside the backend and return its stdout.
    async fn exec(&self, handle: &str, command: &[&str]) -> BackendResult<String>;

    /// Run a command inside the backend without waiting for it.
    async fn exec_detached(&self, handle: &str, command: &[&str]) -> BackendResult<()>;

    /// List backends this driver manages (for orphan cleanup).
    async fn list_managed(&self) -> BackendResult<Vec<ManagedBackend>>;
}

/// Validate a backend handle or name before splicing it into a command line.
///
/// Container ids are hex strings; names are alphanumeric with `-` and `_`.
pub(crate) fn validate_handle(id: &str) -> BackendResult<()> {
    if id.is_empty() {
        return Err(BackendError::InvalidInput(
            "backend handle cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(BackendError::InvalidInput(
            "backend handle exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(BackendError::InvalidInput(format!(
            "backend handle '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate an image reference (repo[:tag][@digest] without shell metachars).
pub(crate) fn validate_image_name(image: &str) -> BackendResult<()> {
    if image.is_empty() {
        return Err(BackendError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@');
    if !image.chars().all(valid_chars) {
        return Err(BackendError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    Ok(())
}
