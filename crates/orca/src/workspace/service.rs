//! Workspace lifecycle orchestration.
//!
//! The service is the only authoritative writer of workspace records. It
//! drives the whole initialization sequence (port allocation, backend
//! creation, CDP readiness, credential injection) and settles each
//! workspace in `running` or `needsLogin`. Tunnel-attached workspaces skip
//! the backend machinery entirely; their CLI owns the backend and the
//! service only relays lifecycle requests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::backend::{BackendDriver, BackendSpec, is_port_available};
use crate::cdp::{
    CdpChannel, DirectTransport, EvalTransport, Target, TargetResolver, TargetRole,
    TunneledTransport,
};
use crate::events::{EventHub, WorkspaceEvent};
use crate::sync::{MonitorConfig, MonitorRegistry};
use crate::tunnel::{TUNNEL_CALL_TIMEOUT, TunnelEvents, TunnelRegistry};

use super::credentials::injection_command;
use super::{Endpoint, Workspace, WorkspaceKind, WorkspaceStatus, WorkspaceStore};

/// Name prefix for backends this orchestrator owns. The startup sweep only
/// ever touches backends carrying it.
const WORKSPACE_NAME_PREFIX: &str = "orca-";

/// Path of the IDE's auth store, relative to the backend workdir.
const AUTH_STORE_PATH: &str = ".orca-ide/auth.bin";

/// Ports probed above the base before giving up.
const PORT_SCAN_RANGE: u16 = 200;

/// Interval between readiness probes.
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Waits for a workspace's CDP endpoint to accept discovery requests.
///
/// Split out as a trait so tests can run the full initialization sequence
/// without a real IDE on the other end.
#[async_trait]
trait CdpReadiness: Send + Sync {
    async fn wait_for_cdp(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;
}

struct HttpCdpReadiness {
    resolver: Arc<TargetResolver>,
}

#[async_trait]
impl CdpReadiness for HttpCdpReadiness {
    async fn wait_for_cdp(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.resolver.probe_version(host, port).await {
                debug!("CDP endpoint {}:{} ready after {} probes", host, port, attempts);
                return Ok(());
            }
            if start.elapsed() >= timeout {
                bail!(
                    "CDP endpoint {}:{} not ready after {} probes over {:?}",
                    host,
                    port,
                    attempts,
                    timeout
                );
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }
}

/// Tunable knobs of the lifecycle service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Container image for container-kind workspaces.
    pub image: String,
    /// First port tried when allocating a debug endpoint.
    pub base_port: u16,
    /// How long a backend gets to expose its CDP endpoint.
    pub readiness_timeout: Duration,
    /// Conversation monitor poll interval.
    pub poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            image: "orca-ide:latest".to_string(),
            base_port: 41900,
            readiness_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Request body for workspace creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: WorkspaceKind,
    pub workdir: String,
    #[serde(default)]
    pub credentials: Option<super::Credentials>,
}

/// Input passthrough request for a workspace's workbench page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub kind: InputKind,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Mouse,
    Key,
}

#[derive(Clone)]
pub struct WorkspaceService {
    store: Arc<WorkspaceStore>,
    hub: Arc<EventHub>,
    resolver: Arc<TargetResolver>,
    tunnels: Arc<TunnelRegistry>,
    monitors: Arc<MonitorRegistry>,
    container_driver: Option<Arc<dyn BackendDriver>>,
    process_driver: Option<Arc<dyn BackendDriver>>,
    readiness: Arc<dyn CdpReadiness>,
    config: ServiceConfig,
}

impl WorkspaceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<WorkspaceStore>,
        hub: Arc<EventHub>,
        resolver: Arc<TargetResolver>,
        tunnels: Arc<TunnelRegistry>,
        monitors: Arc<MonitorRegistry>,
        container_driver: Option<Arc<dyn BackendDriver>>,
        process_driver: Option<Arc<dyn BackendDriver>>,
        config: ServiceConfig,
    ) -> Self {
        let readiness = Arc::new(HttpCdpReadiness {
            resolver: Arc::clone(&resolver),
        });
        Self {
            store,
            hub,
            resolver,
            tunnels,
            monitors,
            container_driver,
            process_driver,
            readiness,
            config,
        }
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    fn driver_for(&self, kind: WorkspaceKind) -> Result<Arc<dyn BackendDriver>> {
        let driver = match kind {
            WorkspaceKind::Container => self.container_driver.as_ref(),
            WorkspaceKind::Process => self.process_driver.as_ref(),
        };
        driver
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("no driver configured for {:?} workspaces", kind))
    }

    pub fn list(&self) -> Vec<Workspace> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Result<Workspace> {
        self.store
            .get(id)
            .ok_or_else(|| anyhow!("workspace {} not found", id))
    }

    /// Create the record for a new workspace. The caller kicks off
    /// initialization separately via [`WorkspaceService::start`].
    pub fn create(&self, request: CreateWorkspaceRequest) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let name = match request.name {
            Some(name) => name,
            None => format!("{}{}", WORKSPACE_NAME_PREFIX, &id[..8]),
        };
        crate::backend::validate_handle(&name).map_err(|e| anyhow!("invalid name: {}", e))?;

        let mut workspace = Workspace::new(&id, name, request.kind, request.workdir);
        workspace.credentials = request.credentials;
        self.store.insert(workspace.clone());

        self.hub.emit(WorkspaceEvent::Status {
            workspace_id: id,
            status: WorkspaceStatus::Creating,
            stage: None,
            message: None,
        });
        Ok(workspace)
    }

    /// Drive a workspace through initialization until it settles.
    ///
    /// Any failure lands the workspace in `error` with the reason in its
    /// setup log before the error is returned.
    pub async fn start(&self, id: &str) -> Result<Workspace> {
        let workspace = self.get(id)?;
        if workspace.status == WorkspaceStatus::Running {
            return Ok(workspace);
        }
        if self.tunnels.is_connected(id) {
            return self.start_via_tunnel(id).await;
        }

        let driver = self.driver_for(workspace.kind)?;
        self.set_status(id, WorkspaceStatus::Initializing, Some("Preparing backend"), None);

        match self.initialize(&driver, &workspace).await {
            Ok(settled) => Ok(settled),
            Err(e) => {
                self.mark_failed(id, &format!("{:#}", e));
                Err(e)
            }
        }
    }

    async fn initialize(
        &self,
        driver: &Arc<dyn BackendDriver>,
        workspace: &Workspace,
    ) -> Result<Workspace> {
        let id = workspace.id.as_str();
        let mut backend_ref = workspace.backend_ref.clone();

        // The record's backend may have rotted underneath us: removed out
        // of band, or re-bound to a different host directory.
        if let Some(ref handle) = backend_ref {
            match driver.inspect(handle).await.context("inspecting backend")? {
                Some(status) => {
                    if mount_differs(&workspace.workdir, status.workdir.as_deref()) {
                        info!("workspace {} workdir changed, recreating backend", id);
                        self.log_line(id, "Working directory changed; recreating backend");
                        if let Err(e) = driver.remove(handle).await {
                            warn!("removing drifted backend for {}: {:?}", id, e);
                        }
                        backend_ref = None;
                    }
                }
                None => backend_ref = None,
            }
        }

        let (handle, endpoint) = match backend_ref {
            Some(handle) => {
                let endpoint = workspace
                    .endpoint
                    .clone()
                    .ok_or_else(|| anyhow!("existing backend has no recorded endpoint"))?;
                self.set_stage(id, "Starting backend");
                self.log_line(id, "Starting existing backend");
                driver.start(&handle).await.context("starting backend")?;
                (handle, endpoint)
            }
            None => {
                self.set_stage(id, "Allocating debug port");
                let port = self.allocate_port()?;
                let endpoint = Endpoint::loopback(port);
                self.log_line(id, &format!("Allocated debug port {}", port));

                self.set_stage(id, "Creating backend");
                let spec = BackendSpec {
                    name: workspace.name.clone(),
                    image: self.config.image.clone(),
                    workdir: workspace.workdir.clone(),
                    debug_port: port,
                    env: Vec::new(),
                };
                let handle = driver.create(&spec).await.context("creating backend")?;
                self.log_line(id, &format!("Backend created ({})", short_handle(&handle)));
                (handle, endpoint)
            }
        };

        self.store.update(id, |w| {
            w.backend_ref = Some(handle.clone());
            w.endpoint = Some(endpoint.clone());
        });

        self.set_stage(id, "Waiting for IDE");
        self.log_line(id, "Waiting for the IDE debug endpoint");
        self.readiness
            .wait_for_cdp(&endpoint.host, endpoint.port, self.config.readiness_timeout)
            .await
            .context("waiting for IDE readiness")?;
        self.log_line(id, "IDE debug endpoint is up");

        let has_credentials = workspace.credentials.is_some();
        if let Some(ref credentials) = workspace.credentials {
            self.set_stage(id, "Injecting credentials");
            self.log_line(id, "Injecting stored credentials");
            let command = injection_command(credentials, AUTH_STORE_PATH);
            let args: Vec<&str> = command.iter().map(String::as_str).collect();
            driver
                .exec(&handle, &args)
                .await
                .context("injecting credentials")?;

            // The IDE reads its auth store once, at boot.
            self.set_stage(id, "Restarting IDE");
            self.log_line(id, "Restarting IDE to pick up credentials");
            driver.stop(&handle).await.context("stopping for credential restart")?;
            driver.start(&handle).await.context("restarting backend")?;
            self.readiness
                .wait_for_cdp(&endpoint.host, endpoint.port, self.config.readiness_timeout)
                .await
                .context("waiting for IDE readiness after restart")?;
            self.log_line(id, "IDE back up with credentials");
        }

        let settled_status = if has_credentials {
            WorkspaceStatus::Running
        } else {
            WorkspaceStatus::NeedsLogin
        };
        let settled = self
            .set_status(id, settled_status, None, None)
            .ok_or_else(|| anyhow!("workspace {} disappeared during initialization", id))?;

        if settled_status == WorkspaceStatus::Running {
            self.start_monitor(id);
            self.log_line(id, "Workspace is running");
        } else {
            self.log_line(id, "Workspace is up, waiting for login");
        }
        Ok(settled)
    }

    /// Restart a tunnel-attached workspace through its CLI.
    ///
    /// The CLI's `cli:ready` frame settles the workspace; this only kicks
    /// the restart off and reports the transitional record.
    async fn start_via_tunnel(&self, id: &str) -> Result<Workspace> {
        let handle = self
            .tunnels
            .get(id)
            .ok_or_else(|| anyhow!("tunnel for workspace {} disappeared", id))?;
        self.set_status(id, WorkspaceStatus::Initializing, Some("Restarting via CLI"), None);
        self.log_line(id, "Asking the CLI to restart the workspace");
        handle
            .restart_workspace(TUNNEL_CALL_TIMEOUT)
            .await
            .map_err(|e| anyhow!("tunnel restart failed: {}", e))?;
        self.get(id)
    }

    pub async fn stop(&self, id: &str) -> Result<Workspace> {
        let workspace = self.get(id)?;
        self.monitors.stop(id);

        if let Some(handle) = self.tunnels.get(id) {
            if let Err(e) = handle.stop_workspace(TUNNEL_CALL_TIMEOUT).await {
                warn!("tunnel stop for {} failed: {}", id, e);
            }
        } else if let Some(ref handle) = workspace.backend_ref {
            let driver = self.driver_for(workspace.kind)?;
            driver.stop(handle).await.context("stopping backend")?;
        }

        self.log_line(id, "Workspace stopped");
        self.set_status(id, WorkspaceStatus::Stopped, None, None)
            .ok_or_else(|| anyhow!("workspace {} not found", id))
    }

    pub async fn restart(&self, id: &str) -> Result<Workspace> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Remove a workspace and its backend.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let workspace = self.get(id)?;
        self.monitors.stop(id);

        if let Some(ref handle) = workspace.backend_ref {
            match self.driver_for(workspace.kind) {
                Ok(driver) => {
                    if let Err(e) = driver.remove(handle).await {
                        warn!("removing backend for {}: {:?}", id, e);
                    }
                }
                Err(e) => warn!("no driver to remove backend for {}: {:#}", id, e),
            }
        }

        self.store.remove(id);
        info!("workspace {} deleted", id);
        Ok(())
    }

    /// Setup log lines, oldest first.
    pub fn log(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.get(id)?.log_lines())
    }

    /// Run a command inside the workspace's backend (or on the CLI host
    /// for tunnel-attached workspaces).
    pub async fn exec(&self, id: &str, command: &[String]) -> Result<String> {
        let workspace = self.get(id)?;

        if let Some(handle) = self.tunnels.get(id) {
            let value = handle
                .exec(command, TUNNEL_CALL_TIMEOUT)
                .await
                .map_err(|e| anyhow!("tunnel exec failed: {}", e))?;
            return Ok(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }

        let backend_ref = workspace
            .backend_ref
            .as_deref()
            .ok_or_else(|| anyhow!("workspace {} has no backend", id))?;
        let driver = self.driver_for(workspace.kind)?;
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        driver
            .exec(backend_ref, &args)
            .await
            .context("executing command in backend")
    }

    /// Forward a raw input event to the workspace's workbench page.
    pub async fn dispatch_input(&self, id: &str, request: InputRequest) -> Result<()> {
        let workspace = self.get(id)?;
        if self.tunnels.is_connected(id) {
            bail!("input passthrough requires a direct connection");
        }
        let endpoint = workspace
            .endpoint
            .ok_or_else(|| anyhow!("workspace {} has no debug endpoint", id))?;

        let target = self
            .resolver
            .resolve(&endpoint.host, endpoint.port, TargetRole::Workbench)
            .await
            .ok_or_else(|| anyhow!("no workbench target at {}", endpoint))?;
        let ws_url = target
            .ws_url
            .ok_or_else(|| anyhow!("workbench target is not debuggable"))?;

        let channel = CdpChannel::connect(&ws_url).await?;
        let result = match request.kind {
            InputKind::Mouse => channel.dispatch_mouse_event(request.params).await,
            InputKind::Key => channel.dispatch_key_event(request.params).await,
        };
        channel.close();
        result.context("dispatching input event")?;
        Ok(())
    }

    /// List the workspace IDE's debuggable targets.
    pub async fn targets(&self, id: &str) -> Result<Vec<Target>> {
        let workspace = self.get(id)?;
        let transport = self.transport_for(&workspace)?;
        transport
            .list_targets()
            .await
            .context("listing workspace targets")
    }

    /// Pick the evaluation transport for a workspace. A live tunnel always
    /// wins over dialing the endpoint directly.
    fn transport_for(&self, workspace: &Workspace) -> Result<Arc<dyn EvalTransport>> {
        if self.tunnels.is_connected(&workspace.id) {
            return Ok(Arc::new(TunneledTransport::new(
                Arc::clone(&self.tunnels),
                &workspace.id,
            )));
        }
        let endpoint = workspace
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("workspace {} has no debug endpoint", workspace.id))?;
        Ok(Arc::new(
            DirectTransport::new(Arc::clone(&self.resolver), endpoint.host, endpoint.port)
                .with_role(TargetRole::AgentPanel),
        ))
    }

    fn start_monitor(&self, id: &str) {
        let Ok(workspace) = self.get(id) else { return };
        match self.transport_for(&workspace) {
            Ok(transport) => self.monitors.start(
                id,
                transport,
                Arc::clone(&self.hub),
                MonitorConfig {
                    poll_interval: self.config.poll_interval,
                },
            ),
            Err(e) => warn!("cannot monitor workspace {}: {:#}", id, e),
        }
    }

    /// Remove leftover backends from a previous server run.
    ///
    /// Only backends carrying the managed name prefix and not claimed by
    /// any current record are touched.
    pub async fn startup_cleanup(&self) -> Result<()> {
        let Some(ref driver) = self.container_driver else {
            return Ok(());
        };
        let claimed: HashSet<String> = self.store.list().into_iter().map(|w| w.name).collect();
        let managed = driver
            .list_managed()
            .await
            .context("listing managed backends")?;
        for backend in managed {
            if backend.name.starts_with(WORKSPACE_NAME_PREFIX) && !claimed.contains(&backend.name) {
                info!("removing orphan backend {} ({})", backend.name, short_handle(&backend.handle));
                if let Err(e) = driver.remove(&backend.handle).await {
                    warn!("failed to remove orphan {}: {:?}", backend.name, e);
                }
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stop all monitors and, when asked, every
    /// workspace that is still up.
    pub async fn shutdown(&self, stop_workspaces: bool) {
        self.monitors.stop_all();
        if !stop_workspaces {
            return;
        }
        for workspace in self.store.list() {
            if matches!(
                workspace.status,
                WorkspaceStatus::Running | WorkspaceStatus::NeedsLogin | WorkspaceStatus::Initializing
            ) {
                if let Err(e) = self.stop(&workspace.id).await {
                    warn!("failed to stop {} during shutdown: {:#}", workspace.id, e);
                }
            }
        }
    }

    /// Find a free host port for a new debug endpoint, skipping ports any
    /// existing record already claims.
    fn allocate_port(&self) -> Result<u16> {
        let claimed: HashSet<u16> = self
            .store
            .list()
            .into_iter()
            .filter_map(|w| w.endpoint.map(|e| e.port))
            .collect();
        let end = self.config.base_port.saturating_add(PORT_SCAN_RANGE);
        for port in self.config.base_port..end {
            if claimed.contains(&port) {
                continue;
            }
            if is_port_available(port) {
                return Ok(port);
            }
        }
        bail!("no free debug port in {}..{}", self.config.base_port, end)
    }

    fn set_status(
        &self,
        id: &str,
        to: WorkspaceStatus,
        stage: Option<&str>,
        message: Option<&str>,
    ) -> Option<Workspace> {
        match self.store.transition(id, to) {
            Ok(Some(mut workspace)) => {
                if let Some(stage) = stage {
                    if let Some(updated) =
                        self.store.update(id, |w| w.stage = Some(stage.to_string()))
                    {
                        workspace = updated;
                    }
                }
                self.hub.emit(WorkspaceEvent::Status {
                    workspace_id: id.to_string(),
                    status: to,
                    stage: workspace.stage.clone(),
                    message: message.map(str::to_string),
                });
                Some(workspace)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    fn set_stage(&self, id: &str, stage: &str) {
        if let Some(workspace) = self.store.update(id, |w| w.stage = Some(stage.to_string())) {
            self.hub.emit(WorkspaceEvent::Status {
                workspace_id: id.to_string(),
                status: workspace.status,
                stage: workspace.stage.clone(),
                message: None,
            });
        }
    }

    fn log_line(&self, id: &str, line: &str) {
        self.store.update(id, |w| w.push_log(line));
        self.hub.emit(WorkspaceEvent::Log {
            workspace_id: id.to_string(),
            line: line.to_string(),
        });
    }

    fn mark_failed(&self, id: &str, message: &str) {
        warn!("workspace {} failed: {}", id, message);
        self.log_line(id, &format!("Initialization failed: {}", message));
        self.set_status(id, WorkspaceStatus::Error, None, Some(message));
    }
}

/// Lifecycle callbacks from CLI tunnels. The CLI is authoritative for its
/// own workspace, so these settle records directly.
#[async_trait]
impl TunnelEvents for WorkspaceService {
    async fn tunnel_ready(&self, workspace_id: &str) {
        let Ok(workspace) = self.get(workspace_id) else {
            debug!("cli:ready from unknown workspace {}", workspace_id);
            return;
        };
        if workspace.status != WorkspaceStatus::Running {
            // Running is only reachable through initializing.
            self.set_status(workspace_id, WorkspaceStatus::Initializing, None, None);
            self.set_status(workspace_id, WorkspaceStatus::Running, None, None);
        }
        self.log_line(workspace_id, "CLI reports workspace ready");
        self.start_monitor(workspace_id);
    }

    async fn tunnel_stopped(&self, workspace_id: &str) {
        if !self.store.contains(workspace_id) {
            return;
        }
        self.monitors.stop(workspace_id);
        self.log_line(workspace_id, "CLI reports workspace stopped");
        self.set_status(workspace_id, WorkspaceStatus::Stopped, None, None);
    }

    async fn tunnel_disconnected(&self, workspace_id: &str) {
        let Ok(workspace) = self.get(workspace_id) else {
            return;
        };
        self.monitors.stop(workspace_id);
        if matches!(
            workspace.status,
            WorkspaceStatus::Running | WorkspaceStatus::NeedsLogin | WorkspaceStatus::Initializing
        ) {
            self.set_status(
                workspace_id,
                WorkspaceStatus::Stopped,
                None,
                Some("CLI tunnel disconnected"),
            );
        }
    }
}

fn short_handle(handle: &str) -> &str {
    &handle[..handle.len().min(12)]
}

/// Whether the backend's actual mount disagrees with the record.
///
/// Paths are canonicalized so symlinked spellings of the same directory
/// do not force a pointless recreate.
fn mount_differs(recorded: &str, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    canonical(recorded) != canonical(actual)
}

fn canonical(path: &str) -> String {
    Path::new(path)
        .canonicalize()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, BackendStatus, ManagedBackend};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDriver {
        calls: Mutex<Vec<String>>,
        inspect_reply: Mutex<Option<BackendStatus>>,
        managed: Mutex<Vec<ManagedBackend>>,
    }

    impl FakeDriver {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BackendDriver for FakeDriver {
        async fn create(&self, spec: &BackendSpec) -> BackendResult<String> {
            self.record(format!("create:{}", spec.name));
            Ok(format!("handle-{}", spec.name))
        }

        async fn start(&self, handle: &str) -> BackendResult<()> {
            self.record(format!("start:{}", handle));
            Ok(())
        }

        async fn stop(&self, handle: &str) -> BackendResult<()> {
            self.record(format!("stop:{}", handle));
            Ok(())
        }

        async fn remove(&self, handle: &str) -> BackendResult<()> {
            self.record(format!("remove:{}", handle));
            Ok(())
        }

        async fn inspect(&self, handle: &str) -> BackendResult<Option<BackendStatus>> {
            self.record(format!("inspect:{}", handle));
            Ok(self.inspect_reply.lock().unwrap().clone())
        }

        async fn exec(&self, handle: &str, command: &[&str]) -> BackendResult<String> {
            self.record(format!("exec:{}:{}", handle, command.join(" ")));
            Ok(String::new())
        }

        async fn exec_detached(&self, handle: &str, _command: &[&str]) -> BackendResult<()> {
            self.record(format!("exec_detached:{}", handle));
            Ok(())
        }

        async fn list_managed(&self) -> BackendResult<Vec<ManagedBackend>> {
            Ok(self.managed.lock().unwrap().clone())
        }
    }

    struct NoopReadiness;

    #[async_trait]
    impl CdpReadiness for NoopReadiness {
        async fn wait_for_cdp(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    struct FailingReadiness;

    #[async_trait]
    impl CdpReadiness for FailingReadiness {
        async fn wait_for_cdp(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
            bail!(
                "CDP endpoint {}:{} not ready after 1 probes over {:?}",
                host,
                port,
                timeout
            )
        }
    }

    fn service_with(
        driver: Arc<FakeDriver>,
        readiness: Arc<dyn CdpReadiness>,
    ) -> WorkspaceService {
        WorkspaceService {
            store: Arc::new(WorkspaceStore::new()),
            hub: Arc::new(EventHub::new()),
            resolver: Arc::new(TargetResolver::new()),
            tunnels: Arc::new(TunnelRegistry::new()),
            monitors: Arc::new(MonitorRegistry::new()),
            container_driver: Some(driver),
            process_driver: None,
            readiness,
            config: ServiceConfig::default(),
        }
    }

    fn container_request(workdir: &str) -> CreateWorkspaceRequest {
        CreateWorkspaceRequest {
            name: None,
            kind: WorkspaceKind::Container,
            workdir: workdir.to_string(),
            credentials: None,
        }
    }

    #[tokio::test]
    async fn workspace_without_credentials_settles_in_needs_login() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let created = service.create(container_request("/tmp/project")).unwrap();
        assert_eq!(created.status, WorkspaceStatus::Creating);
        assert!(created.name.starts_with("orca-"));

        let settled = service.start(&created.id).await.unwrap();
        assert_eq!(settled.status, WorkspaceStatus::NeedsLogin);
        assert!(settled.endpoint.is_some());
        assert!(!service.monitors.is_active(&created.id));

        let calls = driver.calls();
        assert!(calls.iter().any(|c| c.starts_with("create:orca-")));
        assert!(!calls.iter().any(|c| c.starts_with("exec:")));

        let log = service.log(&created.id).unwrap();
        assert!(log.iter().any(|l| l.contains("Allocated debug port")));
    }

    #[tokio::test]
    async fn credentials_are_injected_and_the_ide_restarted() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let mut request = container_request("/tmp/project");
        request.credentials = Some(super::super::Credentials {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: 1_700_000_000_000,
        });
        let created = service.create(request).unwrap();

        let settled = service.start(&created.id).await.unwrap();
        assert_eq!(settled.status, WorkspaceStatus::Running);
        assert!(service.monitors.is_active(&created.id));

        let calls = driver.calls();
        let exec_pos = calls.iter().position(|c| c.starts_with("exec:")).unwrap();
        let stop_pos = calls.iter().position(|c| c.starts_with("stop:")).unwrap();
        let start_pos = calls.iter().position(|c| c.starts_with("start:")).unwrap();
        assert!(exec_pos < stop_pos && stop_pos < start_pos);
        assert!(calls[exec_pos].contains("base64 -d"));

        service.monitors.stop_all();
    }

    #[tokio::test]
    async fn readiness_timeout_lands_the_workspace_in_error() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(FailingReadiness));

        let created = service.create(container_request("/tmp/project")).unwrap();
        let result = service.start(&created.id).await;
        assert!(result.is_err());

        let workspace = service.get(&created.id).unwrap();
        assert_eq!(workspace.status, WorkspaceStatus::Error);
        assert_eq!(workspace.stage, None);

        let log = service.log(&created.id).unwrap();
        assert!(log.iter().any(|l| l.contains("Initialization failed")));
        assert!(log.iter().any(|l| l.contains("not ready")));
    }

    #[tokio::test]
    async fn restart_after_stop_passes_through_initializing() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));
        let mut rx = service.hub.subscribe();

        let created = service.create(container_request("/tmp/project")).unwrap();
        service.start(&created.id).await.unwrap();
        // A stopped backend still exists on re-start.
        *driver.inspect_reply.lock().unwrap() = Some(BackendStatus {
            running: false,
            address: None,
            workdir: Some("/tmp/project".to_string()),
        });
        service.stop(&created.id).await.unwrap();
        service.start(&created.id).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkspaceEvent::Status { status, .. } = event {
                statuses.push(status);
            }
        }
        let stopped_pos = statuses
            .iter()
            .position(|s| *s == WorkspaceStatus::Stopped)
            .unwrap();
        assert_eq!(statuses[stopped_pos + 1], WorkspaceStatus::Initializing);
        assert_eq!(*statuses.last().unwrap(), WorkspaceStatus::NeedsLogin);

        // The existing backend was started, not recreated.
        let creates = driver
            .calls()
            .iter()
            .filter(|c| c.starts_with("create:"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn workdir_drift_forces_backend_recreation() {
        let old_dir = tempfile::tempdir().unwrap();
        let new_dir = tempfile::tempdir().unwrap();

        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let created = service
            .create(container_request(new_dir.path().to_str().unwrap()))
            .unwrap();
        service.start(&created.id).await.unwrap();
        service.stop(&created.id).await.unwrap();

        // The live backend still mounts the old directory.
        *driver.inspect_reply.lock().unwrap() = Some(BackendStatus {
            running: false,
            address: None,
            workdir: Some(old_dir.path().display().to_string()),
        });
        service.start(&created.id).await.unwrap();

        let calls = driver.calls();
        assert!(calls.iter().any(|c| c.starts_with("remove:")));
        let creates = calls.iter().filter(|c| c.starts_with("create:")).count();
        assert_eq!(creates, 2);
    }

    #[tokio::test]
    async fn same_workdir_reuses_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let created = service
            .create(container_request(dir.path().to_str().unwrap()))
            .unwrap();
        service.start(&created.id).await.unwrap();
        service.stop(&created.id).await.unwrap();

        *driver.inspect_reply.lock().unwrap() = Some(BackendStatus {
            running: false,
            address: None,
            workdir: Some(dir.path().display().to_string()),
        });
        service.start(&created.id).await.unwrap();

        let calls = driver.calls();
        assert!(!calls.iter().any(|c| c.starts_with("remove:")));
        let creates = calls.iter().filter(|c| c.starts_with("create:")).count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn startup_cleanup_sweeps_only_unclaimed_prefixed_backends() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let created = service.create(container_request("/tmp/project")).unwrap();
        *driver.managed.lock().unwrap() = vec![
            ManagedBackend {
                handle: "h1".to_string(),
                name: "orca-orphan1".to_string(),
            },
            ManagedBackend {
                handle: "h2".to_string(),
                name: created.name.clone(),
            },
            ManagedBackend {
                handle: "h3".to_string(),
                name: "unrelated-container".to_string(),
            },
        ];

        service.startup_cleanup().await.unwrap();

        let removed: Vec<String> = driver
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("remove:"))
            .collect();
        assert_eq!(removed, vec!["remove:h1".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_backend_and_record() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let created = service.create(container_request("/tmp/project")).unwrap();
        service.start(&created.id).await.unwrap();
        service.delete(&created.id).await.unwrap();

        assert!(service.get(&created.id).is_err());
        assert!(driver.calls().iter().any(|c| c.starts_with("remove:")));
    }

    #[tokio::test]
    async fn tunnel_disconnect_stops_a_running_workspace() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let created = service.create(container_request("/tmp/project")).unwrap();
        service.store.transition(&created.id, WorkspaceStatus::Initializing).unwrap();
        service.store.transition(&created.id, WorkspaceStatus::Running).unwrap();

        service.tunnel_disconnected(&created.id).await;
        assert_eq!(
            service.get(&created.id).unwrap().status,
            WorkspaceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn tunnel_ready_settles_a_stopped_workspace_as_running() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(Arc::clone(&driver), Arc::new(NoopReadiness));

        let created = service.create(container_request("/tmp/project")).unwrap();
        service.store.transition(&created.id, WorkspaceStatus::Initializing).unwrap();
        service.store.transition(&created.id, WorkspaceStatus::Stopped).unwrap();

        // Register a tunnel so the monitor gets the tunneled transport.
        let (_handle, _rx) = service.tunnels.register(&created.id);
        service.tunnel_ready(&created.id).await;

        assert_eq!(
            service.get(&created.id).unwrap().status,
            WorkspaceStatus::Running
        );
        assert!(service.monitors.is_active(&created.id));
        service.monitors.stop_all();
    }

    #[tokio::test]
    async fn create_rejects_hostile_names() {
        let driver = Arc::new(FakeDriver::default());
        let service = service_with(driver, Arc::new(NoopReadiness));

        let mut request = container_request("/tmp/project");
        request.name = Some("bad; rm -rf /".to_string());
        assert!(service.create(request).is_err());
    }

    #[tokio::test]
    async fn start_fails_cleanly_without_a_driver() {
        let service = WorkspaceService {
            store: Arc::new(WorkspaceStore::new()),
            hub: Arc::new(EventHub::new()),
            resolver: Arc::new(TargetResolver::new()),
            tunnels: Arc::new(TunnelRegistry::new()),
            monitors: Arc::new(MonitorRegistry::new()),
            container_driver: None,
            process_driver: None,
            readiness: Arc::new(NoopReadiness),
            config: ServiceConfig::default(),
        };

        let created = service.create(container_request("/tmp/project")).unwrap();
        assert!(service.start(&created.id).await.is_err());
    }
}
