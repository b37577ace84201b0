//! Background health reconciliation.
//!
//! The orchestrator's records can go stale when a backend dies out of
//! band (docker kill, crashed IDE, dropped tunnel). The reconciler
//! periodically compares records against ground truth and corrects in one
//! direction only: a workspace recorded as alive whose backend is gone
//! gets downgraded. It never resurrects anything; only the lifecycle
//! service moves workspaces up.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::BackendDriver;
use crate::events::{EventHub, WorkspaceEvent};
use crate::sync::MonitorRegistry;
use crate::tunnel::TunnelRegistry;

use super::{Workspace, WorkspaceKind, WorkspaceStatus, WorkspaceStore};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

pub struct HealthReconciler {
    store: Arc<WorkspaceStore>,
    hub: Arc<EventHub>,
    tunnels: Arc<TunnelRegistry>,
    monitors: Arc<MonitorRegistry>,
    container_driver: Option<Arc<dyn BackendDriver>>,
    process_driver: Option<Arc<dyn BackendDriver>>,
    config: ReconcilerConfig,
}

impl HealthReconciler {
    pub fn new(
        store: Arc<WorkspaceStore>,
        hub: Arc<EventHub>,
        tunnels: Arc<TunnelRegistry>,
        monitors: Arc<MonitorRegistry>,
        container_driver: Option<Arc<dyn BackendDriver>>,
        process_driver: Option<Arc<dyn BackendDriver>>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            hub,
            tunnels,
            monitors,
            container_driver,
            process_driver,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.reconcile_once().await;
            }
        })
    }

    /// One reconciliation sweep over every record claiming to be alive.
    pub async fn reconcile_once(&self) {
        for workspace in self.store.list() {
            if !matches!(
                workspace.status,
                WorkspaceStatus::Running
                    | WorkspaceStatus::NeedsLogin
                    | WorkspaceStatus::Initializing
            ) {
                continue;
            }
            let Some(alive) = self.backend_alive(&workspace).await else {
                continue;
            };
            if !alive {
                self.correct(&workspace);
            }
        }
    }

    /// Ground-truth liveness. `None` means "cannot tell right now"; the
    /// sweep must not correct on uncertainty.
    async fn backend_alive(&self, workspace: &Workspace) -> Option<bool> {
        let Some(ref handle) = workspace.backend_ref else {
            // No backend of our own. Tunnel-attached workspaces are alive
            // exactly while their CLI socket is; a record still mid-create
            // has no ground truth yet.
            if workspace.status == WorkspaceStatus::Initializing {
                return None;
            }
            return Some(self.tunnels.is_connected(&workspace.id));
        };

        let driver = match workspace.kind {
            WorkspaceKind::Container => self.container_driver.as_ref()?,
            WorkspaceKind::Process => self.process_driver.as_ref()?,
        };
        match driver.inspect(handle).await {
            Ok(Some(status)) => Some(status.running),
            Ok(None) => Some(false),
            Err(e) => {
                debug!(
                    "inspect failed for {} during reconcile: {:?}",
                    workspace.id, e
                );
                None
            }
        }
    }

    fn correct(&self, workspace: &Workspace) {
        let corrected = if workspace.status == WorkspaceStatus::Initializing {
            WorkspaceStatus::Error
        } else {
            WorkspaceStatus::Stopped
        };
        match self.store.transition(&workspace.id, corrected) {
            Ok(Some(_)) => {
                info!(
                    "workspace {} backend is gone, correcting {} -> {}",
                    workspace.id, workspace.status, corrected
                );
                self.monitors.stop(&workspace.id);
                self.store
                    .update(&workspace.id, |w| w.push_log("Backend is no longer alive"));
                self.hub.emit(WorkspaceEvent::Status {
                    workspace_id: workspace.id.clone(),
                    status: corrected,
                    stage: None,
                    message: Some("backend is no longer alive".to_string()),
                });
            }
            Ok(None) => {}
            Err(e) => debug!("reconcile correction skipped: {}", e),
        }
    }
}
