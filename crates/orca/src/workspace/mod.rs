//! Workspace records, lifecycle state machine, and the services that own
//! them.

mod credentials;
mod reconciler;
mod service;
mod store;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use credentials::{Credentials, encode_credential, injection_command};
pub use reconciler::{HealthReconciler, ReconcilerConfig};
pub use service::{
    CreateWorkspaceRequest, InputKind, InputRequest, ServiceConfig, WorkspaceService,
};
pub use store::{TransitionError, WorkspaceStore};

/// Lines kept in a workspace's setup log ring.
pub const INIT_LOG_CAPACITY: usize = 200;

/// Which lifecycle driver owns a workspace's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Container,
    Process,
}

/// Workspace lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkspaceStatus {
    Creating,
    Initializing,
    NeedsLogin,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceStatus::Creating => write!(f, "creating"),
            WorkspaceStatus::Initializing => write!(f, "initializing"),
            WorkspaceStatus::NeedsLogin => write!(f, "needsLogin"),
            WorkspaceStatus::Running => write!(f, "running"),
            WorkspaceStatus::Stopped => write!(f, "stopped"),
            WorkspaceStatus::Error => write!(f, "error"),
        }
    }
}

/// Legal lifecycle moves. Every route into `running` or `needsLogin` goes
/// through `initializing`; nothing skips it.
pub fn can_transition(from: WorkspaceStatus, to: WorkspaceStatus) -> bool {
    use WorkspaceStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Creating, Initializing)
            | (Initializing, Running)
            | (Initializing, NeedsLogin)
            | (Initializing, Error)
            | (Initializing, Stopped)
            | (NeedsLogin, Initializing)
            | (NeedsLogin, Stopped)
            | (Running, Stopped)
            | (Stopped, Initializing)
            | (Error, Initializing)
    )
}

/// CDP debug endpoint of a workspace's IDE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn loopback(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The central workspace record.
///
/// Mutated only by the lifecycle service (authoritative) and the health
/// reconciler (corrective, downward only). Everyone else reads snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    /// Backend name, also used for container naming.
    pub name: String,
    pub kind: WorkspaceKind,
    pub status: WorkspaceStatus,
    /// Sub-phase label shown while `initializing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// Container id / process handle. Owned by the lifecycle service and
    /// never interpreted anywhere else.
    #[serde(skip)]
    pub backend_ref: Option<String>,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// Host directory the IDE opens.
    pub workdir: String,
    /// Ring of recent setup log lines.
    #[serde(skip)]
    init_log: VecDeque<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the workspace last settled `running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the workspace last entered `stopped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Workspace {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: WorkspaceKind,
        workdir: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            status: WorkspaceStatus::Creating,
            stage: None,
            endpoint: None,
            backend_ref: None,
            credentials: None,
            workdir: workdir.into(),
            init_log: VecDeque::with_capacity(INIT_LOG_CAPACITY),
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    /// Append a setup log line, dropping the oldest when full.
    pub fn push_log(&mut self, line: impl Into<String>) {
        if self.init_log.len() == INIT_LOG_CAPACITY {
            self.init_log.pop_front();
        }
        self.init_log.push_back(line.into());
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.init_log.iter().cloned().collect()
    }
}
