//! Dual evaluation transport.
//!
//! The same automation code runs whether the server can dial a workspace's
//! DevTools socket itself (containers, local processes) or has to relay
//! through the persistent WebSocket a remote CLI keeps open. Both paths
//! expose one trait, so callers never know which they got.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

use super::channel::{CdpChannel, ChannelError};
use super::eval::{ContextTracker, EvalOutcome, SuccessShape, eval_across_contexts};
use super::targets::{Target, TargetResolver, TargetRole};
use crate::pending::CallError;
use crate::tunnel::{TUNNEL_CALL_TIMEOUT, TunnelRegistry};

/// Default deadline for one evaluation round trip.
const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a fresh connection waits for execution contexts to announce
/// themselves after `Runtime.enable`. CDP does not reliably replay
/// pre-existing contexts on enable, so this compensating delay is load
/// bearing, not cosmetic.
const CONTEXT_GRACE: Duration = Duration::from_millis(900);

/// Per-call evaluation options.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub timeout: Duration,
    pub success: SuccessShape,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EVAL_TIMEOUT,
            success: SuccessShape::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no debuggable target reachable at {0}")]
    Unreachable(String),

    #[error("no CLI tunnel registered for workspace {0}")]
    NoTunnel(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Call(#[from] CallError),
}

/// Transport-agnostic evaluation surface.
#[async_trait]
pub trait EvalTransport: Send + Sync {
    /// Run a script against the workspace's IDE, across its contexts.
    async fn evaluate(
        &self,
        script: &str,
        opts: &EvalOptions,
    ) -> Result<Vec<EvalOutcome>, TransportError>;

    /// List the IDE's debuggable targets.
    async fn list_targets(&self) -> Result<Vec<Target>, TransportError>;
}

/// Direct transport: the server dials the DevTools socket itself.
pub struct DirectTransport {
    resolver: Arc<TargetResolver>,
    host: String,
    port: u16,
    role: TargetRole,
    tracker: ContextTracker,
}

impl DirectTransport {
    pub fn new(resolver: Arc<TargetResolver>, host: impl Into<String>, port: u16) -> Self {
        Self {
            resolver,
            host: host.into(),
            port,
            role: TargetRole::default(),
            tracker: ContextTracker::new(),
        }
    }

    pub fn with_role(mut self, role: TargetRole) -> Self {
        self.role = role;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl EvalTransport for DirectTransport {
    async fn evaluate(
        &self,
        script: &str,
        opts: &EvalOptions,
    ) -> Result<Vec<EvalOutcome>, TransportError> {
        let target = self
            .resolver
            .resolve(&self.host, self.port, self.role)
            .await
            .ok_or_else(|| TransportError::Unreachable(self.address()))?;
        let ws_url = target
            .ws_url
            .ok_or_else(|| TransportError::Unreachable(self.address()))?;

        let channel = CdpChannel::connect(&ws_url).await?;
        // Subscribe before enabling so no announcement slips past.
        let mut events = channel.events();
        self.tracker.begin_session();

        channel.enable_runtime().await?;

        let deadline = tokio::time::Instant::now() + CONTEXT_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(event)) => self.tracker.observe(&event),
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => break,
            }
        }

        let contexts = self.tracker.ordered();
        let outcomes =
            eval_across_contexts(&channel, script, &contexts, &opts.success, opts.timeout).await;

        if let [outcome] = outcomes.as_slice() {
            if let Some(ctx) = outcome.context_id {
                if opts.success.matches(&outcome.value) {
                    self.tracker.promote(ctx);
                }
            }
        }

        channel.close();
        Ok(outcomes)
    }

    async fn list_targets(&self) -> Result<Vec<Target>, TransportError> {
        self.resolver
            .list(&self.host, self.port)
            .await
            .ok_or_else(|| TransportError::Unreachable(self.address()))
    }
}

/// Tunneled transport: a remote CLI performs the dial on our behalf.
pub struct TunneledTransport {
    workspace_id: String,
    registry: Arc<TunnelRegistry>,
}

impl TunneledTransport {
    pub fn new(registry: Arc<TunnelRegistry>, workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            registry,
        }
    }
}

#[async_trait]
impl EvalTransport for TunneledTransport {
    async fn evaluate(
        &self,
        script: &str,
        opts: &EvalOptions,
    ) -> Result<Vec<EvalOutcome>, TransportError> {
        let handle = self
            .registry
            .get(&self.workspace_id)
            .ok_or_else(|| TransportError::NoTunnel(self.workspace_id.clone()))?;

        let value = handle.eval(script, opts.timeout).await?;
        Ok(outcomes_from_tunnel(value))
    }

    async fn list_targets(&self) -> Result<Vec<Target>, TransportError> {
        let handle = self
            .registry
            .get(&self.workspace_id)
            .ok_or_else(|| TransportError::NoTunnel(self.workspace_id.clone()))?;

        let value = handle.targets(TUNNEL_CALL_TIMEOUT).await?;
        Ok(targets_from_tunnel(value))
    }
}

/// Shape a tunnel eval reply into outcomes.
///
/// The CLI either relays the per-context sweep (array of
/// `{contextId, value}`) or a single bare value.
fn outcomes_from_tunnel(value: Value) -> Vec<EvalOutcome> {
    match value {
        Value::Array(entries) => entries
            .into_iter()
            .map(|entry| {
                if let Some(obj) = entry.as_object() {
                    if obj.contains_key("value") {
                        return EvalOutcome {
                            context_id: obj.get("contextId").and_then(Value::as_u64),
                            value: obj.get("value").cloned().unwrap_or(Value::Null),
                        };
                    }
                }
                EvalOutcome {
                    context_id: None,
                    value: entry,
                }
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![EvalOutcome {
            context_id: None,
            value: other,
        }],
    }
}

fn targets_from_tunnel(value: Value) -> Vec<Target> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|entry| Target {
            id: string_field(entry, "id"),
            title: string_field(entry, "title"),
            url: string_field(entry, "url"),
            ws_url: entry
                .get("wsUrl")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .collect()
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
