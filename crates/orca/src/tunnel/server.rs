//! Server side of the CLI tunnel.
//!
//! Each CLI client keeps one persistent WebSocket open, keyed by workspace
//! id. The server pushes request frames down and correlates `*:result`
//! replies through the same pending-call table the CDP channel uses, just
//! keyed by `requestId` instead of a protocol integer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::{CliFrame, ServerFrame};
use crate::pending::{CallError, CallResult, PendingCalls};

/// Keepalive interval for tunnel sockets.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Size of the per-tunnel outbound frame buffer.
const FRAME_BUFFER_SIZE: usize = 64;

/// Default deadline for tunnel requests.
pub const TUNNEL_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle notifications a connected CLI can push unsolicited.
#[async_trait]
pub trait TunnelEvents: Send + Sync {
    /// The CLI reports its workspace is up.
    async fn tunnel_ready(&self, workspace_id: &str);
    /// The CLI reports its workspace went down.
    async fn tunnel_stopped(&self, workspace_id: &str);
    /// The tunnel socket itself disconnected.
    async fn tunnel_disconnected(&self, workspace_id: &str);
}

/// One live tunnel connection.
pub struct TunnelHandle {
    tx: mpsc::Sender<ServerFrame>,
    pending: PendingCalls<String>,
}

impl TunnelHandle {
    fn channel() -> (Arc<Self>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER_SIZE);
        (
            Arc::new(Self {
                tx,
                pending: PendingCalls::new(),
            }),
            rx,
        )
    }

    /// Send a request frame and wait for its correlated reply.
    async fn request(
        &self,
        request_id: String,
        frame: ServerFrame,
        timeout: Duration,
    ) -> CallResult<Value> {
        let slot = self.pending.register(request_id.clone());
        if self.tx.send(frame).await.is_err() {
            self.pending.discard(&request_id);
            return Err(CallError::ConnectionClosed);
        }
        self.pending.wait(&request_id, slot, timeout).await
    }

    /// Route one `*:result` reply into the pending table.
    ///
    /// Replies with no matching entry are dropped; the call already timed
    /// out on our side.
    pub(crate) fn deliver(&self, request_id: &str, result: Option<Value>, error: Option<String>) {
        let key = request_id.to_string();
        let delivered = match error {
            Some(message) => self.pending.reject(&key, CallError::Remote(message)),
            None => self.pending.resolve(&key, result.unwrap_or(Value::Null)),
        };
        if !delivered {
            debug!("dropping unmatched tunnel reply {}", request_id);
        }
    }

    /// Number of requests awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn close(&self) {
        self.pending.reject_all(CallError::ConnectionClosed);
    }

    /// Evaluate a script in the CLI's IDE.
    pub async fn eval(&self, expression: &str, timeout: Duration) -> CallResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::CdpEval {
            request_id: request_id.clone(),
            expression: expression.to_string(),
            options: json!({ "timeoutMs": timeout.as_millis() as u64 }),
        };
        self.request(request_id, frame, timeout).await
    }

    /// List the CLI IDE's debuggable targets.
    pub async fn targets(&self, timeout: Duration) -> CallResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::CdpTargets {
            request_id: request_id.clone(),
        };
        self.request(request_id, frame, timeout).await
    }

    /// Run a command on the CLI host.
    pub async fn exec(&self, command: &[String], timeout: Duration) -> CallResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::CliExec {
            request_id: request_id.clone(),
            command: command.to_vec(),
        };
        self.request(request_id, frame, timeout).await
    }

    /// Ask the CLI to stop its workspace.
    pub async fn stop_workspace(&self, timeout: Duration) -> CallResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::WorkspaceStop {
            request_id: request_id.clone(),
        };
        self.request(request_id, frame, timeout).await
    }

    /// Ask the CLI to restart its workspace.
    pub async fn restart_workspace(&self, timeout: Duration) -> CallResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::WorkspaceRestart {
            request_id: request_id.clone(),
        };
        self.request(request_id, frame, timeout).await
    }
}

/// Registry of live tunnels, keyed by workspace id.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<TunnelHandle>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Register a fresh tunnel, replacing (and failing) any previous one.
    pub fn register(&self, workspace_id: &str) -> (Arc<TunnelHandle>, mpsc::Receiver<ServerFrame>) {
        let (handle, rx) = TunnelHandle::channel();
        if let Some(old) = self
            .tunnels
            .insert(workspace_id.to_string(), Arc::clone(&handle))
        {
            warn!("replacing existing tunnel for workspace {}", workspace_id);
            old.close();
        }
        (handle, rx)
    }

    /// Drop a tunnel, but only if `handle` is still the registered one.
    ///
    /// A reconnect may already have replaced the entry; the old socket's
    /// cleanup must not tear down the new tunnel.
    pub fn unregister(&self, workspace_id: &str, handle: &Arc<TunnelHandle>) {
        let removed = self
            .tunnels
            .remove_if(workspace_id, |_, current| Arc::ptr_eq(current, handle));
        if let Some((_, old)) = removed {
            old.close();
        }
    }

    pub fn get(&self, workspace_id: &str) -> Option<Arc<TunnelHandle>> {
        self.tunnels.get(workspace_id).map(|h| Arc::clone(&h))
    }

    pub fn is_connected(&self, workspace_id: &str) -> bool {
        self.tunnels.contains_key(workspace_id)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

/// Drive one accepted tunnel socket until it closes.
pub async fn run_tunnel(
    socket: WebSocket,
    registry: Arc<TunnelRegistry>,
    events: Arc<dyn TunnelEvents>,
    workspace_id: String,
) {
    let (handle, mut out_rx) = registry.register(&workspace_id);
    info!("CLI tunnel connected for workspace {}", workspace_id);

    let (mut sender, mut receiver) = socket.split();

    // Forward queued frames and keepalives to the CLI.
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let json = match serde_json::to_string(&frame) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("failed to serialize tunnel frame: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let Ok(json) = serde_json::to_string(&ServerFrame::Ping) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_cli_frame(&handle, events.as_ref(), &workspace_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("tunnel socket error for {}: {:?}", workspace_id, e);
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    registry.unregister(&workspace_id, &handle);
    events.tunnel_disconnected(&workspace_id).await;
    info!("CLI tunnel closed for workspace {}", workspace_id);
}

async fn handle_cli_frame(
    handle: &TunnelHandle,
    events: &dyn TunnelEvents,
    workspace_id: &str,
    text: &str,
) {
    let frame: CliFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("unparseable tunnel frame from {}: {}", workspace_id, e);
            return;
        }
    };

    match frame {
        CliFrame::CdpEvalResult {
            request_id,
            result,
            error,
        }
        | CliFrame::CdpTargetsResult {
            request_id,
            result,
            error,
        }
        | CliFrame::CliExecResult {
            request_id,
            result,
            error,
        }
        | CliFrame::WorkspaceStopResult {
            request_id,
            result,
            error,
        }
        | CliFrame::WorkspaceRestartResult {
            request_id,
            result,
            error,
        } => {
            handle.deliver(&request_id, result, error);
        }
        CliFrame::CliReady => events.tunnel_ready(workspace_id).await,
        CliFrame::CliStopped => events.tunnel_stopped(workspace_id).await,
        CliFrame::Pong => debug!("pong from workspace {}", workspace_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEvents {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TunnelEvents for RecordingEvents {
        async fn tunnel_ready(&self, workspace_id: &str) {
            self.seen.lock().unwrap().push(format!("ready:{}", workspace_id));
        }
        async fn tunnel_stopped(&self, workspace_id: &str) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("stopped:{}", workspace_id));
        }
        async fn tunnel_disconnected(&self, workspace_id: &str) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("disconnected:{}", workspace_id));
        }
    }

    #[tokio::test]
    async fn request_resolves_when_reply_arrives() {
        let registry = TunnelRegistry::new();
        let (handle, mut rx) = registry.register("w1");

        let responder = Arc::clone(&handle);
        tokio::spawn(async move {
            if let Some(ServerFrame::CdpEval { request_id, .. }) = rx.recv().await {
                responder.deliver(&request_id, Some(json!({"ok": true})), None);
            }
        });

        let result = handle.eval("probe()", Duration::from_secs(2)).await;
        assert_eq!(result, Ok(json!({"ok": true})));
        assert_eq!(handle.pending_calls(), 0);
    }

    #[tokio::test]
    async fn request_error_reply_rejects_the_call() {
        let registry = TunnelRegistry::new();
        let (handle, mut rx) = registry.register("w1");

        let responder = Arc::clone(&handle);
        tokio::spawn(async move {
            if let Some(ServerFrame::CliExec { request_id, .. }) = rx.recv().await {
                responder.deliver(&request_id, None, Some("command not found".to_string()));
            }
        });

        let result = handle
            .exec(&["frobnicate".to_string()], Duration::from_secs(2))
            .await;
        assert_eq!(
            result,
            Err(CallError::Remote("command not found".to_string()))
        );
    }

    #[tokio::test]
    async fn timeout_releases_the_pending_entry() {
        let registry = TunnelRegistry::new();
        let (handle, _rx) = registry.register("w1");

        let result = handle.eval("probe()", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CallError::Timeout(_))));
        assert_eq!(handle.pending_calls(), 0);
    }

    #[tokio::test]
    async fn reconnect_replaces_and_fails_the_old_tunnel() {
        let registry = TunnelRegistry::new();
        let (old, _old_rx) = registry.register("w1");

        let in_flight = {
            let old = Arc::clone(&old);
            tokio::spawn(async move { old.eval("probe()", Duration::from_secs(5)).await })
        };
        // Let the call get registered before replacing the tunnel.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (new, _new_rx) = registry.register("w1");
        assert!(Arc::ptr_eq(&registry.get("w1").unwrap(), &new));

        let result = in_flight.await.unwrap();
        assert_eq!(result, Err(CallError::ConnectionClosed));
    }

    #[tokio::test]
    async fn stale_unregister_leaves_the_new_tunnel_alone() {
        let registry = TunnelRegistry::new();
        let (old, _old_rx) = registry.register("w1");
        let (new, _new_rx) = registry.register("w1");

        registry.unregister("w1", &old);
        assert!(registry.is_connected("w1"));
        assert!(Arc::ptr_eq(&registry.get("w1").unwrap(), &new));

        registry.unregister("w1", &new);
        assert!(!registry.is_connected("w1"));
    }

    #[tokio::test]
    async fn unmatched_replies_are_dropped_silently() {
        let registry = TunnelRegistry::new();
        let (handle, _rx) = registry.register("w1");
        let events = RecordingEvents::default();

        handle_cli_frame(
            &handle,
            &events,
            "w1",
            r#"{"event":"cdp:eval:result","payload":{"requestId":"never-issued","result":{}}}"#,
        )
        .await;

        assert_eq!(handle.pending_calls(), 0);
        assert!(events.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_frames_reach_the_event_sink() {
        let registry = TunnelRegistry::new();
        let (handle, _rx) = registry.register("w1");
        let events = RecordingEvents::default();

        handle_cli_frame(&handle, &events, "w1", r#"{"event":"cli:ready"}"#).await;
        handle_cli_frame(&handle, &events, "w1", r#"{"event":"cli:stopped"}"#).await;
        handle_cli_frame(&handle, &events, "w1", r#"{"event":"pong"}"#).await;
        handle_cli_frame(&handle, &events, "w1", "not json").await;

        let seen = events.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["ready:w1".to_string(), "stopped:w1".to_string()]);
    }
}
