//! CDP RPC channel.
//!
//! One instance per target WebSocket. Multiplexes request/response calls
//! (correlated by id) and unsolicited protocol events over the same socket.
//! Closing the socket rejects every call still in flight so no caller is
//! left waiting on a dead connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::pending::{CallError, CallResult, PendingCalls};

/// Size of the event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Size of the outbound frame buffer.
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Timeout for short control calls (enable, ack, input dispatch).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors opening a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
}

/// An unsolicited protocol event.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// A live CDP connection to one target.
pub struct CdpChannel {
    next_id: AtomicU64,
    pending: Arc<PendingCalls<u64>>,
    outbound: mpsc::Sender<String>,
    events: broadcast::Sender<CdpEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpChannel {
    /// Dial a target's DevTools WebSocket and start the frame pumps.
    pub async fn connect(ws_url: &str) -> Result<Self, ChannelError> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER_SIZE);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let pending: Arc<PendingCalls<u64>> = Arc::new(PendingCalls::new());

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let pending_reader = Arc::clone(&pending);
        let event_tx_reader = event_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        dispatch_frame(&pending_reader, &event_tx_reader, text.as_str());
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!("CDP socket error: {:?}", e);
                        break;
                    }
                    _ => {}
                }
            }
            pending_reader.reject_all(CallError::ConnectionClosed);
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outbound: out_tx,
            events: event_tx,
            reader,
            writer,
        })
    }

    /// Issue one protocol call and wait for its response.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> CallResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = self.pending.register(id);

        let frame = json!({
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        if self.outbound.send(frame).await.is_err() {
            self.pending.discard(&id);
            return Err(CallError::ConnectionClosed);
        }

        self.pending.wait(&id, slot, timeout).await
    }

    /// Subscribe to unsolicited protocol events.
    pub fn events(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Tear the channel down, rejecting everything still in flight.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.pending.reject_all(CallError::ConnectionClosed);
    }

    pub async fn enable_runtime(&self) -> CallResult<Value> {
        self.call("Runtime.enable", json!({}), CONTROL_TIMEOUT).await
    }

    /// Evaluate an expression, optionally pinned to one execution context.
    ///
    /// Returns the raw evaluate envelope; callers unwrap `result.value` or
    /// `exceptionDetails` themselves.
    pub async fn evaluate(
        &self,
        expression: &str,
        context_id: Option<u64>,
        timeout: Duration,
    ) -> CallResult<Value> {
        let mut params = json!({
            "expression": expression,
            "returnByValue": true,
            "awaitPromise": true,
        });
        if let Some(ctx) = context_id {
            params["contextId"] = json!(ctx);
        }
        self.call("Runtime.evaluate", params, timeout).await
    }

    pub async fn enable_page(&self) -> CallResult<Value> {
        self.call("Page.enable", json!({}), CONTROL_TIMEOUT).await
    }

    pub async fn start_screencast(&self, max_width: u32, max_height: u32) -> CallResult<Value> {
        self.call(
            "Page.startScreencast",
            json!({
                "format": "jpeg",
                "quality": 70,
                "maxWidth": max_width,
                "maxHeight": max_height,
            }),
            CONTROL_TIMEOUT,
        )
        .await
    }

    pub async fn stop_screencast(&self) -> CallResult<Value> {
        self.call("Page.stopScreencast", json!({}), CONTROL_TIMEOUT)
            .await
    }

    /// Acknowledge a screencast frame so Chromium keeps sending them.
    pub async fn ack_screencast_frame(&self, session_id: u64) -> CallResult<Value> {
        self.call(
            "Page.screencastFrameAck",
            json!({ "sessionId": session_id }),
            CONTROL_TIMEOUT,
        )
        .await
    }

    /// Forward a mouse event; params follow Input.dispatchMouseEvent.
    pub async fn dispatch_mouse_event(&self, params: Value) -> CallResult<Value> {
        self.call("Input.dispatchMouseEvent", params, CONTROL_TIMEOUT)
            .await
    }

    /// Forward a key event; params follow Input.dispatchKeyEvent.
    pub async fn dispatch_key_event(&self, params: Value) -> CallResult<Value> {
        self.call("Input.dispatchKeyEvent", params, CONTROL_TIMEOUT)
            .await
    }
}

impl Drop for CdpChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.pending.reject_all(CallError::ConnectionClosed);
    }
}

/// Route one incoming frame to the pending table or the event stream.
fn dispatch_frame(
    pending: &PendingCalls<u64>,
    events: &broadcast::Sender<CdpEvent>,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("unparseable CDP frame: {:?}", e);
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
        let delivered = if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown CDP error")
                .to_string();
            pending.reject(&id, CallError::Remote(message))
        } else {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            pending.resolve(&id, result)
        };
        if !delivered {
            debug!("dropping reply for unknown call id {}", id);
        }
    } else if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let _ = events.send(CdpEvent {
            method: method.to_string(),
            params,
        });
    }
}
