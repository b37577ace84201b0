//! Per-workspace conversation monitors.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::scripts::{EXTRACTION_SCRIPT, PROBE_SCRIPT};
use super::snapshot::{ConversationSnapshot, plan_update, value_hash};
use crate::cdp::{EvalOptions, EvalOutcome, EvalTransport, SuccessShape};
use crate::events::{EventHub, WorkspaceEvent};

/// Default interval between probe ticks.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Registry enforcing at most one monitor per workspace.
///
/// Starting a monitor for a workspace that already has one replaces it;
/// the old task is aborted before the new one is visible.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: DashMap<String, MonitorHandle>,
}

struct MonitorHandle {
    task: JoinHandle<()>,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self {
            monitors: DashMap::new(),
        }
    }

    /// Start (or restart) the monitor for a workspace.
    pub fn start(
        &self,
        workspace_id: &str,
        transport: Arc<dyn EvalTransport>,
        hub: Arc<EventHub>,
        config: MonitorConfig,
    ) {
        let monitor = Monitor::new(workspace_id, transport, hub);
        let interval = config.poll_interval;
        let task = tokio::spawn(monitor.run(interval));
        if self
            .monitors
            .insert(workspace_id.to_string(), MonitorHandle { task })
            .is_some()
        {
            warn!("replaced running monitor for workspace {}", workspace_id);
        }
    }

    /// Stop a workspace's monitor. Returns whether one was running.
    pub fn stop(&self, workspace_id: &str) -> bool {
        self.monitors.remove(workspace_id).is_some()
    }

    pub fn stop_all(&self) {
        self.monitors.clear();
    }

    pub fn is_active(&self, workspace_id: &str) -> bool {
        self.monitors.contains_key(workspace_id)
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

/// The polling loop for one workspace.
struct Monitor {
    workspace_id: String,
    transport: Arc<dyn EvalTransport>,
    hub: Arc<EventHub>,
    last_probe_hash: Option<String>,
    last_snapshot: Option<ConversationSnapshot>,
    last_target_ids: Vec<String>,
    reachable: bool,
}

impl Monitor {
    fn new(workspace_id: &str, transport: Arc<dyn EvalTransport>, hub: Arc<EventHub>) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            transport,
            hub,
            last_probe_hash: None,
            last_snapshot: None,
            last_target_ids: Vec::new(),
            reachable: false,
        }
    }

    async fn run(mut self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        // A slow IDE must not cause a burst of catch-up probes.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.poll().await;
        }
    }

    /// One probe tick. Failures are logged and absorbed; the next tick
    /// simply tries again.
    async fn poll(&mut self) {
        let opts = EvalOptions {
            success: SuccessShape::conversation(),
            ..EvalOptions::default()
        };

        let probe = match self.transport.evaluate(PROBE_SCRIPT, &opts).await {
            Ok(outcomes) => authoritative(outcomes),
            Err(e) => {
                debug!("probe failed for workspace {}: {}", self.workspace_id, e);
                self.reachable = false;
                return;
            }
        };
        let Some(probe) = probe else {
            self.reachable = false;
            return;
        };

        if !self.reachable {
            self.reachable = true;
            self.refresh_targets().await;
        }

        let probe_hash = value_hash(&probe);
        if self.last_probe_hash.as_deref() == Some(probe_hash.as_str()) {
            return;
        }

        // Probe moved; pay for a full extraction.
        let extracted = match self.transport.evaluate(EXTRACTION_SCRIPT, &opts).await {
            Ok(outcomes) => authoritative(outcomes),
            Err(e) => {
                debug!(
                    "extraction failed for workspace {}: {}",
                    self.workspace_id, e
                );
                return;
            }
        };
        let Some(snapshot) = extracted
            .as_ref()
            .and_then(ConversationSnapshot::from_value)
        else {
            return;
        };

        // Only advance the probe hash once the extraction landed, so a
        // failed extraction gets retried on the next tick.
        self.last_probe_hash = Some(probe_hash);

        if let Some(update) = plan_update(self.last_snapshot.as_ref(), &snapshot) {
            self.hub.emit(WorkspaceEvent::Conversation {
                workspace_id: self.workspace_id.clone(),
                update,
            });
        }
        self.last_snapshot = Some(snapshot);
    }

    /// Broadcast the target set after (re)gaining reachability.
    async fn refresh_targets(&mut self) {
        let targets = match self.transport.list_targets().await {
            Ok(t) => t,
            Err(e) => {
                debug!(
                    "target listing failed for workspace {}: {}",
                    self.workspace_id, e
                );
                return;
            }
        };
        let ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
        if ids != self.last_target_ids {
            self.last_target_ids = ids;
            self.hub.emit(WorkspaceEvent::Targets {
                workspace_id: self.workspace_id.clone(),
                targets,
            });
        }
    }
}

/// First outcome wins; the sweep already short-circuited on success.
fn authoritative(outcomes: Vec<EvalOutcome>) -> Option<serde_json::Value> {
    outcomes.into_iter().next().map(|o| o.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::{Target, TransportError};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport replaying scripted replies. The last entry of each queue
    /// repeats forever.
    #[derive(Default)]
    struct ScriptedTransport {
        probe_replies: Mutex<VecDeque<Value>>,
        full_replies: Mutex<VecDeque<Value>>,
        probe_calls: AtomicUsize,
        full_calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn next_from(queue: &Mutex<VecDeque<Value>>) -> Value {
            let mut queue = queue.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap_or(Value::Null)
            } else {
                queue.front().cloned().unwrap_or(Value::Null)
            }
        }
    }

    #[async_trait]
    impl EvalTransport for ScriptedTransport {
        async fn evaluate(
            &self,
            script: &str,
            _opts: &EvalOptions,
        ) -> Result<Vec<EvalOutcome>, TransportError> {
            let value = if script == PROBE_SCRIPT {
                self.probe_calls.fetch_add(1, Ordering::SeqCst);
                Self::next_from(&self.probe_replies)
            } else {
                self.full_calls.fetch_add(1, Ordering::SeqCst);
                Self::next_from(&self.full_replies)
            };
            if value.is_null() {
                return Ok(Vec::new());
            }
            Ok(vec![EvalOutcome {
                context_id: Some(1),
                value,
            }])
        }

        async fn list_targets(&self) -> Result<Vec<Target>, TransportError> {
            Ok(vec![Target {
                id: "t1".to_string(),
                title: "workbench".to_string(),
                url: "vscode://workbench".to_string(),
                ws_url: Some("ws://127.0.0.1:9222/t1".to_string()),
            }])
        }
    }

    fn probe(turns: usize) -> Value {
        json!({"ok": true, "turnCount": turns, "statusText": null, "isBusy": false, "lastTurnLength": 4})
    }

    fn full(texts: &[&str]) -> Value {
        json!({
            "ok": true,
            "turnCount": texts.len(),
            "items": texts.iter().map(|t| json!({"role": "user", "text": t})).collect::<Vec<_>>(),
            "statusText": null,
            "isBusy": false,
            "hasAcceptAll": false,
            "hasRejectAll": false,
        })
    }

    fn monitor_with(transport: Arc<ScriptedTransport>) -> (Monitor, Arc<EventHub>) {
        let hub = Arc::new(EventHub::new());
        let monitor = Monitor::new("w1", transport, Arc::clone(&hub));
        (monitor, hub)
    }

    #[tokio::test]
    async fn unchanged_probe_skips_extraction_and_stays_silent() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.probe_replies.lock().unwrap().push_back(probe(1));
        transport.full_replies.lock().unwrap().push_back(full(&["hi"]));

        let (mut monitor, hub) = monitor_with(Arc::clone(&transport));
        let mut rx = hub.subscribe();

        monitor.poll().await;
        monitor.poll().await;
        monitor.poll().await;

        assert_eq!(transport.probe_calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.full_calls.load(Ordering::SeqCst), 1);

        // Exactly one targets refresh and one full update, then silence.
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, WorkspaceEvent::Targets { .. }));
        let second = rx.try_recv().unwrap();
        match second {
            WorkspaceEvent::Conversation { workspace_id, update } => {
                assert_eq!(workspace_id, "w1");
                assert!(matches!(update, crate::sync::ConversationUpdate::Full { .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn growth_ships_only_the_new_suffix() {
        let transport = Arc::new(ScriptedTransport::default());
        {
            let mut probes = transport.probe_replies.lock().unwrap();
            probes.push_back(probe(2));
            probes.push_back(probe(4));
        }
        {
            let mut fulls = transport.full_replies.lock().unwrap();
            fulls.push_back(full(&["a", "b"]));
            fulls.push_back(full(&["a", "b", "c", "d"]));
        }

        let (mut monitor, hub) = monitor_with(Arc::clone(&transport));
        let mut rx = hub.subscribe();

        monitor.poll().await;
        monitor.poll().await;

        let mut conversation_updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkspaceEvent::Conversation { update, .. } = event {
                conversation_updates.push(update);
            }
        }
        assert_eq!(conversation_updates.len(), 2);
        assert!(matches!(
            conversation_updates[0],
            crate::sync::ConversationUpdate::Full { .. }
        ));
        match &conversation_updates[1] {
            crate::sync::ConversationUpdate::Incremental { items, .. } => {
                let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
                assert_eq!(texts, vec!["c", "d"]);
            }
            other => panic!("expected incremental, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shrink_ships_a_full_replacement() {
        let transport = Arc::new(ScriptedTransport::default());
        {
            let mut probes = transport.probe_replies.lock().unwrap();
            probes.push_back(probe(3));
            probes.push_back(probe(1));
        }
        {
            let mut fulls = transport.full_replies.lock().unwrap();
            fulls.push_back(full(&["a", "b", "c"]));
            fulls.push_back(full(&["a"]));
        }

        let (mut monitor, hub) = monitor_with(Arc::clone(&transport));
        let mut rx = hub.subscribe();

        monitor.poll().await;
        monitor.poll().await;

        let mut updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkspaceEvent::Conversation { update, .. } = event {
                updates.push(update);
            }
        }
        assert_eq!(updates.len(), 2);
        assert!(matches!(
            updates[1],
            crate::sync::ConversationUpdate::Full { .. }
        ));
    }

    #[tokio::test]
    async fn failed_extraction_is_retried_on_the_next_tick() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.probe_replies.lock().unwrap().push_back(probe(1));
        {
            let mut fulls = transport.full_replies.lock().unwrap();
            fulls.push_back(Value::Null); // extraction comes back empty
            fulls.push_back(full(&["hi"]));
        }

        let (mut monitor, hub) = monitor_with(Arc::clone(&transport));
        let mut rx = hub.subscribe();

        monitor.poll().await;
        // Probe hash must not have advanced past the failed extraction.
        monitor.poll().await;

        assert_eq!(transport.full_calls.load(Ordering::SeqCst), 2);
        let got_full = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
            matches!(
                event,
                WorkspaceEvent::Conversation {
                    update: crate::sync::ConversationUpdate::Full { .. },
                    ..
                }
            )
        });
        assert!(got_full);
    }

    #[tokio::test]
    async fn registry_keeps_at_most_one_monitor_per_workspace() {
        let registry = MonitorRegistry::new();
        let hub = Arc::new(EventHub::new());
        let transport: Arc<dyn EvalTransport> = Arc::new(ScriptedTransport::default());

        registry.start("w1", Arc::clone(&transport), Arc::clone(&hub), MonitorConfig::default());
        registry.start("w1", Arc::clone(&transport), Arc::clone(&hub), MonitorConfig::default());
        assert_eq!(registry.len(), 1);
        assert!(registry.is_active("w1"));

        assert!(registry.stop("w1"));
        assert!(!registry.is_active("w1"));
        assert!(!registry.stop("w1"));
    }

    #[tokio::test]
    async fn stop_all_clears_every_monitor() {
        let registry = MonitorRegistry::new();
        let hub = Arc::new(EventHub::new());
        let transport: Arc<dyn EvalTransport> = Arc::new(ScriptedTransport::default());

        registry.start("w1", Arc::clone(&transport), Arc::clone(&hub), MonitorConfig::default());
        registry.start("w2", Arc::clone(&transport), Arc::clone(&hub), MonitorConfig::default());
        assert_eq!(registry.len(), 2);

        registry.stop_all();
        assert!(registry.is_empty());
    }
}
