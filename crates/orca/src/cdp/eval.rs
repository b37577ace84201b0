//! Cross-context script evaluation.
//!
//! A target page can host several isolated execution contexts (main frame,
//! iframes, extension worlds) and nothing tells us up front which one holds
//! the state a script wants. The engine walks the known contexts in order,
//! stopping early as soon as one returns a success-shaped value.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::channel::{CdpChannel, CdpEvent};
use crate::pending::CallError;

/// Predicate deciding whether an evaluation result is authoritative.
///
/// Extraction scripts each have their own notion of success, so the shape
/// is injected per call site instead of hardcoding field names here.
#[derive(Clone)]
pub struct SuccessShape(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl SuccessShape {
    pub fn new(predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Shape returned by the conversation probe/extraction scripts.
    pub fn conversation() -> Self {
        Self::new(|value| {
            value.get("ok").and_then(Value::as_bool) == Some(true)
                || value.get("turnCount").is_some()
        })
    }

    pub fn matches(&self, value: &Value) -> bool {
        (self.0)(value)
    }
}

impl Default for SuccessShape {
    fn default() -> Self {
        Self::conversation()
    }
}

impl fmt::Debug for SuccessShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SuccessShape(..)")
    }
}

/// One evaluation result, tagged with the context that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    /// `None` means the target's default context.
    pub context_id: Option<u64>,
    pub value: Value,
}

/// Tracks the live execution contexts of one target.
///
/// Fed from the channel's event stream. Iteration order puts the context
/// that last produced a success first, which keeps steady-state polling on
/// the fast path.
#[derive(Debug, Default)]
pub struct ContextTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    order: Vec<u64>,
    last_success: Option<u64>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one protocol event to the working set.
    pub fn observe(&self, event: &CdpEvent) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match event.method.as_str() {
            "Runtime.executionContextCreated" => {
                if let Some(id) = event.params.pointer("/context/id").and_then(Value::as_u64) {
                    if !inner.order.contains(&id) {
                        inner.order.push(id);
                    }
                }
            }
            "Runtime.executionContextDestroyed" => {
                if let Some(id) = event
                    .params
                    .get("executionContextId")
                    .and_then(Value::as_u64)
                {
                    inner.order.retain(|&c| c != id);
                    if inner.last_success == Some(id) {
                        inner.last_success = None;
                    }
                }
            }
            "Runtime.executionContextsCleared" => {
                inner.order.clear();
                inner.last_success = None;
            }
            _ => {}
        }
    }

    /// Remember which context answered successfully.
    pub fn promote(&self, id: u64) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.last_success = Some(id);
    }

    /// Forget announced contexts ahead of a fresh connection.
    ///
    /// The success preference survives; if the same context re-announces
    /// itself it goes straight back to the front of the order.
    pub fn begin_session(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.order.clear();
    }

    /// Known contexts, most promising first.
    pub fn ordered(&self) -> Vec<u64> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out = Vec::with_capacity(inner.order.len());
        if let Some(favorite) = inner.last_success {
            if inner.order.contains(&favorite) {
                out.push(favorite);
            }
        }
        for &id in &inner.order {
            if Some(id) != inner.last_success {
                out.push(id);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.order.len(),
            Err(poisoned) => poisoned.into_inner().order.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Anything that can run a script in one execution context.
#[async_trait]
pub trait ContextEvaluator: Send + Sync {
    async fn evaluate_in(
        &self,
        script: &str,
        context_id: Option<u64>,
        timeout: Duration,
    ) -> Result<Value, CallError>;
}

#[async_trait]
impl ContextEvaluator for CdpChannel {
    async fn evaluate_in(
        &self,
        script: &str,
        context_id: Option<u64>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let envelope = self.evaluate(script, context_id, timeout).await?;
        if let Some(details) = envelope.get("exceptionDetails") {
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("evaluation threw")
                .to_string();
            return Err(CallError::Remote(text));
        }
        Ok(envelope
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// Run a script across contexts, short-circuiting on the first success.
///
/// Contexts that throw or time out are skipped. When nothing matches the
/// shape, every non-null result is returned and the caller decides which
/// one to trust.
pub async fn eval_across_contexts(
    evaluator: &dyn ContextEvaluator,
    script: &str,
    contexts: &[u64],
    shape: &SuccessShape,
    timeout: Duration,
) -> Vec<EvalOutcome> {
    if contexts.is_empty() {
        // Nothing announced yet; the default context is still worth a try.
        return match evaluator.evaluate_in(script, None, timeout).await {
            Ok(value) if !value.is_null() => vec![EvalOutcome {
                context_id: None,
                value,
            }],
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("default context evaluation failed: {}", e);
                Vec::new()
            }
        };
    }

    let mut outcomes = Vec::new();
    for &ctx in contexts {
        let value = match evaluator.evaluate_in(script, Some(ctx), timeout).await {
            Ok(v) => v,
            Err(e) => {
                debug!("context {} skipped: {}", ctx, e);
                continue;
            }
        };

        if shape.matches(&value) {
            return vec![EvalOutcome {
                context_id: Some(ctx),
                value,
            }];
        }

        if !value.is_null() {
            outcomes.push(EvalOutcome {
                context_id: Some(ctx),
                value,
            });
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeEvaluator {
        replies: HashMap<Option<u64>, Result<Value, CallError>>,
        queried: Mutex<Vec<Option<u64>>>,
    }

    impl FakeEvaluator {
        fn new(replies: Vec<(Option<u64>, Result<Value, CallError>)>) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                queried: Mutex::new(Vec::new()),
            }
        }

        fn queried(&self) -> Vec<Option<u64>> {
            self.queried.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContextEvaluator for FakeEvaluator {
        async fn evaluate_in(
            &self,
            _script: &str,
            context_id: Option<u64>,
            _timeout: Duration,
        ) -> Result<Value, CallError> {
            self.queried.lock().unwrap().push(context_id);
            self.replies
                .get(&context_id)
                .cloned()
                .unwrap_or(Ok(Value::Null))
        }
    }

    fn ctx_created(id: u64) -> CdpEvent {
        CdpEvent {
            method: "Runtime.executionContextCreated".to_string(),
            params: json!({"context": {"id": id}}),
        }
    }

    fn ctx_destroyed(id: u64) -> CdpEvent {
        CdpEvent {
            method: "Runtime.executionContextDestroyed".to_string(),
            params: json!({"executionContextId": id}),
        }
    }

    #[tokio::test]
    async fn stops_at_first_success_shaped_context() {
        let fake = FakeEvaluator::new(vec![
            (Some(1), Ok(json!({"partial": true}))),
            (Some(2), Ok(json!({"ok": true, "items": []}))),
            (Some(3), Ok(json!({"ok": true, "never": "queried"}))),
        ]);

        let outcomes = eval_across_contexts(
            &fake,
            "probe()",
            &[1, 2, 3],
            &SuccessShape::conversation(),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].context_id, Some(2));
        // Context 3 must never be touched once 2 matched.
        assert_eq!(fake.queried(), vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn collects_non_null_results_when_nothing_matches() {
        let fake = FakeEvaluator::new(vec![
            (Some(1), Ok(json!({"fragment": 1}))),
            (Some(2), Ok(Value::Null)),
            (Some(3), Err(CallError::Remote("ReferenceError".to_string()))),
        ]);

        let outcomes = eval_across_contexts(
            &fake,
            "probe()",
            &[1, 2, 3],
            &SuccessShape::conversation(),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].context_id, Some(1));
        assert_eq!(fake.queried(), vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn no_known_contexts_falls_back_to_default() {
        let fake = FakeEvaluator::new(vec![(None, Ok(json!({"turnCount": 4})))]);

        let outcomes = eval_across_contexts(
            &fake,
            "probe()",
            &[],
            &SuccessShape::conversation(),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].context_id, None);
        assert_eq!(fake.queried(), vec![None]);
    }

    #[test]
    fn conversation_shape_recognizes_sentinels() {
        let shape = SuccessShape::conversation();
        assert!(shape.matches(&json!({"ok": true})));
        assert!(shape.matches(&json!({"turnCount": 0})));
        assert!(shape.matches(&json!({"ok": false, "turnCount": 2})));
        assert!(!shape.matches(&json!({"ok": false})));
        assert!(!shape.matches(&json!({"anything": "else"})));
        assert!(!shape.matches(&Value::Null));
    }

    #[test]
    fn tracker_orders_promoted_context_first() {
        let tracker = ContextTracker::new();
        tracker.observe(&ctx_created(1));
        tracker.observe(&ctx_created(2));
        tracker.observe(&ctx_created(3));
        assert_eq!(tracker.ordered(), vec![1, 2, 3]);

        tracker.promote(2);
        assert_eq!(tracker.ordered(), vec![2, 1, 3]);
    }

    #[test]
    fn tracker_prunes_destroyed_and_cleared_contexts() {
        let tracker = ContextTracker::new();
        tracker.observe(&ctx_created(1));
        tracker.observe(&ctx_created(2));
        tracker.promote(2);

        tracker.observe(&ctx_destroyed(2));
        assert_eq!(tracker.ordered(), vec![1]);

        tracker.observe(&CdpEvent {
            method: "Runtime.executionContextsCleared".to_string(),
            params: Value::Null,
        });
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracker_ignores_duplicate_announcements() {
        let tracker = ContextTracker::new();
        tracker.observe(&ctx_created(7));
        tracker.observe(&ctx_created(7));
        assert_eq!(tracker.len(), 1);
    }
}
