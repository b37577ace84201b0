//! Generic pending-call correlation table.
//!
//! Both RPC surfaces in this system (the CDP channel and the CLI tunnel)
//! follow the same pattern: send a frame carrying an id, then wait for the
//! frame that echoes it back. `PendingCalls` implements that table once,
//! parametrized by key type: the CDP channel uses the protocol's integer
//! ids, the tunnel uses string request ids.
//!
//! Ownership of an entry is transferred by `DashMap::remove`, so a call is
//! resolved or rejected exactly once no matter how resolve/reject/timeout
//! race each other.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;

/// Terminal failure for a single pending call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No reply arrived within the caller's deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying connection went away with the call still outstanding.
    #[error("connection closed with call outstanding")]
    ConnectionClosed,

    /// The remote side answered with an error payload.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Outcome delivered to a waiter.
pub type CallResult<T> = Result<T, CallError>;

/// Receiver half handed to the caller at registration time.
pub type ReplySlot<T> = oneshot::Receiver<CallResult<T>>;

/// Correlation table mapping in-flight call ids to their waiters.
pub struct PendingCalls<K, T = serde_json::Value>
where
    K: Eq + Hash + Clone,
{
    entries: DashMap<K, oneshot::Sender<CallResult<T>>>,
}

impl<K, T> Default for PendingCalls<K, T>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> PendingCalls<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of calls currently outstanding.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a new in-flight call and return the slot its reply will
    /// arrive on. Registering an id that is already present replaces the old
    /// waiter, which then observes `ConnectionClosed`.
    pub fn register(&self, key: K) -> ReplySlot<T> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(key, tx);
        rx
    }

    /// Deliver a successful reply. Returns false when no entry matches,
    /// which callers treat as an already-timed-out reply to drop.
    pub fn resolve(&self, key: &K, value: T) -> bool {
        match self.entries.remove(key) {
            Some((_, tx)) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Deliver a failure. Returns false when no entry matches.
    pub fn reject(&self, key: &K, error: CallError) -> bool {
        match self.entries.remove(key) {
            Some((_, tx)) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Reject every outstanding call with the same error. Used when the
    /// underlying connection closes.
    pub fn reject_all(&self, error: CallError) {
        let keys: Vec<K> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.reject(&key, error.clone());
        }
    }

    /// Drop an entry without notifying the waiter (the waiter is the one
    /// giving up, on its own timeout).
    pub fn discard(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Await a reply slot with a deadline. On timeout the entry is removed
    /// from the table so a late reply is dropped instead of leaking.
    pub async fn wait(&self, key: &K, slot: ReplySlot<T>, deadline: Duration) -> CallResult<T> {
        match tokio::time::timeout(deadline, slot).await {
            Ok(Ok(result)) => result,
            // Sender dropped without sending: the table was torn down.
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => {
                self.discard(key);
                Err(CallError::Timeout(deadline))
            }
        }
    }
}
