//! Conversation snapshots, hashing, and the diff policy.
//!
//! Every extraction rebuilds the snapshot wholesale; nothing is patched in
//! place. Equality is decided by a content hash over the canonical JSON
//! form, so cosmetic DOM churn that extracts to the same content never
//! produces an event.

use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationItem {
    pub role: String,
    pub text: String,
}

/// Full extracted state of a workspace's agent conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub items: Vec<ConversationItem>,
    pub status_text: Option<String>,
    pub is_busy: bool,
    pub has_accept_all: bool,
    pub has_reject_all: bool,
    /// Content hash over everything above.
    pub hash: String,
}

impl ConversationSnapshot {
    /// Parse an extraction script result. `None` when the script reported
    /// no panel or returned something unrecognizable.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("ok").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        let items = value
            .get("items")?
            .as_array()?
            .iter()
            .map(|item| ConversationItem {
                role: item
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("assistant")
                    .to_string(),
                text: item
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect::<Vec<_>>();
        let status_text = value
            .get("statusText")
            .and_then(Value::as_str)
            .map(str::to_string);
        let is_busy = value.get("isBusy").and_then(Value::as_bool).unwrap_or(false);
        let has_accept_all = value
            .get("hasAcceptAll")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let has_reject_all = value
            .get("hasRejectAll")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let canonical = json!({
            "items": items,
            "statusText": status_text,
            "isBusy": is_busy,
            "hasAcceptAll": has_accept_all,
            "hasRejectAll": has_reject_all,
        });

        Some(Self {
            items,
            status_text,
            is_busy,
            has_accept_all,
            has_reject_all,
            hash: value_hash(&canonical),
        })
    }

    /// True when `other` is this conversation plus appended turns, with
    /// every shared turn untouched.
    pub fn is_prefix_of(&self, other: &ConversationSnapshot) -> bool {
        other.items.len() > self.items.len() && self.items == other.items[..self.items.len()]
    }
}

/// What gets shipped to clients when a conversation changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConversationUpdate {
    /// Full snapshot replacement.
    #[serde(rename_all = "camelCase")]
    Full { snapshot: ConversationSnapshot },

    /// Only the turns appended since the previous snapshot.
    #[serde(rename_all = "camelCase")]
    Incremental {
        items: Vec<ConversationItem>,
        hash: String,
    },
}

/// Decide what to emit for a freshly extracted snapshot.
///
/// Same hash means silence. Pure append-only growth ships just the new
/// suffix; anything else (edits, truncation, the very first snapshot)
/// ships the full state.
pub fn plan_update(
    previous: Option<&ConversationSnapshot>,
    next: &ConversationSnapshot,
) -> Option<ConversationUpdate> {
    match previous {
        None => {
            if next.items.is_empty() && next.status_text.is_none() {
                return None;
            }
            Some(ConversationUpdate::Full {
                snapshot: next.clone(),
            })
        }
        Some(prev) if prev.hash == next.hash => None,
        Some(prev) if prev.is_prefix_of(next) => Some(ConversationUpdate::Incremental {
            items: next.items[prev.items.len()..].to_vec(),
            hash: next.hash.clone(),
        }),
        Some(_) => Some(ConversationUpdate::Full {
            snapshot: next.clone(),
        }),
    }
}

/// SHA-256 over the canonical JSON serialization of a value.
///
/// `serde_json` keeps object keys sorted, so equal values always hash
/// equal regardless of how they were produced.
pub fn value_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
