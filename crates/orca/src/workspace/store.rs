//! In-memory workspace registry.

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;

use super::{Workspace, WorkspaceStatus, can_transition};

/// Attempted a lifecycle move the state machine forbids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal status transition {from} -> {to} for workspace {id}")]
pub struct TransitionError {
    pub id: String,
    pub from: WorkspaceStatus,
    pub to: WorkspaceStatus,
}

/// Registry of workspace records, keyed by id.
///
/// Hands out clones; the record itself is only written through `update`
/// and `transition` so timestamps stay honest.
#[derive(Debug, Default)]
pub struct WorkspaceStore {
    items: DashMap<String, Workspace>,
}

impl WorkspaceStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    pub fn insert(&self, workspace: Workspace) {
        self.items.insert(workspace.id.clone(), workspace);
    }

    pub fn get(&self, id: &str) -> Option<Workspace> {
        self.items.get(id).map(|w| w.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Workspace> {
        self.items.remove(id).map(|(_, w)| w)
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.items.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Apply an in-place edit and return the updated snapshot.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Workspace>
    where
        F: FnOnce(&mut Workspace),
    {
        let mut entry = self.items.get_mut(id)?;
        f(&mut entry);
        entry.updated_at = Utc::now();
        Some(entry.clone())
    }

    /// Move a workspace to a new status, enforcing the state machine.
    pub fn transition(
        &self,
        id: &str,
        to: WorkspaceStatus,
    ) -> Result<Option<Workspace>, TransitionError> {
        let Some(mut entry) = self.items.get_mut(id) else {
            return Ok(None);
        };

        let from = entry.status;
        if !can_transition(from, to) {
            return Err(TransitionError {
                id: id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        entry.status = to;
        if to != WorkspaceStatus::Initializing {
            entry.stage = None;
        }
        match to {
            WorkspaceStatus::Running => entry.started_at = Some(now),
            WorkspaceStatus::Stopped => entry.stopped_at = Some(now),
            _ => {}
        }
        entry.updated_at = now;
        Ok(Some(entry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceKind;

    fn workspace(id: &str) -> Workspace {
        Workspace::new(id, format!("orca-{}", id), WorkspaceKind::Container, "/tmp/p")
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let store = WorkspaceStore::new();
        store.insert(workspace("w1"));

        assert!(store.contains("w1"));
        assert_eq!(store.get("w1").unwrap().id, "w1");
        assert_eq!(store.len(), 1);

        let removed = store.remove("w1").unwrap();
        assert_eq!(removed.id, "w1");
        assert!(store.is_empty());
    }

    #[test]
    fn transition_enforces_the_state_machine() {
        let store = WorkspaceStore::new();
        store.insert(workspace("w1"));

        store.transition("w1", WorkspaceStatus::Initializing).unwrap();
        store.transition("w1", WorkspaceStatus::Running).unwrap();
        store.transition("w1", WorkspaceStatus::Stopped).unwrap();

        let err = store
            .transition("w1", WorkspaceStatus::Running)
            .unwrap_err();
        assert_eq!(err.from, WorkspaceStatus::Stopped);
        assert_eq!(err.to, WorkspaceStatus::Running);

        // The record is untouched after a rejected move.
        assert_eq!(store.get("w1").unwrap().status, WorkspaceStatus::Stopped);
    }

    #[test]
    fn transition_on_missing_workspace_is_none() {
        let store = WorkspaceStore::new();
        let result = store.transition("ghost", WorkspaceStatus::Initializing);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn leaving_initializing_clears_the_stage() {
        let store = WorkspaceStore::new();
        store.insert(workspace("w1"));
        store.transition("w1", WorkspaceStatus::Initializing).unwrap();
        store.update("w1", |w| w.stage = Some("Waiting for IDE".to_string()));

        let after = store
            .transition("w1", WorkspaceStatus::Running)
            .unwrap()
            .unwrap();
        assert_eq!(after.stage, None);
    }

    #[test]
    fn update_touches_the_timestamp() {
        let store = WorkspaceStore::new();
        store.insert(workspace("w1"));
        let before = store.get("w1").unwrap().updated_at;

        std::thread::sleep(std::time::Duration::from_millis(5));
        store.update("w1", |w| w.push_log("hello"));

        let after = store.get("w1").unwrap();
        assert!(after.updated_at > before);
        assert_eq!(after.log_lines(), vec!["hello".to_string()]);
    }

    #[test]
    fn start_and_stop_timestamps_are_stamped() {
        let store = WorkspaceStore::new();
        store.insert(workspace("w1"));
        assert_eq!(store.get("w1").unwrap().started_at, None);

        store.transition("w1", WorkspaceStatus::Initializing).unwrap();
        store.transition("w1", WorkspaceStatus::Running).unwrap();
        let running = store.get("w1").unwrap();
        assert!(running.started_at.is_some());
        assert_eq!(running.stopped_at, None);

        store.transition("w1", WorkspaceStatus::Stopped).unwrap();
        assert!(store.get("w1").unwrap().stopped_at.is_some());
    }

    #[test]
    fn list_is_newest_first() {
        let store = WorkspaceStore::new();
        store.insert(workspace("w1"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.insert(workspace("w2"));

        let ids: Vec<String> = store.list().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["w2".to_string(), "w1".to_string()]);
    }
}
