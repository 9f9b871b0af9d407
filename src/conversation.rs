//! Per-identity conversation state
//!
//! Entries are replaced whole on every write, so a reader sees either the previous
//! step or the next one, never a mix. Entries idle past the timeout read as absent
//! and are dropped by `sweep`.

use crate::identity::Identity;
use crate::state_machine::WorkflowState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Snapshot of one identity's active workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    pub state: WorkflowState,
    pub updated_at: Instant,
}

impl ConversationState {
    fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.updated_at) > idle_timeout
    }
}

pub struct ConversationStore {
    entries: RwLock<HashMap<Identity, Arc<ConversationState>>>,
    idle_timeout: Duration,
}

impl ConversationStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub async fn get(&self, identity: Identity) -> Option<Arc<ConversationState>> {
        let entries = self.entries.read().await;
        entries
            .get(&identity)
            .filter(|entry| !entry.is_expired(self.idle_timeout, Instant::now()))
            .cloned()
    }

    /// Replace the identity's state. Idempotent under retry.
    pub async fn set(&self, identity: Identity, state: WorkflowState) {
        let entry = Arc::new(ConversationState {
            state,
            updated_at: Instant::now(),
        });
        self.entries.write().await.insert(identity, entry);
    }

    /// Returns true if there was a state to clear
    pub async fn clear(&self, identity: Identity) -> bool {
        self.entries.write().await.remove(&identity).is_some()
    }

    #[cfg(test)]
    pub async fn is_active(&self, identity: Identity) -> bool {
        self.get(identity).await.is_some()
    }

    /// Drop every idle entry. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(self.idle_timeout, now));
        let expired = before - entries.len();
        if expired > 0 {
            tracing::info!(expired, "Expired idle conversations");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
