//! Per-conversation turn state
//!
//! Turn state is keyed by conversation id and lives only between a
//! clarification question and its answer (or until the inactivity TTL
//! fires). Each conversation gets its own lock, giving the
//! single-writer-per-conversation discipline the orchestrator relies on;
//! different conversations never contend.

use crate::oracle::Message;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// What a clarification interrupted: the candidate tools and the
/// parameter values already extracted. The next message in the
/// conversation resumes extraction from here.
#[derive(Debug, Clone)]
pub struct PendingClarification {
    pub tool_names: Vec<String>,
    pub found: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Accumulated state of one conversation's open turn
#[derive(Debug)]
pub struct TurnState {
    pub history: Vec<Message>,
    pub pending: Option<PendingClarification>,
    updated_at: Instant,
    retired: bool,
}

impl TurnState {
    fn new() -> Self {
        Self {
            history: Vec::new(),
            pending: None,
            updated_at: Instant::now(),
            retired: false,
        }
    }

    /// Mark the state as freshly used, restarting its TTL
    pub fn touch(&mut self) {
        self.updated_at = Instant::now();
    }

    /// Mark the turn as finished while still holding the writer lock.
    /// A retired slot is never handed out again; `acquire` replaces it,
    /// so a concurrent turn in the same conversation always starts
    /// fresh even before the slot entry is removed.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.updated_at.elapsed() >= ttl
    }

    fn discardable(&self, ttl: Duration) -> bool {
        self.retired || self.expired(ttl)
    }
}

/// Store of per-conversation turn state with TTL expiry
pub struct TurnStateStore {
    ttl: Duration,
    slots: Mutex<HashMap<String, Arc<Mutex<TurnState>>>>,
}

impl TurnStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the state slot for a conversation, creating a fresh one if
    /// none exists or the existing one has expired.
    ///
    /// The caller locks the returned slot for the duration of the turn's
    /// synchronous stages; that lock is the per-conversation writer lock.
    pub async fn acquire(&self, conversation_id: &str) -> Arc<Mutex<TurnState>> {
        let mut slots = self.slots.lock().await;

        if let Some(slot) = slots.get(conversation_id) {
            let discardable = slot.lock().await.discardable(self.ttl);
            if !discardable {
                return Arc::clone(slot);
            }
            // Retired or expired state: the next message starts a fresh
            // turn rather than resuming against stale history.
            debug!(conversation_id, "turn state stale, discarding");
            slots.remove(conversation_id);
        }

        let slot = Arc::new(Mutex::new(TurnState::new()));
        slots.insert(conversation_id.to_string(), Arc::clone(&slot));
        slot
    }

    /// Drop a conversation's state unconditionally (after the turn's
    /// final response is sent).
    pub async fn clear(&self, conversation_id: &str) {
        self.slots.lock().await.remove(conversation_id);
    }

    /// Drop a conversation's entry only if it still holds `slot`.
    ///
    /// A finished turn releases the slot it acquired; if a newer turn
    /// has since replaced the entry, the newer turn's state is left
    /// untouched. The caller retires the slot first, so even a release
    /// that loses this comparison leaves nothing resumable behind.
    pub async fn release(&self, conversation_id: &str, slot: &Arc<Mutex<TurnState>>) {
        let mut slots = self.slots.lock().await;
        if let Some(current) = slots.get(conversation_id) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(conversation_id);
            }
        }
    }

    /// Drop all expired slots. Called opportunistically; correctness does
    /// not depend on it since `acquire` also checks expiry.
    pub async fn sweep(&self) {
        let mut slots = self.slots.lock().await;
        let mut stale_keys = Vec::new();
        for (key, slot) in slots.iter() {
            if slot.lock().await.discardable(self.ttl) {
                stale_keys.push(key.clone());
            }
        }
        for key in stale_keys {
            debug!(conversation_id = %key, "sweeping stale turn state");
            slots.remove(&key);
        }
    }

    /// Number of live slots (for tests and introspection)
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_and_reuses() {
        let store = TurnStateStore::new(Duration::from_secs(60));
        let slot = store.acquire("conv-1").await;
        slot.lock().await.history.push(Message::user("hello"));

        let again = store.acquire("conv-1").await;
        assert_eq!(again.lock().await.history.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_conversations_are_independent() {
        let store = TurnStateStore::new(Duration::from_secs(60));
        store
            .acquire("conv-1")
            .await
            .lock()
            .await
            .history
            .push(Message::user("a"));
        let other = store.acquire("conv-2").await;
        assert!(other.lock().await.history.is_empty());
    }

    #[tokio::test]
    async fn test_expired_state_is_discarded() {
        // Zero TTL: everything is expired on the next acquire
        let store = TurnStateStore::new(Duration::ZERO);
        {
            let slot = store.acquire("conv-1").await;
            let mut state = slot.lock().await;
            state.history.push(Message::user("first"));
            state.pending = Some(PendingClarification {
                tool_names: vec!["get_weather".to_string()],
                found: BTreeMap::new(),
            });
        }

        let slot = store.acquire("conv-1").await;
        let state = slot.lock().await;
        // Fresh turn: no resumed history, no pending clarification
        assert!(state.history.is_empty());
        assert!(state.pending.is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_slot() {
        let store = TurnStateStore::new(Duration::from_secs(60));
        store.acquire("conv-1").await;
        store.clear("conv-1").await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_retired_slot_is_replaced_on_acquire() {
        let store = TurnStateStore::new(Duration::from_secs(60));
        let slot = store.acquire("conv-1").await;
        {
            let mut state = slot.lock().await;
            state.history.push(Message::user("old"));
            state.retire();
        }

        let fresh = store.acquire("conv-1").await;
        assert!(!Arc::ptr_eq(&slot, &fresh));
        assert!(fresh.lock().await.history.is_empty());
    }

    #[tokio::test]
    async fn test_release_spares_a_successor_slot() {
        let store = TurnStateStore::new(Duration::from_secs(60));
        let first = store.acquire("conv-1").await;
        first.lock().await.retire();

        // A newer turn replaces the entry before the old turn releases
        let second = store.acquire("conv-1").await;
        second.lock().await.pending = Some(PendingClarification {
            tool_names: vec!["get_weather".to_string()],
            found: BTreeMap::new(),
        });

        store.release("conv-1", &first).await;
        let current = store.acquire("conv-1").await;
        assert!(Arc::ptr_eq(&current, &second));
        assert!(current.lock().await.pending.is_some());

        // Releasing the live slot does remove it
        current.lock().await.retire();
        store.release("conv-1", &current).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_drops_only_expired() {
        let store = TurnStateStore::new(Duration::ZERO);
        store.acquire("conv-1").await;
        store.acquire("conv-2").await;
        store.sweep().await;
        assert!(store.is_empty().await);
    }
}
