//! # Recurrent State Store
//!
//! Per-session recurrent tensors, carried from one frame's inference to the next.
//!
//! ## Locking:
//! The session map sits behind an async `RwLock` that is only held long enough
//! to find or insert a slot. Each slot has its own async `Mutex`; a frame holds
//! it for the whole decode → infer → persist sequence through a [`SessionGuard`].
//! Frames of one session therefore run one at a time, while different sessions
//! never wait on each other.
//!
//! Dropping a session marks its slot retired before removing it, so a caller
//! that was queued on the old slot retries against a fresh one instead of
//! writing into a slot nobody can see.

use super::architecture::ModelFamily;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// One state tensor, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StateTensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&v| v == 0.0)
    }
}

/// The ordered tensors a model consumes and emits between frames.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    pub tensors: Vec<StateTensor>,
}

impl RecurrentState {
    pub fn zeros(family: ModelFamily) -> Self {
        Self::from_shapes(family.state_shapes())
    }

    pub fn from_shapes(shapes: &[&[usize]]) -> Self {
        Self {
            tensors: shapes.iter().map(|shape| StateTensor::zeros(shape)).collect(),
        }
    }

    /// Whether every tensor has the expected shape and a matching element count.
    pub fn matches(&self, shapes: &[&[usize]]) -> bool {
        self.tensors.len() == shapes.len()
            && self.tensors.iter().zip(shapes).all(|(tensor, shape)| {
                tensor.shape.as_slice() == *shape
                    && tensor.data.len() == shape.iter().product::<usize>()
            })
    }

    pub fn is_zero(&self) -> bool {
        self.tensors.iter().all(StateTensor::is_zero)
    }
}

#[derive(Debug)]
struct SessionSlot {
    /// `None` until the first frame (or after a corruption reset).
    state: Option<RecurrentState>,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    frames: u64,
    retired: bool,
}

impl SessionSlot {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            state: None,
            created_at: now,
            last_seen_at: now,
            frames: 0,
            retired: false,
        }
    }
}

/// Read-only view of a slot for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub initialized: bool,
    pub frames: u64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Exclusive access to one session's state.
///
/// Holding the guard is the per-session critical section.
pub struct SessionGuard {
    slot: OwnedMutexGuard<SessionSlot>,
    family: ModelFamily,
}

impl SessionGuard {
    /// Current state, created as zeros if the session is uninitialized.
    pub fn state(&mut self) -> &RecurrentState {
        let family = self.family;
        self.slot
            .state
            .get_or_insert_with(|| RecurrentState::zeros(family))
    }

    /// Current state without initializing it.
    pub fn peek(&self) -> Option<&RecurrentState> {
        self.slot.state.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.state.is_some()
    }

    /// Atomically replace the state and record a processed frame.
    pub fn commit(&mut self, next: RecurrentState) {
        self.slot.state = Some(next);
        self.slot.frames += 1;
        self.slot.last_seen_at = Utc::now();
    }

    /// Back to uninitialized; the next frame starts from zeros.
    pub fn clear(&mut self) {
        self.slot.state = None;
    }
}

pub struct RecurrentStateStore {
    family: ModelFamily,
    slots: RwLock<HashMap<String, Arc<Mutex<SessionSlot>>>>,
}

impl RecurrentStateStore {
    pub fn new(family: ModelFamily) -> Self {
        Self {
            family,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Lock a session's slot, creating it if needed.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        loop {
            let slot = self.slot_or_insert(session_id).await;
            let guard = slot.lock_owned().await;
            if guard.retired {
                continue;
            }
            return SessionGuard {
                slot: guard,
                family: self.family,
            };
        }
    }

    /// Lock a session's slot only if it already exists.
    async fn acquire_existing(&self, session_id: &str) -> Option<SessionGuard> {
        let slot = self.slots.read().await.get(session_id).cloned()?;
        let guard = slot.lock_owned().await;
        if guard.retired {
            return None;
        }
        Some(SessionGuard {
            slot: guard,
            family: self.family,
        })
    }

    async fn slot_or_insert(&self, session_id: &str) -> Arc<Mutex<SessionSlot>> {
        if let Some(slot) = self.slots.read().await.get(session_id) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::new())))
            .clone()
    }

    /// State for a session, zeroed and stored if absent.
    pub async fn get(&self, session_id: &str) -> RecurrentState {
        self.acquire(session_id).await.state().clone()
    }

    /// Replace a session's state as a unit.
    pub async fn put(&self, session_id: &str, state: RecurrentState) {
        self.acquire(session_id).await.commit(state);
    }

    /// Force an existing session back to zeroed state. Returns false for unknown ids.
    pub async fn reset(&self, session_id: &str) -> bool {
        match self.acquire_existing(session_id).await {
            Some(mut guard) => {
                guard.slot.state = Some(RecurrentState::zeros(self.family));
                true
            }
            None => false,
        }
    }

    /// Remove a session entirely. Waits for an in-flight frame of that session.
    pub async fn drop_session(&self, session_id: &str) -> bool {
        let Some(mut guard) = self.acquire_existing(session_id).await else {
            return false;
        };
        guard.slot.retired = true;
        self.slots.write().await.remove(session_id);
        true
    }

    /// Stored state without creating the session.
    pub async fn peek(&self, session_id: &str) -> Option<RecurrentState> {
        let guard = self.acquire_existing(session_id).await?;
        guard.peek().cloned()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SlotSnapshot> {
        let guard = self.acquire_existing(session_id).await?;
        Some(SlotSnapshot {
            initialized: guard.is_initialized(),
            frames: guard.slot.frames,
            created_at: guard.slot.created_at,
            last_seen_at: guard.slot.last_seen_at,
        })
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.slots.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn marked_state(value: f32) -> RecurrentState {
        let mut state = RecurrentState::zeros(ModelFamily::Silero);
        state.tensors[0].data[0] = value;
        state
    }

    #[tokio::test]
    async fn test_get_creates_zeroed_state() {
        let store = RecurrentStateStore::new(ModelFamily::Ten);
        let state = store.get("s1").await;

        assert!(state.is_zero());
        assert!(state.matches(ModelFamily::Ten.state_shapes()));
        assert!(store.contains("s1").await);
    }

    #[tokio::test]
    async fn test_put_reset_drop() {
        let store = RecurrentStateStore::new(ModelFamily::Silero);
        store.put("s1", marked_state(0.25)).await;
        assert_eq!(store.get("s1").await, marked_state(0.25));

        assert!(store.reset("s1").await);
        assert!(store.get("s1").await.is_zero());

        assert!(store.drop_session("s1").await);
        assert!(!store.contains("s1").await);
        assert!(store.peek("s1").await.is_none());

        assert!(!store.reset("missing").await);
        assert!(!store.drop_session("missing").await);
    }

    #[tokio::test]
    async fn test_sessions_do_not_block_each_other() {
        let store = Arc::new(RecurrentStateStore::new(ModelFamily::Silero));
        let _held = store.acquire("busy").await;

        let other = tokio::time::timeout(Duration::from_millis(200), store.get("idle")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_drop_waits_for_in_flight_frame() {
        let store = Arc::new(RecurrentStateStore::new(ModelFamily::Silero));
        let mut guard = store.acquire("s1").await;

        let dropper = {
            let store = store.clone();
            tokio::spawn(async move { store.drop_session("s1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dropper.is_finished());

        guard.commit(marked_state(0.5));
        drop(guard);

        assert!(dropper.await.unwrap());
        assert!(!store.contains("s1").await);
    }

    #[tokio::test]
    async fn test_acquire_after_drop_starts_fresh() {
        let store = Arc::new(RecurrentStateStore::new(ModelFamily::Silero));
        store.put("s1", marked_state(0.75)).await;

        let guard = store.acquire("s1").await;
        let dropper = {
            let store = store.clone();
            tokio::spawn(async move { store.drop_session("s1").await })
        };
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.get("s1").await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);

        assert!(dropper.await.unwrap());
        assert!(waiter.await.unwrap().is_zero());
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let state = RecurrentState::zeros(ModelFamily::Ten);
        assert!(!state.matches(ModelFamily::Silero.state_shapes()));

        let mut truncated = RecurrentState::zeros(ModelFamily::Silero);
        truncated.tensors[1].data.pop();
        assert!(!truncated.matches(ModelFamily::Silero.state_shapes()));
    }
}
