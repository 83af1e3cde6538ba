//! Save coalescing: per-room single-flight snapshot persistence.
//!
//! State machine per room:
//! ```text
//!            save_snapshot            save_snapshot
//!   Idle ───────────────► Saving ───────────────► Saving+Queued
//!    ▲                      │   ▲                      │
//!    │   store_data done    │   │   store_data done    │
//!    └──────────────────────┘   └──────────────────────┘
//!                                 (issue follow-up save)
//! ```
//!
//! At most one `adapter.store_data` is in flight per room. Any number of
//! saves arriving during a save collapse into exactly one follow-up, which
//! snapshots the room's server copy at the moment it is issued — not the
//! copy captured when the save was requested. Save failures release the
//! slot and are logged; a queued follow-up still runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::adapter::Adapter;
use crate::protocol::Edit;
use crate::store::RoomHandle;

struct QueuedSave {
    edits: Vec<Edit>,
    user_id: String,
}

/// Slot per room with a save in flight. The one-deep queue holds the
/// triggering batch of the most recent follow-up request.
struct SaveSlot {
    queued: Option<QueuedSave>,
}

/// Per-room save serializer (C5).
pub struct SaveCoalescer {
    adapter: Arc<dyn Adapter>,
    slots: Mutex<HashMap<String, SaveSlot>>,
    idle: Notify,
}

impl SaveCoalescer {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            slots: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    /// Request a snapshot save for `room`.
    ///
    /// Returns immediately; persistence happens on a background task. If a
    /// save is already running for the room, the request is folded into the
    /// one-slot follow-up queue.
    pub fn save_snapshot(
        self: &Arc<Self>,
        room: &str,
        handle: Arc<RoomHandle>,
        edits: Vec<Edit>,
        user_id: &str,
    ) {
        {
            let mut slots = self.slots.lock().expect("saver lock");
            if let Some(slot) = slots.get_mut(room) {
                log::trace!("save for {room} already running, queueing follow-up");
                slot.queued = Some(QueuedSave {
                    edits,
                    user_id: user_id.to_string(),
                });
                return;
            }
            slots.insert(room.to_string(), SaveSlot { queued: None });
        }

        let this = self.clone();
        let room = room.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            this.run_saves(room, handle, edits, user_id).await;
        });
    }

    async fn run_saves(
        &self,
        room: String,
        handle: Arc<RoomHandle>,
        mut edits: Vec<Edit>,
        mut user_id: String,
    ) {
        loop {
            // Snapshot the server copy at issue time, then persist outside
            // the room lock.
            let server_copy = handle.lock().await.server_copy.clone();
            if let Err(e) = self
                .adapter
                .store_data(&room, &user_id, &server_copy, &edits)
                .await
            {
                log::warn!("saving room {room} failed: {e}");
            } else {
                log::debug!("room {room} snapshot persisted");
            }

            let next = {
                let mut slots = self.slots.lock().expect("saver lock");
                let slot = slots.get_mut(&room).expect("save slot present");
                match slot.queued.take() {
                    Some(queued) => Some(queued),
                    None => {
                        slots.remove(&room);
                        if slots.is_empty() {
                            self.idle.notify_waiters();
                        }
                        None
                    }
                }
            };
            match next {
                Some(queued) => {
                    edits = queued.edits;
                    user_id = queued.user_id;
                }
                None => break,
            }
        }
    }

    /// Number of rooms with a save in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().expect("saver lock").len()
    }

    /// Wait until every save slot has drained.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.slots.lock().expect("saver lock").is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterResult;
    use crate::room::RoomState;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn handle_with(doc: Value) -> Arc<RoomHandle> {
        Arc::new(RoomHandle::new(RoomState::new(doc)))
    }

    /// Adapter that blocks each store until a permit is released and
    /// records the copies it was given.
    struct SlowAdapter {
        gate: Semaphore,
        stores: AtomicUsize,
        copies: Mutex<Vec<Value>>,
    }

    impl SlowAdapter {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                stores: AtomicUsize::new(0),
                copies: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Adapter for SlowAdapter {
        async fn get_data(&self, _room: &str, _user_id: &str) -> AdapterResult<Value> {
            Ok(json!({}))
        }

        async fn store_data(
            &self,
            _room: &str,
            _user_id: &str,
            server_copy: &Value,
            _edits: &[Edit],
        ) -> AdapterResult<()> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.expect("gate open");
            permit.forget();
            self.copies
                .lock()
                .expect("copies lock")
                .push(server_copy.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_saves_coalesce_to_one_followup() {
        let adapter = Arc::new(SlowAdapter::new());
        let saver = Arc::new(SaveCoalescer::new(adapter.clone()));
        let handle = handle_with(json!({"rev": 0}));

        for rev in 0..5 {
            handle.lock().await.server_copy = json!({"rev": rev});
            saver.save_snapshot("r", handle.clone(), Vec::new(), "u");
        }
        assert_eq!(saver.in_flight(), 1);

        // Release the first save, then the follow-up.
        adapter.gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        adapter.gate.add_permits(1);
        saver.wait_idle().await;

        // Five requests, exactly two adapter calls.
        assert_eq!(adapter.stores.load(Ordering::SeqCst), 2);

        // The follow-up observed the newest server copy.
        let copies = adapter.copies.lock().expect("copies lock");
        assert_eq!(copies.last(), Some(&json!({"rev": 4})));
    }

    #[tokio::test]
    async fn test_save_failure_releases_slot() {
        struct FailingStore;

        #[async_trait]
        impl Adapter for FailingStore {
            async fn get_data(&self, _r: &str, _u: &str) -> AdapterResult<Value> {
                Ok(json!({}))
            }
            async fn store_data(
                &self,
                _r: &str,
                _u: &str,
                _c: &Value,
                _e: &[Edit],
            ) -> AdapterResult<()> {
                Err(crate::adapter::AdapterError::new("disk full"))
            }
        }

        let saver = Arc::new(SaveCoalescer::new(Arc::new(FailingStore)));
        let handle = handle_with(json!({}));
        saver.save_snapshot("r", handle, Vec::new(), "u");
        saver.wait_idle().await;
        assert_eq!(saver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_independent_rooms_save_in_parallel() {
        let adapter = Arc::new(SlowAdapter::new());
        let saver = Arc::new(SaveCoalescer::new(adapter.clone()));

        saver.save_snapshot("a", handle_with(json!({})), Vec::new(), "u");
        saver.save_snapshot("b", handle_with(json!({})), Vec::new(), "u");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(saver.in_flight(), 2);
        assert_eq!(adapter.stores.load(Ordering::SeqCst), 2);

        adapter.gate.add_permits(2);
        saver.wait_idle().await;
        assert_eq!(saver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_idle() {
        let saver = Arc::new(SaveCoalescer::new(Arc::new(SlowAdapter::new())));
        saver.wait_idle().await;
    }
}
