//! Room cache with lazy load-through and concurrent-load de-duplication.
//!
//! ```text
//! get_data("r") ──► cached? ──► Arc<RoomHandle>
//!                      │
//!                      ├─ load pending? ──► queue waiter, all notified
//!                      │
//!                      └─ miss ──► adapter.get_data ──► publish + notify
//! ```
//!
//! For a given room at most one adapter load is ever in flight; callers
//! arriving while it is pending park on a oneshot waiter and are all woken
//! with the same result. A failed load clears the in-flight flag so the
//! next caller retries — no partial room state is ever published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::adapter::Adapter;
use crate::room::RoomState;
use crate::saver::SaveCoalescer;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The adapter failed to produce a seed document.
    #[error("failed to load room {room}: {reason}")]
    Load { room: String, reason: String },
    /// The loading caller went away before publishing a result.
    #[error("room load interrupted")]
    LoadInterrupted,
}

/// Shared handle to one room's state, serialized behind a per-room mutex.
///
/// Every operation that touches the room — edit processing, join, save
/// snapshotting — goes through this lock, which is what makes the
/// shadow/backup updates atomic with respect to each other.
pub struct RoomHandle {
    state: tokio::sync::Mutex<RoomState>,
}

impl RoomHandle {
    pub(crate) fn new(state: RoomState) -> Self {
        Self {
            state: tokio::sync::Mutex::new(state),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, RoomState> {
        self.state.lock().await
    }
}

type LoadResult = Result<Arc<RoomHandle>, StoreError>;

struct StoreInner {
    rooms: HashMap<String, Arc<RoomHandle>>,
    /// Waiters parked on an in-flight load, keyed by room. Presence of the
    /// key is the in-flight flag.
    loads: HashMap<String, Vec<oneshot::Sender<LoadResult>>>,
}

/// In-memory cache of room state (C2). Never evicts.
pub struct RoomStore {
    inner: Mutex<StoreInner>,
    adapter: Arc<dyn Adapter>,
    saver: Arc<SaveCoalescer>,
}

impl RoomStore {
    pub fn new(adapter: Arc<dyn Adapter>, saver: Arc<SaveCoalescer>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                rooms: HashMap::new(),
                loads: HashMap::new(),
            }),
            adapter,
            saver,
        }
    }

    /// Fetch the room, loading it through the adapter on first miss.
    pub async fn get_data(&self, room: &str, user_id: &str) -> LoadResult {
        let waiter = {
            let mut inner = self.inner.lock().expect("store lock");
            if let Some(handle) = inner.rooms.get(room) {
                return Ok(handle.clone());
            }
            match inner.loads.get_mut(room) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    // We are the loading caller.
                    inner.loads.insert(room.to_string(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx.await.unwrap_or(Err(StoreError::LoadInterrupted));
        }

        let loaded = self.adapter.get_data(room, user_id).await;
        let mut inner = self.inner.lock().expect("store lock");
        let waiters = inner.loads.remove(room).unwrap_or_default();
        let outcome = match loaded {
            Ok(document) => {
                let handle = Arc::new(RoomHandle::new(RoomState::new(document)));
                inner.rooms.insert(room.to_string(), handle.clone());
                log::debug!("room {room} loaded ({} waiters)", waiters.len());
                Ok(handle)
            }
            Err(e) => {
                log::warn!("room {room} load failed: {e}");
                Err(StoreError::Load {
                    room: room.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        drop(inner);

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    /// Cached handle, if the room has been loaded.
    pub fn get_cached(&self, room: &str) -> Option<Arc<RoomHandle>> {
        self.inner
            .lock()
            .expect("store lock")
            .rooms
            .get(room)
            .cloned()
    }

    /// Number of rooms currently cached.
    pub fn room_count(&self) -> usize {
        self.inner.lock().expect("store lock").rooms.len()
    }

    /// Drop all in-memory state once every pending save has drained.
    ///
    /// Blocks until the save coalescer is idle, then clears the cache and
    /// any in-flight load bookkeeping.
    pub async fn reset(&self) {
        self.saver.wait_idle().await;
        let mut inner = self.inner.lock().expect("store lock");
        inner.rooms.clear();
        inner.loads.clear();
        log::info!("room store reset");
    }
}
