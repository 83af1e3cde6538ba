//! Storage/authorization adapter contract.
//!
//! The sync core never talks to a database directly; everything it needs
//! from the outside world goes through this trait:
//!
//! - `get_data` seeds a room on first load,
//! - `check_diffs` gates inbound edit messages,
//! - `store_data` persists the latest server copy.
//!
//! Implementations decide durability and policy. [`MemoryAdapter`] is the
//! in-process reference implementation; the `storage` module provides a
//! RocksDB-backed one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{Edit, EditMessage};
use crate::room::RoomState;

/// Adapter failure, opaque to the core.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct AdapterError(String);

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Injected storage/authorization collaborator.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Load the persisted document for `room`, or construct a fresh seed.
    async fn get_data(&self, room: &str, user_id: &str) -> AdapterResult<Value>;

    /// Decide whether an inbound edit message may be applied. A `false`
    /// verdict drops the message silently.
    async fn check_diffs(
        &self,
        _message: &EditMessage,
        _state: &RoomState,
    ) -> AdapterResult<bool> {
        Ok(true)
    }

    /// Persist the latest server copy. `edits` is the batch that triggered
    /// the save, passed along for adapters that keep edit logs.
    async fn store_data(
        &self,
        room: &str,
        user_id: &str,
        server_copy: &Value,
        edits: &[Edit],
    ) -> AdapterResult<()>;
}

/// In-memory adapter: seed-value rooms, snapshot map, call counters.
///
/// The counters make the single-flight invariants of the store and the
/// save coalescer observable from tests.
pub struct MemoryAdapter {
    seed: Value,
    docs: Mutex<HashMap<String, Value>>,
    loads: AtomicUsize,
    stores: AtomicUsize,
}

impl MemoryAdapter {
    /// Rooms that were never stored load as a copy of `seed`.
    pub fn new(seed: Value) -> Self {
        Self {
            seed,
            docs: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
        }
    }

    /// Last stored snapshot for `room`, if any.
    pub fn stored(&self, room: &str) -> Option<Value> {
        self.docs.lock().expect("adapter lock").get(room).cloned()
    }

    /// Number of `get_data` calls so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of `store_data` calls so far.
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn get_data(&self, room: &str, _user_id: &str) -> AdapterResult<Value> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let docs = self.docs.lock().expect("adapter lock");
        Ok(docs.get(room).cloned().unwrap_or_else(|| self.seed.clone()))
    }

    async fn store_data(
        &self,
        room: &str,
        _user_id: &str,
        server_copy: &Value,
        _edits: &[Edit],
    ) -> AdapterResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.lock().expect("adapter lock");
        docs.insert(room.to_string(), server_copy.clone());
        Ok(())
    }
}
