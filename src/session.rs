//! Session routing: transport events in, engine calls out.
//!
//! The router is the seam between a transport (WebSocket front-end,
//! in-process channels, anything implementing the traits in `transport`)
//! and the sync engine. It owns the engine wiring — store, save coalescer,
//! diff engine, edit processor — so embedders construct one router and
//! feed it `join` / `sync` / `leave` events.

use std::sync::Arc;

use serde_json::Value;

use crate::adapter::Adapter;
use crate::diff::{DiffEngine, DiffOptions};
use crate::processor::EditProcessor;
use crate::protocol::{EditMessage, SyncReply};
use crate::saver::SaveCoalescer;
use crate::store::{RoomStore, StoreError};
use crate::transport::{Connection, Transport};

/// Wires transport events to the edit processor and the room store (C6).
pub struct SessionRouter {
    store: Arc<RoomStore>,
    processor: EditProcessor,
}

impl SessionRouter {
    /// Build a router and the full engine stack behind it.
    pub fn new(
        adapter: Arc<dyn Adapter>,
        transport: Arc<dyn Transport>,
        options: DiffOptions,
    ) -> Self {
        let saver = Arc::new(SaveCoalescer::new(adapter.clone()));
        let store = Arc::new(RoomStore::new(adapter.clone(), saver.clone()));
        let engine = Arc::new(DiffEngine::new(options));
        let processor = EditProcessor::new(store.clone(), saver, adapter, transport, engine);
        Self { store, processor }
    }

    /// The room store backing this router (reset, introspection).
    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    /// Handle a join: load the room, seed a client state from the current
    /// server copy, register the connection, and return the document the
    /// client should start from.
    pub async fn handle_join(
        &self,
        connection: &dyn Connection,
        room: &str,
    ) -> Result<Value, StoreError> {
        let handle = self.store.get_data(room, &connection.user_id()).await?;
        let document = {
            let mut state = handle.lock().await;
            state.add_client(connection.id());
            state.server_copy.clone()
        };
        connection.join(room);
        log::info!("client {} joined room {room}", connection.id());
        Ok(document)
    }

    /// Handle a sync: delegate to the edit processor.
    pub async fn handle_sync(
        &self,
        connection: &dyn Connection,
        message: EditMessage,
    ) -> Option<SyncReply> {
        self.processor.receive_edit(connection, message).await
    }

    /// Drop a disconnected client's sync state. Safe to call for rooms the
    /// connection never joined.
    pub async fn handle_leave(&self, connection_id: &str, room: &str) {
        if let Some(handle) = self.store.get_cached(room) {
            let mut state = handle.lock().await;
            if state.remove_client(connection_id).is_some() {
                log::info!("client {connection_id} left room {room}");
            }
        }
    }
}
