//! Inbound edit pipeline.
//!
//! One inbound message runs the whole differential synchronization cycle
//! under the room lock:
//!
//! ```text
//! EditMessage ──► load room ──► adapter gate ──► client lookup
//!                                                     │
//!        ┌────────────────────────────────────────────┘
//!        ▼  per edit, versions matching the shadow:
//!   backup ◄─ shadow        shadow ◄─ patch(diff)      server ◄─ patch(diff)
//!        │
//!        ▼
//!   schedule save ──► broadcast update ──► diff shadow vs server ──► reply
//! ```
//!
//! Edits whose versions do not match the shadow are dropped one by one at
//! diagnostic severity; the message as a whole still produces a reply so
//! the client can resynchronize from the version numbers it carries.
//!
//! Reference: Fraser — Differential Synchronization, §5 (dual shadow method)

use std::sync::Arc;

use serde_json::Value;

use crate::adapter::Adapter;
use crate::diff::DiffEngine;
use crate::protocol::{commands, Edit, EditMessage, SyncReply};
use crate::room::{ClientSyncState, RoomState};
use crate::saver::SaveCoalescer;
use crate::store::RoomStore;
use crate::transport::{Connection, Transport};

/// Applies inbound edit messages to room state (C4).
pub struct EditProcessor {
    store: Arc<RoomStore>,
    saver: Arc<SaveCoalescer>,
    adapter: Arc<dyn Adapter>,
    transport: Arc<dyn Transport>,
    engine: Arc<DiffEngine>,
}

impl EditProcessor {
    pub fn new(
        store: Arc<RoomStore>,
        saver: Arc<SaveCoalescer>,
        adapter: Arc<dyn Adapter>,
        transport: Arc<dyn Transport>,
        engine: Arc<DiffEngine>,
    ) -> Self {
        Self {
            store,
            saver,
            adapter,
            transport,
            engine,
        }
    }

    /// Process one inbound edit message.
    ///
    /// Returns the reply to hand back to the sender, or `None` when the
    /// message was dropped (load failure, adapter veto, unknown client).
    /// The unknown-client case additionally emits a transport-level error
    /// telling the client to re-connect.
    pub async fn receive_edit(
        &self,
        connection: &dyn Connection,
        message: EditMessage,
    ) -> Option<SyncReply> {
        let user_id = connection.user_id();
        let handle = match self.store.get_data(&message.room, &user_id).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("cannot sync room {}: {e}", message.room);
                return None;
            }
        };

        let mut state = handle.lock().await;

        let allowed = match self.adapter.check_diffs(&message, &state).await {
            Ok(allowed) => allowed,
            Err(e) => {
                log::warn!("check_diffs failed for room {}: {e}", message.room);
                false
            }
        };
        if !allowed {
            log::debug!("edit message for room {} vetoed by adapter", message.room);
            return None;
        }

        if !state.clients.contains_key(connection.id()) {
            log::warn!(
                "edit from untracked client {} in room {}",
                connection.id(),
                message.room
            );
            connection.emit(commands::ERROR, Value::from("Need to re-connect!"));
            return None;
        }

        let RoomState {
            server_copy,
            clients,
            ..
        } = &mut *state;
        let client = clients
            .get_mut(connection.id())
            .expect("client presence checked above");

        // The client has acknowledged everything up to this server version;
        // drain the pending queue before applying the new batch.
        if message.server_version == Some(client.shadow.server_version) {
            client.edits.clear();
        }

        for edit in &message.edits {
            if edit.server_version == client.shadow.server_version
                && edit.local_version == client.shadow.local_version
            {
                client.take_backup();
                self.engine.patch(&mut client.shadow.doc, &edit.diff);
                self.engine.patch(server_copy, &edit.diff);
                if !edit.diff.is_empty() {
                    client.shadow.local_version += 1;
                }
            } else {
                log::debug!(
                    "dropping out-of-sync edit for room {}: edit at ({}, {}), shadow at ({}, {})",
                    message.room,
                    edit.server_version,
                    edit.local_version,
                    client.shadow.server_version,
                    client.shadow.local_version
                );
            }
        }

        self.saver.save_snapshot(
            &message.room,
            handle.clone(),
            message.edits.clone(),
            &user_id,
        );

        if !message.edits.is_empty() {
            self.transport.broadcast(
                &message.room,
                commands::REMOTE_UPDATE_INCOMING,
                Value::from(connection.id()),
            );
        }

        Some(self.send_server_changes(server_copy, client))
    }

    /// Diff the client's shadow against the server copy and queue the
    /// result for delivery.
    ///
    /// Always produces a reply carrying the full pending queue — an empty
    /// reply is the acknowledgement that the client is up to date. The
    /// reply's `server_version` is the version the diff was based on, not
    /// the incremented one.
    fn send_server_changes(&self, server_copy: &Value, client: &mut ClientSyncState) -> SyncReply {
        let delta = self.engine.diff(&client.shadow.doc, server_copy);
        let based_on = client.shadow.server_version;

        if !delta.is_empty() {
            client.edits.push(Edit {
                server_version: based_on,
                local_version: client.shadow.local_version,
                diff: delta.clone(),
            });
            client.shadow.server_version += 1;
            self.engine.patch(&mut client.shadow.doc, &delta);
        }

        SyncReply {
            local_version: client.shadow.local_version,
            server_version: based_on,
            edits: client.edits.clone(),
        }
    }
}
