//! Per-room and per-client synchronization state.
//!
//! Each room owns one authoritative document plus a [`ClientSyncState`] per
//! joined client. The client state is the shadow/backup pair of Fraser's
//! differential synchronization: the shadow is what the server believes the
//! client last acknowledged, the backup is one step behind it, taken right
//! before an inbound edit lands.
//!
//! This module is pure bookkeeping — no I/O, no locking. Serialization of
//! access is the room store's job.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::protocol::Edit;

/// The server's model of one client's view of the document.
#[derive(Debug, Clone)]
pub struct ShadowDoc {
    /// Last document the client is known to have acknowledged.
    pub doc: Value,
    /// Count of server→client diffs acknowledged. Monotonic.
    pub server_version: u64,
    /// Count of client→server diffs accepted. Monotonic.
    pub local_version: u64,
}

/// One-step-back copy of the shadow, reserved for recovery.
#[derive(Debug, Clone)]
pub struct BackupDoc {
    pub doc: Value,
    /// The shadow's `server_version` at the time the backup was taken.
    pub server_version: u64,
}

/// Shadow/backup/edit-queue bookkeeping for one (room, client) pair.
#[derive(Debug, Clone)]
pub struct ClientSyncState {
    pub shadow: ShadowDoc,
    pub backup: BackupDoc,
    /// Pending outbound edits, oldest first. Drained when the client
    /// acknowledges the server version they were based on.
    pub edits: Vec<Edit>,
}

impl ClientSyncState {
    /// Seed a fresh client from the room's current server copy.
    ///
    /// Shadow and backup each get their own copy of the seed, so mutating
    /// one never affects the other or the server copy.
    pub fn new(seed: &Value) -> Self {
        Self {
            shadow: ShadowDoc {
                doc: seed.clone(),
                server_version: 0,
                local_version: 0,
            },
            backup: BackupDoc {
                doc: seed.clone(),
                server_version: 0,
            },
            edits: Vec::new(),
        }
    }

    /// Snapshot the shadow into the backup. Called immediately before an
    /// inbound client diff is applied to the shadow.
    pub fn take_backup(&mut self) {
        self.backup.doc = self.shadow.doc.clone();
        self.backup.server_version = self.shadow.server_version;
    }

    /// Whether the pending queue is strictly ordered by
    /// `(server_version, local_version)` and no entry is ahead of the shadow.
    pub fn edits_consistent(&self) -> bool {
        self.edits
            .iter()
            .all(|e| e.server_version <= self.shadow.server_version)
            && self
                .edits
                .windows(2)
                .all(|w| (w[0].server_version, w[0].local_version)
                    < (w[1].server_version, w[1].local_version))
    }
}

/// State for one live room.
#[derive(Debug)]
pub struct RoomState {
    /// The authoritative document.
    pub server_copy: Value,
    /// Tracked clients, keyed by connection id.
    pub clients: HashMap<String, ClientSyncState>,
    /// Connection ids currently joined; broadcast membership bookkeeping.
    pub sockets: HashSet<String>,
}

impl RoomState {
    pub fn new(server_copy: Value) -> Self {
        Self {
            server_copy,
            clients: HashMap::new(),
            sockets: HashSet::new(),
        }
    }

    /// Register a client seeded from the current server copy.
    ///
    /// A rejoin under the same connection id starts from scratch: the old
    /// shadow belongs to a conversation the client no longer remembers.
    pub fn add_client(&mut self, connection_id: &str) -> &mut ClientSyncState {
        self.sockets.insert(connection_id.to_string());
        self.clients
            .insert(connection_id.to_string(), ClientSyncState::new(&self.server_copy));
        self.clients
            .get_mut(connection_id)
            .expect("client just inserted")
    }

    /// Drop a client's sync state and socket registration.
    pub fn remove_client(&mut self, connection_id: &str) -> Option<ClientSyncState> {
        self.sockets.remove(connection_id);
        self.clients.remove(connection_id)
    }
}
