//! Session rooms: one authoritative [`Session`] plus its broadcast group.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use scribe_core::Session;

use crate::broadcast::BroadcastGroup;

pub struct SessionRoom {
    id: String,
    session: Mutex<Session>,
    broadcast: BroadcastGroup,
}

impl SessionRoom {
    pub fn new(id: impl Into<String>, broadcast_capacity: usize, dedup_window: usize) -> Self {
        let id = id.into();
        Self {
            session: Mutex::new(Session::new(id.clone(), dedup_window)),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock the session. Never hold the guard across an `.await`.
    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn is_empty(&self) -> bool {
        self.session.lock().is_empty()
    }
}

/// Maps session ids to rooms. Rooms exist while they have participants.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<SessionRoom>>>>,
    broadcast_capacity: usize,
    dedup_window: usize,
}

impl RoomManager {
    pub fn new(broadcast_capacity: usize, dedup_window: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            broadcast_capacity,
            dedup_window,
        }
    }

    pub async fn get_or_create(&self, session_id: &str) -> Arc<SessionRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(session_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(session_id) {
            return room.clone();
        }
        log::info!("Creating session room {session_id:?}");
        let room = Arc::new(SessionRoom::new(
            session_id,
            self.broadcast_capacity,
            self.dedup_window,
        ));
        rooms.insert(session_id.to_string(), room.clone());
        room
    }

    /// Run `f` on the room for `session_id`, creating it if needed.
    ///
    /// The room map stays locked while `f` runs, so a concurrent
    /// [`remove_if_empty`](Self::remove_if_empty) cannot drop the room
    /// between lookup and join.
    pub async fn enter<R>(&self, session_id: &str, f: impl FnOnce(&Arc<SessionRoom>) -> R) -> R {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(session_id) {
                return f(room);
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(session_id.to_string()).or_insert_with(|| {
            log::info!("Creating session room {session_id:?}");
            Arc::new(SessionRoom::new(
                session_id,
                self.broadcast_capacity,
                self.dedup_window,
            ))
        });
        f(room)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionRoom>> {
        self.rooms.read().await.get(session_id).cloned()
    }

    /// Drop the room if nobody is left in it. Its document goes with it.
    pub async fn remove_if_empty(&self, session_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = rooms.get(session_id).is_some_and(|room| room.is_empty());
        if empty {
            rooms.remove(session_id);
            log::info!("Session room {session_id:?} removed (empty)");
        }
        empty
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
