//! Room-info persistence interface.
//!
//! The relay publishes a summary row per live room so the lobby can list
//! and locate rooms. Persistence itself lives outside the core; this
//! trait is the seam, and [`MemoryRoomStore`] is the in-process
//! implementation used by tests and single-node setups.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{RoomId, RoomInfo};

/// A failed store operation. The publisher retries with backoff, so
/// implementations should return transient failures rather than panic.
#[derive(Debug, thiserror::Error)]
#[error("room info store: {0}")]
pub struct StoreError(pub String);

/// Sink for room-info summaries.
#[async_trait]
pub trait RoomInfoStore: Send + Sync {
    /// Inserts or replaces the row for a live room. Idempotent.
    async fn put_room(&self, info: &RoomInfo) -> Result<(), StoreError>;

    /// Drops the row once the room has ended.
    async fn remove_room(&self, room_id: &RoomId) -> Result<(), StoreError>;
}

/// In-memory store keyed by room id.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: Mutex<HashMap<RoomId, RoomInfo>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current row for a room, if any.
    pub fn get(&self, room_id: &RoomId) -> Option<RoomInfo> {
        self.rooms.lock().expect("store lock").get(room_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().expect("store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RoomInfoStore for MemoryRoomStore {
    async fn put_room(&self, info: &RoomInfo) -> Result<(), StoreError> {
        self.rooms
            .lock()
            .expect("store lock")
            .insert(info.id.clone(), info.clone());
        Ok(())
    }

    async fn remove_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        self.rooms.lock().expect("store lock").remove(room_id);
        Ok(())
    }
}
