//! Registry of live room actors.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    config::AppConfig,
    dao::stats::StatsStore,
    engine::{RoomCommand, RoomHandle, room::RoomSettings, spawn_room},
    error::GameError,
};

/// Concurrent map from room id to the mailbox handle of its actor task.
///
/// Creation goes through the map's entry API, so two connections racing to
/// create the same room always end up talking to a single actor. Rooms remove
/// themselves on shutdown.
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    config: Arc<AppConfig>,
    stats: Arc<dyn StatsStore>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new(config: Arc<AppConfig>, stats: Arc<dyn StatsStore>) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            config,
            stats,
        })
    }

    /// Handle for `room_id`, spawning the actor if the room does not exist.
    /// `settings` only apply when this call creates the room.
    pub fn get_or_create(
        self: &Arc<Self>,
        room_id: &str,
        settings: RoomSettings,
    ) -> Result<RoomHandle, GameError> {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                // A room with an unknown theme could never deal its board; it
                // would admit players and then fail on every start attempt.
                if self.config.palette(&settings.theme).is_none() {
                    return Err(GameError::Configuration(format!(
                        "unknown theme `{}`",
                        settings.theme
                    )));
                }
                let handle = spawn_room(
                    room_id.to_string(),
                    settings,
                    self.config.clone(),
                    self.stats.clone(),
                    Arc::clone(self),
                );
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Handle for an existing room.
    pub fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|entry| entry.clone())
    }

    /// Drop the handle for a room that shut down.
    pub fn remove(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    /// Number of live rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether no rooms are live.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Probe every room; idle ones shut themselves down.
    pub fn sweep(&self, idle_after: Duration) {
        for entry in self.rooms.iter() {
            entry.value().send(RoomCommand::SweepIfIdle { idle_after });
        }
    }
}
