//! Shared application state.

pub mod registry;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    dao::stats::{MemoryStatsStore, StatsStore},
    state::registry::RoomRegistry,
};

/// Cheaply cloneable handle to the application state.
pub type SharedState = Arc<AppState>;

/// Process-wide state: configuration, the room registry, and the stats store.
pub struct AppState {
    config: Arc<AppConfig>,
    registry: Arc<RoomRegistry>,
    stats: Arc<dyn StatsStore>,
}

impl AppState {
    /// Construct the shared state with the in-memory stats store.
    pub fn new(config: AppConfig) -> SharedState {
        let config = Arc::new(config);
        let stats: Arc<dyn StatsStore> = Arc::new(MemoryStatsStore::new());
        let registry = RoomRegistry::new(config.clone(), stats.clone());
        Arc::new(Self {
            config,
            registry,
            stats,
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    /// Registry of live rooms.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Persistent player statistics store.
    pub fn stats(&self) -> &Arc<dyn StatsStore> {
        &self.stats
    }
}
