//! Central application state: the shared store, the clock handle, and the
//! registry of live rooms with their engines and SSE hubs.

mod sse;

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::clock::ClockHandle;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::store::SharedStore;

pub use self::sse::SseHub;

/// Cheaply cloneable handle to the application state.
pub type SharedState = Arc<AppState>;

/// One live room: its engine, its SSE hub, and the task bridging the two.
pub struct RoomEntry {
    /// Arbitration engine acting as the room's controller host.
    pub engine: Arc<Engine>,
    /// Broadcast hub feeding the room's SSE subscribers.
    pub hub: Arc<SseHub>,
    /// Local creation instant, used by the reaper.
    pub created_at: SystemTime,
    forwarder: JoinHandle<()>,
}

impl RoomEntry {
    /// Bundle a freshly spawned engine with its hub and forwarder task.
    pub fn new(engine: Arc<Engine>, hub: Arc<SseHub>, forwarder: JoinHandle<()>) -> Self {
        Self {
            engine,
            hub,
            created_at: SystemTime::now(),
            forwarder,
        }
    }

    /// Stop the engine drivers and the event forwarder.
    fn shutdown(&self) {
        self.engine.close();
        self.forwarder.abort();
    }
}

/// Central application state storing the store handle and room registry.
pub struct AppState {
    store: Arc<dyn SharedStore>,
    config: Arc<EngineConfig>,
    clock: ClockHandle,
    rooms: DashMap<String, RoomEntry>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: Arc<EngineConfig>,
        clock: ClockHandle,
    ) -> SharedState {
        Arc::new(Self {
            store,
            config,
            clock,
            rooms: DashMap::new(),
        })
    }

    /// Handle to the shared store.
    pub fn store(&self) -> Arc<dyn SharedStore> {
        Arc::clone(&self.store)
    }

    /// Runtime configuration.
    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    /// Clock-offset estimates for this process.
    pub fn clock(&self) -> ClockHandle {
        self.clock.clone()
    }

    /// Register a live room.
    pub fn insert_room(&self, code: String, entry: RoomEntry) {
        self.rooms.insert(code, entry);
    }

    /// Engine and hub for a room, if it is live.
    pub fn room(&self, code: &str) -> Option<(Arc<Engine>, Arc<SseHub>)> {
        self.rooms
            .get(code)
            .map(|entry| (Arc::clone(&entry.engine), Arc::clone(&entry.hub)))
    }

    /// Whether a room code is currently registered.
    pub fn room_exists(&self, code: &str) -> bool {
        self.rooms.contains_key(code)
    }

    /// Codes of every live room.
    pub fn room_codes(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Local creation instant of a room, if it is live.
    pub fn room_created_at(&self, code: &str) -> Option<SystemTime> {
        self.rooms.get(code).map(|entry| entry.created_at)
    }

    /// Tear a room down: stop its tasks and drop it from the registry.
    pub fn remove_room(&self, code: &str) -> bool {
        match self.rooms.remove(code) {
            Some((_, entry)) => {
                entry.shutdown();
                true
            }
            None => false,
        }
    }
}
