//! Background sweeper that garbage-collects closed and abandoned rooms.

use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::{
    engine::records::{RoomMeta, RoomPaths, decode},
    state::SharedState,
};

use super::sse_events;

/// Periodically sweep the room registry, dropping rooms whose metadata is
/// marked closed and rooms older than the configured TTL. Runs until the
/// process shuts down.
pub async fn run_room_reaper(state: SharedState) {
    let mut ticker = interval(state.config().reaper_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep(&state).await;
    }
}

async fn sweep(state: &SharedState) {
    let ttl = state.config().room_ttl;
    for code in state.room_codes() {
        let paths = RoomPaths::new(&code);
        let meta: Option<RoomMeta> = match state.store().read(&paths.meta()).await {
            Ok(value) => decode(value.as_ref()),
            Err(err) => {
                warn!(room = %code, error = %err, "reaper failed to read room metadata");
                continue;
            }
        };

        // Missing metadata means a half-created or already-wiped room.
        let closed = meta.map(|meta| meta.closed).unwrap_or(true);
        let expired = state
            .room_created_at(&code)
            .and_then(|created| created.elapsed().ok())
            .is_some_and(|age| age > ttl);

        if !closed && !expired {
            continue;
        }

        info!(room = %code, closed, expired, "reaping room");
        if let Some((_, hub)) = state.room(&code) {
            sse_events::broadcast_room_closed(&hub, &code);
        }
        state.remove_room(&code);
        if let Err(err) = state.store().remove(&paths.root()).await {
            warn!(room = %code, error = %err, "failed to wipe reaped room subtree");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ClockHandle;
    use crate::config::EngineConfig;
    use crate::dto::room::CreateRoomRequest;
    use crate::services::room_service;
    use crate::state::AppState;
    use crate::store::{MemoryStore, SharedStore};

    #[tokio::test]
    async fn sweep_reaps_closed_rooms_and_keeps_live_ones() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let state = AppState::new(
            Arc::clone(&store),
            Arc::new(EngineConfig::default()),
            ClockHandle::fixed(0),
        );

        let live = room_service::create_room(
            &state,
            CreateRoomRequest {
                display_name: "Host".into(),
            },
        )
        .await
        .unwrap();
        let doomed = room_service::create_room(
            &state,
            CreateRoomRequest {
                display_name: "Host".into(),
            },
        )
        .await
        .unwrap();

        // Mark the second room closed without tearing it down.
        let (engine, _) = state.room(&doomed.code).unwrap();
        engine.mark_closed().await.unwrap();

        sweep(&state).await;

        assert!(state.room_exists(&live.code));
        assert!(!state.room_exists(&doomed.code));
        let doomed_paths = RoomPaths::new(&doomed.code);
        assert_eq!(store.read(&doomed_paths.root()).await.unwrap(), None);
    }
}
