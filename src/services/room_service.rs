//! Room lifecycle: creation, joining, snapshots, and teardown.

use std::sync::Arc;

use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::{
    dto::{
        room::{
            CreateRoomRequest, JoinRole, JoinRoomRequest, JoinedResponse, RoomCreatedResponse,
            RoomStateSummary,
        },
        validation::{ROOM_CODE_ALPHABET, ROOM_CODE_LENGTH},
    },
    engine::{
        Engine, EngineContext,
        phase::{PhaseRecord, RoomPhase},
        records::{Participant, Proposal, RoomMeta, RoomPaths, Role, Turn, decode, decode_map},
    },
    error::ServiceError,
    state::{RoomEntry, SharedState, SseHub},
    store::{SharedStore, TransactionUpdate, server_timestamp},
};

use super::{sse_events, sse_service};

/// Attempts made to find an unused room code before giving up.
const CODE_ATTEMPTS: usize = 16;

/// Create a room, registering its creator as the controller.
pub async fn create_room(
    state: &SharedState,
    request: CreateRoomRequest,
) -> Result<RoomCreatedResponse, ServiceError> {
    let store = state.store();
    let code = allocate_code(state, &store).await?;
    let paths = RoomPaths::new(&code);
    let host = Uuid::new_v4();

    let meta_value = serde_json::json!({
        "host_uid": host,
        "created_at": server_timestamp(),
        "closed": false,
    });
    let outcome = store
        .transact(
            &paths.meta(),
            Box::new(move |_| TransactionUpdate::Set(meta_value.clone())),
        )
        .await
        .map_err(crate::error::EngineError::from)?;
    let meta: RoomMeta = decode(outcome.value.as_ref()).ok_or_else(|| {
        ServiceError::InvalidState("room metadata failed to round-trip".into())
    })?;

    let participant = Participant {
        id: host,
        display_name: request.display_name,
        role: Role::Controller,
        score: 0,
        penalized_until: None,
        connected: true,
    };
    write_participant(&store, &paths, &participant).await?;
    store
        .put(
            &paths.phase(),
            serde_json::to_value(PhaseRecord::default())
                .expect("record serialization cannot fail"),
        )
        .await
        .map_err(crate::error::EngineError::from)?;

    let engine = Arc::new(Engine::spawn(EngineContext {
        store: state.store(),
        config: state.config(),
        clock: state.clock(),
        room: code.clone(),
        uid: host,
    }));
    let hub = Arc::new(SseHub::new(state.config().event_capacity));
    let forwarder = sse_events::spawn_room_forwarder(&engine, Arc::clone(&hub));
    state.insert_room(code.clone(), RoomEntry::new(engine, hub, forwarder));

    info!(room = %code, host = %host, "room created");

    Ok(RoomCreatedResponse {
        code,
        created_at: crate::dto::format_timestamp_ms(meta.created_at),
        participant: participant.into(),
    })
}

/// Join an existing room. Actors may only join while the room sits in the
/// lobby; spectators may attach at any point of a round.
pub async fn join_room(
    state: &SharedState,
    code: &str,
    request: JoinRoomRequest,
) -> Result<JoinedResponse, ServiceError> {
    if !state.room_exists(code) {
        return Err(ServiceError::NotFound(format!("room `{code}` not found")));
    }
    let store = state.store();
    let paths = RoomPaths::new(code);

    let meta: RoomMeta = read_meta(&store, &paths).await?;
    if meta.closed {
        return Err(ServiceError::InvalidState("room is closed".into()));
    }

    if matches!(request.role, JoinRole::Actor) {
        let phase: PhaseRecord = decode(
            store
                .read(&paths.phase())
                .await
                .map_err(crate::error::EngineError::from)?
                .as_ref(),
        )
        .unwrap_or_default();
        if phase.phase != RoomPhase::Lobby {
            return Err(ServiceError::InvalidState(
                "actors can only join while the room is in the lobby".into(),
            ));
        }
    }

    let participant = Participant {
        id: Uuid::new_v4(),
        display_name: request.display_name,
        role: request.role.into(),
        score: 0,
        penalized_until: None,
        connected: true,
    };
    write_participant(&store, &paths, &participant).await?;

    info!(room = %code, participant = %participant.id, "participant joined");

    Ok(JoinedResponse {
        code: code.to_string(),
        participant: participant.into(),
    })
}

/// Assemble the full room snapshot a (re)joining observer needs to recover,
/// including the persisted seconds remaining of a running turn.
pub async fn room_snapshot(
    state: &SharedState,
    code: &str,
) -> Result<RoomStateSummary, ServiceError> {
    if !state.room_exists(code) {
        return Err(ServiceError::NotFound(format!("room `{code}` not found")));
    }
    let store = state.store();
    let paths = RoomPaths::new(code);

    let meta: RoomMeta = read_meta(&store, &paths).await?;
    let phase: PhaseRecord = decode(read(&store, &paths.phase()).await?.as_ref()).unwrap_or_default();
    let turn: Option<Turn> = decode(read(&store, &paths.turn()).await?.as_ref());
    let proposal: Option<Proposal> = decode(read(&store, &paths.proposal()).await?.as_ref());
    let participants: Vec<Participant> =
        decode_map::<Participant>(read(&store, &paths.participants()).await?.as_ref())
            .into_values()
            .collect();

    Ok(RoomStateSummary::assemble(
        code,
        meta.host_uid,
        meta.created_at,
        meta.closed,
        phase,
        participants,
        turn,
        proposal,
    ))
}

/// Close a room on behalf of its controller and tear it down.
pub async fn close_room(
    state: &SharedState,
    code: &str,
    participant_id: Uuid,
) -> Result<(), ServiceError> {
    let store = state.store();
    let paths = RoomPaths::new(code);
    let meta: RoomMeta = read_meta(&store, &paths).await?;
    if meta.host_uid != participant_id {
        return Err(ServiceError::Unauthorized(
            "only the room controller may close the room".into(),
        ));
    }

    if let Some((engine, hub)) = state.room(code) {
        engine.mark_closed().await?;
        sse_events::broadcast_room_closed(&hub, code);
        sse_service::broadcast_info(&hub, "room closing");
    }
    state.remove_room(code);
    store
        .remove(&paths.root())
        .await
        .map_err(crate::error::EngineError::from)?;

    info!(room = %code, "room closed");
    Ok(())
}

/// Flip a participant's connection flag, e.g. when their socket drops.
pub async fn set_connected(
    state: &SharedState,
    code: &str,
    participant_id: Uuid,
    connected: bool,
) -> Result<(), ServiceError> {
    let store = state.store();
    let paths = RoomPaths::new(code);
    store
        .transact(
            &paths.participant(participant_id),
            Box::new(move |current| {
                let Some(participant) = decode::<Participant>(current) else {
                    return TransactionUpdate::Keep;
                };
                if participant.connected == connected {
                    return TransactionUpdate::Keep;
                }
                match serde_json::to_value(Participant {
                    connected,
                    ..participant
                }) {
                    Ok(value) => TransactionUpdate::Set(value),
                    Err(_) => TransactionUpdate::Keep,
                }
            }),
        )
        .await
        .map_err(crate::error::EngineError::from)?;
    Ok(())
}

async fn allocate_code(
    state: &SharedState,
    store: &Arc<dyn SharedStore>,
) -> Result<String, ServiceError> {
    for _ in 0..CODE_ATTEMPTS {
        let code = generate_code();
        if state.room_exists(&code) {
            continue;
        }
        // A stale subtree may linger for a code no longer registered.
        let paths = RoomPaths::new(&code);
        if read(store, &paths.meta()).await?.is_none() {
            return Ok(code);
        }
    }
    Err(ServiceError::InvalidState(
        "could not allocate an unused room code".into(),
    ))
}

/// Draw a short human-enterable code from the unambiguous alphabet.
fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LENGTH)
        .map(|_| {
            let index = rng.random_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[index] as char
        })
        .collect()
}

async fn read(
    store: &Arc<dyn SharedStore>,
    path: &crate::store::StorePath,
) -> Result<Option<crate::store::StoreValue>, ServiceError> {
    store
        .read(path)
        .await
        .map_err(|err| crate::error::EngineError::from(err).into())
}

async fn read_meta(
    store: &Arc<dyn SharedStore>,
    paths: &RoomPaths,
) -> Result<RoomMeta, ServiceError> {
    decode(read(store, &paths.meta()).await?.as_ref())
        .ok_or_else(|| ServiceError::NotFound("room metadata not found".into()))
}

async fn write_participant(
    store: &Arc<dyn SharedStore>,
    paths: &RoomPaths,
    participant: &Participant,
) -> Result<(), ServiceError> {
    store
        .put(
            &paths.participant(participant.id),
            serde_json::to_value(participant).expect("record serialization cannot fail"),
        )
        .await
        .map_err(|err| crate::error::EngineError::from(err).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockHandle;
    use crate::config::EngineConfig;
    use crate::state::AppState;
    use crate::store::MemoryStore;

    fn test_state() -> SharedState {
        AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EngineConfig::default()),
            ClockHandle::fixed(0),
        )
    }

    #[tokio::test]
    async fn create_then_join_then_snapshot() {
        let state = test_state();
        let created = create_room(
            &state,
            CreateRoomRequest {
                display_name: "Host".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(created.code.len(), ROOM_CODE_LENGTH);
        assert!(matches!(created.participant.role, Role::Controller));

        let joined = join_room(
            &state,
            &created.code,
            JoinRoomRequest {
                display_name: "Ada".into(),
                role: JoinRole::Actor,
            },
        )
        .await
        .unwrap();
        assert!(matches!(joined.participant.role, Role::Actor));

        let snapshot = room_snapshot(&state, &created.code).await.unwrap();
        assert_eq!(snapshot.phase, RoomPhase::Lobby);
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(snapshot.host, created.participant.id);
    }

    #[tokio::test]
    async fn joining_an_unknown_room_is_not_found() {
        let state = test_state();
        let err = join_room(
            &state,
            "ZZZZ",
            JoinRoomRequest {
                display_name: "Ada".into(),
                role: JoinRole::Actor,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn only_the_controller_can_close() {
        let state = test_state();
        let created = create_room(
            &state,
            CreateRoomRequest {
                display_name: "Host".into(),
            },
        )
        .await
        .unwrap();

        let err = close_room(&state, &created.code, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));

        close_room(&state, &created.code, created.participant.id)
            .await
            .unwrap();
        assert!(!state.room_exists(&created.code));
    }

    #[test]
    fn generated_codes_use_the_code_alphabet() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), ROOM_CODE_LENGTH);
            assert!(code.bytes().all(|byte| ROOM_CODE_ALPHABET.contains(&byte)));
        }
    }
}
