//! Turn control on behalf of the room controller, plus actor actions
//! arriving over REST. Every operation re-checks authority against the
//! stored room metadata before touching the engine.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    dto::turn::{
        ActionResponse, BuzzRequest, ControllerRequest, OpenTurnRequest, OutcomeResponse,
        ValidateRequest, VoteRequest,
    },
    engine::{
        Engine,
        records::{RoomMeta, RoomPaths, decode},
    },
    error::{EngineError, ServiceError},
    state::SharedState,
};

/// Move the room out of the lobby into setup.
pub async fn start_room(
    state: &SharedState,
    code: &str,
    request: ControllerRequest,
) -> Result<ActionResponse, ServiceError> {
    let engine = controller_engine(state, code, request.participant_id).await?;
    engine.configure().await?;
    Ok(ActionResponse {
        message: "started".into(),
    })
}

/// Open the next turn.
pub async fn open_turn(
    state: &SharedState,
    code: &str,
    request: OpenTurnRequest,
) -> Result<ActionResponse, ServiceError> {
    let (participant_id, spec) = request.into_spec()?;
    let engine = controller_engine(state, code, participant_id).await?;
    let turn = engine.open_turn(spec).await?;
    Ok(ActionResponse {
        message: format!("turn {} opened", turn.index),
    })
}

/// Re-open the current turn without advancing the index.
pub async fn repeat_turn(
    state: &SharedState,
    code: &str,
    request: OpenTurnRequest,
) -> Result<ActionResponse, ServiceError> {
    let (participant_id, spec) = request.into_spec()?;
    let engine = controller_engine(state, code, participant_id).await?;
    let turn = engine.repeat_turn(spec).await?;
    Ok(ActionResponse {
        message: format!("turn {} repeated", turn.index),
    })
}

/// Freeze the turn timer.
pub async fn pause(
    state: &SharedState,
    code: &str,
    request: ControllerRequest,
) -> Result<ActionResponse, ServiceError> {
    let engine = controller_engine(state, code, request.participant_id).await?;
    engine.pause().await?;
    Ok(ActionResponse {
        message: "paused".into(),
    })
}

/// Resume a paused turn.
pub async fn resume(
    state: &SharedState,
    code: &str,
    request: ControllerRequest,
) -> Result<ActionResponse, ServiceError> {
    let engine = controller_engine(state, code, request.participant_id).await?;
    engine.resume().await?;
    Ok(ActionResponse {
        message: "resumed".into(),
    })
}

/// Judge the lock holder's answer.
pub async fn validate(
    state: &SharedState,
    code: &str,
    request: ValidateRequest,
) -> Result<OutcomeResponse, ServiceError> {
    let engine = controller_engine(state, code, request.participant_id).await?;
    let outcome = engine.validate(request.correct).await?;
    Ok(OutcomeResponse { outcome })
}

/// Abandon the current turn without a winner.
pub async fn skip(
    state: &SharedState,
    code: &str,
    request: ControllerRequest,
) -> Result<OutcomeResponse, ServiceError> {
    let engine = controller_engine(state, code, request.participant_id).await?;
    let outcome = engine.skip().await?;
    Ok(OutcomeResponse { outcome })
}

/// Finish the room after a resolved turn.
pub async fn end_room(
    state: &SharedState,
    code: &str,
    request: ControllerRequest,
) -> Result<ActionResponse, ServiceError> {
    let engine = controller_engine(state, code, request.participant_id).await?;
    engine.end_room().await?;
    Ok(ActionResponse {
        message: "ended".into(),
    })
}

/// Record a buzz for the current racing turn.
pub async fn buzz(
    state: &SharedState,
    code: &str,
    request: BuzzRequest,
) -> Result<ActionResponse, ServiceError> {
    let engine = room_engine(state, code)?;
    engine.emit_action(request.participant_id).await?;
    Ok(ActionResponse {
        message: "buzzed".into(),
    })
}

/// Record a vote for the current proposal.
pub async fn vote(
    state: &SharedState,
    code: &str,
    request: VoteRequest,
) -> Result<ActionResponse, ServiceError> {
    let engine = room_engine(state, code)?;
    engine
        .cast_vote(request.participant_id, &request.choice)
        .await?;
    Ok(ActionResponse {
        message: "voted".into(),
    })
}

/// Engine handle for a live room.
pub fn room_engine(state: &SharedState, code: &str) -> Result<Arc<Engine>, ServiceError> {
    state
        .room(code)
        .map(|(engine, _)| engine)
        .ok_or_else(|| ServiceError::NotFound(format!("room `{code}` not found")))
}

/// Engine handle plus an authority check: `participant_id` must be the
/// room's current controller.
async fn controller_engine(
    state: &SharedState,
    code: &str,
    participant_id: Uuid,
) -> Result<Arc<Engine>, ServiceError> {
    let engine = room_engine(state, code)?;
    let paths = RoomPaths::new(code);
    let meta: RoomMeta = decode(
        state
            .store()
            .read(&paths.meta())
            .await
            .map_err(EngineError::from)?
            .as_ref(),
    )
    .ok_or_else(|| ServiceError::NotFound("room metadata not found".into()))?;

    if meta.host_uid != participant_id {
        return Err(ServiceError::Unauthorized(format!(
            "participant `{participant_id}` is not the room controller"
        )));
    }
    Ok(engine)
}
