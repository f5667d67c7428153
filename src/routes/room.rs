//! Room lifecycle routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::room::{
        CreateRoomRequest, JoinRoomRequest, JoinedResponse, RoomCreatedResponse, RoomStateSummary,
    },
    dto::turn::{ActionResponse, ControllerRequest},
    error::AppError,
    services::room_service,
    state::SharedState,
};

/// Routes handling room creation, joining, and teardown.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/{code}", get(room_snapshot).delete(close_room))
        .route("/rooms/{code}/join", post(join_room))
}

/// Create a fresh room; the creator becomes its controller.
#[utoipa::path(
    post,
    path = "/rooms",
    tag = "room",
    request_body = CreateRoomRequest,
    responses(
        (status = 200, description = "Room created", body = RoomCreatedResponse)
    )
)]
pub async fn create_room(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateRoomRequest>>,
) -> Result<Json<RoomCreatedResponse>, AppError> {
    let response = room_service::create_room(&state, payload).await?;
    Ok(Json(response))
}

/// Join an existing room as an actor or spectator.
#[utoipa::path(
    post,
    path = "/rooms/{code}/join",
    tag = "room",
    params(("code" = String, Path, description = "Room code")),
    request_body = JoinRoomRequest,
    responses(
        (status = 200, description = "Joined", body = JoinedResponse)
    )
)]
pub async fn join_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Valid(Json(payload)): Valid<Json<JoinRoomRequest>>,
) -> Result<Json<JoinedResponse>, AppError> {
    let response = room_service::join_room(&state, &code, payload).await?;
    Ok(Json(response))
}

/// Full room snapshot for (re)joining observers.
#[utoipa::path(
    get,
    path = "/rooms/{code}",
    tag = "room",
    params(("code" = String, Path, description = "Room code")),
    responses(
        (status = 200, description = "Room snapshot", body = RoomStateSummary)
    )
)]
pub async fn room_snapshot(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<RoomStateSummary>, AppError> {
    let response = room_service::room_snapshot(&state, &code).await?;
    Ok(Json(response))
}

/// Close a room and tear down its engine (controller only).
#[utoipa::path(
    delete,
    path = "/rooms/{code}",
    tag = "room",
    params(("code" = String, Path, description = "Room code")),
    request_body = ControllerRequest,
    responses(
        (status = 200, description = "Room closed", body = ActionResponse)
    )
)]
pub async fn close_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<ControllerRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    room_service::close_room(&state, &code, payload.participant_id).await?;
    Ok(Json(ActionResponse {
        message: "closed".into(),
    }))
}
