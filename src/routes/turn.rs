//! Turn control and actor action routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};

use crate::{
    dto::turn::{
        ActionResponse, BuzzRequest, ControllerRequest, OpenTurnRequest, OutcomeResponse,
        ValidateRequest, VoteRequest,
    },
    error::AppError,
    services::turn_service,
    state::SharedState,
};

/// Routes driving turns and accepting actor actions.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/rooms/{code}/start", post(start_room))
        .route("/rooms/{code}/turn/open", post(open_turn))
        .route("/rooms/{code}/turn/repeat", post(repeat_turn))
        .route("/rooms/{code}/turn/pause", post(pause))
        .route("/rooms/{code}/turn/resume", post(resume))
        .route("/rooms/{code}/turn/validate", post(validate))
        .route("/rooms/{code}/turn/skip", post(skip))
        .route("/rooms/{code}/end", post(end_room))
        .route("/rooms/{code}/buzz", post(buzz))
        .route("/rooms/{code}/vote", post(vote))
}

/// Move the room out of the lobby into setup (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/start",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = ControllerRequest,
    responses((status = 200, description = "Room started", body = ActionResponse))
)]
pub async fn start_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<ControllerRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(turn_service::start_room(&state, &code, payload).await?))
}

/// Open the next turn (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/turn/open",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = OpenTurnRequest,
    responses((status = 200, description = "Turn opened", body = ActionResponse))
)]
pub async fn open_turn(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<OpenTurnRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(turn_service::open_turn(&state, &code, payload).await?))
}

/// Re-open the current turn without advancing (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/turn/repeat",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = OpenTurnRequest,
    responses((status = 200, description = "Turn repeated", body = ActionResponse))
)]
pub async fn repeat_turn(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<OpenTurnRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(
        turn_service::repeat_turn(&state, &code, payload).await?,
    ))
}

/// Freeze the turn timer (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/turn/pause",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = ControllerRequest,
    responses((status = 200, description = "Paused", body = ActionResponse))
)]
pub async fn pause(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<ControllerRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(turn_service::pause(&state, &code, payload).await?))
}

/// Resume a paused turn (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/turn/resume",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = ControllerRequest,
    responses((status = 200, description = "Resumed", body = ActionResponse))
)]
pub async fn resume(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<ControllerRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(turn_service::resume(&state, &code, payload).await?))
}

/// Judge the lock holder's answer (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/turn/validate",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = ValidateRequest,
    responses((status = 200, description = "Verdict", body = OutcomeResponse))
)]
pub async fn validate(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<ValidateRequest>,
) -> Result<Json<OutcomeResponse>, AppError> {
    Ok(Json(turn_service::validate(&state, &code, payload).await?))
}

/// Abandon the current turn (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/turn/skip",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = ControllerRequest,
    responses((status = 200, description = "Skipped", body = OutcomeResponse))
)]
pub async fn skip(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<ControllerRequest>,
) -> Result<Json<OutcomeResponse>, AppError> {
    Ok(Json(turn_service::skip(&state, &code, payload).await?))
}

/// Finish the room after a resolved turn (controller only).
#[utoipa::path(
    post,
    path = "/rooms/{code}/end",
    tag = "turn",
    params(("code" = String, Path, description = "Room code")),
    request_body = ControllerRequest,
    responses((status = 200, description = "Ended", body = ActionResponse))
)]
pub async fn end_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<ControllerRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(turn_service::end_room(&state, &code, payload).await?))
}

/// Record a buzz for the current racing turn.
#[utoipa::path(
    post,
    path = "/rooms/{code}/buzz",
    tag = "action",
    params(("code" = String, Path, description = "Room code")),
    request_body = BuzzRequest,
    responses((status = 200, description = "Buzz recorded", body = ActionResponse))
)]
pub async fn buzz(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<BuzzRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(turn_service::buzz(&state, &code, payload).await?))
}

/// Record a vote for the current proposal.
#[utoipa::path(
    post,
    path = "/rooms/{code}/vote",
    tag = "action",
    params(("code" = String, Path, description = "Room code")),
    request_body = VoteRequest,
    responses((status = 200, description = "Vote recorded", body = ActionResponse))
)]
pub async fn vote(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Json(payload): Json<VoteRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(turn_service::vote(&state, &code, payload).await?))
}
