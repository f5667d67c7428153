//! Event payloads carried on the per-room SSE stream.

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::Outcome;
use crate::engine::phase::RoomPhase;

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// Optional SSE event name.
    pub event: Option<String>,
    /// Serialized data field.
    pub data: String,
}

impl ServerEvent {
    /// Build an event from a preserialized data string.
    pub fn new<E>(event: E, data: String) -> Self
    where
        E: Into<Option<String>>,
    {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Code of the room the stream is scoped to.
    pub room: String,
    /// Human-readable message confirming the subscription.
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast whenever the room phase changes.
pub struct PhaseChangedEvent {
    /// New phase.
    #[schema(value_type = String)]
    pub phase: RoomPhase,
    /// Transition counter, for deduplicating re-deliveries.
    pub version: u64,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the turn lock changes hands or is released.
pub struct LockChangedEvent {
    /// Current lock holder, if any.
    pub holder: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Periodic countdown update from the synchronized timer.
pub struct TimerTickEvent {
    /// Milliseconds left of the turn budget.
    pub remaining_ms: u64,
    /// Whole seconds left, rounded up.
    pub seconds_left: u32,
    /// Points currently at stake.
    pub points_available: i64,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when a tied tally enters the tiebreak sub-phase.
pub struct TiebreakEvent {
    /// Option ids tied for the maximum.
    pub tied: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the turn reaches a verdict.
pub struct ResolutionEvent {
    /// The verdict.
    #[schema(value_type = Object)]
    pub outcome: Outcome,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when a participant joins, leaves, or changes.
pub struct RosterChangedEvent {
    /// Current roster, in join order.
    pub participants: Vec<crate::dto::room::ParticipantSummary>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Final message pushed before a room's stream shuts down.
pub struct RoomClosedEvent {
    /// Code of the closed room.
    pub room: String,
}
