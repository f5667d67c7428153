//! Messages exchanged with actor WebSocket clients.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
/// Messages accepted from actor WebSocket clients.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorInboundMessage {
    /// First message on every connection: binds it to a participant.
    Identification {
        /// Identity previously returned by the join endpoint.
        participant_id: Uuid,
    },
    /// Attempt to win the current racing turn.
    Buzz {
        /// Identity of the acting participant.
        participant_id: Uuid,
    },
    /// Cast a vote for the current proposal.
    Vote {
        /// Identity of the voting participant.
        participant_id: Uuid,
        /// Chosen option id.
        choice: String,
    },
    /// Anything unrecognized; ignored with a warning.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, ToSchema)]
/// Positive acknowledgement sent after successful identification.
pub struct ActorAck {
    /// Bound participant identity.
    pub participant_id: Uuid,
    /// Always `"identified"`.
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
/// Feedback sent after a buzz or vote attempt.
pub struct ActionFeedback {
    /// Whether the action was recorded.
    pub accepted: bool,
    /// Refusal reason when not accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
