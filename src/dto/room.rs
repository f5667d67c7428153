//! Room lifecycle requests and summaries.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::dto::{format_timestamp_ms, validation::validate_display_name};
use crate::engine::phase::{PhaseRecord, RoomPhase};
use crate::engine::records::{Participant, Proposal, ProposalOption, Role, Turn};

/// Payload used to create a brand-new room.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRoomRequest {
    /// Display name of the creating participant (the controller).
    pub display_name: String,
}

impl Validate for CreateRoomRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Err(err) = validate_display_name(&self.display_name) {
            errors.add("display_name", err);
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Non-controller roles a joiner may request.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JoinRole {
    /// Competes in races and votes.
    #[default]
    Actor,
    /// Observes only.
    Spectator,
}

impl From<JoinRole> for Role {
    fn from(role: JoinRole) -> Self {
        match role {
            JoinRole::Actor => Role::Actor,
            JoinRole::Spectator => Role::Spectator,
        }
    }
}

/// Payload used to join an existing room.
#[derive(Debug, Deserialize, ToSchema)]
pub struct JoinRoomRequest {
    /// Display name shown to other participants.
    pub display_name: String,
    /// Requested role; defaults to actor.
    #[serde(default)]
    pub role: JoinRole,
}

impl Validate for JoinRoomRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Err(err) = validate_display_name(&self.display_name) {
            errors.add("display_name", err);
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Snapshot of one participant.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ParticipantSummary {
    /// Stable identity.
    pub id: Uuid,
    /// Display name.
    pub display_name: String,
    /// Permission role.
    #[schema(value_type = String)]
    pub role: Role,
    /// Accumulated score.
    pub score: i64,
    /// Whether the participant holds a live connection.
    pub connected: bool,
}

impl From<Participant> for ParticipantSummary {
    fn from(participant: Participant) -> Self {
        Self {
            id: participant.id,
            display_name: participant.display_name,
            role: participant.role,
            score: participant.score,
            connected: participant.connected,
        }
    }
}

/// Response to a successful room creation.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoomCreatedResponse {
    /// Short human-entered code identifying the room.
    pub code: String,
    /// Creation instant, RFC3339.
    pub created_at: String,
    /// The creating participant (room controller).
    pub participant: ParticipantSummary,
}

/// Response to a successful join.
#[derive(Debug, Serialize, ToSchema)]
pub struct JoinedResponse {
    /// Code of the joined room.
    pub code: String,
    /// The newly created participant.
    pub participant: ParticipantSummary,
}

/// Snapshot of the current turn for rejoin recovery.
#[derive(Debug, Serialize, ToSchema)]
pub struct TurnSummary {
    /// Zero-based turn counter.
    pub index: u32,
    /// Resolution machine for this turn (`race` or `vote`).
    pub kind: String,
    /// Scoring tier.
    pub difficulty: String,
    /// Current lock holder, if any.
    pub lock_holder: Option<Uuid>,
    /// Whether the timer is currently frozen.
    pub paused: bool,
    /// Whole seconds remaining, as last persisted by the controller.
    pub seconds_left: Option<u32>,
}

impl From<Turn> for TurnSummary {
    fn from(turn: Turn) -> Self {
        Self {
            index: turn.index,
            kind: match turn.kind {
                crate::engine::records::TurnKind::Race => "race".into(),
                crate::engine::records::TurnKind::Vote => "vote".into(),
            },
            difficulty: match turn.difficulty {
                crate::engine::records::Difficulty::Normal => "normal".into(),
                crate::engine::records::Difficulty::Hard => "hard".into(),
            },
            lock_holder: turn.lock_holder,
            paused: turn.paused_at.is_some(),
            seconds_left: turn.seconds_left,
        }
    }
}

/// Snapshot of the current proposal.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProposalSummary {
    /// Proposal identifier.
    pub id: Uuid,
    /// Candidates in presentation order.
    #[schema(value_type = Vec<Object>)]
    pub options: Vec<ProposalOption>,
    /// Whether the proposal resolves by strict majority on the first option.
    pub binary: bool,
    /// Whether the tally already produced an outcome.
    pub resolved: bool,
}

impl From<Proposal> for ProposalSummary {
    fn from(proposal: Proposal) -> Self {
        Self {
            id: proposal.id,
            options: proposal.options,
            binary: proposal.binary,
            resolved: proposal.resolved,
        }
    }
}

/// Full room snapshot returned to (re)joining observers.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoomStateSummary {
    /// Room code.
    pub code: String,
    /// Creation instant, RFC3339.
    pub created_at: String,
    /// Whether the room has been closed.
    pub closed: bool,
    /// Identity of the room controller.
    pub host: Uuid,
    /// Current phase.
    #[schema(value_type = String)]
    pub phase: RoomPhase,
    /// Phase transition counter.
    pub version: u64,
    /// Participants in join order.
    pub participants: Vec<ParticipantSummary>,
    /// Current turn, if one exists.
    pub turn: Option<TurnSummary>,
    /// Current proposal, if one is open.
    pub proposal: Option<ProposalSummary>,
}

impl RoomStateSummary {
    /// Assemble a snapshot from the decoded room records.
    pub fn assemble(
        code: &str,
        host: Uuid,
        created_at: i64,
        closed: bool,
        phase: PhaseRecord,
        participants: Vec<Participant>,
        turn: Option<Turn>,
        proposal: Option<Proposal>,
    ) -> Self {
        Self {
            code: code.to_string(),
            created_at: format_timestamp_ms(created_at),
            closed,
            host,
            phase: phase.phase,
            version: phase.version,
            participants: participants.into_iter().map(Into::into).collect(),
            turn: turn.map(Into::into),
            proposal: proposal.map(Into::into),
        }
    }
}
