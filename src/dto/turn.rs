//! Turn control and action requests.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::records::{Difficulty, ProposalOption};
use crate::engine::{Outcome, TurnSpec};
use crate::error::ServiceError;

/// Identifies the participant performing a controller operation.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ControllerRequest {
    /// Identity of the requesting participant; must be the room controller.
    pub participant_id: Uuid,
}

/// Kinds of turns a controller can open.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnKindInput {
    /// First-action-wins arbitration.
    Race,
    /// Consensus vote over a proposal.
    Vote,
}

/// One candidate supplied when opening a vote turn.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct OptionInput {
    /// Stable identifier voters reference.
    pub id: String,
    /// Text shown to voters.
    pub label: String,
}

/// Payload used to open the next turn (or repeat the current one).
#[derive(Debug, Deserialize, ToSchema)]
pub struct OpenTurnRequest {
    /// Identity of the requesting participant; must be the room controller.
    pub participant_id: Uuid,
    /// Which resolution machine to run.
    pub kind: TurnKindInput,
    /// Scoring tier for race turns; defaults to normal.
    #[serde(default)]
    pub difficulty: Option<DifficultyInput>,
    /// Candidates for vote turns.
    #[serde(default)]
    pub options: Vec<OptionInput>,
    /// Whether a vote turn resolves by strict majority on its first option.
    #[serde(default)]
    pub binary: bool,
}

/// Difficulty tiers accepted over the wire.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyInput {
    /// Standard decay curve.
    Normal,
    /// Steeper curve with a higher starting value.
    Hard,
}

impl From<DifficultyInput> for Difficulty {
    fn from(input: DifficultyInput) -> Self {
        match input {
            DifficultyInput::Normal => Difficulty::Normal,
            DifficultyInput::Hard => Difficulty::Hard,
        }
    }
}

impl OpenTurnRequest {
    /// Convert the request into an engine turn spec, validating that vote
    /// turns carry at least two options.
    pub fn into_spec(self) -> Result<(Uuid, TurnSpec), ServiceError> {
        let participant_id = self.participant_id;
        let spec = match self.kind {
            TurnKindInput::Race => TurnSpec::Race {
                difficulty: self.difficulty.map(Into::into).unwrap_or_default(),
            },
            TurnKindInput::Vote => {
                if self.options.len() < 2 {
                    return Err(ServiceError::InvalidInput(
                        "a vote turn requires at least two options".into(),
                    ));
                }
                TurnSpec::Vote {
                    options: self
                        .options
                        .into_iter()
                        .map(|option| ProposalOption {
                            id: option.id,
                            label: option.label,
                        })
                        .collect(),
                    binary: self.binary,
                }
            }
        };
        Ok((participant_id, spec))
    }
}

/// Payload used to judge the lock holder's answer.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ValidateRequest {
    /// Identity of the requesting participant; must be the room controller.
    pub participant_id: Uuid,
    /// Whether the answer was correct.
    pub correct: bool,
}

/// Payload for a buzz emitted over REST.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BuzzRequest {
    /// Identity of the acting participant.
    pub participant_id: Uuid,
}

/// Payload for a vote cast over REST.
#[derive(Debug, Deserialize, ToSchema)]
pub struct VoteRequest {
    /// Identity of the voting participant.
    pub participant_id: Uuid,
    /// Chosen option id.
    pub choice: String,
}

/// Generic acknowledgement for turn-control operations.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    /// Human-readable confirmation.
    pub message: String,
}

/// Verdict returned by a validation or skip.
#[derive(Debug, Serialize, ToSchema)]
pub struct OutcomeResponse {
    /// The closed-set verdict.
    #[schema(value_type = Object)]
    pub outcome: Outcome,
}
