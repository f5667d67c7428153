//! Room phase state machine.
//!
//! The transition table is pure; applications go through a store transaction
//! that re-reads the current phase and silently no-ops when the state has
//! already moved on. That guard is what keeps transitions idempotent under
//! duplicate push delivery and under two controller instances briefly
//! overlapping during an authority handoff.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::engine::records::{RoomPaths, decode};
use crate::store::{SharedStore, StoreResult, TransactionUpdate};

/// High-level phases a room can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    /// Participants are gathering; nothing is running.
    Lobby,
    /// The controller is configuring the first turn.
    Setup,
    /// A turn exists but its resolution window has not started.
    TurnOpen,
    /// Race arbitration is live: actors may emit race events.
    Racing,
    /// Consensus voting is live: eligible voters may cast votes.
    Voting,
    /// The turn produced an outcome; awaiting the next turn or the end.
    Resolved,
    /// Terminal: consumers move to their results view.
    Ended,
}

impl fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Lobby => "lobby",
            Self::Setup => "setup",
            Self::TurnOpen => "turn_open",
            Self::Racing => "racing",
            Self::Voting => "voting",
            Self::Resolved => "resolved",
            Self::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// Events that can be applied to the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// The controller finished lobby setup.
    Configure,
    /// Open the next turn (advancing the index).
    OpenTurn,
    /// Re-open the current turn without advancing (the one allowed cycle).
    RepeatTurn,
    /// Start race arbitration for the open turn.
    BeginRace,
    /// Start consensus voting for the open turn.
    BeginVote,
    /// The turn produced an outcome.
    Resolve,
    /// Finish the room after a resolved turn.
    End,
    /// Abort back to the lobby; observers drop any mid-round view.
    Abort,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from}")]
pub struct InvalidTransition {
    /// The phase the machine was in when the invalid event was received.
    pub from: RoomPhase,
    /// The event that cannot be applied from this phase.
    pub event: PhaseEvent,
}

/// Stored phase record: the phase plus a version that increments with every
/// applied transition, letting observers deduplicate re-deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Current phase.
    pub phase: RoomPhase,
    /// Number of transitions applied so far.
    pub version: u64,
}

impl Default for PhaseRecord {
    fn default() -> Self {
        Self {
            phase: RoomPhase::Lobby,
            version: 0,
        }
    }
}

/// Compute the phase reached by applying `event` from `from`.
pub fn compute_transition(
    from: RoomPhase,
    event: PhaseEvent,
) -> Result<RoomPhase, InvalidTransition> {
    use PhaseEvent as E;
    use RoomPhase as P;

    let next = match (from, event) {
        (P::Lobby, E::Configure) => P::Setup,
        (P::Setup, E::OpenTurn) => P::TurnOpen,
        (P::Resolved, E::OpenTurn) => P::TurnOpen,
        (P::Resolved, E::RepeatTurn) => P::TurnOpen,
        (P::TurnOpen, E::BeginRace) => P::Racing,
        (P::TurnOpen, E::BeginVote) => P::Voting,
        (P::Racing, E::Resolve) => P::Resolved,
        (P::Voting, E::Resolve) => P::Resolved,
        (P::Resolved, E::End) => P::Ended,
        (from, E::Abort) if from != P::Ended => P::Lobby,
        (from, event) => return Err(InvalidTransition { from, event }),
    };

    Ok(next)
}

/// Result of pushing a transition through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseApplied {
    /// The transition committed; the record now holds the new phase.
    Applied(PhaseRecord),
    /// The stored phase no longer admits this event (duplicate delivery or a
    /// concurrent controller got there first). Not an error.
    Stale(PhaseRecord),
}

impl PhaseApplied {
    /// The stored record after the attempt, whichever way it went.
    pub fn record(&self) -> PhaseRecord {
        match self {
            Self::Applied(record) | Self::Stale(record) => *record,
        }
    }
}

/// Apply `event` to the stored phase record via a guarded transaction.
pub async fn apply_phase_event(
    store: &Arc<dyn SharedStore>,
    paths: &RoomPaths,
    event: PhaseEvent,
) -> StoreResult<PhaseApplied> {
    let outcome = store
        .transact(
            &paths.phase(),
            Box::new(move |current| {
                let record: PhaseRecord = decode(current).unwrap_or_default();
                match compute_transition(record.phase, event) {
                    Ok(next) => {
                        let updated = PhaseRecord {
                            phase: next,
                            version: record.version + 1,
                        };
                        match serde_json::to_value(updated) {
                            Ok(value) => TransactionUpdate::Set(value),
                            Err(_) => TransactionUpdate::Keep,
                        }
                    }
                    Err(_) => TransactionUpdate::Keep,
                }
            }),
        )
        .await?;

    let record: PhaseRecord = decode(outcome.value.as_ref()).unwrap_or_default();
    if outcome.committed {
        Ok(PhaseApplied::Applied(record))
    } else {
        debug!(event = ?event, phase = %record.phase, "stale phase event ignored");
        Ok(PhaseApplied::Stale(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn happy_path_through_a_race_turn() {
        let mut phase = RoomPhase::Lobby;
        for event in [
            PhaseEvent::Configure,
            PhaseEvent::OpenTurn,
            PhaseEvent::BeginRace,
            PhaseEvent::Resolve,
            PhaseEvent::OpenTurn,
            PhaseEvent::BeginVote,
            PhaseEvent::Resolve,
            PhaseEvent::End,
        ] {
            phase = compute_transition(phase, event).unwrap();
        }
        assert_eq!(phase, RoomPhase::Ended);
    }

    #[test]
    fn repeat_turn_is_the_only_cycle_back_into_a_turn() {
        let phase = compute_transition(RoomPhase::Resolved, PhaseEvent::RepeatTurn).unwrap();
        assert_eq!(phase, RoomPhase::TurnOpen);

        let err = compute_transition(RoomPhase::Racing, PhaseEvent::OpenTurn).unwrap_err();
        assert_eq!(err.from, RoomPhase::Racing);
    }

    #[test]
    fn abort_returns_to_lobby_from_everywhere_but_ended() {
        for from in [
            RoomPhase::Lobby,
            RoomPhase::Setup,
            RoomPhase::TurnOpen,
            RoomPhase::Racing,
            RoomPhase::Voting,
            RoomPhase::Resolved,
        ] {
            assert_eq!(
                compute_transition(from, PhaseEvent::Abort).unwrap(),
                RoomPhase::Lobby
            );
        }
        assert!(compute_transition(RoomPhase::Ended, PhaseEvent::Abort).is_err());
    }

    #[test]
    fn end_requires_a_resolved_turn() {
        assert!(compute_transition(RoomPhase::Racing, PhaseEvent::End).is_err());
        assert!(compute_transition(RoomPhase::Lobby, PhaseEvent::End).is_err());
        assert_eq!(
            compute_transition(RoomPhase::Resolved, PhaseEvent::End).unwrap(),
            RoomPhase::Ended
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let paths = RoomPaths::new("ABCD");

        let first = apply_phase_event(&store, &paths, PhaseEvent::Configure)
            .await
            .unwrap();
        assert_eq!(
            first,
            PhaseApplied::Applied(PhaseRecord {
                phase: RoomPhase::Setup,
                version: 1,
            })
        );

        // Same handler firing again: no write, same end state.
        let second = apply_phase_event(&store, &paths, PhaseEvent::Configure)
            .await
            .unwrap();
        assert_eq!(
            second,
            PhaseApplied::Stale(PhaseRecord {
                phase: RoomPhase::Setup,
                version: 1,
            })
        );

        let stored: PhaseRecord =
            decode(store.read(&paths.phase()).await.unwrap().as_ref()).unwrap();
        assert_eq!(stored.version, 1);
    }
}
