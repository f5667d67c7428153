//! Records persisted in the shared tree for one room. Every struct here
//! round-trips through the store as JSON; decoding is lenient so that a
//! malformed write from a misbehaving client is skipped instead of wedging a
//! resolver.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{StorePath, StoreValue};

/// Roster of participants in join order.
pub type Roster = IndexMap<Uuid, Participant>;

/// Room-level metadata written once at creation and on close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMeta {
    /// Identity of the participant currently authorized to drive the room.
    pub host_uid: Uuid,
    /// Creation instant on the store clock (milliseconds).
    pub created_at: i64,
    /// Set when the controller tears the room down.
    #[serde(default)]
    pub closed: bool,
}

/// What a participant is allowed to do in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Drives phase transitions, arbitration, and tallies.
    Controller,
    /// Competes in races and votes.
    Actor,
    /// Observes only.
    Spectator,
}

/// One connected identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable identity, also the key under `participants/`.
    pub id: Uuid,
    /// Name shown to other participants.
    pub display_name: String,
    /// Permission role.
    pub role: Role,
    /// Accumulated score.
    #[serde(default)]
    pub score: i64,
    /// Store-clock instant until which the participant may not act, set
    /// after a rejected answer.
    #[serde(default)]
    pub penalized_until: Option<i64>,
    /// Whether the participant currently holds a live connection.
    #[serde(default = "default_true")]
    pub connected: bool,
}

fn default_true() -> bool {
    true
}

/// Which machine resolves the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// First-action-wins arbitration (buzz, guess).
    Race,
    /// Consensus vote over a proposal.
    Vote,
}

/// Scoring tier selected when the turn opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Standard decay curve.
    #[default]
    Normal,
    /// Steeper curve with a higher starting value.
    Hard,
}

/// The unit the arbitration machine operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Zero-based turn counter within the room.
    pub index: u32,
    /// Resolution machine for this turn.
    pub kind: TurnKind,
    /// Scoring tier.
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Store-clock instant at which the current open window started, or
    /// `None` before the turn is revealed.
    #[serde(default)]
    pub revealed_at: Option<i64>,
    /// Open-window time consumed before `revealed_at`, so pauses never lose
    /// or double-count time.
    #[serde(default)]
    pub elapsed_acc: u64,
    /// Winner of the race arbitration, cleared by resolution actions.
    #[serde(default)]
    pub lock_holder: Option<Uuid>,
    /// Store-clock instant bracketing a freeze, if currently paused.
    #[serde(default)]
    pub paused_at: Option<i64>,
    /// Store-clock instant at which the lock was claimed.
    #[serde(default)]
    pub locked_at: Option<i64>,
    /// Whole seconds remaining, persisted by the controller so a rejoining
    /// observer recovers the countdown without waiting for a tick.
    #[serde(default)]
    pub seconds_left: Option<u32>,
}

impl Turn {
    /// Fresh unrevealed turn.
    pub fn new(index: u32, kind: TurnKind, difficulty: Difficulty) -> Self {
        Self {
            index,
            kind,
            difficulty,
            revealed_at: None,
            elapsed_acc: 0,
            lock_holder: None,
            paused_at: None,
            locked_at: None,
            seconds_left: None,
        }
    }
}

/// Ephemeral fact recording one actor's attempt to win a turn. Keyed by
/// actor id under `race/`, so a duplicate attempt overwrites instead of
/// duplicating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceEvent {
    /// Who acted.
    pub actor_id: Uuid,
    /// Local-clock instant of the action (milliseconds).
    pub local_ts: i64,
    /// The actor's estimated local-minus-server clock offset at emission.
    pub offset_ms: i64,
}

/// One candidate in a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalOption {
    /// Stable identifier voters reference.
    pub id: String,
    /// Text shown to voters.
    pub label: String,
}

/// The thing being voted on during a consensus turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Identifier regenerated each time a new proposal opens.
    pub id: Uuid,
    /// Candidates, in presentation order.
    pub options: Vec<ProposalOption>,
    /// Binary proposals resolve by strict majority on the first option.
    #[serde(default)]
    pub binary: bool,
    /// Consumed exactly once when the tally produces an outcome.
    #[serde(default)]
    pub resolved: bool,
}

/// Decode a store value into a typed record, dropping malformed payloads.
pub fn decode<T: DeserializeOwned>(value: Option<&StoreValue>) -> Option<T> {
    value.and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Decode a keyed collection (`race/`, `votes/`, `participants/`), skipping
/// entries that fail to parse.
pub fn decode_map<T: DeserializeOwned>(value: Option<&StoreValue>) -> IndexMap<Uuid, T> {
    let Some(Value::Object(map)) = value else {
        return IndexMap::new();
    };
    map.iter()
        .filter_map(|(key, entry)| {
            let uid = key.parse().ok()?;
            let parsed = serde_json::from_value(entry.clone()).ok()?;
            Some((uid, parsed))
        })
        .collect()
}

/// Store locations for one room's records.
#[derive(Debug, Clone)]
pub struct RoomPaths {
    root: StorePath,
}

impl RoomPaths {
    /// Paths for the room identified by `code`.
    pub fn new(code: &str) -> Self {
        Self {
            root: StorePath::parse("rooms").child(code),
        }
    }

    /// Root of the room subtree.
    pub fn root(&self) -> StorePath {
        self.root.clone()
    }

    /// Room metadata record.
    pub fn meta(&self) -> StorePath {
        self.root.child("meta")
    }

    /// Phase record.
    pub fn phase(&self) -> StorePath {
        self.root.child("phase")
    }

    /// Current turn record.
    pub fn turn(&self) -> StorePath {
        self.root.child("turn")
    }

    /// Race-event collection.
    pub fn race(&self) -> StorePath {
        self.root.child("race")
    }

    /// One actor's race event.
    pub fn race_event(&self, actor_id: Uuid) -> StorePath {
        self.race().child(actor_id)
    }

    /// Participant roster.
    pub fn participants(&self) -> StorePath {
        self.root.child("participants")
    }

    /// One participant record.
    pub fn participant(&self, id: Uuid) -> StorePath {
        self.participants().child(id)
    }

    /// Current proposal record.
    pub fn proposal(&self) -> StorePath {
        self.root.child("proposal")
    }

    /// Vote collection for the current proposal.
    pub fn votes(&self) -> StorePath {
        self.root.child("votes")
    }

    /// One voter's choice.
    pub fn vote(&self, voter_id: Uuid) -> StorePath {
        self.votes().child(voter_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn turn_round_trips_through_json() {
        let turn = Turn {
            revealed_at: Some(1_000),
            elapsed_acc: 250,
            lock_holder: Some(Uuid::new_v4()),
            ..Turn::new(3, TurnKind::Race, Difficulty::Hard)
        };
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(decode::<Turn>(Some(&value)), Some(turn));
    }

    #[test]
    fn decode_map_skips_malformed_entries() {
        let uid = Uuid::new_v4();
        let value = json!({
            uid.to_string(): { "actor_id": uid, "local_ts": 5, "offset_ms": -2 },
            "not-a-uuid": { "actor_id": uid, "local_ts": 5, "offset_ms": 0 },
            Uuid::new_v4().to_string(): { "local_ts": "bogus" },
        });
        let events = decode_map::<RaceEvent>(Some(&value));
        assert_eq!(events.len(), 1);
        assert_eq!(events[&uid].local_ts, 5);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let value = json!({
            "id": Uuid::new_v4(),
            "display_name": "Ada",
            "role": "actor",
        });
        let participant = decode::<Participant>(Some(&value)).unwrap();
        assert_eq!(participant.score, 0);
        assert!(participant.connected);
        assert_eq!(participant.penalized_until, None);
    }
}
