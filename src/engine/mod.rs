//! The turn arbitration engine.
//!
//! One [`Engine`] instance is constructed per room-session from an explicit
//! [`EngineContext`] and torn down when the room closes. It observes the
//! room subtree of the shared store, fans observer callbacks out over a
//! broadcast channel, and — when its identity matches the room's controller
//! — drives the race window, the vote tally, and the synchronized timer.
//! All cross-instance coordination goes through store transactions, so two
//! overlapping controller instances (an authority handoff mid-turn) stay
//! consistent without any in-process locking.

pub mod arbiter;
pub mod phase;
pub mod race;
pub mod records;
pub mod timer;
pub mod vote;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{ClockHandle, local_now_ms};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::store::{SharedStore, StoreValue, TransactionUpdate, server_timestamp};

use self::phase::{PhaseApplied, PhaseEvent, PhaseRecord, RoomPhase, apply_phase_event};
use self::race::{RaceWindow, WindowAction};
use self::records::{
    Difficulty, Participant, Proposal, ProposalOption, RaceEvent, RoomMeta, RoomPaths, Roster,
    Turn, TurnKind, decode, decode_map,
};

/// Final word on a turn, always one of a closed set of verdicts — observers
/// never see a raw error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The lock holder answered correctly and was awarded points.
    Correct {
        /// The winning actor.
        actor: Uuid,
        /// Points awarded from the decay curve at the freeze instant.
        points: i64,
    },
    /// The lock holder answered incorrectly; the turn continues.
    Incorrect {
        /// The penalized actor.
        actor: Uuid,
    },
    /// The open-window budget ran out with no lock held.
    Timeout,
    /// The vote produced a single option.
    VoteDecided {
        /// The winning option id.
        option: String,
        /// Whether a randomized tiebreak selected it.
        tiebreak: bool,
    },
    /// The controller skipped the turn.
    Skipped,
}

/// Observer callbacks pushed to every engine subscriber.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The room phase advanced.
    PhaseChanged {
        /// New phase.
        phase: RoomPhase,
        /// Transition counter, for deduplicating re-deliveries.
        version: u64,
    },
    /// The turn lock changed hands (or was cleared).
    LockChanged {
        /// New lock holder, if any.
        holder: Option<Uuid>,
    },
    /// Periodic recompute of the synchronized timer.
    TimerTick {
        /// Milliseconds left of the turn budget.
        remaining_ms: u64,
        /// Whole seconds left, rounded up.
        seconds_left: u32,
        /// Points currently at stake.
        points_available: i64,
    },
    /// A tied tally entered the tiebreak sub-phase.
    TiebreakStarted {
        /// Option ids tied for the maximum.
        tied: Vec<String>,
    },
    /// The turn reached a verdict.
    Resolution(Outcome),
    /// The participant roster changed.
    RosterChanged {
        /// Current roster in join order.
        roster: Roster,
    },
}

/// What kind of turn to open and with which payload.
#[derive(Debug, Clone)]
pub enum TurnSpec {
    /// A race-arbitrated turn.
    Race {
        /// Scoring tier.
        difficulty: Difficulty,
    },
    /// A consensus-vote turn over the given options.
    Vote {
        /// Candidates, in presentation order.
        options: Vec<ProposalOption>,
        /// Resolve by strict majority on the first option.
        binary: bool,
    },
}

/// Everything an engine needs, constructed once per room-session.
pub struct EngineContext {
    /// Handle to the shared store.
    pub store: Arc<dyn SharedStore>,
    /// Runtime configuration.
    pub config: Arc<EngineConfig>,
    /// Clock-offset estimates for this client.
    pub clock: ClockHandle,
    /// Code of the room this engine is bound to.
    pub room: String,
    /// Identity this engine acts as.
    pub uid: Uuid,
}

/// Cloneable bundle shared between the engine facade and its driver tasks.
#[derive(Clone)]
struct Shared {
    store: Arc<dyn SharedStore>,
    config: Arc<EngineConfig>,
    clock: ClockHandle,
    uid: Uuid,
    paths: RoomPaths,
    events: broadcast::Sender<EngineEvent>,
    meta_rx: watch::Receiver<Option<RoomMeta>>,
    phase_rx: watch::Receiver<PhaseRecord>,
    turn_rx: watch::Receiver<Option<Turn>>,
    roster_rx: watch::Receiver<Roster>,
}

impl Shared {
    /// Whether this engine's identity currently holds room authority. The
    /// answer can change between turns when the controller role rotates.
    fn is_controller(&self) -> bool {
        self.meta_rx
            .borrow()
            .as_ref()
            .is_some_and(|meta| meta.host_uid == self.uid)
    }

    /// Authoritative phase guard: a fresh read, not the local watch cache,
    /// so a driver acting on a just-pushed fact can never be misled by its
    /// own stale view of the phase.
    async fn read_phase(&self) -> RoomPhase {
        match self.store.read(&self.paths.phase()).await {
            Ok(value) => decode::<PhaseRecord>(value.as_ref())
                .unwrap_or_default()
                .phase,
            Err(err) => {
                warn!(room = %self.paths.root(), error = %err, "phase guard read failed");
                self.phase_rx.borrow().phase
            }
        }
    }
}

/// Per-room arbitration engine. Dropping it (or calling [`Engine::close`])
/// stops every driver task.
pub struct Engine {
    shared: Shared,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Subscribe to the room subtree and start the driver tasks.
    pub fn spawn(ctx: EngineContext) -> Self {
        let paths = RoomPaths::new(&ctx.room);
        let (events, _) = broadcast::channel(ctx.config.event_capacity);
        let (meta_tx, meta_rx) = watch::channel(None);
        let (phase_tx, phase_rx) = watch::channel(PhaseRecord::default());
        let (turn_tx, turn_rx) = watch::channel(None);
        let (roster_tx, roster_rx) = watch::channel(Roster::new());

        let shared = Shared {
            store: ctx.store,
            config: ctx.config,
            clock: ctx.clock,
            uid: ctx.uid,
            paths,
            events,
            meta_rx,
            phase_rx,
            turn_rx,
            roster_rx,
        };

        let tasks = vec![
            tokio::spawn(forward_meta(shared.clone(), meta_tx)),
            tokio::spawn(forward_phase(shared.clone(), phase_tx)),
            tokio::spawn(forward_turn(shared.clone(), turn_tx)),
            tokio::spawn(forward_roster(shared.clone(), roster_tx)),
            tokio::spawn(drive_race(shared.clone())),
            tokio::spawn(drive_votes(shared.clone())),
            tokio::spawn(drive_timer(shared.clone())),
        ];

        Self {
            shared,
            tasks: StdMutex::new(tasks),
        }
    }

    /// Register an observer for phase/lock/timer/resolution callbacks.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Latest observed phase record.
    pub fn current_phase(&self) -> PhaseRecord {
        *self.shared.phase_rx.borrow()
    }

    /// Latest observed turn record, if a turn exists.
    pub fn current_turn(&self) -> Option<Turn> {
        self.shared.turn_rx.borrow().clone()
    }

    /// Latest observed roster, in join order.
    pub fn roster(&self) -> Roster {
        self.shared.roster_rx.borrow().clone()
    }

    /// Identity this engine acts as.
    pub fn uid(&self) -> Uuid {
        self.shared.uid
    }

    /// Stop every driver task. Idempotent.
    pub fn close(&self) {
        let mut tasks = self.tasks.lock().expect("engine task lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    // -----------------------------------------------------------------
    // Actor operations
    // -----------------------------------------------------------------

    /// Record `actor`'s attempt to win the current racing turn.
    ///
    /// The event lands in the race collection keyed by actor id, so emitting
    /// twice overwrites instead of duplicating; the controller's collection
    /// window decides the winner.
    pub async fn emit_action(&self, actor: Uuid) -> Result<(), EngineError> {
        self.ensure_open().await?;
        self.ensure_phase(RoomPhase::Racing, "racing").await?;

        let turn = self.read_turn().await?.ok_or(EngineError::MissingTurn)?;
        if turn.lock_holder.is_some() {
            return Err(EngineError::LockHeld);
        }

        let participant = self.read_participant(actor).await?;
        let now = self.shared.clock.server_now_ms();
        if let Some(until) = participant.penalized_until
            && until > now
        {
            return Err(EngineError::Penalized { actor, until });
        }

        let event = RaceEvent {
            actor_id: actor,
            local_ts: local_now_ms(),
            offset_ms: self.shared.clock.offset_ms(),
        };
        self.shared
            .store
            .put(&self.shared.paths.race_event(actor), encode(&event))
            .await?;
        Ok(())
    }

    /// Record `voter`'s choice for the current proposal.
    pub async fn cast_vote(&self, voter: Uuid, choice: &str) -> Result<(), EngineError> {
        self.ensure_open().await?;
        self.ensure_phase(RoomPhase::Voting, "voting").await?;
        self.read_participant(voter).await?;

        let proposal: Proposal = decode(
            self.shared
                .store
                .read(&self.shared.paths.proposal())
                .await?
                .as_ref(),
        )
        .ok_or(EngineError::MissingProposal)?;
        if proposal.resolved {
            // The tally already produced an outcome; a late vote is a no-op.
            return Ok(());
        }
        if !proposal.options.iter().any(|option| option.id == choice) {
            return Err(EngineError::UnknownOption(choice.to_string()));
        }

        self.shared
            .store
            .put(
                &self.shared.paths.vote(voter),
                StoreValue::String(choice.to_string()),
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Controller operations
    // -----------------------------------------------------------------

    /// Open the next turn and start its resolution sub-phase.
    pub async fn open_turn(&self, spec: TurnSpec) -> Result<Turn, EngineError> {
        self.ensure_controller().await?;
        let next_index = match self.read_turn().await? {
            Some(turn) => turn.index + 1,
            None => 0,
        };
        self.open_turn_at(next_index, spec, PhaseEvent::OpenTurn).await
    }

    /// Re-open the current turn without advancing the index (the one
    /// allowed cycle in the phase graph).
    pub async fn repeat_turn(&self, spec: TurnSpec) -> Result<Turn, EngineError> {
        self.ensure_controller().await?;
        let index = self.read_turn().await?.map(|turn| turn.index).unwrap_or(0);
        self.open_turn_at(index, spec, PhaseEvent::RepeatTurn).await
    }

    async fn open_turn_at(
        &self,
        index: u32,
        spec: TurnSpec,
        event: PhaseEvent,
    ) -> Result<Turn, EngineError> {
        let store = &self.shared.store;
        let paths = &self.shared.paths;

        match apply_phase_event(store, paths, event).await? {
            PhaseApplied::Applied(_) => {}
            PhaseApplied::Stale(record) => {
                return Err(EngineError::InvalidPhase {
                    expected: "setup or resolved",
                    actual: record.phase,
                });
            }
        }

        // Reset every per-turn collection before the window opens.
        store.remove(&paths.race()).await?;
        store.remove(&paths.votes()).await?;

        let (kind, difficulty, begin) = match spec {
            TurnSpec::Race { difficulty } => {
                store.remove(&paths.proposal()).await?;
                (TurnKind::Race, difficulty, PhaseEvent::BeginRace)
            }
            TurnSpec::Vote { options, binary } => {
                let proposal = Proposal {
                    id: Uuid::new_v4(),
                    options,
                    binary,
                    resolved: false,
                };
                store.put(&paths.proposal(), encode(&proposal)).await?;
                (TurnKind::Vote, Difficulty::Normal, PhaseEvent::BeginVote)
            }
        };

        let mut value = encode(&Turn::new(index, kind, difficulty));
        value["revealed_at"] = server_timestamp();
        let outcome = store
            .transact(&paths.turn(), Box::new(move |_| TransactionUpdate::Set(value.clone())))
            .await?;

        apply_phase_event(store, paths, begin).await?;

        decode(outcome.value.as_ref()).ok_or(EngineError::MissingTurn)
    }

    /// Freeze the turn timer.
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.ensure_controller().await?;
        self.ensure_phase(RoomPhase::Racing, "racing").await?;

        self.shared
            .store
            .transact(
                &self.shared.paths.turn(),
                Box::new(|current| {
                    let Some(turn) = decode::<Turn>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    if turn.revealed_at.is_none() || turn.paused_at.is_some() {
                        return TransactionUpdate::Keep;
                    }
                    let mut value = encode(&turn);
                    value["paused_at"] = server_timestamp();
                    TransactionUpdate::Set(value)
                }),
            )
            .await?;
        Ok(())
    }

    /// Resume a paused turn: fold the consumed window into the accumulator,
    /// re-base the window start, and release any held lock.
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.ensure_controller().await?;
        self.ensure_phase(RoomPhase::Racing, "racing").await?;
        self.resume_turn_fields().await
    }

    /// Judge the lock holder's answer.
    ///
    /// A correct answer resolves the turn and awards the decayed points; an
    /// incorrect one penalizes the actor, releases the lock, and lets the
    /// turn continue.
    pub async fn validate(&self, correct: bool) -> Result<Outcome, EngineError> {
        self.ensure_controller().await?;
        self.ensure_phase(RoomPhase::Racing, "racing").await?;

        let turn = self.read_turn().await?.ok_or(EngineError::MissingTurn)?;
        let holder = turn.lock_holder.ok_or(EngineError::LockNotHeld)?;

        if correct {
            let elapsed =
                timer::elapsed_effective_ms(&turn, self.shared.clock.server_now_ms());
            let points =
                timer::points_available(self.shared.config.tier(turn.difficulty), elapsed);

            // The phase transition is the idempotency gate: only the
            // controller instance that applies it owns the award.
            match apply_phase_event(&self.shared.store, &self.shared.paths, PhaseEvent::Resolve)
                .await?
            {
                PhaseApplied::Applied(_) => {}
                PhaseApplied::Stale(_) => return Err(EngineError::AlreadyResolved),
            }

            self.adjust_score(holder, points).await?;
            self.clear_lock().await?;
            self.shared.store.remove(&self.shared.paths.race()).await?;
            let outcome = Outcome::Correct {
                actor: holder,
                points,
            };
            let _ = self.shared.events.send(EngineEvent::Resolution(outcome.clone()));
            Ok(outcome)
        } else {
            // Clearing the lock is the gate here: a duplicate rejection
            // finds it already gone and backs off without a second penalty.
            let released = self.resume_if_held(holder).await?;
            if !released {
                return Err(EngineError::AlreadyResolved);
            }

            let until = self.shared.clock.server_now_ms()
                + self.shared.config.lockout.as_millis() as i64;
            self.apply_penalty(holder, until).await?;
            let outcome = Outcome::Incorrect { actor: holder };
            let _ = self.shared.events.send(EngineEvent::Resolution(outcome.clone()));
            Ok(outcome)
        }
    }

    /// Abandon the current turn without a winner.
    pub async fn skip(&self) -> Result<Outcome, EngineError> {
        self.ensure_controller().await?;
        let phase = self.read_phase().await?.phase;
        if !matches!(phase, RoomPhase::Racing | RoomPhase::Voting) {
            return Err(EngineError::InvalidPhase {
                expected: "racing or voting",
                actual: phase,
            });
        }

        match apply_phase_event(&self.shared.store, &self.shared.paths, PhaseEvent::Resolve)
            .await?
        {
            PhaseApplied::Applied(_) => {}
            PhaseApplied::Stale(_) => return Err(EngineError::AlreadyResolved),
        }

        self.clear_lock().await?;
        self.shared.store.remove(&self.shared.paths.race()).await?;
        self.shared.store.remove(&self.shared.paths.votes()).await?;
        let _ = self
            .shared
            .events
            .send(EngineEvent::Resolution(Outcome::Skipped));
        Ok(Outcome::Skipped)
    }

    /// Move the room from the lobby into setup.
    pub async fn configure(&self) -> Result<(), EngineError> {
        self.ensure_controller().await?;
        match apply_phase_event(&self.shared.store, &self.shared.paths, PhaseEvent::Configure)
            .await?
        {
            PhaseApplied::Applied(_) => Ok(()),
            PhaseApplied::Stale(record) => Err(EngineError::InvalidPhase {
                expected: "lobby",
                actual: record.phase,
            }),
        }
    }

    /// Finish the room after a resolved turn.
    pub async fn end_room(&self) -> Result<(), EngineError> {
        self.ensure_controller().await?;
        match apply_phase_event(&self.shared.store, &self.shared.paths, PhaseEvent::End).await? {
            PhaseApplied::Applied(_) => {}
            PhaseApplied::Stale(record) => {
                return Err(EngineError::InvalidPhase {
                    expected: "resolved",
                    actual: record.phase,
                });
            }
        }
        self.mark_closed().await
    }

    /// Abort the round back to the lobby; observers drop their mid-round
    /// view when they see the phase change.
    pub async fn abort(&self) -> Result<(), EngineError> {
        self.ensure_controller().await?;
        apply_phase_event(&self.shared.store, &self.shared.paths, PhaseEvent::Abort).await?;
        let paths = &self.shared.paths;
        self.shared.store.remove(&paths.turn()).await?;
        self.shared.store.remove(&paths.race()).await?;
        self.shared.store.remove(&paths.votes()).await?;
        self.shared.store.remove(&paths.proposal()).await?;
        Ok(())
    }

    /// Stamp the room closed so observers and the reaper can let go.
    pub async fn mark_closed(&self) -> Result<(), EngineError> {
        self.shared
            .store
            .transact(
                &self.shared.paths.meta(),
                Box::new(|current| {
                    let Some(meta) = decode::<RoomMeta>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    if meta.closed {
                        return TransactionUpdate::Keep;
                    }
                    TransactionUpdate::Set(encode(&RoomMeta {
                        closed: true,
                        ..meta
                    }))
                }),
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Guards and record access
    // -----------------------------------------------------------------

    async fn ensure_open(&self) -> Result<(), EngineError> {
        let meta: Option<RoomMeta> = decode(
            self.shared
                .store
                .read(&self.shared.paths.meta())
                .await?
                .as_ref(),
        );
        match meta {
            Some(meta) if meta.closed => Err(EngineError::RoomClosed),
            Some(_) => Ok(()),
            None => Err(EngineError::RoomClosed),
        }
    }

    async fn ensure_controller(&self) -> Result<(), EngineError> {
        let meta: Option<RoomMeta> = decode(
            self.shared
                .store
                .read(&self.shared.paths.meta())
                .await?
                .as_ref(),
        );
        match meta {
            Some(meta) if meta.closed => Err(EngineError::RoomClosed),
            Some(meta) if meta.host_uid == self.shared.uid => Ok(()),
            Some(_) | None => Err(EngineError::NotController(self.shared.uid)),
        }
    }

    /// Every handler re-reads its guard from the store before writing.
    async fn ensure_phase(
        &self,
        expected: RoomPhase,
        label: &'static str,
    ) -> Result<(), EngineError> {
        let record = self.read_phase().await?;
        if record.phase == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidPhase {
                expected: label,
                actual: record.phase,
            })
        }
    }

    async fn read_phase(&self) -> Result<PhaseRecord, EngineError> {
        Ok(decode(
            self.shared
                .store
                .read(&self.shared.paths.phase())
                .await?
                .as_ref(),
        )
        .unwrap_or_default())
    }

    async fn read_turn(&self) -> Result<Option<Turn>, EngineError> {
        Ok(decode(
            self.shared
                .store
                .read(&self.shared.paths.turn())
                .await?
                .as_ref(),
        ))
    }

    async fn read_participant(&self, id: Uuid) -> Result<Participant, EngineError> {
        decode(
            self.shared
                .store
                .read(&self.shared.paths.participant(id))
                .await?
                .as_ref(),
        )
        .ok_or(EngineError::UnknownParticipant(id))
    }

    /// Re-base the turn's window start, releasing any lock. Returns whether
    /// the transaction committed.
    async fn resume_turn_fields(&self) -> Result<(), EngineError> {
        self.shared
            .store
            .transact(
                &self.shared.paths.turn(),
                Box::new(|current| {
                    let Some(turn) = decode::<Turn>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    match timer::resume_update(&turn) {
                        Some(value) => TransactionUpdate::Set(value),
                        None => TransactionUpdate::Keep,
                    }
                }),
            )
            .await?;
        Ok(())
    }

    /// Release the turn lock after a resolution, keeping the freeze in
    /// place. Once cleared, the lock stays append-only for the next race.
    async fn clear_lock(&self) -> Result<(), EngineError> {
        self.shared
            .store
            .transact(
                &self.shared.paths.turn(),
                Box::new(|current| {
                    let Some(turn) = decode::<Turn>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    if turn.lock_holder.is_none() {
                        return TransactionUpdate::Keep;
                    }
                    TransactionUpdate::Set(encode(&Turn {
                        lock_holder: None,
                        locked_at: None,
                        ..turn
                    }))
                }),
            )
            .await?;
        Ok(())
    }

    /// Resume the turn only while `holder` still owns the lock.
    async fn resume_if_held(&self, holder: Uuid) -> Result<bool, EngineError> {
        let outcome = self
            .shared
            .store
            .transact(
                &self.shared.paths.turn(),
                Box::new(move |current| {
                    let Some(turn) = decode::<Turn>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    if turn.lock_holder != Some(holder) {
                        return TransactionUpdate::Keep;
                    }
                    match timer::resume_update(&turn) {
                        Some(value) => TransactionUpdate::Set(value),
                        None => TransactionUpdate::Keep,
                    }
                }),
            )
            .await?;
        Ok(outcome.committed)
    }

    async fn adjust_score(&self, id: Uuid, delta: i64) -> Result<(), EngineError> {
        self.shared
            .store
            .transact(
                &self.shared.paths.participant(id),
                Box::new(move |current| {
                    let Some(participant) = decode::<Participant>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    TransactionUpdate::Set(encode(&Participant {
                        score: (participant.score + delta).max(0),
                        ..participant
                    }))
                }),
            )
            .await?;
        Ok(())
    }

    async fn apply_penalty(&self, id: Uuid, until: i64) -> Result<(), EngineError> {
        let penalty = self.shared.config.wrong_answer_penalty;
        self.shared
            .store
            .transact(
                &self.shared.paths.participant(id),
                Box::new(move |current| {
                    let Some(participant) = decode::<Participant>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    TransactionUpdate::Set(encode(&Participant {
                        score: (participant.score - penalty).max(0),
                        penalized_until: Some(until),
                        ..participant
                    }))
                }),
            )
            .await?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serialize a record that cannot fail to serialize.
fn encode<T: Serialize>(value: &T) -> StoreValue {
    serde_json::to_value(value).expect("record serialization cannot fail")
}

// ---------------------------------------------------------------------
// Forwarder tasks: store subtrees into watch channels plus callbacks
// ---------------------------------------------------------------------

async fn forward_meta(shared: Shared, tx: watch::Sender<Option<RoomMeta>>) {
    let mut stream = shared.store.subscribe(&shared.paths.meta());
    while let Some(value) = stream.next().await {
        if tx.send(decode(value.as_ref())).is_err() {
            break;
        }
    }
}

async fn forward_phase(shared: Shared, tx: watch::Sender<PhaseRecord>) {
    let mut stream = shared.store.subscribe(&shared.paths.phase());
    let mut last_version = None;
    while let Some(value) = stream.next().await {
        let record: PhaseRecord = decode(value.as_ref()).unwrap_or_default();
        if tx.send(record).is_err() {
            break;
        }
        if last_version != Some(record.version) {
            last_version = Some(record.version);
            let _ = shared.events.send(EngineEvent::PhaseChanged {
                phase: record.phase,
                version: record.version,
            });
        }
    }
}

async fn forward_turn(shared: Shared, tx: watch::Sender<Option<Turn>>) {
    let mut stream = shared.store.subscribe(&shared.paths.turn());
    let mut last_holder: Option<Uuid> = None;
    while let Some(value) = stream.next().await {
        let turn: Option<Turn> = decode(value.as_ref());
        let holder = turn.as_ref().and_then(|turn| turn.lock_holder);
        if tx.send(turn).is_err() {
            break;
        }
        if holder != last_holder {
            last_holder = holder;
            let _ = shared.events.send(EngineEvent::LockChanged { holder });
        }
    }
}

async fn forward_roster(shared: Shared, tx: watch::Sender<Roster>) {
    let mut stream = shared.store.subscribe(&shared.paths.participants());
    let mut last: Option<Roster> = None;
    while let Some(value) = stream.next().await {
        let roster: Roster = decode_map::<Participant>(value.as_ref());
        if tx.send(roster.clone()).is_err() {
            break;
        }
        if last.as_ref() != Some(&roster) {
            last = Some(roster.clone());
            let _ = shared.events.send(EngineEvent::RosterChanged { roster });
        }
    }
}

// ---------------------------------------------------------------------
// Controller drivers
// ---------------------------------------------------------------------

/// Far-enough deadline used to keep the disabled select branch harmless.
fn idle_deadline() -> Instant {
    Instant::now() + Duration::from_secs(3_600)
}

async fn drive_race(shared: Shared) {
    let mut stream = shared.store.subscribe(&shared.paths.race());
    let mut phase_rx = shared.phase_rx.clone();
    let mut window = RaceWindow::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            maybe = stream.next() => {
                let Some(value) = maybe else { break };
                let observed = decode_map::<RaceEvent>(value.as_ref());
                if observed.is_empty() {
                    if value.is_none() {
                        // Collection cleared: the pending race was resolved
                        // or cancelled elsewhere.
                        window.cancel();
                        deadline = None;
                    }
                    continue;
                }
                if !shared.is_controller() || shared.read_phase().await != RoomPhase::Racing {
                    continue;
                }
                if window.observe(observed.into_values()) == WindowAction::Opened {
                    deadline = Some(Instant::now() + shared.config.race_window);
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(idle_deadline)), if deadline.is_some() => {
                deadline = None;
                let batch = window.begin_resolution();
                // The state may have moved on while the window was pending.
                if shared.is_controller() && shared.read_phase().await == RoomPhase::Racing {
                    if let Err(err) = arbiter::resolve(&shared.store, &shared.paths, &batch).await {
                        warn!(room = %shared.paths.root(), error = %err, "race resolution failed");
                    }
                } else {
                    debug!(room = %shared.paths.root(), "race window fired after state moved on");
                }
                if window.finish_resolution() {
                    deadline = Some(Instant::now() + shared.config.race_window);
                }
            }
            changed = phase_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if phase_rx.borrow().phase != RoomPhase::Racing {
                    window.cancel();
                    deadline = None;
                }
            }
        }
    }
}

async fn drive_votes(shared: Shared) {
    let mut stream = shared.store.subscribe(&shared.paths.votes());
    while let Some(value) = stream.next().await {
        if !shared.is_controller() || shared.read_phase().await != RoomPhase::Voting {
            continue;
        }

        let votes = decode_map::<String>(value.as_ref());
        let roster: Roster = match shared.store.read(&shared.paths.participants()).await {
            Ok(value) => decode_map::<Participant>(value.as_ref()),
            Err(err) => {
                warn!(room = %shared.paths.root(), error = %err, "failed to read roster");
                continue;
            }
        };
        let eligible = vote::eligible_voters(&roster);

        let proposal: Option<Proposal> = match shared.store.read(&shared.paths.proposal()).await {
            Ok(value) => decode(value.as_ref()),
            Err(err) => {
                warn!(room = %shared.paths.root(), error = %err, "failed to read proposal");
                continue;
            }
        };
        let Some(proposal) = proposal else { continue };
        if proposal.resolved {
            continue;
        }

        match vote::tally(&proposal, &votes, &eligible) {
            vote::TallyOutcome::Pending => {}
            vote::TallyOutcome::Winner(option) => {
                if consume_and_log(&shared).await {
                    resolve_vote(&shared, option, false).await;
                }
            }
            vote::TallyOutcome::Tie(tied) => {
                if consume_and_log(&shared).await {
                    let _ = shared
                        .events
                        .send(EngineEvent::TiebreakStarted { tied: tied.clone() });
                    sleep(shared.config.tiebreak_delay).await;
                    if let Some(pick) = vote::pick_tiebreak(&tied) {
                        resolve_vote(&shared, pick, true).await;
                    }
                }
            }
        }
    }
}

/// Consume the proposal's tally flag, logging store failures as a lost
/// attempt rather than an error.
async fn consume_and_log(shared: &Shared) -> bool {
    match vote::consume_tally(&shared.store, &shared.paths.proposal()).await {
        Ok(consumed) => {
            if !consumed {
                debug!(room = %shared.paths.root(), "tally already consumed");
            }
            consumed
        }
        Err(err) => {
            warn!(room = %shared.paths.root(), error = %err, "tally consumption failed");
            false
        }
    }
}

async fn resolve_vote(shared: &Shared, option: String, tiebreak: bool) {
    match apply_phase_event(&shared.store, &shared.paths, PhaseEvent::Resolve).await {
        Ok(PhaseApplied::Applied(_)) => {
            if let Err(err) = shared.store.remove(&shared.paths.votes()).await {
                warn!(room = %shared.paths.root(), error = %err, "failed to clear votes");
            }
            let _ = shared
                .events
                .send(EngineEvent::Resolution(Outcome::VoteDecided { option, tiebreak }));
        }
        Ok(PhaseApplied::Stale(_)) => {
            debug!(room = %shared.paths.root(), "vote resolution superseded");
        }
        Err(err) => {
            warn!(room = %shared.paths.root(), error = %err, "vote resolution failed");
        }
    }
}

async fn drive_timer(shared: Shared) {
    let mut ticker = interval(shared.config.timer_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut expired_for: Option<u32> = None;
    let duration_ms = shared.config.turn_duration.as_millis() as u64;

    loop {
        ticker.tick().await;
        // The watch cache is fine here: a stale view only delays the tick by
        // one interval, and the resolve transition gates the expiry anyway.
        if shared.phase_rx.borrow().phase != RoomPhase::Racing {
            // Leaving the racing phase re-arms expiry for a repeated turn.
            expired_for = None;
            continue;
        }
        let Some(turn) = shared.turn_rx.borrow().clone() else {
            continue;
        };
        if turn.revealed_at.is_none() {
            continue;
        }

        let now = shared.clock.server_now_ms();
        let tier = shared.config.tier(turn.difficulty);
        let elapsed = timer::elapsed_effective_ms(&turn, now);
        let remaining = duration_ms.saturating_sub(elapsed);
        let seconds = remaining.div_ceil(1_000) as u32;

        let _ = shared.events.send(EngineEvent::TimerTick {
            remaining_ms: remaining,
            seconds_left: seconds,
            points_available: timer::points_available(tier, elapsed),
        });

        if !shared.is_controller() {
            continue;
        }

        if turn.seconds_left != Some(seconds) {
            persist_seconds(&shared, turn.index, seconds).await;
        }

        // Expiry is terminal for the turn and fires exactly once; a held
        // lock freezes the clock, so no expiry can race a validation.
        if elapsed >= duration_ms
            && turn.lock_holder.is_none()
            && expired_for != Some(turn.index)
        {
            expired_for = Some(turn.index);
            match apply_phase_event(&shared.store, &shared.paths, PhaseEvent::Resolve).await {
                Ok(PhaseApplied::Applied(_)) => {
                    if let Err(err) = shared.store.remove(&shared.paths.race()).await {
                        warn!(room = %shared.paths.root(), error = %err, "failed to clear race events");
                    }
                    let _ = shared
                        .events
                        .send(EngineEvent::Resolution(Outcome::Timeout));
                }
                Ok(PhaseApplied::Stale(_)) => {
                    debug!(room = %shared.paths.root(), "expiry superseded by another resolution");
                }
                Err(err) => {
                    warn!(room = %shared.paths.root(), error = %err, "expiry resolution failed");
                }
            }
        }
    }
}

/// Persist the integer seconds remaining so a rejoining observer recovers
/// the countdown without waiting for the next tick.
async fn persist_seconds(shared: &Shared, index: u32, seconds: u32) {
    let result = shared
        .store
        .transact(
            &shared.paths.turn(),
            Box::new(move |current| {
                let Some(turn) = decode::<Turn>(current) else {
                    return TransactionUpdate::Keep;
                };
                if turn.index != index || turn.seconds_left == Some(seconds) {
                    return TransactionUpdate::Keep;
                }
                TransactionUpdate::Set(encode(&Turn {
                    seconds_left: Some(seconds),
                    ..turn
                }))
            }),
        )
        .await;
    if let Err(err) = result {
        warn!(room = %shared.paths.root(), error = %err, "failed to persist seconds remaining");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::store::MemoryStore;

    const ROOM: &str = "WXYZ";

    async fn seed_room(store: &Arc<dyn SharedStore>, host: Uuid, actors: &[Uuid]) {
        let paths = RoomPaths::new(ROOM);
        store
            .put(
                &paths.meta(),
                encode(&RoomMeta {
                    host_uid: host,
                    created_at: 0,
                    closed: false,
                }),
            )
            .await
            .unwrap();
        store
            .put(&paths.phase(), encode(&PhaseRecord::default()))
            .await
            .unwrap();
        let mut all = vec![(host, records::Role::Controller)];
        all.extend(actors.iter().map(|actor| (*actor, records::Role::Actor)));
        for (uid, role) in all {
            store
                .put(
                    &paths.participant(uid),
                    encode(&Participant {
                        id: uid,
                        display_name: format!("p-{uid}"),
                        role,
                        score: 0,
                        penalized_until: None,
                        connected: true,
                    }),
                )
                .await
                .unwrap();
        }
    }

    fn engine_for(store: &Arc<dyn SharedStore>, uid: Uuid) -> Engine {
        Engine::spawn(EngineContext {
            store: Arc::clone(store),
            config: Arc::new(EngineConfig::default()),
            clock: ClockHandle::fixed(0),
            room: ROOM.to_string(),
            uid,
        })
    }

    async fn next_resolution(rx: &mut broadcast::Receiver<EngineEvent>) -> Outcome {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for resolution")
                .expect("event channel closed");
            if let EngineEvent::Resolution(outcome) = event {
                return outcome;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn race_turn_resolves_to_single_winner_and_awards_points() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        let fast = Uuid::from_u128(3);
        let slow = Uuid::from_u128(5);
        seed_room(&store, host, &[fast, slow]).await;

        let engine = engine_for(&store, host);
        let mut events = engine.subscribe_events();

        engine.configure().await.unwrap();
        engine
            .open_turn(TurnSpec::Race {
                difficulty: Difficulty::Normal,
            })
            .await
            .unwrap();

        // The slower actor's event lands first in the store, but its local
        // action instant is later: the window must rank, not first-write-win.
        let paths = RoomPaths::new(ROOM);
        let base = local_now_ms();
        store
            .put(
                &paths.race_event(slow),
                encode(&RaceEvent {
                    actor_id: slow,
                    local_ts: base + 90,
                    offset_ms: 10,
                }),
            )
            .await
            .unwrap();
        store
            .put(
                &paths.race_event(fast),
                encode(&RaceEvent {
                    actor_id: fast,
                    local_ts: base + 40,
                    offset_ms: -20,
                }),
            )
            .await
            .unwrap();

        // Wait for the lock to land.
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for lock")
                .expect("event channel closed");
            if let EngineEvent::LockChanged { holder: Some(holder) } = event {
                assert_eq!(holder, fast);
                break;
            }
        }

        let outcome = engine.validate(true).await.unwrap();
        let Outcome::Correct { actor, points } = outcome else {
            panic!("expected a correct outcome, got {outcome:?}");
        };
        assert_eq!(actor, fast);
        assert!(points > 0);

        let winner: Participant =
            decode(store.read(&paths.participant(fast)).await.unwrap().as_ref()).unwrap();
        assert_eq!(winner.score, points);

        // Double validation is a stale no-op, not a second award.
        assert!(matches!(
            engine.validate(true).await,
            Err(EngineError::InvalidPhase { .. })
        ));
        engine.close();
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_answer_penalizes_and_keeps_the_turn_running() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        let actor = Uuid::new_v4();
        seed_room(&store, host, &[actor]).await;

        let engine = engine_for(&store, host);
        let mut events = engine.subscribe_events();
        engine.configure().await.unwrap();
        engine
            .open_turn(TurnSpec::Race {
                difficulty: Difficulty::Normal,
            })
            .await
            .unwrap();

        engine.emit_action(actor).await.unwrap();
        loop {
            if let EngineEvent::LockChanged { holder: Some(_) } =
                timeout(Duration::from_secs(5), events.recv())
                    .await
                    .unwrap()
                    .unwrap()
            {
                break;
            }
        }

        let outcome = engine.validate(false).await.unwrap();
        assert_eq!(outcome, Outcome::Incorrect { actor });

        let paths = RoomPaths::new(ROOM);
        let turn: Turn = decode(store.read(&paths.turn()).await.unwrap().as_ref()).unwrap();
        assert_eq!(turn.lock_holder, None);
        assert!(turn.paused_at.is_none());

        // The penalized actor is locked out of the continuing turn.
        let err = engine.emit_action(actor).await.unwrap_err();
        assert!(matches!(err, EngineError::Penalized { .. }));
        engine.close();
    }

    #[tokio::test(start_paused = true)]
    async fn vote_turn_tallies_once_all_eligible_voted() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        let voters = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        seed_room(&store, host, &voters).await;

        let engine = engine_for(&store, host);
        let mut events = engine.subscribe_events();
        engine.configure().await.unwrap();
        engine
            .open_turn(TurnSpec::Vote {
                options: vec![
                    ProposalOption {
                        id: "rule-a".into(),
                        label: "Rule A".into(),
                    },
                    ProposalOption {
                        id: "rule-b".into(),
                        label: "Rule B".into(),
                    },
                ],
                binary: false,
            })
            .await
            .unwrap();

        engine.cast_vote(voters[0], "rule-b").await.unwrap();
        engine.cast_vote(voters[1], "rule-b").await.unwrap();
        engine.cast_vote(voters[2], "rule-a").await.unwrap();

        let outcome = next_resolution(&mut events).await;
        assert_eq!(
            outcome,
            Outcome::VoteDecided {
                option: "rule-b".into(),
                tiebreak: false,
            }
        );
        engine.close();
    }

    #[tokio::test(start_paused = true)]
    async fn tied_vote_goes_through_the_tiebreak_subphase() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        let voters = [Uuid::new_v4(), Uuid::new_v4()];
        seed_room(&store, host, &voters).await;

        let engine = engine_for(&store, host);
        let mut events = engine.subscribe_events();
        engine.configure().await.unwrap();
        engine
            .open_turn(TurnSpec::Vote {
                options: vec![
                    ProposalOption {
                        id: "rule-a".into(),
                        label: "Rule A".into(),
                    },
                    ProposalOption {
                        id: "rule-b".into(),
                        label: "Rule B".into(),
                    },
                ],
                binary: false,
            })
            .await
            .unwrap();

        engine.cast_vote(voters[0], "rule-a").await.unwrap();
        engine.cast_vote(voters[1], "rule-b").await.unwrap();

        let mut saw_tiebreak = false;
        let outcome = loop {
            let event = timeout(Duration::from_secs(30), events.recv())
                .await
                .expect("timed out waiting for tiebreak resolution")
                .expect("event channel closed");
            match event {
                EngineEvent::TiebreakStarted { tied } => {
                    assert_eq!(tied, ["rule-a", "rule-b"]);
                    saw_tiebreak = true;
                }
                EngineEvent::Resolution(outcome) => break outcome,
                _ => {}
            }
        };

        assert!(saw_tiebreak);
        let Outcome::VoteDecided { option, tiebreak } = outcome else {
            panic!("expected a vote outcome");
        };
        assert!(tiebreak);
        assert!(option == "rule-a" || option == "rule-b");
        engine.close();
    }

    #[tokio::test(start_paused = true)]
    async fn turn_expires_exactly_once_with_no_lock() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        seed_room(&store, host, &[Uuid::new_v4()]).await;

        let engine = engine_for(&store, host);
        let mut events = engine.subscribe_events();
        engine.configure().await.unwrap();
        engine
            .open_turn(TurnSpec::Race {
                difficulty: Difficulty::Normal,
            })
            .await
            .unwrap();

        // The store clock is the host clock, which the paused tokio runtime
        // does not advance: backdate the window start past the 30s budget so
        // the next tick observes an expired turn.
        let paths = RoomPaths::new(ROOM);
        let past = local_now_ms() - 31_000;
        store
            .transact(
                &paths.turn(),
                Box::new(move |current| {
                    let Some(turn) = decode::<Turn>(current) else {
                        return TransactionUpdate::Keep;
                    };
                    TransactionUpdate::Set(encode(&Turn {
                        revealed_at: Some(past),
                        ..turn
                    }))
                }),
            )
            .await
            .unwrap();

        let outcome = next_resolution(&mut events).await;
        assert_eq!(outcome, Outcome::Timeout);

        let paths = RoomPaths::new(ROOM);
        let record: PhaseRecord =
            decode(store.read(&paths.phase()).await.unwrap().as_ref()).unwrap();
        assert_eq!(record.phase, RoomPhase::Resolved);
        engine.close();
    }

    #[tokio::test(start_paused = true)]
    async fn non_controller_cannot_drive_the_turn() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let host = Uuid::new_v4();
        let other = Uuid::new_v4();
        seed_room(&store, host, &[other]).await;

        let engine = engine_for(&store, other);
        assert!(matches!(
            engine.configure().await,
            Err(EngineError::NotController(_))
        ));
        assert!(matches!(
            engine
                .open_turn(TurnSpec::Race {
                    difficulty: Difficulty::Normal
                })
                .await,
            Err(EngineError::NotController(_))
        ));
        engine.close();
    }
}
