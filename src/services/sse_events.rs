//! Bridges engine observer callbacks onto a room's SSE hub.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{
    dto::sse::{
        LockChangedEvent, PhaseChangedEvent, ResolutionEvent, RoomClosedEvent,
        RosterChangedEvent, ServerEvent, TiebreakEvent, TimerTickEvent,
    },
    engine::{Engine, EngineEvent},
    state::SseHub,
};

const EVENT_PHASE_CHANGED: &str = "phase_changed";
const EVENT_LOCK_CHANGED: &str = "lock_changed";
const EVENT_TIMER_TICK: &str = "timer_tick";
const EVENT_TIEBREAK: &str = "tiebreak";
const EVENT_RESOLUTION: &str = "resolution";
const EVENT_ROSTER: &str = "roster";
const EVENT_ROOM_CLOSED: &str = "room_closed";

/// Forward every engine callback of `engine` onto `hub` until the engine
/// closes. Returns the forwarder task handle so teardown can abort it.
pub fn spawn_room_forwarder(engine: &Engine, hub: Arc<SseHub>) -> JoinHandle<()> {
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => broadcast_engine_event(&hub, event),
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    // Last-value-wins surface: observers resynchronize from
                    // the next push.
                    warn!(skipped, "room event forwarder lagged");
                }
            }
        }
    })
}

/// Broadcast that a room is going away; pushed right before teardown.
pub fn broadcast_room_closed(hub: &SseHub, room: &str) {
    let payload = RoomClosedEvent {
        room: room.to_string(),
    };
    send_event(hub, EVENT_ROOM_CLOSED, &payload);
}

fn broadcast_engine_event(hub: &SseHub, event: EngineEvent) {
    match event {
        EngineEvent::PhaseChanged { phase, version } => {
            send_event(hub, EVENT_PHASE_CHANGED, &PhaseChangedEvent { phase, version });
        }
        EngineEvent::LockChanged { holder } => {
            send_event(hub, EVENT_LOCK_CHANGED, &LockChangedEvent { holder });
        }
        EngineEvent::TimerTick {
            remaining_ms,
            seconds_left,
            points_available,
        } => {
            send_event(
                hub,
                EVENT_TIMER_TICK,
                &TimerTickEvent {
                    remaining_ms,
                    seconds_left,
                    points_available,
                },
            );
        }
        EngineEvent::TiebreakStarted { tied } => {
            send_event(hub, EVENT_TIEBREAK, &TiebreakEvent { tied });
        }
        EngineEvent::Resolution(outcome) => {
            send_event(hub, EVENT_RESOLUTION, &ResolutionEvent { outcome });
        }
        EngineEvent::RosterChanged { roster } => {
            let payload = RosterChangedEvent {
                participants: roster.into_values().map(Into::into).collect(),
            };
            send_event(hub, EVENT_ROSTER, &payload);
        }
    }
}

fn send_event(hub: &SseHub, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => hub.broadcast(event),
        Err(err) => warn!(event, error = %err, "failed to serialize SSE payload"),
    }
}
