//! Synchronized turn timer.
//!
//! Remaining time is a pure function of the turn record and the store clock,
//! so the authoritative controller and read-only observers compute the same
//! value no matter how their local clocks drift. Pause freezes the window by
//! stamping `paused_at`; resume folds the consumed window into
//! `elapsed_acc` and re-bases `revealed_at`, so repeated pause/resume cycles
//! never accumulate drift.

use serde_json::Value;

use crate::config::ScoringTier;
use crate::engine::records::Turn;
use crate::store::server_timestamp;

/// Lifecycle of a turn timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// The turn has not been revealed yet.
    Idle,
    /// The window is open and consuming time.
    Running,
    /// Frozen by a pause (manual or lock-induced).
    Paused,
    /// The open-window budget is spent; terminal for the turn.
    Expired,
}

/// Open-window time consumed so far, in milliseconds on the store clock.
pub fn elapsed_effective_ms(turn: &Turn, server_now_ms: i64) -> u64 {
    let Some(revealed_at) = turn.revealed_at else {
        return turn.elapsed_acc;
    };
    let end = turn.paused_at.unwrap_or(server_now_ms);
    turn.elapsed_acc + (end - revealed_at).max(0) as u64
}

/// Milliseconds left of the turn's open-window budget.
pub fn remaining_ms(turn: &Turn, duration_ms: u64, server_now_ms: i64) -> u64 {
    duration_ms.saturating_sub(elapsed_effective_ms(turn, server_now_ms))
}

/// Whole seconds left, rounded up so the display never shows zero early.
pub fn seconds_left(turn: &Turn, duration_ms: u64, server_now_ms: i64) -> u32 {
    remaining_ms(turn, duration_ms, server_now_ms).div_ceil(1_000) as u32
}

/// Classify the timer's current phase.
pub fn timer_phase(turn: &Turn, duration_ms: u64, server_now_ms: i64) -> TimerPhase {
    if turn.revealed_at.is_none() && turn.elapsed_acc == 0 {
        return TimerPhase::Idle;
    }
    if elapsed_effective_ms(turn, server_now_ms) >= duration_ms {
        return TimerPhase::Expired;
    }
    if turn.paused_at.is_some() {
        TimerPhase::Paused
    } else {
        TimerPhase::Running
    }
}

/// Window time consumed up to the pause instant, used when re-basing on
/// resume.
pub fn rebased_elapsed_ms(turn: &Turn) -> u64 {
    let (Some(revealed_at), Some(paused_at)) = (turn.revealed_at, turn.paused_at) else {
        return turn.elapsed_acc;
    };
    turn.elapsed_acc + (paused_at - revealed_at).max(0) as u64
}

/// Serialize a resumed copy of `turn`: consumed time folded into
/// `elapsed_acc`, the window start re-based to the store clock, the pause
/// and any held lock cleared. Returns `None` when the turn is not paused.
pub fn resume_update(turn: &Turn) -> Option<Value> {
    turn.paused_at?;
    let resumed = Turn {
        elapsed_acc: rebased_elapsed_ms(turn),
        revealed_at: None,
        paused_at: None,
        locked_at: None,
        lock_holder: None,
        ..turn.clone()
    };
    let mut value = serde_json::to_value(resumed).ok()?;
    value["revealed_at"] = server_timestamp();
    Some(value)
}

/// Points still available at `elapsed_ms` into the turn: decays linearly
/// from the tier's start value to its floor over the tier duration.
pub fn points_available(tier: &ScoringTier, elapsed_ms: u64) -> i64 {
    if tier.duration_ms == 0 {
        return tier.floor;
    }
    let ratio = (1.0 - elapsed_ms as f64 / tier.duration_ms as f64).clamp(0.0, 1.0);
    tier.floor + ((tier.start - tier.floor) as f64 * ratio).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::records::{Difficulty, TurnKind};

    fn running_turn(revealed_at: i64) -> Turn {
        Turn {
            revealed_at: Some(revealed_at),
            ..Turn::new(0, TurnKind::Race, Difficulty::Normal)
        }
    }

    const TIER: ScoringTier = ScoringTier {
        start: 1_000,
        floor: 200,
        duration_ms: 30_000,
    };

    #[test]
    fn elapsed_counts_only_open_window_time() {
        let t0 = 100_000;
        let mut turn = running_turn(t0);
        assert_eq!(elapsed_effective_ms(&turn, t0 + 5_000), 5_000);

        // Pause at t0+12s: elapsed freezes no matter how far `now` advances.
        turn.paused_at = Some(t0 + 12_000);
        assert_eq!(elapsed_effective_ms(&turn, t0 + 60_000), 12_000);
    }

    #[test]
    fn pause_resume_scenario_expires_at_38s_wall_clock() {
        // Opens at t0, pauses at t0+12s, resumes at t0+20s with a 30s
        // duration: the timer must expire at t0+38s wall clock.
        let t0 = 1_000_000;
        let mut turn = running_turn(t0);
        turn.paused_at = Some(t0 + 12_000);

        // Resume re-bases the window start and accumulates the 12s consumed.
        let resumed = Turn {
            elapsed_acc: rebased_elapsed_ms(&turn),
            revealed_at: Some(t0 + 20_000),
            paused_at: None,
            ..turn
        };
        assert_eq!(resumed.elapsed_acc, 12_000);

        let duration = 30_000;
        assert_eq!(
            timer_phase(&resumed, duration, t0 + 37_999),
            TimerPhase::Running
        );
        assert_eq!(
            timer_phase(&resumed, duration, t0 + 38_000),
            TimerPhase::Expired
        );
        assert_eq!(remaining_ms(&resumed, duration, t0 + 38_000), 0);
    }

    #[test]
    fn elapsed_is_monotone_across_repeated_pause_cycles() {
        let t0 = 0;
        let mut turn = running_turn(t0);
        let mut previous = 0;
        let mut now = t0;

        for cycle in 1..=5 {
            now += 2_000;
            turn.paused_at = Some(now);
            let frozen = elapsed_effective_ms(&turn, now + 999_999);
            assert!(frozen >= previous, "cycle {cycle} went backwards");
            assert_eq!(frozen, 2_000 * cycle);
            previous = frozen;

            now += 3_000; // paused wall time never counts
            turn = Turn {
                elapsed_acc: rebased_elapsed_ms(&turn),
                revealed_at: Some(now),
                paused_at: None,
                ..turn
            };
            assert_eq!(elapsed_effective_ms(&turn, now), previous);
        }
    }

    #[test]
    fn clock_regression_never_subtracts_time() {
        let turn = running_turn(10_000);
        // Store pushes may be observed with a stale local estimate of the
        // server clock; elapsed clamps at the accumulator.
        assert_eq!(elapsed_effective_ms(&turn, 9_000), 0);
    }

    #[test]
    fn points_decay_from_start_to_floor() {
        assert_eq!(points_available(&TIER, 0), TIER.start);
        assert_eq!(points_available(&TIER, TIER.duration_ms), TIER.floor);
        assert_eq!(points_available(&TIER, TIER.duration_ms * 10), TIER.floor);

        let mut previous = i64::MAX;
        for elapsed in (0..=TIER.duration_ms).step_by(1_000) {
            let points = points_available(&TIER, elapsed);
            assert!(points <= previous, "curve increased at {elapsed}ms");
            assert!((TIER.floor..=TIER.start).contains(&points));
            previous = points;
        }
    }

    #[test]
    fn seconds_left_rounds_up() {
        let turn = running_turn(0);
        assert_eq!(seconds_left(&turn, 30_000, 100), 30);
        assert_eq!(seconds_left(&turn, 30_000, 29_001), 1);
        assert_eq!(seconds_left(&turn, 30_000, 30_000), 0);
    }

    #[test]
    fn resume_update_requires_a_pause() {
        let turn = running_turn(5_000);
        assert!(resume_update(&turn).is_none());

        let paused = Turn {
            paused_at: Some(8_000),
            elapsed_acc: 1_000,
            ..turn
        };
        let value = resume_update(&paused).unwrap();
        assert_eq!(value["elapsed_acc"], 4_000);
        assert_eq!(value["paused_at"], serde_json::Value::Null);
        assert!(crate::store::is_server_timestamp(&value["revealed_at"]));
    }
}
