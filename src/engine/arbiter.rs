//! Arbitration of a closed race window: normalize every event onto the store
//! clock, rank, and claim the turn lock through a compare-and-swap.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::engine::records::{RaceEvent, RoomPaths, Turn, decode};
use crate::store::{SharedStore, StoreResult, TransactionUpdate, server_timestamp};

/// An event's action instant on the store clock: the actor's local timestamp
/// corrected by the clock offset it carried at emission.
pub fn adjusted_time_ms(event: &RaceEvent) -> i64 {
    event.local_ts - event.offset_ms
}

/// Pick the provisional winner: minimum adjusted time, ties broken by actor
/// id so the outcome never depends on map-iteration order.
pub fn rank(batch: &[RaceEvent]) -> Option<&RaceEvent> {
    batch
        .iter()
        .min_by_key(|event| (adjusted_time_ms(event), event.actor_id))
}

/// How a resolution attempt concluded. Only [`ClaimOutcome::Won`] means this
/// resolver owns the follow-up writes; the other variants are silent no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The lock was claimed for the ranked winner.
    Won(Uuid),
    /// Another resolver (or a racing controller instance) got there first.
    AlreadyHeld,
    /// The batch was empty once the window fired.
    Empty,
}

/// Resolve a closed window batch against the turn record.
///
/// Contention loss is expected and must not be retried with the same batch:
/// the compare-and-swap failing only means somebody else already resolved
/// this race.
pub async fn resolve(
    store: &Arc<dyn SharedStore>,
    paths: &RoomPaths,
    batch: &[RaceEvent],
) -> StoreResult<ClaimOutcome> {
    let Some(winner) = rank(batch) else {
        return Ok(ClaimOutcome::Empty);
    };
    let winner_id = winner.actor_id;

    // Fresh guard read: a racing controller instance may already have
    // resolved this turn (e.g. around a host migration).
    let current: Option<Turn> = decode(store.read(&paths.turn()).await?.as_ref());
    if current.as_ref().is_none_or(|turn| turn.lock_holder.is_some()) {
        debug!(room = %paths.root(), "lock already held before claim; dropping batch");
        return Ok(ClaimOutcome::AlreadyHeld);
    }

    let outcome = store
        .transact(
            &paths.turn(),
            Box::new(move |current| {
                let Some(turn) = decode::<Turn>(current) else {
                    return TransactionUpdate::Keep;
                };
                if turn.lock_holder.is_some() {
                    return TransactionUpdate::Keep;
                }

                let claimed = Turn {
                    lock_holder: Some(winner_id),
                    ..turn
                };
                match serde_json::to_value(claimed) {
                    Ok(mut value) => {
                        // The freeze instants come from the store clock, not
                        // from any client's estimate of it.
                        value["paused_at"] = server_timestamp();
                        value["locked_at"] = server_timestamp();
                        TransactionUpdate::Set(value)
                    }
                    Err(_) => TransactionUpdate::Keep,
                }
            }),
        )
        .await?;

    let claimed_by = decode::<Turn>(outcome.value.as_ref()).and_then(|turn| turn.lock_holder);
    if outcome.committed && claimed_by == Some(winner_id) {
        store.remove(&paths.race()).await?;
        Ok(ClaimOutcome::Won(winner_id))
    } else {
        debug!(room = %paths.root(), "lost lock claim to a concurrent resolver");
        Ok(ClaimOutcome::AlreadyHeld)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::records::{Difficulty, TurnKind};
    use crate::store::MemoryStore;

    fn event(actor: Uuid, local_ts: i64, offset_ms: i64) -> RaceEvent {
        RaceEvent {
            actor_id: actor,
            local_ts,
            offset_ms,
        }
    }

    #[test]
    fn ranking_normalizes_by_clock_offset() {
        // Local times T, T+40, T+90 with offsets 0, -20, +10 adjust to
        // T, T+60, T+80: the chronologically-first actor wins even though
        // other writes may have landed earlier.
        let t = 1_000_000;
        let a1 = Uuid::new_v4();
        let batch = vec![
            event(Uuid::new_v4(), t + 40, -20),
            event(a1, t, 0),
            event(Uuid::new_v4(), t + 90, 10),
        ];

        assert_eq!(rank(&batch).unwrap().actor_id, a1);
    }

    #[test]
    fn identical_adjusted_times_break_by_actor_id() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(u128::MAX);
        let batch = vec![event(high, 500, 0), event(low, 500, 0)];

        assert_eq!(rank(&batch).unwrap().actor_id, low);
        // Order of the input array does not matter.
        let flipped = vec![event(low, 500, 0), event(high, 500, 0)];
        assert_eq!(rank(&flipped).unwrap().actor_id, low);
    }

    async fn seed_turn(store: &Arc<dyn SharedStore>, paths: &RoomPaths) {
        let turn = Turn {
            revealed_at: Some(0),
            ..Turn::new(0, TurnKind::Race, Difficulty::Normal)
        };
        store
            .put(&paths.turn(), serde_json::to_value(turn).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn winner_claims_lock_and_clears_collection() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let paths = RoomPaths::new("ABCD");
        seed_turn(&store, &paths).await;

        let actor = Uuid::new_v4();
        store
            .put(&paths.race_event(actor), json!({"actor_id": actor, "local_ts": 5, "offset_ms": 0}))
            .await
            .unwrap();

        let batch = vec![event(actor, 5, 0)];
        assert_eq!(
            resolve(&store, &paths, &batch).await.unwrap(),
            ClaimOutcome::Won(actor)
        );

        let turn: Turn = decode(store.read(&paths.turn()).await.unwrap().as_ref()).unwrap();
        assert_eq!(turn.lock_holder, Some(actor));
        assert!(turn.paused_at.is_some());
        assert_eq!(store.read(&paths.race()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let paths = RoomPaths::new("ABCD");
        seed_turn(&store, &paths).await;

        assert_eq!(
            resolve(&store, &paths, &[]).await.unwrap(),
            ClaimOutcome::Empty
        );
    }

    #[tokio::test]
    async fn two_racing_resolvers_produce_exactly_one_winner() {
        // Two controller instances resolving the same turn concurrently: the
        // compare-and-swap admits exactly one, and the loser must not
        // overwrite.
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let paths = RoomPaths::new("ABCD");
        seed_turn(&store, &paths).await;

        let fast = Uuid::from_u128(7);
        let slow = Uuid::from_u128(9);
        let batch_a = vec![event(fast, 100, 0)];
        let batch_b = vec![event(slow, 120, 0)];

        let store_a = Arc::clone(&store);
        let store_b = Arc::clone(&store);
        let paths_a = paths.clone();
        let paths_b = paths.clone();
        let (left, right) = tokio::join!(
            tokio::spawn(async move { resolve(&store_a, &paths_a, &batch_a).await.unwrap() }),
            tokio::spawn(async move { resolve(&store_b, &paths_b, &batch_b).await.unwrap() }),
        );

        let outcomes = [left.unwrap(), right.unwrap()];
        let wins = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, ClaimOutcome::Won(_)))
            .count();
        assert_eq!(wins, 1);

        let turn: Turn = decode(store.read(&paths.turn()).await.unwrap().as_ref()).unwrap();
        let holder = turn.lock_holder.unwrap();
        assert!(holder == fast || holder == slow);
        // The stored holder matches whichever resolver reported the win.
        let winner = outcomes.iter().find_map(|outcome| match outcome {
            ClaimOutcome::Won(uid) => Some(*uid),
            _ => None,
        });
        assert_eq!(winner, Some(holder));
    }

    #[tokio::test]
    async fn resolver_aborts_when_lock_already_held() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let paths = RoomPaths::new("ABCD");
        let holder = Uuid::new_v4();
        let turn = Turn {
            revealed_at: Some(0),
            lock_holder: Some(holder),
            ..Turn::new(0, TurnKind::Race, Difficulty::Normal)
        };
        store
            .put(&paths.turn(), serde_json::to_value(turn).unwrap())
            .await
            .unwrap();

        let challenger = Uuid::new_v4();
        let batch = vec![event(challenger, 1, 0)];
        assert_eq!(
            resolve(&store, &paths, &batch).await.unwrap(),
            ClaimOutcome::AlreadyHeld
        );

        let stored: Turn = decode(store.read(&paths.turn()).await.unwrap().as_ref()).unwrap();
        assert_eq!(stored.lock_holder, Some(holder));
    }
}
