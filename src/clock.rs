//! Clock synchronization against the store's authoritative clock.
//!
//! Every client estimates how far its local clock runs ahead of the store by
//! committing a server-timestamp token and diffing the resolved value against
//! the midpoint of the round trip. The offset feeds the adjusted-time
//! computation of the arbiter and the synchronized timer.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::store::{
    SharedStore, StorePath, StoreResult, TransactionUpdate, server_timestamp,
};

/// Root path under which offset probes are written.
const PROBE_ROOT: &str = "clock";

/// Milliseconds since the Unix epoch on the local clock.
pub fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Cheaply cloneable view of the latest offset estimate.
///
/// The offset is the number of milliseconds the local clock runs ahead of the
/// store clock, so a local instant maps onto the store clock as
/// `local_ts - offset_ms`.
#[derive(Clone)]
pub struct ClockHandle {
    offset: watch::Receiver<i64>,
}

impl ClockHandle {
    /// Handle pinned to a fixed offset, for tests and for stores that share
    /// the host clock.
    pub fn fixed(offset_ms: i64) -> Self {
        // The receiver keeps serving the seeded value after the sender drops.
        let (_tx, rx) = watch::channel(offset_ms);
        Self { offset: rx }
    }

    /// Latest estimated offset (local minus server), in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        *self.offset.borrow()
    }

    /// Current time on the store's clock, as estimated from the local clock.
    pub fn server_now_ms(&self) -> i64 {
        local_now_ms() - self.offset_ms()
    }
}

/// One probe round trip: commit a timestamp token, read the resolved instant
/// back, and compare it to the midpoint of the local send/receive window.
pub async fn estimate_offset_ms(
    store: &Arc<dyn SharedStore>,
    client_id: Uuid,
) -> StoreResult<i64> {
    let probe = StorePath::parse(PROBE_ROOT).child(client_id);
    let sent_at = local_now_ms();
    let outcome = store
        .transact(&probe, Box::new(|_| TransactionUpdate::Set(server_timestamp())))
        .await?;
    let received_at = local_now_ms();
    store.remove(&probe).await?;

    let committed = outcome
        .value
        .as_ref()
        .and_then(|value| value.as_i64())
        .unwrap_or(received_at);
    let midpoint = sent_at + (received_at - sent_at) / 2;
    Ok(midpoint - committed)
}

/// Spawn the periodic resync task and return a handle tracking its estimates.
///
/// The first estimate is taken immediately; afterwards the task resyncs on
/// the configured interval until every handle is dropped.
pub async fn spawn_sync(store: Arc<dyn SharedStore>, config: Arc<EngineConfig>) -> ClockHandle {
    let client_id = Uuid::new_v4();
    let initial = match estimate_offset_ms(&store, client_id).await {
        Ok(offset) => offset,
        Err(err) => {
            warn!(error = %err, "initial clock probe failed; assuming zero offset");
            0
        }
    };

    let (tx, rx) = watch::channel(initial);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.clock_resync);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            match estimate_offset_ms(&store, client_id).await {
                Ok(offset) => {
                    debug!(offset_ms = offset, "clock offset refreshed");
                    let _ = tx.send(offset);
                }
                Err(err) => warn!(error = %err, "clock probe failed; keeping last offset"),
            }
        }
    });

    ClockHandle { offset: rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn offset_tracks_store_skew() {
        // Store clock runs one minute ahead, so the local clock is 60s behind
        // it: the local-minus-server offset must come out negative.
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock_skew(60_000));
        let offset = estimate_offset_ms(&store, Uuid::new_v4()).await.unwrap();
        assert!((-61_000..=-59_000).contains(&offset), "offset {offset}");
    }

    #[tokio::test]
    async fn probe_cleans_up_after_itself() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        estimate_offset_ms(&store, Uuid::new_v4()).await.unwrap();
        assert_eq!(store.read(&StorePath::parse(PROBE_ROOT)).await.unwrap(), None);
    }

    #[test]
    fn fixed_handle_applies_offset() {
        let handle = ClockHandle::fixed(500);
        let delta = local_now_ms() - handle.server_now_ms();
        assert!((500..=600).contains(&delta), "delta {delta}");
    }
}
