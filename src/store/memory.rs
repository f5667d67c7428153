//! Single-process reference implementation of [`SharedStore`], backed by a
//! JSON tree under a lock with per-subscription watch channels. The server
//! binary runs every room on one of these; concurrency tests run several
//! engines against a single instance to exercise the compare-and-swap paths.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{
    SharedStore, StorePath, StoreResult, StoreValue, TransactFn, TransactionOutcome,
    TransactionUpdate, is_server_timestamp,
};

/// In-memory shared store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    tree: Mutex<StoreValue>,
    watchers: Mutex<Vec<Watcher>>,
    /// Offset added to the host clock, letting tests present an
    /// authoritative clock that disagrees with the clients'.
    clock_skew_ms: i64,
}

struct Watcher {
    path: StorePath,
    tx: watch::Sender<Option<StoreValue>>,
}

impl MemoryStore {
    /// Create an empty store whose clock tracks the host clock.
    pub fn new() -> Self {
        Self::with_clock_skew(0)
    }

    /// Create an empty store whose authoritative clock runs `skew_ms` ahead
    /// of (or, negative, behind) the host clock.
    pub fn with_clock_skew(skew_ms: i64) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                tree: Mutex::new(Value::Null),
                watchers: Mutex::new(Vec::new()),
                clock_skew_ms: skew_ms,
            }),
        }
    }

    /// Milliseconds since the Unix epoch on the store's authoritative clock.
    pub fn now_ms(&self) -> i64 {
        let host = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        host + self.inner.clock_skew_ms
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for MemoryStore {
    fn subscribe(&self, path: &StorePath) -> BoxStream<'static, Option<StoreValue>> {
        let tree = self.inner.tree.lock().expect("store tree lock poisoned");
        let current = subtree(&tree, path);
        drop(tree);

        let (tx, rx) = watch::channel(current);
        self.inner
            .watchers
            .lock()
            .expect("store watcher lock poisoned")
            .push(Watcher {
                path: path.clone(),
                tx,
            });

        WatchStream::new(rx).boxed()
    }

    fn transact(
        &self,
        path: &StorePath,
        mut apply: TransactFn,
    ) -> BoxFuture<'static, StoreResult<TransactionOutcome>> {
        let inner = Arc::clone(&self.inner);
        let path = path.clone();
        let now_ms = self.now_ms();

        Box::pin(async move {
            let mut tree = inner.tree.lock().expect("store tree lock poisoned");
            let current = subtree(&tree, &path);

            let outcome = match apply(current.as_ref()) {
                TransactionUpdate::Keep => TransactionOutcome {
                    committed: false,
                    value: current,
                },
                TransactionUpdate::Set(mut value) => {
                    resolve_server_values(&mut value, now_ms);
                    write_subtree(&mut tree, &path, Some(value.clone()));
                    TransactionOutcome {
                        committed: true,
                        value: Some(value),
                    }
                }
                TransactionUpdate::Remove => {
                    write_subtree(&mut tree, &path, None);
                    TransactionOutcome {
                        committed: true,
                        value: None,
                    }
                }
            };

            if outcome.committed {
                let notifications = inner.collect_notifications(&tree, &path);
                drop(tree);
                for (tx, value) in notifications {
                    let _ = tx.send(value);
                }
            }

            Ok(outcome)
        })
    }
}

impl StoreInner {
    /// Gather the updated subtree for every watcher overlapping `changed`,
    /// pruning watchers whose receivers have been dropped.
    fn collect_notifications(
        &self,
        tree: &StoreValue,
        changed: &StorePath,
    ) -> Vec<(watch::Sender<Option<StoreValue>>, Option<StoreValue>)> {
        let mut watchers = self.watchers.lock().expect("store watcher lock poisoned");
        watchers.retain(|watcher| !watcher.tx.is_closed());
        watchers
            .iter()
            .filter(|watcher| {
                watcher.path.starts_with(changed) || changed.starts_with(&watcher.path)
            })
            .map(|watcher| (watcher.tx.clone(), subtree(tree, &watcher.path)))
            .collect()
    }
}

/// Read the value stored under `path`, if any.
fn subtree(tree: &StoreValue, path: &StorePath) -> Option<StoreValue> {
    let mut node = tree;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    if node.is_null() { None } else { Some(node.clone()) }
}

/// Replace (or remove, with `None`) the subtree under `path`, creating
/// intermediate objects as needed and pruning emptied parents on removal.
fn write_subtree(tree: &mut StoreValue, path: &StorePath, value: Option<StoreValue>) {
    let segments = path.segments();
    if segments.is_empty() {
        *tree = value.unwrap_or(Value::Null);
        return;
    }

    match value {
        Some(value) => {
            let mut node = tree;
            for segment in &segments[..segments.len() - 1] {
                if !node.is_object() {
                    *node = Value::Object(serde_json::Map::new());
                }
                node = node
                    .as_object_mut()
                    .expect("object just ensured")
                    .entry(segment.clone())
                    .or_insert(Value::Null);
            }
            if !node.is_object() {
                *node = Value::Object(serde_json::Map::new());
            }
            node.as_object_mut()
                .expect("object just ensured")
                .insert(segments[segments.len() - 1].clone(), value);
        }
        None => {
            remove_subtree(tree, segments);
        }
    }
}

/// Remove the entry at `segments`, returning whether the parent became empty.
fn remove_subtree(node: &mut StoreValue, segments: &[String]) -> bool {
    let Some(map) = node.as_object_mut() else {
        return false;
    };
    match segments {
        [] => false,
        [leaf] => {
            map.remove(leaf);
            map.is_empty()
        }
        [head, rest @ ..] => {
            if let Some(child) = map.get_mut(head)
                && remove_subtree(child, rest)
            {
                map.remove(head);
            }
            map.is_empty()
        }
    }
}

/// Substitute every server-timestamp token in `value` with the commit clock.
fn resolve_server_values(value: &mut StoreValue, now_ms: i64) {
    if is_server_timestamp(value) {
        *value = Value::from(now_ms);
        return;
    }
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                resolve_server_values(child, now_ms);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                resolve_server_values(child, now_ms);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::server_timestamp;

    #[tokio::test]
    async fn put_then_read_round_trip() {
        let store = MemoryStore::new();
        let path = StorePath::parse("rooms/ABCD/meta");
        store.put(&path, json!({"closed": false})).await.unwrap();

        let value = store.read(&path).await.unwrap();
        assert_eq!(value, Some(json!({"closed": false})));
        assert_eq!(
            store.read(&StorePath::parse("rooms/ABCD")).await.unwrap(),
            Some(json!({"meta": {"closed": false}}))
        );
    }

    #[tokio::test]
    async fn remove_prunes_empty_parents() {
        let store = MemoryStore::new();
        let path = StorePath::parse("rooms/ABCD/race/u1");
        store.put(&path, json!({"local_ts": 1})).await.unwrap();
        store.remove(&path).await.unwrap();

        assert_eq!(
            store.read(&StorePath::parse("rooms/ABCD")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn server_timestamp_resolved_at_commit() {
        let store = MemoryStore::with_clock_skew(5_000);
        let path = StorePath::parse("rooms/ABCD/turn");
        let before = store.now_ms();
        let outcome = store
            .transact(
                &path,
                Box::new(|_| TransactionUpdate::Set(json!({"paused_at": server_timestamp()}))),
            )
            .await
            .unwrap();
        let after = store.now_ms();

        let committed = outcome.value.unwrap();
        let paused_at = committed["paused_at"].as_i64().unwrap();
        assert!((before..=after).contains(&paused_at));
    }

    #[tokio::test]
    async fn transaction_keep_leaves_value_untouched() {
        let store = MemoryStore::new();
        let path = StorePath::parse("rooms/ABCD/turn/lock_holder");
        store.put(&path, json!("holder-1")).await.unwrap();

        let outcome = store
            .transact(
                &path,
                Box::new(|current| match current {
                    Some(_) => TransactionUpdate::Keep,
                    None => TransactionUpdate::Set(json!("holder-2")),
                }),
            )
            .await
            .unwrap();

        assert!(!outcome.committed);
        assert_eq!(outcome.value, Some(json!("holder-1")));
    }

    #[tokio::test]
    async fn subscription_pushes_initial_and_updated_snapshots() {
        let store = MemoryStore::new();
        let path = StorePath::parse("rooms/ABCD/race");
        let mut stream = store.subscribe(&path);

        assert_eq!(stream.next().await, Some(None));

        store
            .put(&path.child("u1"), json!({"local_ts": 7}))
            .await
            .unwrap();
        assert_eq!(
            stream.next().await,
            Some(Some(json!({"u1": {"local_ts": 7}})))
        );

        // A write above the subscription root also re-pushes the subtree.
        store.remove(&StorePath::parse("rooms/ABCD")).await.unwrap();
        assert_eq!(stream.next().await, Some(None));
    }
}
