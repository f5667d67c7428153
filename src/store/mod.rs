//! Shared-state store abstraction: the only channel through which room
//! participants coordinate. A store exposes path-scoped push subscriptions,
//! atomic read-modify-write transactions, and a server-timestamp token
//! resolved against its own clock at commit time.

pub mod memory;

use std::fmt;

use futures::{future::BoxFuture, stream::BoxStream};
use serde_json::{Value, json};
use thiserror::Error;

pub use self::memory::MemoryStore;

/// Hierarchical values stored in the shared tree.
pub type StoreValue = Value;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store has been shut down and no longer accepts operations.
    #[error("store is closed")]
    Closed,
    /// A transaction kept colliding with concurrent writers and gave up.
    #[error("transaction aborted after too many retries")]
    Contention,
}

/// Key under which a server-timestamp placeholder is encoded.
const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder written in place of a timestamp; the store substitutes its own
/// authoritative clock (milliseconds since the Unix epoch) at commit time.
pub fn server_timestamp() -> StoreValue {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// Whether `value` is a server-timestamp placeholder.
pub fn is_server_timestamp(value: &StoreValue) -> bool {
    match value.as_object() {
        Some(map) => {
            map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp")
        }
        None => false,
    }
}

/// Slash-separated location inside the hierarchical tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(Vec<String>);

impl StorePath {
    /// The root of the tree.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a `a/b/c` path, ignoring empty segments.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Extend the path with one more segment.
    pub fn child(&self, segment: impl fmt::Display) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// Borrow the individual segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `self` is `prefix` or lives underneath it.
    pub fn starts_with(&self, prefix: &StorePath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Decision returned by a transaction closure.
pub enum TransactionUpdate {
    /// Leave the current value untouched (abort without error).
    Keep,
    /// Replace the subtree with the given value.
    Set(StoreValue),
    /// Delete the subtree.
    Remove,
}

/// Result of a transaction: whether a write was applied and the value now
/// stored at the path (with any timestamp tokens already resolved).
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    /// True when the closure's update was committed.
    pub committed: bool,
    /// Value at the path after the transaction completed.
    pub value: Option<StoreValue>,
}

/// Closure applied inside [`SharedStore::transact`]. Must be pure: the store
/// may invoke it several times under contention before a commit sticks.
pub type TransactFn = Box<dyn FnMut(Option<&StoreValue>) -> TransactionUpdate + Send>;

/// Abstraction over the shared hierarchical store.
///
/// Anything satisfying this contract works: the bundled in-memory store, a
/// pub/sub + compare-and-swap service, or a remote realtime database.
pub trait SharedStore: Send + Sync {
    /// Subscribe to the subtree at `path`. The stream pushes the current
    /// value immediately and again after every change, with last-value-wins
    /// semantics (intermediate states may be skipped under load).
    fn subscribe(&self, path: &StorePath) -> BoxStream<'static, Option<StoreValue>>;

    /// Atomically read, transform, and write the subtree at `path`.
    fn transact(&self, path: &StorePath, apply: TransactFn)
    -> BoxFuture<'static, StoreResult<TransactionOutcome>>;

    /// Read the current value at `path` (a transaction that keeps the value).
    fn read(&self, path: &StorePath) -> BoxFuture<'static, StoreResult<Option<StoreValue>>> {
        let fut = self.transact(path, Box::new(|_| TransactionUpdate::Keep));
        Box::pin(async move { fut.await.map(|outcome| outcome.value) })
    }

    /// Unconditionally replace the subtree at `path`.
    fn put(&self, path: &StorePath, value: StoreValue) -> BoxFuture<'static, StoreResult<()>> {
        let fut = self.transact(
            path,
            Box::new(move |_| TransactionUpdate::Set(value.clone())),
        );
        Box::pin(async move { fut.await.map(|_| ()) })
    }

    /// Delete the subtree at `path`.
    fn remove(&self, path: &StorePath) -> BoxFuture<'static, StoreResult<()>> {
        let fut = self.transact(path, Box::new(|_| TransactionUpdate::Remove));
        Box::pin(async move { fut.await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ignores_empty_segments() {
        let path = StorePath::parse("/rooms//ABCD/turn/");
        assert_eq!(path.segments(), ["rooms", "ABCD", "turn"]);
        assert_eq!(path.to_string(), "rooms/ABCD/turn");
    }

    #[test]
    fn starts_with_is_prefix_inclusive() {
        let room = StorePath::parse("rooms/ABCD");
        let turn = room.child("turn");
        assert!(turn.starts_with(&room));
        assert!(room.starts_with(&room));
        assert!(!room.starts_with(&turn));
        assert!(turn.starts_with(&StorePath::root()));
    }

    #[test]
    fn server_timestamp_token_detection() {
        assert!(is_server_timestamp(&server_timestamp()));
        assert!(!is_server_timestamp(&json!({"at": 12})));
        assert!(!is_server_timestamp(&json!(42)));
        assert!(!is_server_timestamp(&json!({".sv": "increment"})));
    }
}
