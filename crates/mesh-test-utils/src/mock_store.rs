//! In-memory realtime store for coordinator testing.
//!
//! One `MockStore` models the shared cloud store; each simulated client
//! gets its own [`MockStoreClient`] with independent connection state and
//! disconnect hooks, while all clients see the same tree.
//!
//! Semantics mirrored from the store contract:
//! - children are kept in insertion order and replayed as `Added` events
//!   to new watchers before any live event
//! - `push` assigns insertion-ordered unique keys
//! - disconnect hooks are one-shot: they fire once when the owning client
//!   goes offline and are dropped afterwards
//! - `remove` of an absent path is a no-op

use mesh_coordinator::errors::MeshError;
use mesh_coordinator::store::{ChildEvent, ConnectionState, RealtimeStore, StorePath};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct TreeInner {
    /// Children per parent path, in insertion order.
    children: HashMap<String, Vec<(String, Value)>>,
    /// Monotonic counter for push keys.
    push_counter: u64,
    /// Watchers per parent path.
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<ChildEvent>>>,
    /// Deterministic server clock, epoch milliseconds.
    clock: i64,
}

impl TreeInner {
    fn notify(&mut self, parent: &str, event: &ChildEvent) {
        if let Some(senders) = self.watchers.get_mut(parent) {
            senders.retain(|s| s.send(event.clone()).is_ok());
        }
    }

    fn set(&mut self, parent: &str, key: &str, value: Value) {
        let entries = self.children.entry(parent.to_string()).or_default();
        if let Some(entry) = entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.clone();
        } else {
            entries.push((key.to_string(), value.clone()));
        }
        self.notify(
            parent,
            &ChildEvent::Added {
                key: key.to_string(),
                value,
            },
        );
    }

    fn remove_leaf(&mut self, parent: &str, key: &str) {
        let removed = match self.children.get_mut(parent) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|(k, _)| k != key);
                entries.len() != before
            }
            None => false,
        };
        if removed {
            self.notify(
                parent,
                &ChildEvent::Removed {
                    key: key.to_string(),
                },
            );
        }
    }

    fn remove(&mut self, path: &str) {
        // A path is a leaf if its parent holds it as a child; otherwise it
        // may itself be a parent whose whole subtree goes away.
        if let Some((parent, key)) = path.rsplit_once('/') {
            self.remove_leaf(parent, key);
        }
        if let Some(entries) = self.children.remove(path) {
            let keys: Vec<String> = entries.into_iter().map(|(k, _)| k).collect();
            for key in keys {
                self.notify(path, &ChildEvent::Removed { key });
            }
        }
    }
}

/// The shared in-memory store.
#[derive(Clone)]
pub struct MockStore {
    tree: Arc<Mutex<TreeInner>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(TreeInner {
                clock: 1_700_000_000_000,
                ..TreeInner::default()
            })),
        }
    }

    /// A new simulated client of this store, initially connected.
    #[must_use]
    pub fn client(&self) -> Arc<MockStoreClient> {
        let (conn_tx, _) = watch::channel(ConnectionState::Connected);
        Arc::new(MockStoreClient {
            tree: Arc::clone(&self.tree),
            conn_tx,
            hooks: Mutex::new(HashSet::new()),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Current value at a leaf path, if any.
    #[must_use]
    pub fn value_at(&self, path: &StorePath) -> Option<Value> {
        let (parent, key) = path.as_str().rsplit_once('/')?;
        let tree = lock(&self.tree);
        tree.children
            .get(parent)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Children of a path, in insertion order.
    #[must_use]
    pub fn children_of(&self, path: &StorePath) -> Vec<(String, Value)> {
        let tree = lock(&self.tree);
        tree.children.get(path.as_str()).cloned().unwrap_or_default()
    }

    /// Re-deliver an `Added` event for an existing child to all watchers,
    /// simulating the store's at-least-once delivery.
    pub fn emit_duplicate_child(&self, path: &StorePath, key: &str) {
        let mut tree = lock(&self.tree);
        let value = tree
            .children
            .get(path.as_str())
            .and_then(|entries| entries.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone());
        if let Some(value) = value {
            tree.notify(
                path.as_str(),
                &ChildEvent::Added {
                    key: key.to_string(),
                    value,
                },
            );
        }
    }
}

/// One client's connection to the [`MockStore`].
pub struct MockStoreClient {
    tree: Arc<Mutex<TreeInner>>,
    conn_tx: watch::Sender<ConnectionState>,
    /// Paths armed for removal when this client disconnects.
    hooks: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
}

impl MockStoreClient {
    /// Flip this client's connection state. Going offline fires (and
    /// drops) every armed disconnect hook, exactly like the real store.
    pub fn set_connected(&self, connected: bool) {
        if connected {
            let _ = self.conn_tx.send(ConnectionState::Connected);
            return;
        }
        let _ = self.conn_tx.send(ConnectionState::Disconnected);

        let armed: Vec<String> = {
            let mut hooks = lock(&self.hooks);
            hooks.drain().collect()
        };
        let mut tree = lock(&self.tree);
        for path in armed {
            tree.remove(&path);
        }
    }

    /// Make subsequent writes fail with a store error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Paths currently armed for disconnect removal.
    #[must_use]
    pub fn armed_hooks(&self) -> Vec<String> {
        lock(&self.hooks).iter().cloned().collect()
    }

    fn check_writable(&self) -> Result<(), MeshError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(MeshError::Store("simulated write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RealtimeStore for MockStoreClient {
    async fn set(&self, path: &StorePath, value: Value) -> Result<(), MeshError> {
        self.check_writable()?;
        if let Some((parent, key)) = path.as_str().rsplit_once('/') {
            lock(&self.tree).set(parent, key, value);
        }
        Ok(())
    }

    async fn push(&self, path: &StorePath, value: Value) -> Result<String, MeshError> {
        self.check_writable()?;
        let mut tree = lock(&self.tree);
        tree.push_counter += 1;
        let key = format!("s{:08}", tree.push_counter);
        tree.set(path.as_str(), &key, value);
        Ok(key)
    }

    async fn remove(&self, path: &StorePath) -> Result<(), MeshError> {
        self.check_writable()?;
        lock(&self.tree).remove(path.as_str());
        Ok(())
    }

    fn watch_children(&self, path: &StorePath) -> mpsc::UnboundedReceiver<ChildEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tree = lock(&self.tree);
        // Replay existing children in insertion order before live events.
        if let Some(entries) = tree.children.get(path.as_str()) {
            for (key, value) in entries.clone() {
                let _ = tx.send(ChildEvent::Added { key, value });
            }
        }
        tree.watchers
            .entry(path.as_str().to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.conn_tx.subscribe()
    }

    async fn arm_disconnect_remove(&self, path: &StorePath) -> Result<(), MeshError> {
        lock(&self.hooks).insert(path.as_str().to_string());
        Ok(())
    }

    async fn cancel_disconnect_remove(&self, path: &StorePath) -> Result<(), MeshError> {
        lock(&self.hooks).remove(path.as_str());
        Ok(())
    }

    fn now_millis(&self) -> i64 {
        let mut tree = lock(&self.tree);
        tree.clock += 1;
        tree.clock
    }
}

/// Lock a mutex, recovering from poisoning (a panicking test thread must
/// not wedge every other test).
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use mesh_coordinator::store::paths;
    use serde_json::json;

    #[tokio::test]
    async fn test_push_keys_are_ordered() {
        let store = MockStore::new();
        let client = store.client();
        let mailbox = paths::signals("m1", "b1");

        let k1 = client.push(&mailbox, json!({"n": 1})).await.unwrap();
        let k2 = client.push(&mailbox, json!({"n": 2})).await.unwrap();
        assert!(k1 < k2);

        let children = store.children_of(&mailbox);
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].0, k1);
        assert_eq!(children[1].0, k2);
    }

    #[tokio::test]
    async fn test_watch_replays_existing_children_in_order() {
        let store = MockStore::new();
        let client = store.client();
        let parent = paths::participants("m1");

        client
            .set(&parent.child("c1"), json!({"display_name": "C"}))
            .await
            .unwrap();
        client
            .set(&parent.child("a1"), json!({"display_name": "A"}))
            .await
            .unwrap();

        let mut rx = client.watch_children(&parent);
        // Insertion order, not key order: c1 first.
        match rx.recv().await.unwrap() {
            ChildEvent::Added { key, .. } => assert_eq!(key, "c1"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ChildEvent::Added { key, .. } => assert_eq!(key, "a1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_notifies_and_is_idempotent() {
        let store = MockStore::new();
        let client = store.client();
        let parent = paths::participants("m1");
        let record = parent.child("a1");

        client.set(&record, json!({"display_name": "A"})).await.unwrap();
        let mut rx = client.watch_children(&parent);
        let _ = rx.recv().await; // replayed Added

        client.remove(&record).await.unwrap();
        match rx.recv().await.unwrap() {
            ChildEvent::Removed { key } => assert_eq!(key, "a1"),
            other => panic!("unexpected event: {other:?}"),
        }

        // Removing again is a harmless no-op with no event.
        client.remove(&record).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_fires_hooks_once() {
        let store = MockStore::new();
        let client = store.client();
        let record = paths::participant("m1", "a1");

        client.set(&record, json!({"display_name": "A"})).await.unwrap();
        client.arm_disconnect_remove(&record).await.unwrap();

        client.set_connected(false);
        assert!(store.value_at(&record).is_none());
        // Hook is one-shot: dropped after firing.
        assert!(client.armed_hooks().is_empty());

        // Reconnecting and writing again without re-arming leaves the
        // record unprotected.
        client.set_connected(true);
        client.set(&record, json!({"display_name": "A"})).await.unwrap();
        client.set_connected(false);
        assert!(store.value_at(&record).is_some());
    }

    #[tokio::test]
    async fn test_cancel_disconnect_hook() {
        let store = MockStore::new();
        let client = store.client();
        let record = paths::participant("m1", "a1");

        client.set(&record, json!({"display_name": "A"})).await.unwrap();
        client.arm_disconnect_remove(&record).await.unwrap();
        client.cancel_disconnect_remove(&record).await.unwrap();

        client.set_connected(false);
        assert!(store.value_at(&record).is_some());
    }

    #[tokio::test]
    async fn test_clients_share_the_tree() {
        let store = MockStore::new();
        let a = store.client();
        let b = store.client();
        let parent = paths::participants("m1");

        let mut rx = b.watch_children(&parent);
        a.set(&parent.child("a1"), json!({"display_name": "A"}))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ChildEvent::Added { key, .. } => assert_eq!(key, "a1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_writes() {
        let store = MockStore::new();
        let client = store.client();
        client.fail_writes(true);
        let err = client
            .set(&paths::participant("m1", "a1"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Store(_)));
    }
}
