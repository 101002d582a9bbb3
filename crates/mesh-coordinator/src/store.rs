//! Realtime store capability trait and path layout.
//!
//! The coordinator requires a path-addressed key/value store with
//! subscribe-on-change semantics, a connection-state signal, and a
//! server-side "remove this key when the client disconnects" registration.
//! Any store offering these primitives can back the mesh; a replacement
//! without the disconnect hook would need a heartbeat/lease mechanism
//! instead.
//!
//! # Path layout
//!
//! ```text
//! meetings/{meeting_id}/participants/{participant_id}   -> ParticipantRecord
//! meetings/{meeting_id}/signals/{recipient_id}/{seq}    -> SignalEnvelope
//! ```

use crate::errors::MeshError;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::{mpsc, watch};

/// A slash-joined path into the store's key/value tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorePath(String);

impl StorePath {
    /// Build a path from segments. Slashes inside a segment are rejected
    /// at the call site by construction; segments are joined verbatim.
    #[must_use]
    pub fn new(segments: &[&str]) -> Self {
        Self(segments.join("/"))
    }

    /// Append one segment.
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}/{segment}", self.0))
    }

    /// The path as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store connection state as observed by the local client.
///
/// May flip between the two values repeatedly over a session's life;
/// consumers must treat every `Connected` observation as a fresh
/// reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The client has an active connection to the store.
    Connected,
    /// The client is offline; writes are queued by the store layer.
    Disconnected,
}

/// A change to the children of a watched path.
#[derive(Clone, Debug)]
pub enum ChildEvent {
    /// A child appeared (or was rewritten). Watchers receive one `Added`
    /// per existing child on subscribe, then live additions; delivery is
    /// at-least-once.
    Added { key: String, value: Value },
    /// A child was removed.
    Removed { key: String },
}

/// Capability trait for the realtime store backing the mesh.
///
/// Implementations must serialize child events per watched path in
/// insertion order; no ordering is required across paths.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Write a value at `path`, creating or replacing it.
    async fn set(&self, path: &StorePath, value: Value) -> Result<(), MeshError>;

    /// Append a child under `path` with a store-assigned, insertion-ordered
    /// unique key. Returns the key.
    async fn push(&self, path: &StorePath, value: Value) -> Result<String, MeshError>;

    /// Remove the value at `path`. Removing an absent path is a no-op.
    async fn remove(&self, path: &StorePath) -> Result<(), MeshError>;

    /// Watch the children of `path`. Existing children are replayed as
    /// `Added` events in insertion order before any live event.
    fn watch_children(&self, path: &StorePath) -> mpsc::UnboundedReceiver<ChildEvent>;

    /// Watch the local client's connection state.
    fn watch_connection(&self) -> watch::Receiver<ConnectionState>;

    /// Register a server-side removal of `path` for when this client
    /// disconnects. The registration is one-shot: it is dropped once it
    /// fires and must be re-armed after every reconnect.
    async fn arm_disconnect_remove(&self, path: &StorePath) -> Result<(), MeshError>;

    /// Cancel a previously armed disconnect removal, if any.
    async fn cancel_disconnect_remove(&self, path: &StorePath) -> Result<(), MeshError>;

    /// The store's notion of server time, in epoch milliseconds. Used only
    /// for display timestamps, never for protocol correctness.
    fn now_millis(&self) -> i64;
}

/// Path layout helpers.
pub mod paths {
    use super::StorePath;

    /// `meetings/{meeting_id}/participants`
    #[must_use]
    pub fn participants(meeting_id: &str) -> StorePath {
        StorePath::new(&["meetings", meeting_id, "participants"])
    }

    /// `meetings/{meeting_id}/participants/{participant_id}`
    #[must_use]
    pub fn participant(meeting_id: &str, participant_id: &str) -> StorePath {
        participants(meeting_id).child(participant_id)
    }

    /// `meetings/{meeting_id}/signals/{recipient_id}`
    #[must_use]
    pub fn signals(meeting_id: &str, recipient_id: &str) -> StorePath {
        StorePath::new(&["meetings", meeting_id, "signals", recipient_id])
    }

    /// `meetings/{meeting_id}/signals/{recipient_id}/{key}`
    #[must_use]
    pub fn signal(meeting_id: &str, recipient_id: &str, key: &str) -> StorePath {
        signals(meeting_id, recipient_id).child(key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_store_path_join() {
        let path = StorePath::new(&["meetings", "m1", "participants"]);
        assert_eq!(path.as_str(), "meetings/m1/participants");
        assert_eq!(path.child("p1").as_str(), "meetings/m1/participants/p1");
    }

    #[test]
    fn test_path_layout() {
        assert_eq!(
            paths::participant("m1", "a1").as_str(),
            "meetings/m1/participants/a1"
        );
        assert_eq!(
            paths::signal("m1", "b1", "s00000001").as_str(),
            "meetings/m1/signals/b1/s00000001"
        );
    }

    #[test]
    fn test_display_matches_as_str() {
        let path = paths::signals("m1", "b1");
        assert_eq!(format!("{path}"), path.as_str());
    }
}
