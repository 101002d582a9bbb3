//! Media capability traits.
//!
//! The coordinator never touches real media. A `MediaTransport` wraps one
//! peer connection: the coordinator feeds it inbound signaling payloads and
//! consumes its events; ICE/DTLS/SRTP mechanics stay behind the trait.
//! Local tracks and remote streams are descriptors — the embedding
//! application maps their ids back to its real media objects.

use crate::errors::MeshError;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The two asymmetric roles in a peer negotiation.
///
/// Serialized into signal envelopes so a recipient can tell whether the
/// sender believes it is initiating; see the coordinator's glare handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Creates the first offer; begins negotiation immediately on creation.
    Initiator,
    /// Waits for an inbound payload before negotiating.
    Receiver,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Initiator => f.write_str("initiator"),
            PeerRole::Receiver => f.write_str("receiver"),
        }
    }
}

/// Kind of a media track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Descriptor of one media track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackInfo {
    /// Track identifier, unique within its stream.
    pub id: String,
    pub kind: TrackKind,
    /// Human-readable label (device name or similar).
    pub label: String,
}

/// The local track set, shared read-only across all peer sessions.
///
/// Only the local lifecycle manager releases the underlying devices, and
/// only after every session has been destroyed.
#[derive(Clone, Debug)]
pub struct LocalTracks {
    pub tracks: Vec<TrackInfo>,
}

/// Descriptor of a remote media stream produced by a transport.
#[derive(Clone, Debug)]
pub struct RemoteStream {
    /// Stream identifier, stable for the life of the session.
    pub stream_id: String,
    pub tracks: Vec<TrackInfo>,
}

/// Events emitted by a media transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// An outbound signaling payload to deliver to the remote peer.
    Signal(Bytes),
    /// The remote media stream became available.
    RemoteStream(RemoteStream),
    /// The transport reached the connected state.
    Connected,
    /// The transport closed (remote hangup or local close).
    Closed,
    /// The transport failed; terminal.
    Error(String),
}

/// One peer connection, created by a [`MediaTransportFactory`].
///
/// Transports live inside the coordinator actor's future, which is moved
/// across threads by the runtime, so implementations must be thread-safe.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Feed an inbound signaling payload into the transport. Out-of-order
    /// candidate delivery must be tolerated when trickling is enabled.
    async fn receive_signal(&mut self, payload: Bytes) -> Result<(), MeshError>;

    /// Release all transport resources. Must be idempotent.
    async fn close(&mut self);
}

/// Factory for media transports.
///
/// An `Initiator` transport begins negotiation during `create`; a
/// `Receiver` transport stays quiet until its first inbound payload.
#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(
        &self,
        role: PeerRole,
        local_tracks: Arc<LocalTracks>,
        trickle: bool,
    ) -> Result<
        (
            Box<dyn MediaTransport>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        MeshError,
    >;
}

/// Source of local camera/microphone tracks.
#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    /// Acquire the local track set. A denied permission prompt surfaces as
    /// [`MeshError::PermissionDenied`] and is terminal for the attend flow.
    async fn acquire(&self) -> Result<Arc<LocalTracks>, MeshError>;

    /// Stop the underlying devices. Idempotent.
    async fn release(&self, tracks: Arc<LocalTracks>);
}
