//! Scripted media transport and local media source.
//!
//! `MockTransport` performs a deterministic offer/answer/candidate
//! handshake over whatever relay the coordinator wires it to, emitting
//! `Connected` and a `RemoteStream` descriptor once its side of the
//! negotiation completes. With trickling enabled the receiver emits a
//! candidate *before* its answer, so consumers are exercised against
//! out-of-order candidate delivery.
//!
//! Tests needing failures grab a [`TransportControl`] from the factory and
//! inject `TransportEvent::Error` or `Closed` directly.

use mesh_coordinator::errors::MeshError;
use mesh_coordinator::media::{
    LocalMediaSource, LocalTracks, MediaTransport, MediaTransportFactory, PeerRole, RemoteStream,
    TrackInfo, TrackKind, TransportEvent,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Handle for injecting events into a created transport.
#[derive(Clone)]
pub struct TransportControl {
    pub label: String,
    pub role: PeerRole,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportControl {
    /// Push an event as if the transport emitted it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[derive(Default)]
struct FactoryInner {
    created: usize,
    controls: Vec<TransportControl>,
    fail_next_create: bool,
}

/// Factory producing [`MockTransport`]s.
#[derive(Clone, Default)]
pub struct MockMediaFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl MockMediaFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` call fail with a negotiation error.
    pub fn fail_next_create(&self) {
        lock(&self.inner).fail_next_create = true;
    }

    /// Controls for every transport created so far, in creation order.
    #[must_use]
    pub fn controls(&self) -> Vec<TransportControl> {
        lock(&self.inner).controls.clone()
    }

    /// Number of transports created.
    #[must_use]
    pub fn created_count(&self) -> usize {
        lock(&self.inner).created
    }
}

#[async_trait]
impl MediaTransportFactory for MockMediaFactory {
    async fn create(
        &self,
        role: PeerRole,
        _local_tracks: Arc<LocalTracks>,
        trickle: bool,
    ) -> Result<
        (
            Box<dyn MediaTransport>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        MeshError,
    > {
        let label = {
            let mut inner = lock(&self.inner);
            if inner.fail_next_create {
                inner.fail_next_create = false;
                return Err(MeshError::Negotiation(
                    "simulated transport creation failure".to_string(),
                ));
            }
            inner.created += 1;
            format!("t{}-{role}", inner.created)
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        lock(&self.inner).controls.push(TransportControl {
            label: label.clone(),
            role,
            event_tx: event_tx.clone(),
        });

        let transport = MockTransport {
            label,
            role,
            trickle,
            event_tx,
            negotiated: false,
            closed: false,
            candidates_seen: 0,
        };
        // The initiator creates the first offer immediately.
        if role == PeerRole::Initiator {
            transport.emit_signal(&json!({ "kind": "offer", "from": transport.label }));
            if trickle {
                transport.emit_signal(&json!({ "kind": "candidate", "from": transport.label }));
            }
        }

        Ok((Box::new(transport), event_rx))
    }
}

/// One scripted peer connection.
pub struct MockTransport {
    label: String,
    role: PeerRole,
    trickle: bool,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    negotiated: bool,
    closed: bool,
    candidates_seen: usize,
}

impl MockTransport {
    fn emit_signal(&self, payload: &serde_json::Value) {
        let bytes = Bytes::from(payload.to_string());
        let _ = self.event_tx.send(TransportEvent::Signal(bytes));
    }

    fn emit_connected(&self) {
        let _ = self.event_tx.send(TransportEvent::Connected);
        let stream = RemoteStream {
            stream_id: format!("stream-{}", self.label),
            tracks: remote_tracks(&self.label),
        };
        let _ = self.event_tx.send(TransportEvent::RemoteStream(stream));
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn receive_signal(&mut self, payload: Bytes) -> Result<(), MeshError> {
        if self.closed {
            return Err(MeshError::Negotiation("transport closed".to_string()));
        }

        let message: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| MeshError::Negotiation(format!("unparseable payload: {e}")))?;
        let kind = message.get("kind").and_then(|k| k.as_str()).unwrap_or("");

        match (kind, self.role) {
            ("offer", PeerRole::Receiver) if !self.negotiated => {
                self.negotiated = true;
                // Trickled candidates may precede the answer.
                if self.trickle {
                    self.emit_signal(&json!({ "kind": "candidate", "from": self.label }));
                }
                self.emit_signal(&json!({ "kind": "answer", "from": self.label }));
                self.emit_connected();
            }
            ("answer", PeerRole::Initiator) if !self.negotiated => {
                self.negotiated = true;
                self.emit_connected();
            }
            ("candidate", _) => {
                // Tolerated in any order, before or after the answer.
                self.candidates_seen += 1;
            }
            _ => {
                // Duplicate offer/answer or a role mismatch: ignored, the
                // relay is allowed to deliver twice.
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

fn remote_tracks(label: &str) -> Vec<TrackInfo> {
    vec![
        TrackInfo {
            id: format!("{label}-audio"),
            kind: TrackKind::Audio,
            label: "mock microphone".to_string(),
        },
        TrackInfo {
            id: format!("{label}-video"),
            kind: TrackKind::Video,
            label: "mock camera".to_string(),
        },
    ]
}

/// Local media source with grant/deny behavior and release tracking.
pub struct MockMediaSource {
    granted: bool,
    releases: AtomicUsize,
}

impl MockMediaSource {
    /// A source where the user granted camera/microphone access.
    #[must_use]
    pub fn granted() -> Self {
        Self {
            granted: true,
            releases: AtomicUsize::new(0),
        }
    }

    /// A source where the permission prompt was denied.
    #[must_use]
    pub fn denied() -> Self {
        Self {
            granted: false,
            releases: AtomicUsize::new(0),
        }
    }

    /// How many times the tracks have been released.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalMediaSource for MockMediaSource {
    async fn acquire(&self) -> Result<Arc<LocalTracks>, MeshError> {
        if !self.granted {
            return Err(MeshError::PermissionDenied(
                "camera and microphone access denied".to_string(),
            ));
        }
        Ok(Arc::new(LocalTracks {
            tracks: vec![
                TrackInfo {
                    id: "local-audio".to_string(),
                    kind: TrackKind::Audio,
                    label: "mock microphone".to_string(),
                },
                TrackInfo {
                    id: "local-video".to_string(),
                    kind: TrackKind::Video,
                    label: "mock camera".to_string(),
                },
            ],
        }))
    }

    async fn release(&self, _tracks: Arc<LocalTracks>) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

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

    fn tracks() -> Arc<LocalTracks> {
        Arc::new(LocalTracks { tracks: Vec::new() })
    }

    async fn drain_signals(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Vec<Bytes>, bool, Option<RemoteStream>) {
        let mut signals = Vec::new();
        let mut connected = false;
        let mut stream = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransportEvent::Signal(payload) => signals.push(payload),
                TransportEvent::Connected => connected = true,
                TransportEvent::RemoteStream(s) => stream = Some(s),
                _ => {}
            }
        }
        (signals, connected, stream)
    }

    #[tokio::test]
    async fn test_offer_answer_handshake() {
        let factory = MockMediaFactory::new();
        let (mut initiator, mut init_rx) = factory
            .create(PeerRole::Initiator, tracks(), true)
            .await
            .unwrap();
        let (mut receiver, mut recv_rx) = factory
            .create(PeerRole::Receiver, tracks(), true)
            .await
            .unwrap();

        // Initiator emits offer (+ trickled candidate) on creation.
        let (offers, connected, _) = drain_signals(&mut init_rx).await;
        assert_eq!(offers.len(), 2);
        assert!(!connected);

        // Deliver both to the receiver, candidate first to prove ordering
        // does not matter.
        receiver.receive_signal(offers[1].clone()).await.unwrap();
        receiver.receive_signal(offers[0].clone()).await.unwrap();

        let (answers, recv_connected, recv_stream) = drain_signals(&mut recv_rx).await;
        assert!(recv_connected);
        assert!(recv_stream.is_some());
        // Candidate before answer under trickling.
        assert_eq!(answers.len(), 2);

        for payload in answers {
            initiator.receive_signal(payload).await.unwrap();
        }
        let (_, init_connected, init_stream) = drain_signals(&mut init_rx).await;
        assert!(init_connected);
        assert!(init_stream.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_offer_ignored() {
        let factory = MockMediaFactory::new();
        let (mut receiver, mut rx) = factory
            .create(PeerRole::Receiver, tracks(), false)
            .await
            .unwrap();

        let offer = Bytes::from(json!({ "kind": "offer", "from": "x" }).to_string());
        receiver.receive_signal(offer.clone()).await.unwrap();
        let (first, connected, _) = drain_signals(&mut rx).await;
        assert!(connected);
        assert_eq!(first.len(), 1); // answer only, no trickle

        receiver.receive_signal(offer).await.unwrap();
        let (second, _, _) = drain_signals(&mut rx).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_signals() {
        let factory = MockMediaFactory::new();
        let (mut transport, _rx) = factory
            .create(PeerRole::Receiver, tracks(), true)
            .await
            .unwrap();
        transport.close().await;
        let offer = Bytes::from(json!({ "kind": "offer" }).to_string());
        assert!(matches!(
            transport.receive_signal(offer).await,
            Err(MeshError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_next_create() {
        let factory = MockMediaFactory::new();
        factory.fail_next_create();
        assert!(factory
            .create(PeerRole::Initiator, tracks(), true)
            .await
            .is_err());
        assert!(factory
            .create(PeerRole::Initiator, tracks(), true)
            .await
            .is_ok());
        assert_eq!(factory.created_count(), 1);
    }

    #[tokio::test]
    async fn test_media_source_grant_and_deny() {
        let granted = MockMediaSource::granted();
        let tracks = granted.acquire().await.unwrap();
        assert_eq!(tracks.tracks.len(), 2);
        granted.release(tracks).await;
        assert_eq!(granted.release_count(), 1);

        let denied = MockMediaSource::denied();
        assert!(matches!(
            denied.acquire().await,
            Err(MeshError::PermissionDenied(_))
        ));
    }
}
