//! End-to-end mesh scenarios over the in-memory store.
//!
//! Each test drives one or more simulated clients (own store connection,
//! own media transport factory) against a single shared `MockStore`, the
//! way real clients share one cloud store.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use mesh_coordinator::actors::MeshState;
use mesh_coordinator::media::{LocalMediaSource, PeerRole};
use mesh_coordinator::relay::SignalRelay;
use mesh_coordinator::store::{paths, RealtimeStore};
use mesh_coordinator::{
    arm_unload_cleanup, AttendRequest, LocalLifecycleManager, MeshConfig, MeshCoordinator,
    MeshError, MeshEvent, MeshHandle, SessionState,
};
use mesh_test_utils::{
    init_test_tracing, MockMediaFactory, MockMediaSource, MockStore, MockStoreClient,
};

use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct TestClient {
    handle: MeshHandle,
    events: mpsc::Receiver<MeshEvent>,
    task: JoinHandle<()>,
    store_client: Arc<MockStoreClient>,
    media: Arc<MockMediaSource>,
    factory: Arc<MockMediaFactory>,
}

async fn attend(store: &MockStore, meeting_id: &str, id: &str, name: &str) -> TestClient {
    let store_client = store.client();
    let media = Arc::new(MockMediaSource::granted());
    let factory = Arc::new(MockMediaFactory::new());
    let local_tracks = media.acquire().await.unwrap();

    let store_arc: Arc<dyn RealtimeStore> = store_client.clone();
    let (handle, events, task) = MeshCoordinator::attend(AttendRequest {
        store: store_arc,
        transport_factory: factory.clone(),
        media_source: media.clone(),
        config: MeshConfig::default(),
        meeting_id: meeting_id.to_string(),
        local_participant_id: id.to_string(),
        display_name: name.to_string(),
        local_tracks,
    });

    TestClient {
        handle,
        events,
        task,
        store_client,
        media,
        factory,
    }
}

/// Receive events until one matches, with a timeout.
async fn wait_for_event<F>(client: &mut TestClient, mut pred: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let deadline = Duration::from_secs(2);
    loop {
        let event = timeout(deadline, client.events.recv())
            .await
            .expect("timed out waiting for mesh event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Poll the mesh state until a condition holds.
async fn wait_for_state<F>(handle: &MeshHandle, pred: F) -> MeshState
where
    F: Fn(&MeshState) -> bool,
{
    for _ in 0..200 {
        if let Ok(state) = handle.get_state().await {
            if pred(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for mesh state condition");
}

/// Poll an arbitrary condition.
async fn wait_until<F: Fn() -> bool>(pred: F, what: &str) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_two_party_scenario() {
    init_test_tracing();
    let store = MockStore::new();

    let mut a = attend(&store, "m1", "a1", "Alice").await;
    let mut b = attend(&store, "m1", "b1", "Bob").await;

    // A observes B's join and initiates; B answers A's offer.
    let joined = wait_for_event(&mut a, |e| {
        matches!(e, MeshEvent::ParticipantJoined { participant_id, .. } if participant_id == "b1")
    })
    .await;
    if let MeshEvent::ParticipantJoined { display_name, .. } = joined {
        assert_eq!(display_name, "Bob");
    }

    wait_for_event(&mut b, |e| {
        matches!(e, MeshEvent::ParticipantJoined { participant_id, .. } if participant_id == "a1")
    })
    .await;

    // Both sides converge to one connected session with media.
    wait_for_event(&mut a, |e| {
        matches!(e, MeshEvent::ParticipantStreamReady { participant_id, .. } if participant_id == "b1")
    })
    .await;
    wait_for_event(&mut b, |e| {
        matches!(e, MeshEvent::ParticipantStreamReady { participant_id, .. } if participant_id == "a1")
    })
    .await;

    // Role symmetry: exactly one side initiated.
    let a_state = wait_for_state(&a.handle, |s| {
        s.session("b1").is_some_and(|i| i.state == SessionState::Connected)
    })
    .await;
    let b_state = wait_for_state(&b.handle, |s| {
        s.session("a1").is_some_and(|i| i.state == SessionState::Connected)
    })
    .await;
    assert_eq!(a_state.sessions.len(), 1);
    assert_eq!(b_state.sessions.len(), 1);
    assert_eq!(a_state.session("b1").unwrap().role, PeerRole::Initiator);
    assert_eq!(b_state.session("a1").unwrap().role, PeerRole::Receiver);

    // B leaves: A sees the departure and drops the session.
    b.handle.leave().await;
    wait_for_event(&mut a, |e| {
        matches!(e, MeshEvent::ParticipantLeft { participant_id } if participant_id == "b1")
    })
    .await;
    let a_state = wait_for_state(&a.handle, |s| s.sessions.is_empty()).await;
    assert!(a_state.session("b1").is_none());
    assert!(store.value_at(&paths::participant("m1", "b1")).is_none());
    assert_eq!(b.media.release_count(), 1);

    a.handle.leave().await;
    let _ = timeout(Duration::from_secs(1), b.task).await;
    let _ = timeout(Duration::from_secs(1), a.task).await;
}

#[tokio::test]
async fn test_three_party_full_mesh() {
    init_test_tracing();
    let store = MockStore::new();

    let a = attend(&store, "m1", "a1", "Alice").await;
    let b = attend(&store, "m1", "b1", "Bob").await;
    let c = attend(&store, "m1", "c1", "Carol").await;

    let all_connected = |state: &MeshState| {
        state.sessions.len() == 2
            && state
                .sessions
                .iter()
                .all(|s| s.state == SessionState::Connected)
    };

    // Every client ends with two connected sessions regardless of order.
    let a_state = wait_for_state(&a.handle, all_connected).await;
    let b_state = wait_for_state(&b.handle, all_connected).await;
    let c_state = wait_for_state(&c.handle, all_connected).await;

    // Join order decides roles: earlier participants initiate toward later.
    assert_eq!(a_state.session("b1").unwrap().role, PeerRole::Initiator);
    assert_eq!(a_state.session("c1").unwrap().role, PeerRole::Initiator);
    assert_eq!(b_state.session("a1").unwrap().role, PeerRole::Receiver);
    assert_eq!(b_state.session("c1").unwrap().role, PeerRole::Initiator);
    assert_eq!(c_state.session("a1").unwrap().role, PeerRole::Receiver);
    assert_eq!(c_state.session("b1").unwrap().role, PeerRole::Receiver);

    for client in [a, b, c] {
        client.handle.leave().await;
    }
}

#[tokio::test]
async fn test_join_and_first_signal_race_yields_one_session() {
    init_test_tracing();
    let store = MockStore::new();

    let mut a = attend(&store, "m1", "a1", "Alice").await;
    wait_for_state(&a.handle, |s| !s.is_leaving).await;

    // A hand-rolled remote races its first offer ahead of its membership
    // record. Whichever event wins the race, exactly one session may exist.
    let remote = store.client();
    let relay = SignalRelay::new(remote.clone() as Arc<dyn RealtimeStore>, "m1");
    let offer = Bytes::from(json!({ "kind": "offer", "from": "z9" }).to_string());
    relay
        .send("z9", PeerRole::Initiator, "a1", &offer)
        .await
        .unwrap();
    remote
        .set(
            &paths::participant("m1", "z9"),
            json!({ "display_name": "Zed", "joined_at": 1 }),
        )
        .await
        .unwrap();

    // Exactly one session exists for z9. Its role depends on which event
    // arrived first (signal first: receiver; membership first: a1 keeps
    // the initiator role under the glare tie-break), but never two.
    let state = wait_for_state(&a.handle, |s| s.session("z9").is_some()).await;
    assert_eq!(state.sessions.len(), 1);

    // And exactly one join event was surfaced for z9.
    wait_for_event(&mut a, |e| {
        matches!(e, MeshEvent::ParticipantJoined { participant_id, .. } if participant_id == "z9")
    })
    .await;
    let state = a.handle.get_state().await.unwrap();
    assert_eq!(state.roster.iter().filter(|r| *r == "z9").count(), 1);

    a.handle.leave().await;
}

#[tokio::test]
async fn test_offer_glare_lower_id_keeps_initiator_role() {
    init_test_tracing();
    let store = MockStore::new();

    let mut a = attend(&store, "m1", "a1", "Alice").await;

    // The remote's membership record lands first: a1 initiates toward it.
    let remote = store.client();
    remote
        .set(
            &paths::participant("m1", "z9"),
            json!({ "display_name": "Zed", "joined_at": 1 }),
        )
        .await
        .unwrap();
    wait_for_state(&a.handle, |s| {
        s.session("z9").is_some_and(|i| i.role == PeerRole::Initiator)
    })
    .await;

    // Now the remote's own offer arrives: both sides initiated. The lower
    // id (a1) keeps its initiator session and drops the colliding offer.
    let relay = SignalRelay::new(remote.clone() as Arc<dyn RealtimeStore>, "m1");
    let offer = Bytes::from(json!({ "kind": "offer", "from": "z9" }).to_string());
    relay
        .send("z9", PeerRole::Initiator, "a1", &offer)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = a.handle.get_state().await.unwrap();
    assert_eq!(state.sessions.len(), 1);
    assert_eq!(state.session("z9").unwrap().role, PeerRole::Initiator);
    assert_eq!(a.factory.created_count(), 1);

    wait_for_event(&mut a, |e| {
        matches!(e, MeshEvent::ParticipantJoined { participant_id, .. } if participant_id == "z9")
    })
    .await;
    a.handle.leave().await;
}

#[tokio::test]
async fn test_offer_glare_higher_id_demotes_to_receiver() {
    init_test_tracing();
    let store = MockStore::new();

    let mut b = attend(&store, "m1", "b1", "Bob").await;

    let remote = store.client();
    remote
        .set(
            &paths::participant("m1", "a9"),
            json!({ "display_name": "Ann", "joined_at": 1 }),
        )
        .await
        .unwrap();
    wait_for_state(&b.handle, |s| {
        s.session("a9").is_some_and(|i| i.role == PeerRole::Initiator)
    })
    .await;

    // The remote also initiated, and its id orders below ours: the local
    // initiator session is torn down and recreated as a receiver, which
    // answers the offer and converges.
    let relay = SignalRelay::new(remote.clone() as Arc<dyn RealtimeStore>, "m1");
    let offer = Bytes::from(json!({ "kind": "offer", "from": "a9" }).to_string());
    relay
        .send("a9", PeerRole::Initiator, "b1", &offer)
        .await
        .unwrap();

    let state = wait_for_state(&b.handle, |s| {
        s.session("a9").is_some_and(|i| {
            i.role == PeerRole::Receiver && i.state == SessionState::Connected
        })
    })
    .await;
    assert_eq!(state.sessions.len(), 1);
    // One transport for the abandoned initiator attempt, one for the
    // receiver that converged.
    assert_eq!(b.factory.created_count(), 2);

    wait_for_event(&mut b, |e| {
        matches!(e, MeshEvent::ParticipantStreamReady { participant_id, .. } if participant_id == "a9")
    })
    .await;
    b.handle.leave().await;
}

#[tokio::test]
async fn test_leave_is_idempotent() {
    init_test_tracing();
    let store = MockStore::new();

    let a = attend(&store, "m1", "a1", "Alice").await;
    wait_until(
        || store.value_at(&paths::participant("m1", "a1")).is_some(),
        "membership record",
    )
    .await;

    a.handle.leave().await;
    a.handle.leave().await;

    assert!(store.value_at(&paths::participant("m1", "a1")).is_none());
    assert_eq!(a.media.release_count(), 1);
    let _ = timeout(Duration::from_secs(1), a.task).await;
}

#[tokio::test]
async fn test_duplicate_signal_delivery_is_dropped() {
    init_test_tracing();
    let store = MockStore::new();
    let client = store.client();

    let relay = SignalRelay::new(client.clone() as Arc<dyn RealtimeStore>, "m1");
    let (tx, mut rx) = mpsc::channel(8);
    let _subscription = relay.subscribe("a1", tx, 16, CancellationToken::new());

    let payload = Bytes::from_static(b"candidate");
    relay
        .send("b1", PeerRole::Receiver, "a1", &payload)
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.sender_id, "b1");
    assert_eq!(first.payload, payload);

    // The consumed envelope is deleted from the mailbox.
    let mailbox = paths::signals("m1", "a1");
    wait_until(|| store.children_of(&mailbox).is_empty(), "mailbox drain").await;

    // A late at-least-once redelivery of the same sequence key is dropped.
    // Re-publish under the same key by hand, then emit the duplicate.
    client
        .set(
            &mailbox.child(&first.sequence_key),
            serde_json::to_value(mesh_coordinator::relay::SignalEnvelope::new(
                "b1",
                PeerRole::Receiver,
                "a1",
                &payload,
            ))
            .unwrap(),
        )
        .await
        .unwrap();
    store.emit_duplicate_child(&mailbox, &first.sequence_key);

    let second = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(second.is_err(), "duplicate delivery must not be forwarded");
}

#[tokio::test]
async fn test_malformed_envelope_is_deleted_not_fatal() {
    init_test_tracing();
    let store = MockStore::new();
    let client = store.client();

    let relay = SignalRelay::new(client.clone() as Arc<dyn RealtimeStore>, "m1");
    let (tx, mut rx) = mpsc::channel(8);
    let _subscription = relay.subscribe("a1", tx, 16, CancellationToken::new());

    let mailbox = paths::signals("m1", "a1");
    client.push(&mailbox, json!({ "garbage": true })).await.unwrap();
    relay
        .send("b1", PeerRole::Receiver, "a1", &Bytes::from_static(b"after"))
        .await
        .unwrap();

    // The well-formed envelope still arrives and both items are deleted.
    let signal = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal.payload, Bytes::from_static(b"after"));
    wait_until(|| store.children_of(&mailbox).is_empty(), "mailbox drain").await;
}

#[tokio::test]
async fn test_disconnect_hook_removes_presence_and_peer_observes() {
    init_test_tracing();
    let store = MockStore::new();

    let mut a = attend(&store, "m1", "a1", "Alice").await;
    let b = attend(&store, "m1", "b1", "Bob").await;

    wait_for_state(&a.handle, |s| {
        s.session("b1").is_some_and(|i| i.state == SessionState::Connected)
    })
    .await;

    // B's network dies: no explicit leave, the armed hook fires instead.
    b.store_client.set_connected(false);

    wait_until(
        || store.value_at(&paths::participant("m1", "b1")).is_none(),
        "hook-driven record removal",
    )
    .await;
    wait_for_event(&mut a, |e| {
        matches!(e, MeshEvent::ParticipantLeft { participant_id } if participant_id == "b1")
    })
    .await;
    wait_for_state(&a.handle, |s| s.sessions.is_empty()).await;

    a.handle.leave().await;
    b.handle.leave().await;
}

#[tokio::test]
async fn test_presence_republishes_on_reconnect() {
    init_test_tracing();
    let store = MockStore::new();

    let a = attend(&store, "m1", "a1", "Alice").await;
    let record = paths::participant("m1", "a1");
    wait_until(|| store.value_at(&record).is_some(), "initial publish").await;

    // Drop the connection: the hook fires and is consumed.
    a.store_client.set_connected(false);
    wait_until(|| store.value_at(&record).is_none(), "hook removal").await;

    // Reconnect: the record comes back and the hook is re-armed.
    a.store_client.set_connected(true);
    wait_until(|| store.value_at(&record).is_some(), "republish").await;
    wait_until(
        || a.store_client.armed_hooks().contains(&record.as_str().to_string()),
        "hook re-arm",
    )
    .await;

    // After an explicit leave, a late connection blip must not resurrect
    // anything: the hook was cancelled and the delete already happened.
    a.handle.leave().await;
    assert!(store.value_at(&record).is_none());
    a.store_client.set_connected(false);
    a.store_client.set_connected(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.value_at(&record).is_none());
}

#[tokio::test]
async fn test_session_failure_is_isolated() {
    init_test_tracing();
    let store = MockStore::new();

    let mut a = attend(&store, "m1", "a1", "Alice").await;
    let b = attend(&store, "m1", "b1", "Bob").await;
    let c = attend(&store, "m1", "c1", "Carol").await;

    wait_for_state(&a.handle, |s| {
        s.sessions.len() == 2
            && s.sessions
                .iter()
                .all(|i| i.state == SessionState::Connected)
    })
    .await;

    // Fail A's transport toward B (created first, in join order).
    let controls = a.factory.controls();
    controls[0].emit(mesh_coordinator::media::TransportEvent::Error(
        "simulated ICE failure".to_string(),
    ));

    wait_for_event(&mut a, |e| {
        matches!(e, MeshEvent::ParticipantLeft { participant_id } if participant_id == "b1")
    })
    .await;

    // The c1 session is untouched; the mesh degraded to N-1, not zero.
    let state = a.handle.get_state().await.unwrap();
    assert_eq!(state.sessions.len(), 1);
    assert_eq!(
        state.session("c1").unwrap().state,
        SessionState::Connected
    );

    for client in [a, b, c] {
        client.handle.leave().await;
    }
}

#[tokio::test]
async fn test_permission_denied_is_terminal() {
    init_test_tracing();
    let store = MockStore::new();

    let manager = LocalLifecycleManager::new(Arc::new(MockMediaSource::denied()));
    let result = manager
        .attend(
            store.client() as Arc<dyn RealtimeStore>,
            Arc::new(MockMediaFactory::new()),
            MeshConfig::default(),
            "m1",
            "Alice",
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(MeshError::PermissionDenied(_))));
    // Nothing was written to the store.
    assert!(store.children_of(&paths::participants("m1")).is_empty());
}

#[tokio::test]
async fn test_unload_cleanup_leaves_meeting() {
    init_test_tracing();
    let store = MockStore::new();

    let media = Arc::new(MockMediaSource::granted());
    let manager = LocalLifecycleManager::new(media.clone());
    let attendance = manager
        .attend(
            store.client() as Arc<dyn RealtimeStore>,
            Arc::new(MockMediaFactory::new()),
            MeshConfig::default(),
            "m1",
            "Alice",
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let local_id = attendance.handle.local_participant_id().to_string();
    let record = paths::participant("m1", &local_id);
    wait_until(|| store.value_at(&record).is_some(), "publish").await;

    let unload = CancellationToken::new();
    let cleanup = arm_unload_cleanup(attendance.handle.clone(), unload.clone());

    unload.cancel();
    let _ = timeout(Duration::from_secs(1), cleanup).await;

    assert!(store.value_at(&record).is_none());
    assert_eq!(media.release_count(), 1);
    let _ = timeout(Duration::from_secs(1), attendance.task).await;
}

#[tokio::test]
async fn test_attend_cancelled_before_acquisition_completes() {
    init_test_tracing();
    let store = MockStore::new();

    let manager = LocalLifecycleManager::new(Arc::new(MockMediaSource::granted()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = manager
        .attend(
            store.client() as Arc<dyn RealtimeStore>,
            Arc::new(MockMediaFactory::new()),
            MeshConfig::default(),
            "m1",
            "Alice",
            cancel,
        )
        .await;

    assert!(matches!(result, Err(MeshError::Cancelled)));
    assert!(store.children_of(&paths::participants("m1")).is_empty());
}
