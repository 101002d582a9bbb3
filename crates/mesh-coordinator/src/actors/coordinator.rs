//! `MeshCoordinator` - the per-attendance actor that owns the mesh.
//!
//! Reacts to membership and signal events, decides when to create a peer
//! session and in which role, deduplicates concurrent creation, and routes
//! inbound payloads to the right session.
//!
//! # Role assignment
//!
//! A client initiates only toward participants whose membership record it
//! observes *after* the echo of its own record: membership events replay in
//! insertion order, so everything before the echo joined earlier and will
//! send us an offer instead. That makes role assignment deterministic by
//! join order — exactly one of the two sides initiates per pair. The
//! Receiver-side session is created lazily on the first inbound signal,
//! never by membership events, and the existing-session check absorbs the
//! race between a membership event and the first signal for the same
//! remote.
//!
//! # Offer glare
//!
//! A membership event crosses one channel hop while an inbound signal
//! crosses three, so a remote's membership record can outrun its
//! already-sent first offer; after a presence blink the same pair can also
//! end up initiating toward each other. Envelopes carry the sender's
//! session role, and an initiator-role signal arriving at a local
//! initiator session is resolved by id order: the lexicographically lower
//! participant id keeps the initiator role and drops the colliding offer,
//! the higher one closes its initiator session, recreates it as Receiver,
//! and answers. Both sides apply the same rule, so every glare converges
//! to exactly one session per pair.
//!
//! # Failure isolation
//!
//! One session entering `Failed` removes that session and emits
//! `ParticipantLeft` for that remote only; the mesh degrades to N-1
//! connections, never aborts wholesale.

use crate::config::MeshConfig;
use crate::errors::MeshError;
use crate::media::{
    LocalMediaSource, LocalTracks, MediaTransportFactory, PeerRole, TransportEvent,
};
use crate::presence::{ParticipantRecord, PresenceRegister};
use crate::relay::{InboundSignal, RelaySubscription, SignalRelay};
use crate::store::{paths, ChildEvent, RealtimeStore};

use super::messages::{CoordinatorMessage, MeshEvent, MeshState, SessionInfo};
use super::session::{PeerSession, SessionState};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Everything needed to attend a meeting.
pub struct AttendRequest {
    pub store: Arc<dyn RealtimeStore>,
    pub transport_factory: Arc<dyn MediaTransportFactory>,
    pub media_source: Arc<dyn LocalMediaSource>,
    pub config: MeshConfig,
    pub meeting_id: String,
    pub local_participant_id: String,
    pub display_name: String,
    pub local_tracks: Arc<LocalTracks>,
}

/// Handle to a running `MeshCoordinator`.
#[derive(Clone)]
pub struct MeshHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
    meeting_id: String,
    local_participant_id: String,
}

impl MeshHandle {
    #[must_use]
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    #[must_use]
    pub fn local_participant_id(&self) -> &str {
        &self.local_participant_id
    }

    /// Tear down the attendance: close every session, withdraw presence,
    /// release local media. Idempotent — calling twice, or racing the
    /// disconnect hook, produces the same end state.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(CoordinatorMessage::Leave { respond_to: tx })
            .await
            .is_err()
        {
            // Actor already gone; leave is a no-op.
            return;
        }
        let _ = rx.await;
    }

    /// Snapshot the mesh state.
    pub async fn get_state(&self) -> Result<MeshState, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| MeshError::ChannelClosed("coordinator mailbox"))?;
        rx.await
            .map_err(|_| MeshError::ChannelClosed("coordinator response"))
    }

    /// Cancel the coordinator actor outright.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token tied to this attendance's lifetime.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The coordinator actor.
pub struct MeshCoordinator {
    meeting_id: String,
    local_participant_id: String,
    receiver: mpsc::Receiver<CoordinatorMessage>,
    self_sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
    /// Token for the membership watcher and relay adapter tasks.
    watcher_token: CancellationToken,
    event_tx: mpsc::Sender<MeshEvent>,
    relay: SignalRelay,
    relay_subscription: RelaySubscription,
    presence: PresenceRegister,
    transport_factory: Arc<dyn MediaTransportFactory>,
    media_source: Arc<dyn LocalMediaSource>,
    local_tracks: Arc<LocalTracks>,
    config: MeshConfig,
    /// The mesh map: at most one session per remote participant.
    sessions: HashMap<String, PeerSession>,
    /// Known remote participants and their membership metadata.
    roster: HashMap<String, ParticipantRecord>,
    /// Set once our own membership record's echo arrives; records observed
    /// before it belong to participants who joined earlier.
    saw_own_record: bool,
    has_left: bool,
}

impl MeshCoordinator {
    /// Attend a meeting.
    ///
    /// Publishes presence, subscribes to membership and the local signal
    /// mailbox, and spawns the coordinator actor. Returns the handle, the
    /// event stream for the presentation layer, and the actor task handle.
    pub fn attend(
        request: AttendRequest,
    ) -> (MeshHandle, mpsc::Receiver<MeshEvent>, JoinHandle<()>) {
        let AttendRequest {
            store,
            transport_factory,
            media_source,
            config,
            meeting_id,
            local_participant_id,
            display_name,
            local_tracks,
        } = request;

        let cancel_token = CancellationToken::new();
        let watcher_token = cancel_token.child_token();
        let (sender, receiver) = mpsc::channel(config.coordinator_mailbox);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

        // Subscribe to membership before publishing presence so the echo of
        // our own record lands behind every earlier participant's replay.
        let membership = store.watch_children(&paths::participants(&meeting_id));
        spawn_membership_watcher(membership, sender.clone(), watcher_token.clone());

        let relay = SignalRelay::new(Arc::clone(&store), &meeting_id);
        let (signal_tx, signal_rx) = mpsc::channel(config.coordinator_mailbox);
        let relay_subscription = relay.subscribe(
            &local_participant_id,
            signal_tx,
            config.relay_dedup_capacity,
            watcher_token.child_token(),
        );
        spawn_signal_adapter(signal_rx, sender.clone(), watcher_token.clone());

        let presence = PresenceRegister::join(
            Arc::clone(&store),
            &meeting_id,
            &local_participant_id,
            &display_name,
            cancel_token.clone(),
        );

        let actor = Self {
            meeting_id: meeting_id.clone(),
            local_participant_id: local_participant_id.clone(),
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            watcher_token,
            event_tx,
            relay,
            relay_subscription,
            presence,
            transport_factory,
            media_source,
            local_tracks,
            config,
            sessions: HashMap::new(),
            roster: HashMap::new(),
            saw_own_record: false,
            has_left: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = MeshHandle {
            sender,
            cancel_token,
            meeting_id,
            local_participant_id,
        };

        (handle, event_rx, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "mesh.actor.coordinator", fields(
        meeting_id = %self.meeting_id,
        local_participant_id = %self.local_participant_id
    ))]
    async fn run(mut self) {
        info!(
            target: "mesh.actor.coordinator",
            meeting_id = %self.meeting_id,
            "coordinator started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.teardown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            if self.has_left {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "mesh.actor.coordinator",
                                "mailbox closed, coordinator exiting"
                            );
                            self.teardown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "mesh.actor.coordinator",
            meeting_id = %self.meeting_id,
            "coordinator stopped"
        );
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::MembershipAdded {
                participant_id,
                record,
            } => {
                self.handle_membership_added(participant_id, record).await;
            }

            CoordinatorMessage::MembershipRemoved { participant_id } => {
                self.handle_membership_removed(&participant_id).await;
            }

            CoordinatorMessage::InboundSignal(signal) => {
                self.handle_inbound_signal(signal).await;
            }

            CoordinatorMessage::Transport { remote_id, event } => {
                self.handle_transport(&remote_id, event).await;
            }

            CoordinatorMessage::Leave { respond_to } => {
                self.teardown().await;
                let _ = respond_to.send(());
            }

            CoordinatorMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// A membership record appeared.
    async fn handle_membership_added(&mut self, participant_id: String, record: ParticipantRecord) {
        if participant_id == self.local_participant_id {
            self.saw_own_record = true;
            debug!(
                target: "mesh.actor.coordinator",
                "own membership record echoed"
            );
            return;
        }

        let newly_known = !self.roster.contains_key(&participant_id);
        let display_name = record.display_name.clone();
        self.roster.insert(participant_id.clone(), record);

        if newly_known {
            self.emit(MeshEvent::ParticipantJoined {
                participant_id: participant_id.clone(),
                display_name,
            })
            .await;
        }

        if self.sessions.contains_key(&participant_id) {
            // Metadata refresh, or the first-signal race already built the
            // session; the existing-session check absorbs it.
            return;
        }

        if !self.saw_own_record {
            debug!(
                target: "mesh.actor.coordinator",
                remote_id = %participant_id,
                "participant joined earlier, awaiting its offer"
            );
            return;
        }

        info!(
            target: "mesh.actor.coordinator",
            remote_id = %participant_id,
            "participant joined, initiating session"
        );
        self.create_session(&participant_id, PeerRole::Initiator)
            .await;
    }

    /// A membership record disappeared: explicit leave or disconnect hook.
    async fn handle_membership_removed(&mut self, participant_id: &str) {
        if participant_id == self.local_participant_id {
            // Stale disconnect hook fired behind our back; presence
            // republishes on the next reconnect.
            debug!(
                target: "mesh.actor.coordinator",
                "own membership record removed"
            );
            return;
        }

        let was_known = self.roster.remove(participant_id).is_some();
        let had_session = if let Some(mut session) = self.sessions.remove(participant_id) {
            session.close(SessionState::Closed).await;
            true
        } else {
            false
        };

        if was_known || had_session {
            info!(
                target: "mesh.actor.coordinator",
                remote_id = %participant_id,
                remaining_sessions = self.sessions.len(),
                "participant left"
            );
            self.emit(MeshEvent::ParticipantLeft {
                participant_id: participant_id.to_string(),
            })
            .await;
        }
    }

    /// An inbound payload from the relay.
    async fn handle_inbound_signal(&mut self, signal: InboundSignal) {
        let InboundSignal {
            sender_id,
            sender_role,
            payload,
            ..
        } = signal;

        if sender_id == self.local_participant_id {
            return;
        }

        let glare = sender_role == PeerRole::Initiator
            && self
                .sessions
                .get(&sender_id)
                .is_some_and(|s| s.role() == PeerRole::Initiator);
        if glare {
            self.resolve_glare(&sender_id, payload).await;
            return;
        }

        if let Some(session) = self.sessions.get_mut(&sender_id) {
            session.signal(payload).await;
            return;
        }

        // First signal from an unseen remote: it initiated, we receive.
        if !self.roster.contains_key(&sender_id) {
            // Signal raced ahead of the membership event; a placeholder
            // name holds until the record arrives.
            self.roster.insert(
                sender_id.clone(),
                ParticipantRecord {
                    display_name: sender_id.clone(),
                    joined_at: 0,
                },
            );
            let display_name = sender_id.clone();
            self.emit(MeshEvent::ParticipantJoined {
                participant_id: sender_id.clone(),
                display_name,
            })
            .await;
        }

        info!(
            target: "mesh.actor.coordinator",
            remote_id = %sender_id,
            "first inbound signal, creating receiver session"
        );
        if self.create_session(&sender_id, PeerRole::Receiver).await {
            if let Some(session) = self.sessions.get_mut(&sender_id) {
                session.signal(payload).await;
            }
        }
    }

    /// An event from one session's media transport.
    async fn handle_transport(&mut self, remote_id: &str, event: TransportEvent) {
        match event {
            TransportEvent::Signal(payload) => {
                self.send_signal(remote_id, payload).await;
            }

            TransportEvent::RemoteStream(stream) => {
                if let Some(session) = self.sessions.get_mut(remote_id) {
                    if session.set_remote_stream(stream.clone()) {
                        self.emit(MeshEvent::ParticipantStreamReady {
                            participant_id: remote_id.to_string(),
                            stream,
                        })
                        .await;
                    }
                }
            }

            TransportEvent::Connected => {
                if let Some(session) = self.sessions.get_mut(remote_id) {
                    session.mark_connected();
                    info!(
                        target: "mesh.actor.coordinator",
                        remote_id = %remote_id,
                        "peer session connected"
                    );
                }
            }

            TransportEvent::Closed => {
                self.drop_session(remote_id, SessionState::Closed).await;
            }

            TransportEvent::Error(error) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    remote_id = %remote_id,
                    error = %error,
                    "peer session failed"
                );
                self.drop_session(remote_id, SessionState::Failed).await;
            }
        }
    }

    /// Create a session for `remote_id` unless one exists. Returns whether
    /// a session is present afterwards.
    async fn create_session(&mut self, remote_id: &str, role: PeerRole) -> bool {
        if self.sessions.contains_key(remote_id) {
            return true;
        }

        let created = PeerSession::create(
            remote_id,
            role,
            &self.transport_factory,
            Arc::clone(&self.local_tracks),
            self.config.trickle_ice,
            self.config.session_close_timeout,
            &self.cancel_token,
            self.self_sender.clone(),
        )
        .await;

        match created {
            Ok(session) => {
                self.sessions.insert(remote_id.to_string(), session);
                true
            }
            Err(e) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    remote_id = %remote_id,
                    role = %role,
                    error = %e,
                    "failed to create peer session"
                );
                self.roster.remove(remote_id);
                self.emit(MeshEvent::ParticipantLeft {
                    participant_id: remote_id.to_string(),
                })
                .await;
                false
            }
        }
    }

    /// Both sides initiated toward each other. Deterministic tie-break:
    /// the lower participant id keeps the initiator role and drops the
    /// colliding offer; the higher one demotes to Receiver and answers.
    async fn resolve_glare(&mut self, remote_id: &str, payload: Bytes) {
        if self
            .sessions
            .get(remote_id)
            .is_some_and(|s| s.state() == SessionState::Connected)
        {
            // The pair already converged; a glare offer this late is stale.
            debug!(
                target: "mesh.actor.coordinator",
                remote_id = %remote_id,
                "dropping stale initiator signal for connected session"
            );
            return;
        }

        if self.local_participant_id.as_str() < remote_id {
            debug!(
                target: "mesh.actor.coordinator",
                remote_id = %remote_id,
                "offer glare, keeping initiator role"
            );
            return;
        }

        info!(
            target: "mesh.actor.coordinator",
            remote_id = %remote_id,
            "offer glare, demoting to receiver"
        );
        if let Some(mut session) = self.sessions.remove(remote_id) {
            session.close(SessionState::Closed).await;
        }
        if self.create_session(remote_id, PeerRole::Receiver).await {
            if let Some(session) = self.sessions.get_mut(remote_id) {
                session.signal(payload).await;
            }
        }
    }

    /// Forward an outbound payload from a session's transport to the relay.
    async fn send_signal(&self, remote_id: &str, payload: Bytes) {
        let Some(role) = self.sessions.get(remote_id).map(PeerSession::role) else {
            // Late event from a torn-down session's pump.
            return;
        };
        if let Err(e) = self
            .relay
            .send(&self.local_participant_id, role, remote_id, &payload)
            .await
        {
            warn!(
                target: "mesh.actor.coordinator",
                remote_id = %remote_id,
                error = %e,
                "relay write failed, store layer will retry"
            );
        }
    }

    /// Close and remove one session, emitting `ParticipantLeft` for it.
    async fn drop_session(&mut self, remote_id: &str, outcome: SessionState) {
        if let Some(mut session) = self.sessions.remove(remote_id) {
            session.close(outcome).await;
            self.roster.remove(remote_id);
            self.emit(MeshEvent::ParticipantLeft {
                participant_id: remote_id.to_string(),
            })
            .await;
        }
    }

    /// Tear everything down. Idempotent.
    async fn teardown(&mut self) {
        if self.has_left {
            return;
        }
        self.has_left = true;

        info!(
            target: "mesh.actor.coordinator",
            meeting_id = %self.meeting_id,
            sessions = self.sessions.len(),
            "leaving meeting"
        );

        let drained: Vec<PeerSession> = self.sessions.drain().map(|(_, s)| s).collect();
        for mut session in drained {
            session.close(SessionState::Closed).await;
        }
        self.roster.clear();

        self.relay_subscription.stop();
        self.watcher_token.cancel();
        self.presence.leave().await;
        self.media_source
            .release(Arc::clone(&self.local_tracks))
            .await;

        self.cancel_token.cancel();

        info!(
            target: "mesh.actor.coordinator",
            meeting_id = %self.meeting_id,
            "attendance torn down"
        );
    }

    fn snapshot(&self) -> MeshState {
        MeshState {
            meeting_id: self.meeting_id.clone(),
            local_participant_id: self.local_participant_id.clone(),
            sessions: self
                .sessions
                .values()
                .map(|s| SessionInfo {
                    remote_participant_id: s.remote_id().to_string(),
                    role: s.role(),
                    state: s.state(),
                })
                .collect(),
            roster: self.roster.keys().cloned().collect(),
            is_leaving: self.has_left,
        }
    }

    async fn emit(&self, event: MeshEvent) {
        // The presentation layer may have dropped its receiver; that only
        // means nobody is rendering anymore.
        let _ = self.event_tx.send(event).await;
    }
}

/// Forward membership child events into the coordinator mailbox.
fn spawn_membership_watcher(
    mut children: mpsc::UnboundedReceiver<ChildEvent>,
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel_token.cancelled() => break,
                event = children.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let message = match event {
                ChildEvent::Added { key, value } => {
                    match serde_json::from_value::<ParticipantRecord>(value) {
                        Ok(record) => CoordinatorMessage::MembershipAdded {
                            participant_id: key,
                            record,
                        },
                        Err(e) => {
                            warn!(
                                target: "mesh.actor.coordinator",
                                participant_id = %key,
                                error = %e,
                                "skipping malformed membership record"
                            );
                            continue;
                        }
                    }
                }
                ChildEvent::Removed { key } => CoordinatorMessage::MembershipRemoved {
                    participant_id: key,
                },
            };

            if sender.send(message).await.is_err() {
                break;
            }
        }
    });
}

/// Forward consumed relay signals into the coordinator mailbox.
fn spawn_signal_adapter(
    mut signals: mpsc::Receiver<InboundSignal>,
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                () = cancel_token.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            if sender
                .send(CoordinatorMessage::InboundSignal(signal))
                .await
                .is_err()
            {
                break;
            }
        }
    });
}
