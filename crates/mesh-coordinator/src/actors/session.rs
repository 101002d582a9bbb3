//! Peer session state machine.
//!
//! Wraps one media transport in either role. The session owns the
//! transport; its events are pumped into the coordinator's mailbox by a
//! task cancelled together with the session. State transitions are applied
//! by the coordinator, which is the only mutator.
//!
//! `Closed` and `Failed` are terminal: a session is never resurrected, and
//! signaling a dead session is a logged no-op because late or duplicate
//! delivery from the relay is expected.

use crate::errors::MeshError;
use crate::media::{LocalTracks, MediaTransport, MediaTransportFactory, PeerRole, RemoteStream};

use super::messages::CoordinatorMessage;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle states of a peer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Receiver created, waiting for the first inbound payload.
    Created,
    /// Negotiation in progress.
    Negotiating,
    /// Media flowing.
    Connected,
    /// Closed by either side. Terminal.
    Closed,
    /// Negotiation or transport failure. Terminal.
    Failed,
}

impl SessionState {
    /// Whether the session can never leave this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// One peer-to-peer media session with a remote participant.
pub struct PeerSession {
    remote_id: String,
    role: PeerRole,
    state: SessionState,
    transport: Box<dyn MediaTransport>,
    pump_token: CancellationToken,
    close_timeout: Duration,
    remote_stream: Option<RemoteStream>,
}

impl PeerSession {
    /// Create a session and start pumping its transport events into the
    /// coordinator mailbox.
    ///
    /// An `Initiator` transport begins negotiation inside the factory; a
    /// `Receiver` stays in `Created` until [`PeerSession::signal`].
    pub async fn create(
        remote_id: &str,
        role: PeerRole,
        factory: &Arc<dyn MediaTransportFactory>,
        local_tracks: Arc<LocalTracks>,
        trickle: bool,
        close_timeout: Duration,
        cancel_token: &CancellationToken,
        outbox: mpsc::Sender<CoordinatorMessage>,
    ) -> Result<Self, MeshError> {
        let (transport, mut events) = factory.create(role, local_tracks, trickle).await?;

        let pump_token = cancel_token.child_token();
        let pump_cancel = pump_token.clone();
        let pump_remote = remote_id.to_string();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = pump_cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let message = CoordinatorMessage::Transport {
                    remote_id: pump_remote.clone(),
                    event,
                };
                if outbox.send(message).await.is_err() {
                    break;
                }
            }
        });

        let state = match role {
            PeerRole::Initiator => SessionState::Negotiating,
            PeerRole::Receiver => SessionState::Created,
        };

        debug!(
            target: "mesh.actor.session",
            remote_id = %remote_id,
            role = %role,
            "peer session created"
        );

        Ok(Self {
            remote_id: remote_id.to_string(),
            role,
            state,
            transport,
            pump_token,
            close_timeout,
            remote_stream: None,
        })
    }

    #[must_use]
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Feed an inbound signaling payload into the transport.
    ///
    /// A terminal session ignores the payload with a debug log; duplicate
    /// and late delivery are expected, not errors.
    pub async fn signal(&mut self, payload: Bytes) {
        if self.state.is_terminal() {
            debug!(
                target: "mesh.actor.session",
                remote_id = %self.remote_id,
                state = ?self.state,
                "ignoring signal for terminal session"
            );
            return;
        }
        if self.state == SessionState::Created {
            self.state = SessionState::Negotiating;
        }
        if let Err(e) = self.transport.receive_signal(payload).await {
            warn!(
                target: "mesh.actor.session",
                remote_id = %self.remote_id,
                error = %e,
                "transport rejected signaling payload"
            );
        }
    }

    /// Record the transport reaching the connected state.
    pub fn mark_connected(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Connected;
        }
    }

    /// Store the remote stream. Returns false if one was already set
    /// (duplicate transport event).
    pub fn set_remote_stream(&mut self, stream: RemoteStream) -> bool {
        if self.remote_stream.is_some() {
            return false;
        }
        self.remote_stream = Some(stream);
        true
    }

    /// Release transport resources and stop the event pump.
    ///
    /// Idempotent: the first call moves the session to `outcome` (which
    /// must be terminal); later calls are no-ops. The transport's close is
    /// bounded by the configured timeout so a wedged transport cannot
    /// stall attendance teardown.
    pub async fn close(&mut self, outcome: SessionState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if outcome.is_terminal() {
            outcome
        } else {
            SessionState::Closed
        };
        if tokio::time::timeout(self.close_timeout, self.transport.close())
            .await
            .is_err()
        {
            warn!(
                target: "mesh.actor.session",
                remote_id = %self.remote_id,
                timeout_ms = self.close_timeout.as_millis() as u64,
                "transport close timed out, abandoning it"
            );
        }
        self.pump_token.cancel();

        debug!(
            target: "mesh.actor.session",
            remote_id = %self.remote_id,
            state = ?self.state,
            "peer session closed"
        );
    }
}
