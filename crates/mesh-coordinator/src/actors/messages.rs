//! Mailbox messages and presentation-layer events.
//!
//! All communication into the coordinator actor is typed message passing
//! over `tokio::sync::mpsc`; request-reply uses `tokio::sync::oneshot`.

use crate::media::{PeerRole, RemoteStream, TransportEvent};
use crate::presence::ParticipantRecord;
use crate::relay::InboundSignal;

use super::session::SessionState;

use tokio::sync::oneshot;

/// Messages consumed by the coordinator actor.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A membership record appeared under the meeting's participants path.
    MembershipAdded {
        participant_id: String,
        record: ParticipantRecord,
    },

    /// A membership record was removed.
    MembershipRemoved { participant_id: String },

    /// An inbound signaling payload consumed from the relay.
    InboundSignal(InboundSignal),

    /// An event from one peer session's media transport.
    Transport {
        remote_id: String,
        event: TransportEvent,
    },

    /// Tear down the attendance. Idempotent.
    Leave { respond_to: oneshot::Sender<()> },

    /// Snapshot the mesh state (diagnostics and tests).
    GetState {
        respond_to: oneshot::Sender<MeshState>,
    },
}

/// Events surfaced to the presentation layer.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    /// A remote participant is present in the meeting. Emitted exactly once
    /// per remote, from whichever of the membership event or the first
    /// inbound signal arrives first.
    ParticipantJoined {
        participant_id: String,
        display_name: String,
    },

    /// A remote participant's media stream is ready for rendering.
    ParticipantStreamReady {
        participant_id: String,
        stream: RemoteStream,
    },

    /// A remote participant left or its session failed.
    ParticipantLeft { participant_id: String },
}

/// Diagnostic snapshot of one peer session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub remote_participant_id: String,
    pub role: PeerRole,
    pub state: SessionState,
}

/// Diagnostic snapshot of the mesh.
#[derive(Clone, Debug)]
pub struct MeshState {
    pub meeting_id: String,
    pub local_participant_id: String,
    /// Live sessions, one per remote participant.
    pub sessions: Vec<SessionInfo>,
    /// Remote participants known from membership or signaling.
    pub roster: Vec<String>,
    pub is_leaving: bool,
}

impl MeshState {
    /// Look up a session snapshot by remote id.
    #[must_use]
    pub fn session(&self, remote_id: &str) -> Option<&SessionInfo> {
        self.sessions
            .iter()
            .find(|s| s.remote_participant_id == remote_id)
    }
}
