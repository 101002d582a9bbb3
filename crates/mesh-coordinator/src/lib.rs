//! Peer-mesh signaling coordinator.
//!
//! This library establishes a full mesh of peer-to-peer media sessions among
//! the participants of a meeting. Signaling payloads travel through a shared
//! realtime key/value store acting as a message relay; the store and the
//! media transport are both injected capability traits, so the coordinator
//! itself never talks to a network.
//!
//! # Architecture
//!
//! One actor per local attendance:
//!
//! ```text
//! MeshCoordinator (one per active attendance)
//! ├── owns the mesh map (remote participant -> PeerSession)
//! ├── PresenceRegister (publishes/withdraws the local membership record)
//! ├── SignalRelay (per-recipient mailbox over the store)
//! └── PeerSession (one per remote participant, Initiator or Receiver)
//! ```
//!
//! All mesh-state mutation happens inside the coordinator actor; store
//! watchers and transport event pumps feed its mailbox over
//! `tokio::sync::mpsc` channels, so no locks guard the mesh map.
//!
//! # Key design decisions
//!
//! - **At most one session per remote**: membership events and inbound
//!   signals race freely; the existing-session check absorbs duplicates.
//! - **Role by join order**: a client initiates only toward participants
//!   whose membership record appears after its own record's echo; earlier
//!   participants are answered lazily on their first inbound offer.
//! - **Idempotent teardown**: explicit leave, page unload, and the store's
//!   disconnect hook may all fire for the same attendance; every cleanup
//!   path is a harmless no-op the second time.
//!
//! # Modules
//!
//! - [`actors`] - the coordinator actor and peer-session state machine
//! - [`config`] - configuration from environment with defaults
//! - [`errors`] - error taxonomy
//! - [`lifecycle`] - local media acquisition and unload cleanup
//! - [`media`] - media transport and local media capability traits
//! - [`presence`] - membership record publication and withdrawal
//! - [`relay`] - signaling mailbox over the store
//! - [`store`] - realtime store capability trait and path layout

pub mod actors;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod media;
pub mod presence;
pub mod relay;
pub mod store;

pub use actors::{AttendRequest, MeshCoordinator, MeshEvent, MeshHandle, MeshState, SessionState};
pub use config::MeshConfig;
pub use errors::MeshError;
pub use lifecycle::{arm_unload_cleanup, Attendance, LocalLifecycleManager};
pub use media::{
    LocalMediaSource, LocalTracks, MediaTransport, MediaTransportFactory, PeerRole, RemoteStream,
    TrackInfo, TrackKind, TransportEvent,
};
pub use presence::ParticipantRecord;
pub use store::{ChildEvent, ConnectionState, RealtimeStore, StorePath};
