//! Actor model for the mesh coordinator.
//!
//! One `MeshCoordinator` actor runs per active meeting attendance and owns
//! all mesh state. Store watchers, the relay subscription, and per-session
//! transport event pumps feed its mailbox; nothing mutates the mesh map
//! outside the actor task.
//!
//! ```text
//! MeshCoordinator (one per attendance)
//! ├── membership watcher task  -> MembershipAdded / MembershipRemoved
//! ├── relay subscription task  -> InboundSignal
//! └── N transport event pumps  -> Transport { remote_id, event }
//! ```
//!
//! # Modules
//!
//! - [`coordinator`] - the actor, its handle, and `attend`
//! - [`messages`] - mailbox messages and events to the presentation layer
//! - [`session`] - the per-remote `PeerSession` state machine

pub mod coordinator;
pub mod messages;
pub mod session;

pub use coordinator::{AttendRequest, MeshCoordinator, MeshHandle};
pub use messages::{CoordinatorMessage, MeshEvent, MeshState, SessionInfo};
pub use session::{PeerSession, SessionState};
