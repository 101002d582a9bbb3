//! Coordinator error types.
//!
//! The propagation policy is narrow: only local media acquisition failure
//! escalates to the caller of `attend`. Store write failures are logged and
//! tolerated (the store layer retries), and a negotiation failure removes
//! exactly one peer session without touching the rest of the mesh.

use thiserror::Error;

/// Mesh coordinator error type.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Local media acquisition was denied. Fatal to the attend flow; there
    /// is no automatic retry.
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    /// A store read/write failed. Transient; call sites log and continue.
    #[error("store error: {0}")]
    Store(String),

    /// A peer negotiation failed. Isolated to one session.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A signaling payload could not be decoded.
    #[error("malformed signal envelope: {0}")]
    MalformedEnvelope(String),

    /// The attendance was cancelled while an operation was in flight.
    #[error("cancelled")]
    Cancelled,

    /// An internal channel closed (the actor is gone).
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
