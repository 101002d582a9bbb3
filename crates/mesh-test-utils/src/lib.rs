//! # Mesh test utilities
//!
//! Shared test doubles for `mesh-coordinator`: an in-memory realtime store
//! with Firebase-like semantics and a scripted media transport, so the
//! coordinator can be exercised end to end without real infrastructure.
//!
//! ## Modules
//!
//! - `mock_store` - shared in-memory store: ordered child replay, one-shot
//!   disconnect hooks, per-client connection state
//! - `mock_media` - scripted offer/answer/candidate transport and a local
//!   media source with grant/deny behavior
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::{MockMediaFactory, MockMediaSource, MockStore};
//!
//! let store = MockStore::new();
//! let client_a = store.client();
//! let client_b = store.client();
//! // Attend the same meeting from two clients and drive both coordinators.
//! ```

pub mod mock_media;
pub mod mock_store;

pub use mock_media::{MockMediaFactory, MockMediaSource, MockTransport, TransportControl};
pub use mock_store::{MockStore, MockStoreClient};

/// Install a test tracing subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_test_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
