//! Local lifecycle manager.
//!
//! Acquires the local camera/microphone, drives `attend`, and arms a
//! cleanup task that guarantees `MeshHandle::leave` runs when the hosting
//! page or process terminates. The unload task and the store's disconnect
//! hook cover different failure windows: graceful unload versus network or
//! process death.

use crate::actors::{AttendRequest, MeshCoordinator, MeshEvent, MeshHandle};
use crate::config::MeshConfig;
use crate::errors::MeshError;
use crate::media::{LocalMediaSource, LocalTracks, MediaTransportFactory};
use crate::store::RealtimeStore;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A running meeting attendance.
pub struct Attendance {
    pub handle: MeshHandle,
    /// Events for the presentation layer.
    pub events: mpsc::Receiver<MeshEvent>,
    /// The coordinator actor task.
    pub task: JoinHandle<()>,
}

/// Drives local media acquisition and attendance lifecycle.
pub struct LocalLifecycleManager {
    media_source: Arc<dyn LocalMediaSource>,
}

impl LocalLifecycleManager {
    #[must_use]
    pub fn new(media_source: Arc<dyn LocalMediaSource>) -> Self {
        Self { media_source }
    }

    /// Acquire the local track set.
    ///
    /// A denied permission prompt is terminal for this client: no retry
    /// loop — the user must re-grant and the flow restarts from scratch.
    pub async fn acquire_local_media(&self) -> Result<Arc<LocalTracks>, MeshError> {
        match self.media_source.acquire().await {
            Ok(tracks) => {
                info!(
                    target: "mesh.lifecycle",
                    track_count = tracks.tracks.len(),
                    "local media acquired"
                );
                Ok(tracks)
            }
            Err(e) => {
                warn!(
                    target: "mesh.lifecycle",
                    error = %e,
                    "local media acquisition failed"
                );
                Err(e)
            }
        }
    }

    /// Acquire local media and attend a meeting.
    ///
    /// The local participant id is generated once per client session.
    /// `cancel` is a cooperative-cancellation point: cancelling during the
    /// permission prompt abandons the attend flow without touching the
    /// store, and already-acquired devices are released.
    pub async fn attend(
        &self,
        store: Arc<dyn RealtimeStore>,
        transport_factory: Arc<dyn MediaTransportFactory>,
        config: MeshConfig,
        meeting_id: &str,
        display_name: &str,
        cancel: CancellationToken,
    ) -> Result<Attendance, MeshError> {
        let local_tracks = tokio::select! {
            () = cancel.cancelled() => return Err(MeshError::Cancelled),
            tracks = self.acquire_local_media() => tracks?,
        };

        if cancel.is_cancelled() {
            self.media_source.release(local_tracks).await;
            return Err(MeshError::Cancelled);
        }

        let local_participant_id = uuid::Uuid::new_v4().to_string();
        let (handle, events, task) = MeshCoordinator::attend(AttendRequest {
            store,
            transport_factory,
            media_source: Arc::clone(&self.media_source),
            config,
            meeting_id: meeting_id.to_string(),
            local_participant_id,
            display_name: display_name.to_string(),
            local_tracks,
        });

        Ok(Attendance {
            handle,
            events,
            task,
        })
    }
}

/// Guarantee `handle.leave()` runs when `unload` fires.
///
/// Complements the presence register's disconnect hook: the hook covers
/// network and process death server-side, this task covers graceful
/// termination of the hosting context.
pub fn arm_unload_cleanup(handle: MeshHandle, unload: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        unload.cancelled().await;
        info!(
            target: "mesh.lifecycle",
            meeting_id = %handle.meeting_id(),
            "unload signal received, leaving meeting"
        );
        handle.leave().await;
    })
}
