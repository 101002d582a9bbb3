//! Presence register.
//!
//! Publishes and withdraws the local participant's membership record and
//! keeps the store's remove-on-disconnect hook armed. The connection state
//! may flip repeatedly over a session's life; the store drops one-shot
//! disconnect hooks when they fire, so the record is rewritten and the hook
//! re-armed on every `Connected` observation.

use crate::store::{paths, ConnectionState, RealtimeStore, StorePath};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A participant's live membership record.
///
/// Exactly one record exists per (meeting, participant) at a time;
/// last-writer-wins is acceptable because only the owning client writes
/// its own record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Human-readable display name.
    pub display_name: String,
    /// Server-assigned join timestamp in epoch milliseconds. Display only.
    pub joined_at: i64,
}

/// Publishes the local membership record and arms disconnect cleanup.
pub struct PresenceRegister {
    store: Arc<dyn RealtimeStore>,
    record_path: StorePath,
    participant_id: String,
    watcher_token: CancellationToken,
    left: AtomicBool,
}

impl PresenceRegister {
    /// Join a meeting: spawn a connection watcher that (re)publishes the
    /// membership record and re-arms the disconnect hook on every
    /// reconnection.
    ///
    /// The watcher is a child of `cancel_token` and stops with it.
    pub fn join(
        store: Arc<dyn RealtimeStore>,
        meeting_id: &str,
        participant_id: &str,
        display_name: &str,
        cancel_token: CancellationToken,
    ) -> Self {
        let record_path = paths::participant(meeting_id, participant_id);
        let watcher_token = cancel_token.child_token();

        let task_store = Arc::clone(&store);
        let task_path = record_path.clone();
        let task_token = watcher_token.clone();
        let task_name = display_name.to_string();
        let task_participant = participant_id.to_string();

        tokio::spawn(async move {
            let mut connection = task_store.watch_connection();
            loop {
                let state = *connection.borrow_and_update();
                if state == ConnectionState::Connected {
                    publish(&task_store, &task_path, &task_name, &task_participant).await;
                }
                tokio::select! {
                    () = task_token.cancelled() => break,
                    changed = connection.changed() => {
                        if changed.is_err() {
                            debug!(
                                target: "mesh.presence",
                                participant_id = %task_participant,
                                "connection watch closed, presence watcher exiting"
                            );
                            break;
                        }
                    }
                }
            }
        });

        Self {
            store,
            record_path,
            participant_id: participant_id.to_string(),
            watcher_token,
            left: AtomicBool::new(false),
        }
    }

    /// Withdraw the membership record.
    ///
    /// Idempotent: stops the watcher, cancels any still-armed disconnect
    /// hook (so a late network blip cannot resurrect a stale deletion
    /// trigger), and deletes the record. A disconnect hook firing after
    /// this is a harmless duplicate delete.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watcher_token.cancel();

        if let Err(e) = self.store.cancel_disconnect_remove(&self.record_path).await {
            warn!(
                target: "mesh.presence",
                participant_id = %self.participant_id,
                error = %e,
                "failed to cancel disconnect hook"
            );
        }
        if let Err(e) = self.store.remove(&self.record_path).await {
            warn!(
                target: "mesh.presence",
                participant_id = %self.participant_id,
                error = %e,
                "failed to delete membership record"
            );
        }

        info!(
            target: "mesh.presence",
            participant_id = %self.participant_id,
            "membership record withdrawn"
        );
    }

    /// Whether `leave` has run.
    #[must_use]
    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }
}

/// Write the record and re-arm the disconnect hook. Failures are logged
/// and tolerated; the store layer retries writes on its own.
async fn publish(
    store: &Arc<dyn RealtimeStore>,
    record_path: &StorePath,
    display_name: &str,
    participant_id: &str,
) {
    let record = ParticipantRecord {
        display_name: display_name.to_string(),
        joined_at: store.now_millis(),
    };
    let value = match serde_json::to_value(&record) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                target: "mesh.presence",
                participant_id = %participant_id,
                error = %e,
                "failed to serialize membership record"
            );
            return;
        }
    };

    if let Err(e) = store.set(record_path, value).await {
        warn!(
            target: "mesh.presence",
            participant_id = %participant_id,
            error = %e,
            "membership record write failed, store layer will retry"
        );
        return;
    }
    if let Err(e) = store.arm_disconnect_remove(record_path).await {
        warn!(
            target: "mesh.presence",
            participant_id = %participant_id,
            error = %e,
            "failed to arm disconnect hook"
        );
        return;
    }

    debug!(
        target: "mesh.presence",
        participant_id = %participant_id,
        path = %record_path,
        "membership record published, disconnect hook armed"
    );
}
