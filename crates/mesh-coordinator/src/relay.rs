//! Signal relay channel.
//!
//! A per-(sender, recipient) mailbox over the store. Outbound payloads are
//! pushed under the recipient's signals path; the subscription consumes
//! inbound items and deletes each one from the store immediately after
//! forwarding, succeed or fail, so reconnect-triggered replays cannot
//! reprocess them. Payloads are opaque bytes; the relay never interprets
//! signaling semantics.
//!
//! Delivery is at-least-once: duplicates of the same store-assigned
//! sequence key are dropped by a bounded dedup cache. Order across
//! different senders is not guaranteed.

use crate::errors::MeshError;
use crate::media::PeerRole;
use crate::store::{paths, ChildEvent, RealtimeStore};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A signaling payload in transit through the store.
///
/// The payload is base64 inside the JSON value; the store-assigned child
/// key serves as the envelope's sequence key. `sender_role` is envelope
/// metadata, not payload interpretation: the recipient's coordinator uses
/// it to detect offer glare (both sides initiating toward each other).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub sender_id: String,
    /// The role the sender's session held when it produced this payload.
    pub sender_role: PeerRole,
    pub recipient_id: String,
    /// Opaque payload bytes, base64-encoded.
    pub payload: String,
}

impl SignalEnvelope {
    /// Wrap opaque payload bytes for transit.
    #[must_use]
    pub fn new(sender_id: &str, sender_role: PeerRole, recipient_id: &str, payload: &Bytes) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            sender_role,
            recipient_id: recipient_id.to_string(),
            payload: BASE64.encode(payload),
        }
    }

    /// Decode the payload bytes.
    pub fn payload_bytes(&self) -> Result<Bytes, MeshError> {
        BASE64
            .decode(&self.payload)
            .map(Bytes::from)
            .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))
    }
}

/// An inbound signal delivered to the coordinator.
#[derive(Clone, Debug)]
pub struct InboundSignal {
    pub sender_id: String,
    pub sender_role: PeerRole,
    pub payload: Bytes,
    /// Store-assigned child key of the consumed envelope.
    pub sequence_key: String,
}

/// Guard for an active relay subscription. Stops the consumer task when
/// cancelled or dropped.
pub struct RelaySubscription {
    cancel_token: CancellationToken,
}

impl RelaySubscription {
    /// Stop consuming inbound signals.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Mailbox abstraction over the store's signals paths.
#[derive(Clone)]
pub struct SignalRelay {
    store: Arc<dyn RealtimeStore>,
    meeting_id: String,
}

impl SignalRelay {
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>, meeting_id: &str) -> Self {
        Self {
            store,
            meeting_id: meeting_id.to_string(),
        }
    }

    /// Publish a payload into the recipient's mailbox.
    ///
    /// Write failures are transient; the store layer retries on its own,
    /// so callers log and continue.
    pub async fn send(
        &self,
        sender_id: &str,
        sender_role: PeerRole,
        recipient_id: &str,
        payload: &Bytes,
    ) -> Result<(), MeshError> {
        let envelope = SignalEnvelope::new(sender_id, sender_role, recipient_id, payload);
        let value = serde_json::to_value(&envelope)
            .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
        let mailbox = paths::signals(&self.meeting_id, recipient_id);
        let key = self.store.push(&mailbox, value).await?;
        debug!(
            target: "mesh.relay",
            sender_id = %sender_id,
            recipient_id = %recipient_id,
            sequence_key = %key,
            payload_len = payload.len(),
            "signal published"
        );
        Ok(())
    }

    /// Subscribe to the local participant's mailbox.
    ///
    /// Every consumed item is deleted from the store after the forward
    /// completes, whether or not decoding succeeded. Duplicate deliveries
    /// of the same sequence key are dropped; `dedup_capacity` bounds the
    /// cache of seen keys.
    pub fn subscribe(
        &self,
        local_id: &str,
        forward: mpsc::Sender<InboundSignal>,
        dedup_capacity: usize,
        cancel_token: CancellationToken,
    ) -> RelaySubscription {
        let store = Arc::clone(&self.store);
        let meeting_id = self.meeting_id.clone();
        let local_id = local_id.to_string();
        let token = cancel_token.clone();

        tokio::spawn(async move {
            let mailbox = paths::signals(&meeting_id, &local_id);
            let mut children = store.watch_children(&mailbox);
            let mut seen: HashSet<String> = HashSet::new();
            let mut seen_order: VecDeque<String> = VecDeque::new();

            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = children.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let ChildEvent::Added { key, value } = event else {
                    continue;
                };

                if !seen.insert(key.clone()) {
                    debug!(
                        target: "mesh.relay",
                        local_id = %local_id,
                        sequence_key = %key,
                        "duplicate signal delivery dropped"
                    );
                    continue;
                }
                seen_order.push_back(key.clone());
                if seen_order.len() > dedup_capacity {
                    if let Some(evicted) = seen_order.pop_front() {
                        seen.remove(&evicted);
                    }
                }

                match decode(&value) {
                    Ok((sender_id, sender_role, payload)) => {
                        let signal = InboundSignal {
                            sender_id,
                            sender_role,
                            payload,
                            sequence_key: key.clone(),
                        };
                        if forward.send(signal).await.is_err() {
                            // Coordinator gone; still delete the item below
                            // so it cannot replay, then stop.
                            delete_consumed(&store, &meeting_id, &local_id, &key).await;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            target: "mesh.relay",
                            local_id = %local_id,
                            sequence_key = %key,
                            error = %e,
                            "dropping malformed signal envelope"
                        );
                    }
                }

                delete_consumed(&store, &meeting_id, &local_id, &key).await;
            }

            debug!(
                target: "mesh.relay",
                local_id = %local_id,
                "relay subscription stopped"
            );
        });

        RelaySubscription { cancel_token }
    }
}

fn decode(value: &serde_json::Value) -> Result<(String, PeerRole, Bytes), MeshError> {
    let envelope: SignalEnvelope = serde_json::from_value(value.clone())
        .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    let payload = envelope.payload_bytes()?;
    Ok((envelope.sender_id, envelope.sender_role, payload))
}

async fn delete_consumed(
    store: &Arc<dyn RealtimeStore>,
    meeting_id: &str,
    local_id: &str,
    key: &str,
) {
    let path = paths::signal(meeting_id, local_id, key);
    if let Err(e) = store.remove(&path).await {
        warn!(
            target: "mesh.relay",
            local_id = %local_id,
            sequence_key = %key,
            error = %e,
            "failed to delete consumed signal"
        );
    }
}
