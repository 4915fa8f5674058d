use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cove_store::ConversationStore;
use cove_types::error::{CoreError, CoreResult};
use cove_types::events::{ClientCommand, ServerEvent};
use cove_types::models::{DeliveryState, PresenceState, StoredMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::presence::PresenceTracker;
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Payload kinds the core accepts. The payload body stays opaque; only
/// the tag and the serialized size are inspected.
const ALLOWED_PAYLOAD_KINDS: &[&str] = &["text", "file", "voice"];

/// Bounded backoff for persistence faults: 3 attempts, doubling delay.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);

const MAX_EMOJI_BYTES: usize = 32;

/// Routes every inbound event through its pipeline. Durable messages:
/// `Received → Validated → Persisted → FannedOut → Acknowledged`.
/// Ephemeral events (typing, reaction) skip `Persisted`. Fan-out
/// failures stay local to the failing connection and never roll back
/// persistence or reach the sender.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    store: ConversationStore,
    registry: ConnectionRegistry,
    presence: PresenceTracker,
    reactions: ReactionBook,
    max_payload_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        store: ConversationStore,
        registry: ConnectionRegistry,
        presence: PresenceTracker,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                registry,
                presence,
                reactions: ReactionBook::default(),
                max_payload_bytes,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub fn store(&self) -> &ConversationStore {
        &self.inner.store
    }

    /// Register a connection for an authenticated user: queue the Ready
    /// event and a presence snapshot of everyone already online, then
    /// announce the user if this is their first live connection.
    pub async fn connect(
        &self,
        user_id: Uuid,
        username: &str,
    ) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let registry = &self.inner.registry;
        let (connection_id, rx, came_online) = registry.register(user_id).await;

        let _ = registry
            .send_to(
                connection_id,
                ServerEvent::Ready {
                    user_id,
                    username: username.to_string(),
                },
            )
            .await;

        // Existing online users first, so the new client sees who is
        // already here before its own announcement echoes back.
        for online in registry.online_users().await {
            if online == user_id {
                continue;
            }
            let _ = registry
                .send_to(
                    connection_id,
                    ServerEvent::Presence {
                        user_id: online,
                        state: PresenceState::Online,
                    },
                )
                .await;
        }

        if came_online {
            registry
                .broadcast(&ServerEvent::Presence {
                    user_id,
                    state: PresenceState::Online,
                })
                .await;
        }

        (connection_id, rx)
    }

    /// Tear down a connection. Cancels only this connection's pending
    /// sends; nothing durable is touched.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let registry = &self.inner.registry;
        if let Some((user_id, went_offline)) = registry.unregister(connection_id).await {
            if went_offline {
                self.inner.presence.clear_user(user_id);
                registry
                    .broadcast(&ServerEvent::Presence {
                        user_id,
                        state: PresenceState::Offline,
                    })
                    .await;
            }
        }
    }

    /// Entry point for every parsed client command. Failures are
    /// reported to the originating connection only.
    pub async fn handle_command(
        &self,
        connection_id: ConnectionId,
        user_id: Uuid,
        command: ClientCommand,
    ) {
        let (conversation_id, result) = match command {
            ClientCommand::Subscribe {
                conversation_id,
                last_seen_seq,
            } => (
                conversation_id,
                self.subscribe(connection_id, user_id, conversation_id, last_seen_seq)
                    .await,
            ),
            ClientCommand::Message {
                conversation_id,
                payload,
            } => (
                conversation_id,
                self.ingest_message(connection_id, user_id, conversation_id, payload)
                    .await,
            ),
            ClientCommand::Typing { conversation_id } => (
                conversation_id,
                self.typing(user_id, conversation_id).await,
            ),
            ClientCommand::Reaction {
                conversation_id,
                message_id,
                emoji,
                remove,
            } => (
                conversation_id,
                self.reaction(user_id, conversation_id, message_id, emoji, remove)
                    .await,
            ),
            ClientCommand::Ack {
                conversation_id,
                message_id,
                state,
            } => (
                conversation_id,
                self.ack(user_id, message_id, state).await,
            ),
        };

        if let Err(err) = result {
            self.report_error(connection_id, Some(conversation_id), err)
                .await;
        }
    }

    /// Reconciliation: replay the gap between the client's cursor and
    /// the current head, or signal a resync when the gap exceeds
    /// retained history. Live events buffered during replay are flushed
    /// afterwards, so per-connection sequence order holds.
    async fn subscribe(
        &self,
        connection_id: ConnectionId,
        user_id: Uuid,
        conversation_id: Uuid,
        last_seen_seq: Option<u64>,
    ) -> CoreResult<()> {
        let store = &self.inner.store;
        let registry = &self.inner.registry;

        if !store.is_member(conversation_id, user_id).await? {
            return Err(CoreError::NotAMember {
                user_id,
                conversation_id,
            });
        }

        if !registry
            .begin_subscription(connection_id, conversation_id)
            .await
        {
            return Ok(());
        }

        let head = store.head_seq(conversation_id).await?;
        let last_seen = last_seen_seq.unwrap_or(0);

        if last_seen < head {
            match store
                .read_range(conversation_id, last_seen + 1, head)
                .await
            {
                Ok(replay) => {
                    debug!(
                        %conversation_id,
                        %connection_id,
                        from = last_seen + 1,
                        to = head,
                        "replaying reconciliation gap"
                    );
                    for message in replay {
                        if !registry
                            .send_to(connection_id, message_event(&message))
                            .await?
                        {
                            // Connection went away mid-replay.
                            return Ok(());
                        }
                    }
                }
                Err(CoreError::Unavailable { earliest_retained }) => {
                    debug!(
                        %conversation_id,
                        %connection_id,
                        earliest_retained,
                        "gap exceeds retention, signaling resync"
                    );
                    if !registry
                        .send_to(
                            connection_id,
                            ServerEvent::ResyncRequired { conversation_id },
                        )
                        .await?
                    {
                        return Ok(());
                    }
                }
                Err(other) => return Err(other),
            }
        }

        registry
            .finish_subscription(connection_id, conversation_id, head)
            .await
    }

    /// The durable path. Membership is enforced by the store before any
    /// sequence number is assigned; the sequence number rides on the
    /// fan-out event so every recipient observes the same order.
    async fn ingest_message(
        &self,
        connection_id: ConnectionId,
        user_id: Uuid,
        conversation_id: Uuid,
        payload: serde_json::Value,
    ) -> CoreResult<()> {
        self.validate_payload(&payload)?;

        let message = self.persist(conversation_id, user_id, payload).await?;

        self.inner
            .registry
            .fan_out(conversation_id, &message_event(&message))
            .await;

        let _ = self
            .inner
            .registry
            .send_to(
                connection_id,
                ServerEvent::Ack {
                    conversation_id,
                    message_id: message.id,
                    sequence_number: message.seq,
                    timestamp: message.created_at,
                },
            )
            .await;

        Ok(())
    }

    /// Append with bounded backoff. Only storage faults retry;
    /// authorization and validation failures surface immediately. A
    /// message is never silently dropped: exhausted retries surface as
    /// `PersistenceFailed` to the sender.
    async fn persist(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: serde_json::Value,
    ) -> CoreResult<StoredMessage> {
        let mut attempt = 0;
        loop {
            match self
                .inner
                .store
                .append(conversation_id, sender_id, payload.clone())
                .await
            {
                Ok(message) => return Ok(message),
                Err(CoreError::Storage(reason)) => {
                    attempt += 1;
                    if attempt >= PERSIST_ATTEMPTS {
                        return Err(CoreError::PersistenceFailed(reason));
                    }
                    let backoff = PERSIST_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(
                        %conversation_id,
                        attempt,
                        ?backoff,
                        %reason,
                        "append failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn typing(&self, user_id: Uuid, conversation_id: Uuid) -> CoreResult<()> {
        if !self.inner.store.is_member(conversation_id, user_id).await? {
            return Err(CoreError::NotAMember {
                user_id,
                conversation_id,
            });
        }

        self.inner.presence.note_typing(user_id, conversation_id);
        self.inner
            .registry
            .fan_out(
                conversation_id,
                &ServerEvent::Typing {
                    conversation_id,
                    user_id,
                },
            )
            .await;
        Ok(())
    }

    async fn reaction(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
        emoji: String,
        remove: bool,
    ) -> CoreResult<()> {
        if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
            return Err(CoreError::UnsupportedPayload(format!(
                "emoji of {} bytes",
                emoji.len()
            )));
        }
        if !self.inner.store.is_member(conversation_id, user_id).await? {
            return Err(CoreError::NotAMember {
                user_id,
                conversation_id,
            });
        }
        match self.inner.store.message_meta(message_id).await? {
            Some((convo, _)) if convo == conversation_id => {}
            _ => return Err(CoreError::UnknownMessage(message_id)),
        }

        if self
            .inner
            .reactions
            .apply(message_id, user_id, &emoji, remove)
        {
            self.inner
                .registry
                .fan_out(
                    conversation_id,
                    &ServerEvent::Reaction {
                        conversation_id,
                        message_id,
                        user_id,
                        emoji,
                        removed: remove,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Delivery receipt: monotonic advance in the store, then an
    /// ephemeral receipt event so sender UIs can render status. A no-op
    /// advance fans nothing out.
    async fn ack(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        state: DeliveryState,
    ) -> CoreResult<()> {
        if let Some(conversation_id) = self
            .inner
            .store
            .update_delivery_state(message_id, user_id, state)
            .await?
        {
            self.inner
                .registry
                .fan_out(
                    conversation_id,
                    &ServerEvent::Receipt {
                        conversation_id,
                        message_id,
                        user_id,
                        state,
                    },
                )
                .await;
        }
        Ok(())
    }

    fn validate_payload(&self, payload: &serde_json::Value) -> CoreResult<()> {
        let size = payload.to_string().len();
        if size > self.inner.max_payload_bytes {
            return Err(CoreError::PayloadTooLarge {
                size,
                limit: self.inner.max_payload_bytes,
            });
        }

        let kind = payload
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("");
        if !ALLOWED_PAYLOAD_KINDS.contains(&kind) {
            return Err(CoreError::UnsupportedPayload(kind.to_string()));
        }
        Ok(())
    }

    async fn report_error(
        &self,
        connection_id: ConnectionId,
        conversation_id: Option<Uuid>,
        err: CoreError,
    ) {
        warn!(%connection_id, error = %err, "command failed");
        if matches!(err, CoreError::ConnectionSaturated) {
            // The connection was already force-dropped; nothing to send.
            return;
        }
        let _ = self
            .inner
            .registry
            .send_to(
                connection_id,
                ServerEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                    conversation_id,
                },
            )
            .await;
    }
}

fn message_event(message: &StoredMessage) -> ServerEvent {
    ServerEvent::Message {
        conversation_id: message.conversation_id,
        sequence_number: message.seq,
        message_id: message.id,
        sender_id: message.sender_id,
        payload: message.payload.clone(),
        timestamp: message.created_at,
    }
}

/// Ephemeral reaction sets keyed by (message, user, emoji). Never
/// sequenced into the durable log; state lives and dies with the
/// process.
#[derive(Default)]
struct ReactionBook {
    sets: Mutex<HashMap<Uuid, HashSet<(Uuid, String)>>>,
}

impl ReactionBook {
    /// Apply an add or remove. Returns whether the set actually changed
    /// (duplicate adds and absent removes are no-ops).
    fn apply(&self, message_id: Uuid, user_id: Uuid, emoji: &str, remove: bool) -> bool {
        let mut sets = self.sets.lock().expect("reaction lock poisoned");
        if remove {
            let Some(set) = sets.get_mut(&message_id) else {
                return false;
            };
            let changed = set.remove(&(user_id, emoji.to_string()));
            if set.is_empty() {
                sets.remove(&message_id);
            }
            changed
        } else {
            sets.entry(message_id)
                .or_default()
                .insert((user_id, emoji.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reaction_book_has_set_semantics() {
        let book = ReactionBook::default();
        let msg = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(book.apply(msg, user, "🔥", false));
        assert!(!book.apply(msg, user, "🔥", false), "duplicate add");
        assert!(book.apply(msg, user, "🔥", true));
        assert!(!book.apply(msg, user, "🔥", true), "absent remove");
    }

    #[tokio::test]
    async fn payload_validation_rejects_unknown_kind_and_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let db = cove_store::Database::open(&dir.path().join("v.db")).unwrap();
        let store = ConversationStore::new(db, 100);
        let dispatcher = Dispatcher::new(
            store,
            ConnectionRegistry::new(8),
            PresenceTracker::new(Duration::from_secs(5)),
            64,
        );

        assert!(
            dispatcher
                .validate_payload(&json!({"kind": "text", "body": "hi"}))
                .is_ok()
        );
        assert!(matches!(
            dispatcher.validate_payload(&json!({"kind": "video", "ref": "x"})),
            Err(CoreError::UnsupportedPayload(_))
        ));
        assert!(matches!(
            dispatcher.validate_payload(&json!({"body": "no kind"})),
            Err(CoreError::UnsupportedPayload(_))
        ));
        assert!(matches!(
            dispatcher.validate_payload(&json!({
                "kind": "text",
                "body": "x".repeat(200),
            })),
            Err(CoreError::PayloadTooLarge { .. })
        ));
    }
}
