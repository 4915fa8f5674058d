use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use cove_types::error::{CoreError, CoreResult};
use cove_types::events::ServerEvent;
use cove_types::models::PresenceState;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// A subscription is Syncing while reconciliation replay is in flight:
/// live fan-out buffers instead of sending, so replayed history always
/// reaches the socket before anything newer. `finish_subscription`
/// drains the buffer and flips to Live.
enum SubscriptionState {
    Syncing { buffer: Vec<ServerEvent> },
    Live,
}

struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
    subscriptions: Mutex<HashMap<Uuid, SubscriptionState>>,
}

/// Tracks live connections, their owners, and their conversation
/// subscriptions. Each connection owns a bounded outbound queue; every
/// send is a `try_send`, so one slow client never delays the rest. A
/// full queue force-disconnects that connection instead of applying
/// backpressure upstream.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    queue_capacity: usize,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
    by_user: RwLock<HashMap<Uuid, HashSet<ConnectionId>>>,
    by_conversation: RwLock<HashMap<Uuid, HashSet<ConnectionId>>>,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                queue_capacity: queue_capacity.max(1),
                connections: RwLock::new(HashMap::new()),
                by_user: RwLock::new(HashMap::new()),
                by_conversation: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection for an authenticated user. Returns the
    /// connection id, the receiving end of its outbound queue, and
    /// whether this is the user's first live connection (an
    /// offline→online transition for presence).
    pub async fn register(
        &self,
        user_id: Uuid,
    ) -> (ConnectionId, mpsc::Receiver<ServerEvent>, bool) {
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);

        let entry = Arc::new(ConnectionEntry {
            user_id,
            tx,
            subscriptions: Mutex::new(HashMap::new()),
        });

        self.inner
            .connections
            .write()
            .await
            .insert(connection_id, entry);

        let mut by_user = self.inner.by_user.write().await;
        let connections = by_user.entry(user_id).or_default();
        let came_online = connections.is_empty();
        connections.insert(connection_id);

        debug!(%user_id, %connection_id, "connection registered");
        (connection_id, rx, came_online)
    }

    /// Idempotent. Removes the connection and all its subscriptions.
    /// Returns the owning user and whether this was their last live
    /// connection (an online→offline transition), or `None` if the
    /// connection was already gone.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<(Uuid, bool)> {
        let entry = self.inner.connections.write().await.remove(&connection_id)?;

        let subscribed: Vec<Uuid> = {
            let subs = entry.subscriptions.lock().expect("subscription lock poisoned");
            subs.keys().copied().collect()
        };
        let mut by_conversation = self.inner.by_conversation.write().await;
        for conversation_id in subscribed {
            if let Some(ids) = by_conversation.get_mut(&conversation_id) {
                ids.remove(&connection_id);
                if ids.is_empty() {
                    by_conversation.remove(&conversation_id);
                }
            }
        }
        drop(by_conversation);

        let mut by_user = self.inner.by_user.write().await;
        let went_offline = match by_user.get_mut(&entry.user_id) {
            Some(ids) => {
                ids.remove(&connection_id);
                if ids.is_empty() {
                    by_user.remove(&entry.user_id);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        debug!(user_id = %entry.user_id, %connection_id, "connection unregistered");
        Some((entry.user_id, went_offline))
    }

    /// Start a subscription in the Syncing state. Live fan-out for the
    /// conversation buffers on this connection until
    /// `finish_subscription` runs. Re-subscribing resets any previous
    /// state for the conversation. Returns `false` if the connection is
    /// already gone.
    pub async fn begin_subscription(
        &self,
        connection_id: ConnectionId,
        conversation_id: Uuid,
    ) -> bool {
        let Some(entry) = self.entry(connection_id).await else {
            return false;
        };
        {
            let mut subs = entry.subscriptions.lock().expect("subscription lock poisoned");
            subs.insert(conversation_id, SubscriptionState::Syncing { buffer: Vec::new() });
        }
        self.inner
            .by_conversation
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        true
    }

    /// Flip a Syncing subscription to Live: deliver events buffered
    /// during replay, discarding any message at or below `replay_head`
    /// (already covered by the replay), then let fan-out flow directly.
    pub async fn finish_subscription(
        &self,
        connection_id: ConnectionId,
        conversation_id: Uuid,
        replay_head: u64,
    ) -> CoreResult<()> {
        let Some(entry) = self.entry(connection_id).await else {
            return Ok(());
        };

        let buffered = {
            let mut subs = entry.subscriptions.lock().expect("subscription lock poisoned");
            match subs.insert(conversation_id, SubscriptionState::Live) {
                Some(SubscriptionState::Syncing { buffer }) => buffer,
                _ => Vec::new(),
            }
        };

        for event in buffered {
            if let Some(seq) = event.sequence_number() {
                if seq <= replay_head {
                    continue;
                }
            }
            if entry.tx.try_send(event).is_err() {
                self.disconnect_saturated(connection_id).await;
                return Err(CoreError::ConnectionSaturated);
            }
        }
        Ok(())
    }

    /// Queue an event for one connection. Returns `Ok(false)` if the
    /// connection is already gone; fails `ConnectionSaturated` (and
    /// force-disconnects) if its bounded queue is full.
    pub async fn send_to(
        &self,
        connection_id: ConnectionId,
        event: ServerEvent,
    ) -> CoreResult<bool> {
        let Some(entry) = self.entry(connection_id).await else {
            return Ok(false);
        };
        if entry.tx.try_send(event).is_err() {
            self.disconnect_saturated(connection_id).await;
            return Err(CoreError::ConnectionSaturated);
        }
        Ok(true)
    }

    /// Best-effort fan-out to every connection subscribed to the
    /// conversation. Delivery to each connection is isolated: a full
    /// queue disconnects that connection and never delays or fails the
    /// others.
    pub async fn fan_out(&self, conversation_id: Uuid, event: &ServerEvent) {
        let targets: Vec<(ConnectionId, Arc<ConnectionEntry>)> = {
            let index = self.inner.by_conversation.read().await;
            let Some(ids) = index.get(&conversation_id) else {
                return;
            };
            let connections = self.inner.connections.read().await;
            ids.iter()
                .filter_map(|id| connections.get(id).map(|e| (*id, e.clone())))
                .collect()
        };

        let mut saturated = Vec::new();
        for (connection_id, entry) in targets {
            let overflowed = {
                let mut subs = entry.subscriptions.lock().expect("subscription lock poisoned");
                match subs.get_mut(&conversation_id) {
                    Some(SubscriptionState::Live) => entry.tx.try_send(event.clone()).is_err(),
                    Some(SubscriptionState::Syncing { buffer }) => {
                        if buffer.len() >= self.inner.queue_capacity {
                            true
                        } else {
                            buffer.push(event.clone());
                            false
                        }
                    }
                    None => false,
                }
            };
            if overflowed {
                saturated.push(connection_id);
            }
        }

        for connection_id in saturated {
            self.disconnect_saturated(connection_id).await;
        }
    }

    /// Deliver an event to every live connection regardless of
    /// subscriptions (presence transitions). Overflowing connections
    /// are dropped without a further presence cascade.
    pub async fn broadcast(&self, event: &ServerEvent) {
        let targets: Vec<(ConnectionId, Arc<ConnectionEntry>)> = {
            let connections = self.inner.connections.read().await;
            connections.iter().map(|(id, e)| (*id, e.clone())).collect()
        };

        let mut saturated = Vec::new();
        for (connection_id, entry) in targets {
            if entry.tx.try_send(event.clone()).is_err() {
                saturated.push(connection_id);
            }
        }
        for connection_id in saturated {
            warn!(%connection_id, "outbound queue saturated during broadcast, disconnecting");
            self.unregister(connection_id).await;
        }
    }

    /// Users with at least one live connection. Presence is derived
    /// from this, never stored.
    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.by_user.read().await.keys().copied().collect()
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.by_user.read().await.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    async fn entry(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.inner
            .connections
            .read()
            .await
            .get(&connection_id)
            .cloned()
    }

    /// Drop a connection whose queue overflowed. Removing the entry
    /// drops the queue sender, which closes the connection's send loop
    /// and with it the socket. The presence transition is announced
    /// here because the socket loop's own teardown will find the entry
    /// already gone.
    async fn disconnect_saturated(&self, connection_id: ConnectionId) {
        warn!(%connection_id, "outbound queue saturated, disconnecting");
        if let Some((user_id, went_offline)) = self.unregister(connection_id).await {
            if went_offline {
                self.broadcast(&ServerEvent::Presence {
                    user_id,
                    state: PresenceState::Offline,
                })
                .await;
            }
        }
    }
}
