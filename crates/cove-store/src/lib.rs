pub mod migrations;
pub mod models;
pub mod queries;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use cove_types::error::{CoreError, CoreResult};
use cove_types::models::{Conversation, DeliveryState, StoredMessage};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

/// Map any low-level failure into the storage arm of the taxonomy.
pub(crate) fn storage(e: impl std::fmt::Display) -> CoreError {
    CoreError::Storage(e.to_string())
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path).map_err(storage)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage)?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> CoreResult<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Storage(format!("DB lock poisoned: {e}")))?;
        f(&conn)
    }
}

/// Async facade over the durable log. Owns the per-conversation ordering
/// slots: appends to one conversation serialize on its slot while other
/// conversations proceed independently — there is no global sequencing
/// lock. Blocking rusqlite work runs under `spawn_blocking`.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Arc<Database>,
    /// Retained messages per conversation; older entries are pruned.
    retention: u64,
    /// Per-conversation ordering slot. The guarded value caches the next
    /// sequence number; `None` until primed from the stored head.
    slots: tokio::sync::RwLock<HashMap<Uuid, Arc<tokio::sync::Mutex<Option<u64>>>>>,
}

impl ConversationStore {
    pub fn new(db: Database, retention: u64) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                db: Arc::new(db),
                retention: retention.max(1),
                slots: tokio::sync::RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn retention(&self) -> u64 {
        self.inner.retention
    }

    async fn run<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Database) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| CoreError::Storage(format!("blocking task join: {e}")))?
    }

    async fn slot(&self, conversation_id: Uuid) -> Arc<tokio::sync::Mutex<Option<u64>>> {
        if let Some(slot) = self.inner.slots.read().await.get(&conversation_id) {
            return slot.clone();
        }
        let mut slots = self.inner.slots.write().await;
        slots
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Atomically assign the next sequence number and persist. Fails
    /// with `NotAMember` before any sequence number is consumed; the
    /// next successful append reuses the number a rejected call would
    /// have taken.
    pub async fn append(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: serde_json::Value,
    ) -> CoreResult<StoredMessage> {
        let slot = self.slot(conversation_id).await;
        let mut guard = slot.lock().await;

        let primed = *guard;
        let retention = self.inner.retention;
        let message = self
            .run(move |db| db.append_message(conversation_id, sender_id, payload, primed, retention))
            .await?;

        *guard = Some(message.seq + 1);
        Ok(message)
    }

    pub async fn read_range(
        &self,
        conversation_id: Uuid,
        from_seq: u64,
        to_seq: u64,
    ) -> CoreResult<Vec<StoredMessage>> {
        self.run(move |db| db.select_range(conversation_id, from_seq, to_seq))
            .await
    }

    /// Monotonic delivery-state advance. Returns the conversation id
    /// when the state actually moved, `None` on a no-op.
    pub async fn update_delivery_state(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        new_state: DeliveryState,
    ) -> CoreResult<Option<Uuid>> {
        self.run(move |db| {
            let Some((conversation_id, _sender)) = db.message_meta(message_id)? else {
                return Err(CoreError::UnknownMessage(message_id));
            };
            let changed = db.advance_receipt(message_id, user_id, new_state)?;
            Ok(changed.then_some(conversation_id))
        })
        .await
    }

    /// `(conversation_id, sender_id)` of a stored message, or `None`
    /// for stale references (unknown or already pruned).
    pub async fn message_meta(&self, message_id: Uuid) -> CoreResult<Option<(Uuid, Uuid)>> {
        self.run(move |db| db.message_meta(message_id)).await
    }

    pub async fn delivery_state(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<DeliveryState> {
        self.run(move |db| db.receipt_state(message_id, user_id))
            .await
    }

    // -- Conversations & membership --

    pub async fn create_conversation(&self, member_ids: Vec<Uuid>) -> CoreResult<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            member_ids: member_ids.clone(),
            created_at: chrono::Utc::now(),
            archived: false,
        };
        let id = conversation.id;
        let created_at = conversation.created_at;
        self.run(move |db| db.insert_conversation(id, &member_ids, created_at))
            .await?;
        Ok(conversation)
    }

    pub async fn conversation(&self, conversation_id: Uuid) -> CoreResult<Option<Conversation>> {
        self.run(move |db| db.conversation(conversation_id)).await
    }

    pub async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
        self.run(move |db| db.is_member(conversation_id, user_id))
            .await
    }

    pub async fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        self.run(move |db| db.add_member(conversation_id, user_id))
            .await
    }

    pub async fn remove_member(&self, conversation_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        self.run(move |db| db.remove_member(conversation_id, user_id))
            .await
    }

    // -- Reconciliation queries --

    pub async fn head_seq(&self, conversation_id: Uuid) -> CoreResult<u64> {
        self.run(move |db| db.head_seq(conversation_id)).await
    }

    pub async fn earliest_retained_seq(&self, conversation_id: Uuid) -> CoreResult<Option<u64>> {
        self.run(move |db| db.earliest_retained_seq(conversation_id))
            .await
    }

    /// Full-state snapshot for resync: membership, head, and the most
    /// recent `limit` messages in ascending order.
    pub async fn snapshot(
        &self,
        conversation_id: Uuid,
        limit: u32,
    ) -> CoreResult<Option<(Conversation, u64, Vec<StoredMessage>)>> {
        self.run(move |db| {
            let Some(conversation) = db.conversation(conversation_id)? else {
                return Ok(None);
            };
            let head = db.head_seq(conversation_id)?;
            let messages = db.recent_messages(conversation_id, limit)?;
            Ok(Some((conversation, head, messages)))
        })
        .await
    }

    // -- Users (identity records the JWTs are minted from) --

    pub async fn create_user(
        &self,
        id: Uuid,
        username: String,
        password_hash: String,
    ) -> CoreResult<()> {
        self.run(move |db| db.create_user(id, &username, &password_hash))
            .await
    }

    pub async fn user_by_username(
        &self,
        username: String,
    ) -> CoreResult<Option<models::UserRow>> {
        self.run(move |db| db.user_by_username(&username)).await
    }

    pub async fn user_by_id(&self, id: Uuid) -> CoreResult<Option<models::UserRow>> {
        self.run(move |db| db.user_by_id(id)).await
    }
}
