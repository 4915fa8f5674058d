use chrono::{DateTime, Utc};
use cove_types::error::{CoreError, CoreResult};
use cove_types::models::{Conversation, DeliveryState, StoredMessage};
use rusqlite::Connection;
use uuid::Uuid;

use crate::models::{MessageRow, UserRow, parse_timestamp, parse_uuid};
use crate::{Database, storage};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: Uuid, username: &str, password_hash: &str) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (
                    id.to_string(),
                    username,
                    password_hash,
                    Utc::now().to_rfc3339(),
                ),
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    pub fn user_by_username(&self, username: &str) -> CoreResult<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn user_by_id(&self, id: Uuid) -> CoreResult<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", &id.to_string()))
    }

    // -- Conversations --

    pub fn insert_conversation(
        &self,
        id: Uuid,
        member_ids: &[Uuid],
        created_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, created_at, archived) VALUES (?1, ?2, 0)",
                (id.to_string(), created_at.to_rfc3339()),
            )
            .map_err(storage)?;
            for member in member_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO conversation_members
                         (conversation_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    (id.to_string(), member.to_string(), created_at.to_rfc3339()),
                )
                .map_err(storage)?;
            }
            Ok(())
        })
    }

    pub fn conversation(&self, id: Uuid) -> CoreResult<Option<Conversation>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT created_at, archived FROM conversations WHERE id = ?1",
                    [id.to_string()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()?;

            let Some((created_at, archived)) = row else {
                return Ok(None);
            };

            Ok(Some(Conversation {
                id,
                member_ids: query_member_ids(conn, id)?,
                created_at: parse_timestamp(&created_at)?,
                archived,
            }))
        })
    }

    pub fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
        self.with_conn(|conn| query_is_member(conn, conversation_id, user_id))
    }

    /// Add a member. Re-adding a member to an archived conversation
    /// reactivates it (membership is non-empty again).
    pub fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        self.with_conn(|conn| {
            require_conversation(conn, conversation_id, user_id)?;
            conn.execute(
                "INSERT OR IGNORE INTO conversation_members
                     (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                (
                    conversation_id.to_string(),
                    user_id.to_string(),
                    Utc::now().to_rfc3339(),
                ),
            )
            .map_err(storage)?;
            conn.execute(
                "UPDATE conversations SET archived = 0 WHERE id = ?1",
                [conversation_id.to_string()],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Remove a member. Removing the last member archives the
    /// conversation rather than deleting it.
    pub fn remove_member(&self, conversation_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        self.with_conn(|conn| {
            require_conversation(conn, conversation_id, user_id)?;
            conn.execute(
                "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id.to_string(), user_id.to_string()),
            )
            .map_err(storage)?;

            let remaining: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = ?1",
                    [conversation_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            if remaining == 0 {
                conn.execute(
                    "UPDATE conversations SET archived = 1 WHERE id = ?1",
                    [conversation_id.to_string()],
                )
                .map_err(storage)?;
            }
            Ok(())
        })
    }

    // -- Messages --

    /// Validate membership, assign the next sequence number, persist,
    /// and prune beyond the retention window. Callers serialize on the
    /// per-conversation ordering slot, so the seq computed here cannot
    /// race another append to the same conversation. The membership
    /// check runs before assignment: a rejected append consumes nothing.
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: serde_json::Value,
        primed_next: Option<u64>,
        retention: u64,
    ) -> CoreResult<StoredMessage> {
        self.with_conn(|conn| {
            if !query_is_member(conn, conversation_id, sender_id)? {
                return Err(CoreError::NotAMember {
                    user_id: sender_id,
                    conversation_id,
                });
            }

            let seq = match primed_next {
                Some(next) => next,
                None => query_head_seq(conn, conversation_id)? + 1,
            };

            let message = StoredMessage {
                id: Uuid::new_v4(),
                conversation_id,
                seq,
                sender_id,
                payload,
                created_at: Utc::now(),
            };

            conn.execute(
                "INSERT INTO messages (conversation_id, seq, id, sender_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    conversation_id.to_string(),
                    seq as i64,
                    message.id.to_string(),
                    sender_id.to_string(),
                    message.payload.to_string(),
                    message.created_at.to_rfc3339(),
                ),
            )
            .map_err(storage)?;

            prune(conn, conversation_id, seq, retention)?;

            Ok(message)
        })
    }

    /// Read `[from_seq, to_seq]` in ascending sequence order. Fails with
    /// `Unavailable` when `from_seq` precedes the retained window.
    pub fn select_range(
        &self,
        conversation_id: Uuid,
        from_seq: u64,
        to_seq: u64,
    ) -> CoreResult<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            if let Some(earliest) = query_earliest_seq(conn, conversation_id)? {
                if from_seq < earliest {
                    return Err(CoreError::Unavailable {
                        earliest_retained: earliest,
                    });
                }
            }

            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, seq, sender_id, payload, created_at
                     FROM messages
                     WHERE conversation_id = ?1 AND seq >= ?2 AND seq <= ?3
                     ORDER BY seq ASC",
                )
                .map_err(storage)?;

            let rows = stmt
                .query_map(
                    (conversation_id.to_string(), from_seq as i64, to_seq as i64),
                    map_message_row,
                )
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;

            rows.into_iter().map(MessageRow::decode).collect()
        })
    }

    /// The most recent `limit` messages in ascending sequence order, for
    /// the resync snapshot.
    pub fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
    ) -> CoreResult<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, seq, sender_id, payload, created_at
                     FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY seq DESC
                     LIMIT ?2",
                )
                .map_err(storage)?;

            let mut rows = stmt
                .query_map((conversation_id.to_string(), limit), map_message_row)
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?
                .into_iter()
                .map(MessageRow::decode)
                .collect::<CoreResult<Vec<_>>>()?;

            rows.reverse();
            Ok(rows)
        })
    }

    pub fn head_seq(&self, conversation_id: Uuid) -> CoreResult<u64> {
        self.with_conn(|conn| query_head_seq(conn, conversation_id))
    }

    pub fn earliest_retained_seq(&self, conversation_id: Uuid) -> CoreResult<Option<u64>> {
        self.with_conn(|conn| query_earliest_seq(conn, conversation_id))
    }

    /// Conversation and sender of a message, for receipt validation.
    pub fn message_meta(&self, message_id: Uuid) -> CoreResult<Option<(Uuid, Uuid)>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT conversation_id, sender_id FROM messages WHERE id = ?1",
                    [message_id.to_string()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            match row {
                Some((convo, sender)) => Ok(Some((parse_uuid(&convo)?, parse_uuid(&sender)?))),
                None => Ok(None),
            }
        })
    }

    // -- Delivery receipts --

    /// Advance a recipient's delivery state. Monotonic: returns `false`
    /// (no-op) unless the new state is strictly later than the current
    /// one. `sent` is the implicit base state and never advances anything.
    pub fn advance_receipt(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        state: DeliveryState,
    ) -> CoreResult<bool> {
        if state == DeliveryState::Sent {
            return Ok(false);
        }

        self.with_conn(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
                    [message_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            if !exists {
                return Err(CoreError::UnknownMessage(message_id));
            }

            let changed = conn
                .execute(
                    "INSERT INTO receipts (message_id, user_id, state, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (message_id, user_id) DO UPDATE SET
                         state = excluded.state,
                         updated_at = excluded.updated_at
                     WHERE CASE excluded.state
                               WHEN 'delivered' THEN 1 WHEN 'read' THEN 2 ELSE 0 END
                         > CASE receipts.state
                               WHEN 'delivered' THEN 1 WHEN 'read' THEN 2 ELSE 0 END",
                    (
                        message_id.to_string(),
                        user_id.to_string(),
                        state.as_str(),
                        Utc::now().to_rfc3339(),
                    ),
                )
                .map_err(storage)?;

            Ok(changed > 0)
        })
    }

    pub fn receipt_state(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<DeliveryState> {
        self.with_conn(|conn| {
            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM receipts WHERE message_id = ?1 AND user_id = ?2",
                    (message_id.to_string(), user_id.to_string()),
                    |row| row.get(0),
                )
                .optional()?;
            match state {
                Some(s) => DeliveryState::parse(&s)
                    .ok_or_else(|| CoreError::Storage(format!("corrupt receipt state `{s}`"))),
                None => Ok(DeliveryState::Sent),
            }
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> CoreResult<Option<UserRow>> {
    // `column` is a compile-time constant from the two callers above.
    let sql = format!("SELECT id, username, password, created_at FROM users WHERE {column} = ?1");
    let mut stmt = conn.prepare(&sql).map_err(storage)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_member_ids(conn: &Connection, conversation_id: Uuid) -> CoreResult<Vec<Uuid>> {
    let mut stmt = conn
        .prepare(
            "SELECT user_id FROM conversation_members
             WHERE conversation_id = ?1 ORDER BY joined_at ASC, user_id ASC",
        )
        .map_err(storage)?;

    let ids = stmt
        .query_map([conversation_id.to_string()], |row| row.get::<_, String>(0))
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;

    ids.iter().map(|s| parse_uuid(s)).collect()
}

fn query_is_member(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
    conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM conversation_members
             WHERE conversation_id = ?1 AND user_id = ?2
         )",
        (conversation_id.to_string(), user_id.to_string()),
        |row| row.get(0),
    )
    .map_err(storage)
}

fn query_head_seq(conn: &Connection, conversation_id: Uuid) -> CoreResult<u64> {
    let head: Option<i64> = conn
        .query_row(
            "SELECT MAX(seq) FROM messages WHERE conversation_id = ?1",
            [conversation_id.to_string()],
            |row| row.get(0),
        )
        .map_err(storage)?;
    Ok(head.unwrap_or(0) as u64)
}

fn query_earliest_seq(conn: &Connection, conversation_id: Uuid) -> CoreResult<Option<u64>> {
    let earliest: Option<i64> = conn
        .query_row(
            "SELECT MIN(seq) FROM messages WHERE conversation_id = ?1",
            [conversation_id.to_string()],
            |row| row.get(0),
        )
        .map_err(storage)?;
    Ok(earliest.map(|s| s as u64))
}

fn require_conversation(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> CoreResult<()> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            [conversation_id.to_string()],
            |row| row.get(0),
        )
        .map_err(storage)?;
    if exists {
        Ok(())
    } else {
        Err(CoreError::NotAMember {
            user_id,
            conversation_id,
        })
    }
}

/// Drop messages (and their receipts) that fall outside the retained
/// window of the most recent `retention` sequence numbers.
fn prune(conn: &Connection, conversation_id: Uuid, head: u64, retention: u64) -> CoreResult<()> {
    if head <= retention {
        return Ok(());
    }
    let cutoff = (head - retention) as i64;

    conn.execute(
        "DELETE FROM receipts WHERE message_id IN (
             SELECT id FROM messages WHERE conversation_id = ?1 AND seq <= ?2
         )",
        (conversation_id.to_string(), cutoff),
    )
    .map_err(storage)?;
    conn.execute(
        "DELETE FROM messages WHERE conversation_id = ?1 AND seq <= ?2",
        (conversation_id.to_string(), cutoff),
    )
    .map_err(storage)?;
    Ok(())
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        sender_id: row.get(3)?,
        payload: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extension trait for optional query results.
trait OptionalExt<T> {
    fn optional(self) -> CoreResult<Option<T>>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> CoreResult<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage(e)),
        }
    }
}
