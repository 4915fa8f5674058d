//! Database row types — these map directly to SQLite rows.
//! Distinct from the cove-types API models to keep the DB layer
//! independent.

use chrono::{DateTime, Utc};
use cove_types::error::{CoreError, CoreResult};
use cove_types::models::StoredMessage;
use uuid::Uuid;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub sender_id: String,
    pub payload: String,
    pub created_at: String,
}

impl MessageRow {
    /// Decode a raw row into the shared message model. A row that fails
    /// to decode indicates store corruption, not caller error.
    pub fn decode(self) -> CoreResult<StoredMessage> {
        Ok(StoredMessage {
            id: parse_uuid(&self.id)?,
            conversation_id: parse_uuid(&self.conversation_id)?,
            seq: self.seq as u64,
            sender_id: parse_uuid(&self.sender_id)?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| CoreError::Storage(format!("corrupt payload: {e}")))?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub fn parse_uuid(s: &str) -> CoreResult<Uuid> {
    s.parse()
        .map_err(|e| CoreError::Storage(format!("corrupt uuid `{s}`: {e}")))
}

pub fn parse_timestamp(s: &str) -> CoreResult<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| CoreError::Storage(format!("corrupt timestamp `{s}`: {e}")))
}
