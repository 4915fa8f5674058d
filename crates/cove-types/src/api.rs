use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::StoredMessage;

// -- JWT Claims --

/// JWT claims shared across cove-api (REST middleware) and cove-server
/// (WebSocket upgrade authentication). Canonical definition lives here
/// in cove-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CreateConversationRequest {
    /// Initial membership. The creator is always included, listed or not.
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub id: Uuid,
    pub member_ids: Vec<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub archived: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: Uuid,
}

// -- Reconciliation snapshot --

/// Full-state answer to `resyncRequired`: current membership plus the
/// most recent retained messages. The client splices live events with
/// `sequenceNumber > headSeq` on top of this.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub conversation_id: Uuid,
    pub member_ids: Vec<Uuid>,
    pub head_seq: u64,
    pub messages: Vec<StoredMessage>,
}
