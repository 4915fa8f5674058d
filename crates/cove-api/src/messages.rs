use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use cove_types::api::Claims;
use cove_types::error::CoreError;

use crate::auth::AppState;
use crate::error_status;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Cursor: return messages with a sequence number strictly greater
    /// than this. Omit to read from the start of retained history.
    pub after: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// History reads over the same `read_range` the gateway replays from.
/// A cursor that has fallen out of retention maps to 410 Gone; the
/// client should fetch the snapshot instead.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let is_member = state
        .store
        .is_member(conversation_id, claims.sub)
        .await
        .map_err(|e| error_status(&e))?;
    if !is_member {
        return Err(error_status(&CoreError::NotAMember {
            user_id: claims.sub,
            conversation_id,
        }));
    }

    let head = state
        .store
        .head_seq(conversation_id)
        .await
        .map_err(|e| error_status(&e))?;

    let from = query.after.unwrap_or(0) + 1;
    if from > head {
        return Ok(Json(Vec::new()));
    }
    let limit = query.limit.clamp(1, 200) as u64;
    let to = head.min(from + limit - 1);

    let messages = state
        .store
        .read_range(conversation_id, from, to)
        .await
        .map_err(|e| error_status(&e))?;

    Ok(Json(messages))
}
