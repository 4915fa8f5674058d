use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use cove_types::api::{
    AddMemberRequest, Claims, ConversationResponse, CreateConversationRequest, SnapshotResponse,
};
use cove_types::error::CoreError;
use cove_types::models::Conversation;

use crate::auth::AppState;
use crate::error_status;

/// Create a conversation. The creator is always a member, whether or
/// not the request lists them.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let mut member_ids = req.member_ids;
    if !member_ids.contains(&claims.sub) {
        member_ids.push(claims.sub);
    }

    let conversation = state
        .store
        .create_conversation(member_ids)
        .await
        .map_err(|e| error_status(&e))?;

    info!(
        conversation_id = %conversation.id,
        creator = %claims.sub,
        members = conversation.member_ids.len(),
        "conversation created"
    );

    Ok((StatusCode::CREATED, Json(response(conversation))))
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    require_membership(&state, conversation_id, claims.sub).await?;

    state
        .store
        .add_member(conversation_id, req.user_id)
        .await
        .map_err(|e| error_status(&e))?;

    current(&state, conversation_id).await.map(Json)
}

/// Members may remove themselves or any other member. Removing the
/// last member archives the conversation.
pub async fn remove_member(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_membership(&state, conversation_id, claims.sub).await?;

    state
        .store
        .remove_member(conversation_id, user_id)
        .await
        .map_err(|e| error_status(&e))?;

    current(&state, conversation_id).await.map(Json)
}

/// Full-state resync query: current membership plus the most recent
/// retained messages. Answers the gateway's `resyncRequired` signal.
pub async fn snapshot(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_membership(&state, conversation_id, claims.sub).await?;

    let (conversation, head_seq, messages) = state
        .store
        .snapshot(conversation_id, state.snapshot_messages)
        .await
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(SnapshotResponse {
        conversation_id: conversation.id,
        member_ids: conversation.member_ids,
        head_seq,
        messages,
    }))
}

async fn require_membership(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<(), StatusCode> {
    let is_member = state
        .store
        .is_member(conversation_id, user_id)
        .await
        .map_err(|e| error_status(&e))?;
    if is_member {
        Ok(())
    } else {
        Err(error_status(&CoreError::NotAMember {
            user_id,
            conversation_id,
        }))
    }
}

async fn current(
    state: &AppState,
    conversation_id: Uuid,
) -> Result<ConversationResponse, StatusCode> {
    state
        .store
        .conversation(conversation_id)
        .await
        .map_err(|e| error_status(&e))?
        .map(response)
        .ok_or(StatusCode::NOT_FOUND)
}

fn response(conversation: Conversation) -> ConversationResponse {
    ConversationResponse {
        id: conversation.id,
        member_ids: conversation.member_ids,
        created_at: conversation.created_at,
        archived: conversation.archived,
    }
}
