pub mod auth;
pub mod conversations;
pub mod messages;
pub mod middleware;

use axum::http::StatusCode;
use cove_types::error::CoreError;

/// Map the core taxonomy onto REST status codes.
pub fn error_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotAMember { .. } => StatusCode::FORBIDDEN,
        CoreError::Unavailable { .. } => StatusCode::GONE,
        CoreError::UnknownMessage(_) => StatusCode::NOT_FOUND,
        CoreError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        CoreError::UnsupportedPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::ConnectionSaturated => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::PersistenceFailed(_) | CoreError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
