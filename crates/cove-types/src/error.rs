use thiserror::Error;
use uuid::Uuid;

/// The core error taxonomy, shared by the store, the gateway, and the
/// REST surface. Fan-out failures to individual connections are local
/// and never produce one of these for the sender.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("user {user_id} is not a member of conversation {conversation_id}")]
    NotAMember {
        user_id: Uuid,
        conversation_id: Uuid,
    },

    /// The requested range starts before retained history.
    #[error("history before seq {earliest_retained} is no longer retained")]
    Unavailable { earliest_retained: u64 },

    #[error("unknown message {0}")]
    UnknownMessage(Uuid),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("unsupported payload kind `{0}`")]
    UnsupportedPayload(String),

    /// The connection's bounded outbound queue overflowed; the
    /// connection is force-disconnected rather than applying
    /// backpressure to the sender.
    #[error("connection outbound queue saturated")]
    ConnectionSaturated,

    /// Persistence still failing after bounded retry.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Stable wire code for `error` events and REST bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotAMember { .. } => "notAMember",
            CoreError::Unavailable { .. } => "unavailable",
            CoreError::UnknownMessage(_) => "unknownMessage",
            CoreError::PayloadTooLarge { .. } => "payloadTooLarge",
            CoreError::UnsupportedPayload(_) => "unsupportedPayload",
            CoreError::ConnectionSaturated => "connectionSaturated",
            CoreError::PersistenceFailed(_) => "persistenceFailed",
            CoreError::Storage(_) => "storage",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
