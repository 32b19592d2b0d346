use thiserror::Error;

/// Result type for classroom sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing classroom whiteboards
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Channel is not open (state: {state})")]
    ChannelNotReady { state: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Unknown action code: {0}")]
    UnknownAction(u8),

    #[error("Classroom not found: {id}")]
    ClassroomNotFound { id: String },

    #[error("User not found: {user_id} in classroom {classroom_id}")]
    UserNotFound {
        classroom_id: String,
        user_id: String,
    },

    #[error("Action {action} not allowed for user {user_id}")]
    Forbidden { action: String, user_id: String },
}
