// src/errors.rs

use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Every failure the client can report.
///
/// Decode errors for a single streamed event never become a `ChatError`; they
/// are skipped inside the transport layer.
#[derive(Debug, Error)]
pub enum ChatError {
    // ── Transport ────────────────────────────────────────────────────────────
    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Can't reach the inference server at {endpoint}. Is the server running and the port correct?")]
    Connectivity { endpoint: String },

    // ── Persistence ──────────────────────────────────────────────────────────
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Invalid archive format: {message}")]
    ArchiveFormat { message: String },

    // ── Configuration ────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Turn guards ──────────────────────────────────────────────────────────
    #[error("A response is already streaming")]
    TurnInProgress,

    #[error("No model selected")]
    MissingModel,

    #[error("Message is empty")]
    EmptyInput,

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChatError {
    pub fn transport_error(message: impl Into<String>) -> Self {
        ChatError::Transport {
            message: message.into(),
        }
    }

    pub fn connectivity_error(endpoint: impl Into<String>) -> Self {
        ChatError::Connectivity {
            endpoint: endpoint.into(),
        }
    }

    pub fn storage_error(message: impl Into<String>) -> Self {
        ChatError::Storage {
            message: message.into(),
        }
    }

    pub fn archive_error(message: impl Into<String>) -> Self {
        ChatError::ArchiveFormat {
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        ChatError::Config {
            message: message.into(),
        }
    }

    /// Failures that the streaming path recovers from by falling back to a
    /// single non-streaming request.
    pub fn is_transport(&self) -> bool {
        matches!(self, ChatError::HttpStatus { .. } | ChatError::Transport { .. })
    }

    /// Errors meant to be shown to the person at the keyboard.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ChatError::Connectivity { .. } | ChatError::ArchiveFormat { .. }
        )
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ChatError::HttpStatus {
                status: status.as_u16(),
            },
            None => ChatError::transport_error(err.to_string()),
        }
    }
}
