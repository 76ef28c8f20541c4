use crate::token_store::TokenStoreError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("No auth token available for this session")]
    MissingToken,

    #[error("No conversation peer given for this session")]
    MissingPeer,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server responded with status {status} for {url}")]
    Http { status: u16, url: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue is full, event dropped")]
    OutboundQueueFull,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Token store error: {0}")]
    TokenStore(#[from] TokenStoreError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ChatError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        ChatError::Other(anyhow::anyhow!(err.to_string()))
    }
}

impl ChatError {
    /// Precondition failures are permanent for the session; callers should not retry.
    pub fn is_precondition(&self) -> bool {
        matches!(self, ChatError::MissingToken | ChatError::MissingPeer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(ChatError::MissingToken.is_precondition());
        assert!(ChatError::MissingPeer.is_precondition());
        assert!(!ChatError::ConnectionClosed.is_precondition());
        assert!(
            !ChatError::Http {
                status: 500,
                url: "http://localhost/chat/messages/u2".to_string()
            }
            .is_precondition()
        );
    }

    #[test]
    fn test_http_error_display() {
        let err = ChatError::Http {
            status: 404,
            url: "http://localhost/users/u2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Server responded with status 404 for http://localhost/users/u2"
        );
    }
}
