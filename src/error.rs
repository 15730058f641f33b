//! Error taxonomy shared by the token manager, the API client and the record pipeline.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Identity endpoint rejected the exchange or answered with something unreadable.
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unsupported action ({0})")]
    UnsupportedAction(String),
    #[error("contact {contact_id} has no field '{field}'")]
    MissingField { contact_id: i64, field: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("invalid run configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Errors that abort the whole run instead of a single record or call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_) | SyncError::UnsupportedAction(_) | SyncError::Config(_)
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
