use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session terminated")]
    Terminated,
}

impl AppError {
    /// Whether this error should put the session into its error cooldown
    /// (transport-open and negotiation failures) rather than being absorbed.
    pub fn is_fatal_to_call(&self) -> bool {
        matches!(
            self,
            AppError::Config(_)
                | AppError::Signaling(_)
                | AppError::Negotiation(_)
                | AppError::Timeout(_)
                | AppError::Http(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
