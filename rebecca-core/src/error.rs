use thiserror::Error;

/// Infrastructure errors: pool, config, migrations.
#[derive(Error, Debug)]
pub enum RebeccaError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Errors a chat request can end with, from the session gate to persistence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Missing credentials")]
    Unauthenticated,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    TokenInvalid,

    #[error("User not found")]
    UserNotFound,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Model stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Failed to store conversation: {0}")]
    StorageFailure(String),

    /// A read needed to build the request failed before anything streamed.
    #[error("Conversation storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl ChatError {
    /// Stable identifier used in in-band error events.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "unauthenticated",
            ChatError::TokenExpired => "token_expired",
            ChatError::TokenInvalid => "token_invalid",
            ChatError::UserNotFound => "user_not_found",
            ChatError::InvalidInput(_) => "invalid_input",
            ChatError::BackendUnavailable(_) => "backend_unavailable",
            ChatError::StreamInterrupted(_) => "stream_interrupted",
            ChatError::StorageFailure(_) => "storage_failure",
            ChatError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_snake_case_and_distinct() {
        let all = [
            ChatError::Unauthenticated,
            ChatError::TokenExpired,
            ChatError::TokenInvalid,
            ChatError::UserNotFound,
            ChatError::InvalidInput("x".into()),
            ChatError::BackendUnavailable("x".into()),
            ChatError::StreamInterrupted("x".into()),
            ChatError::StorageFailure("x".into()),
            ChatError::StorageUnavailable("x".into()),
        ];
        let mut kinds: Vec<&str> = all.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), all.len());
        assert!(kinds.iter().all(|k| k.chars().all(|c| c.is_ascii_lowercase() || c == '_')));
    }
}
