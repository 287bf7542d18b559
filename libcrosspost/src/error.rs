//! Error types for Crosspost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosspostError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::InvalidInput(_) => 3,
            CrosspostError::Platform(PlatformError::Authentication(_)) => 2,
            CrosspostError::Token(TokenError::ReconnectRequired(_)) => 2,
            CrosspostError::Config(_) => 2,
            CrosspostError::Database(_)
            | CrosspostError::Platform(_)
            | CrosspostError::Vault(_)
            | CrosspostError::Token(_)
            | CrosspostError::Queue(_)
            | CrosspostError::Webhook(_)
            | CrosspostError::NotFound(_) => 1,
        }
    }

    /// True when the error is a lost optimistic-concurrency race on a post
    pub fn is_stale_write(&self) -> bool {
        matches!(self, CrosspostError::Database(DbError::StaleWrite(_)))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stored JSON column could not be decoded: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Post {0} was modified concurrently; reload and retry")]
    StaleWrite(String),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Malformed encrypted value: {0}")]
    Malformed(String),

    #[error("No key registered for version {0}")]
    UnknownKeyVersion(u32),

    #[error("Ciphertext failed authentication (tampered data or wrong key)")]
    Authentication,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

/// Outcome classification for credential refresh failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The grant is gone; only the user can fix this by reconnecting
    #[error("Reconnect required: {0}")]
    ReconnectRequired(String),

    /// Network trouble or a provider-side 5xx; safe to retry later
    #[error("Transient token failure: {0}")]
    Transient(String),

    #[error("Token refresh failed: {0}")]
    Failed(String),
}

impl TokenError {
    pub fn is_user_actionable(&self) -> bool {
        matches!(self, TokenError::ReconnectRequired(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TokenError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Queue backend failure: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("Job payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("No webhook handler registered for {0}")]
    NoHandler(String),

    #[error("Missing signature header {0}")]
    MissingSignature(String),

    #[error("Signature does not match payload")]
    InvalidSignature,

    #[error("No webhook secret configured for {0}")]
    MissingSecret(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CrosspostError::InvalidInput("scheduledAt must be in the future".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_reconnect_required() {
        let error = CrosspostError::Token(TokenError::ReconnectRequired("revoked".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_transient_token_error() {
        let error = CrosspostError::Token(TokenError::Transient("timeout".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = CrosspostError::Platform(PlatformError::Authentication("401".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = CrosspostError::Config(ConfigError::MissingField("vault.keys".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_operational_errors() {
        let errors = vec![
            CrosspostError::Platform(PlatformError::Posting("boom".to_string())),
            CrosspostError::Vault(VaultError::Authentication),
            CrosspostError::Queue(QueueError::Unavailable("down".to_string())),
            CrosspostError::Webhook(WebhookError::InvalidSignature),
            CrosspostError::NotFound("post".to_string()),
        ];
        for error in errors {
            assert_eq!(error.exit_code(), 1, "unexpected exit code for {:?}", error);
        }
    }

    #[test]
    fn test_error_message_formatting() {
        let error = CrosspostError::Platform(PlatformError::Posting(
            "twitter rejected the request".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Platform error: Posting failed: twitter rejected the request"
        );

        let error = CrosspostError::Token(TokenError::ReconnectRequired(
            "No refresh token stored for pinterest".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Token error: Reconnect required: No refresh token stored for pinterest"
        );
    }

    #[test]
    fn test_token_error_classification() {
        assert!(TokenError::ReconnectRequired("x".into()).is_user_actionable());
        assert!(!TokenError::ReconnectRequired("x".into()).is_transient());
        assert!(TokenError::Transient("x".into()).is_transient());
        assert!(!TokenError::Failed("x".into()).is_user_actionable());
        assert!(!TokenError::Failed("x".into()).is_transient());
    }

    #[test]
    fn test_stale_write_detection() {
        let error: CrosspostError = DbError::StaleWrite("post-1".to_string()).into();
        assert!(error.is_stale_write());
        assert!(!CrosspostError::NotFound("post-1".to_string()).is_stale_write());
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original.to_string(), cloned.to_string());
    }
}
