// Error handling framework

use thiserror::Error;

/// Errors raised while talking to the chain node
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Node request failed: {0}")]
    Transport(String),

    #[error("Node returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Unexpected node response for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("Failed to decode transaction {hash}: {reason}")]
    Decode { hash: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ChainError {
    /// True when the node reported that the requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            ChainError::NotFound(_) => true,
            ChainError::Rpc { message, .. } => message.to_lowercase().contains("not found"),
            _ => false,
        }
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Persistent store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),

    #[error("Router closed")]
    Closed,
}

/// Notification template errors
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read templates from {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid template JSON: {0}")]
    InvalidJson(String),

    #[error("Unknown identity state key '{key}' in template '{template}'")]
    UnknownStateKey { template: String, key: String },

    #[error("Missing template(s): {0:?}")]
    Missing(Vec<String>),
}

/// Errors surfaced by trigger bodies
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DatabaseError::ConnectionFailed(err.to_string())
            }
            sqlx::Error::Database(db_err) => DatabaseError::QueryFailed(db_err.message().to_string()),
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<DatabaseError> for StorageError {
    fn from(err: DatabaseError) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidPayload(err.to_string())
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        ChainError::Transport(err.to_string())
    }
}
