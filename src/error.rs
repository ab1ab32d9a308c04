//! Error types for taro
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in taro
#[derive(Debug, Error)]
pub enum TaroError {
    /// Instance id unknown to a registry
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// The instance cannot honor the command in its current state
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// The job process could not be started
    #[error("Start failure: {0}")]
    StartFailure(String),

    /// Registry endpoint could not be reached
    #[error("IPC unavailable: {0}")]
    IpcUnavailable(String),

    /// Registry endpoint did not answer in time
    #[error("IPC timeout after {0}ms")]
    IpcTimeout(u64),

    /// Event could not be pushed to a listening server
    #[error("Listener delivery failed: {0}")]
    ListenerDelivery(String),

    /// Storage/persistence error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Plugin hook failure
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for taro operations
pub type Result<T> = std::result::Result<T, TaroError>;
