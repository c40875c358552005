//! Error types for the connector stack

use thiserror::Error;

use crate::models::{MailboxId, MessageId};

/// Failures raised by a [`MailStore`](crate::storage::MailStore)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store call cancelled")]
    Cancelled,

    #[error("no such message: {0}")]
    NoSuchMessage(MessageId),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Failures raised while queueing or delivering updates
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("update stream closed")]
    Closed,

    /// Fail-closed policy tripped; this session no longer accepts updates
    #[error("session aborted after failed update: {reason}")]
    SessionAborted { reason: String },

    #[error("pending update queue full ({limit} entries)")]
    QueueFull { limit: usize },

    #[error("engine rejected {update}: {reason}")]
    Rejected { update: String, reason: String },

    #[error("wait for acknowledgment cancelled")]
    Cancelled,
}

/// Failures surfaced to the engine from a connector call
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("no such mailbox: {0}")]
    NoSuchMailbox(MailboxId),

    #[error("no such message: {0}")]
    NoSuchMessage(MessageId),

    #[error("mailbox name must start with {expected}")]
    InvalidPrefix { expected: String },

    #[error("mailbox {0} cannot be renamed")]
    RenameForbidden(String),

    #[error("mailbox {0} cannot be deleted")]
    DeleteForbidden(String),

    #[error("connector is not authorized")]
    NotAuthorized,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<StoreError> for ConnectorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => ConnectorError::Cancelled,
            StoreError::NoSuchMessage(id) => ConnectorError::NoSuchMessage(id),
            other => ConnectorError::Store(other),
        }
    }
}

impl ConnectorError {
    /// Whether the engine should answer the command with a temporary failure
    /// rather than a permanent one.
    pub fn is_temporary(&self) -> bool {
        match self {
            ConnectorError::Cancelled => true,
            ConnectorError::Store(StoreError::Sqlite(e)) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy)
                    | Some(rusqlite::ErrorCode::DatabaseLocked)
                    | Some(rusqlite::ErrorCode::CannotOpen)
                    | Some(rusqlite::ErrorCode::SystemIoFailure)
            ),
            ConnectorError::Store(StoreError::Poisoned) => true,
            ConnectorError::Dispatch(DispatchError::QueueFull { .. }) => true,
            _ => false,
        }
    }
}

/// Failure reported by the external engine
#[derive(Debug, Clone, Error)]
#[error("engine error: {0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures raised by the connector factory
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("user {0} is not loaded")]
    UserNotLoaded(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
