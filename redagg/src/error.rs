use crate::schema::ColumnKind;
use crate::value::InstanceId;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Join: {0}")]
    JoinError(#[from] JoinError),

    #[error("Invalid model: {0}")]
    Schema(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown column {entity}.{column}")]
    UnknownColumn { entity: String, column: String },

    #[error("Unknown relationship {entity}.{relationship}")]
    UnknownRelationship { entity: String, relationship: String },

    #[error("Column {table}.{column} is already the target of another aggregate")]
    AmbiguousAggregate { table: String, column: String },

    #[error("Column {column} expects {expected:?}, got {found}")]
    TypeMismatch { column: String, expected: ColumnKind, found: String },

    #[error("Aggregation failed: {0}")]
    Evaluation(String),

    #[error("Cannot resolve parent {entity}#{id}: {reason}")]
    UnresolvedParent { entity: String, id: u64, reason: String },

    #[error("Corrupt storage: {0}")]
    Corrupt(String),

    #[error("Unknown instance {0:?}")]
    UnknownInstance(InstanceId),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl AppError {
    pub fn unresolved(entity: &str, id: u64, reason: impl Into<String>) -> Self {
        AppError::UnresolvedParent { entity: entity.to_string(), id, reason: reason.into() }
    }

    pub fn unknown_column(entity: &str, column: &str) -> Self {
        AppError::UnknownColumn { entity: entity.to_string(), column: column.to_string() }
    }
}
