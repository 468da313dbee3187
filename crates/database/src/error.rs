//! Error types for the database layer

use parley_relay::CollaboratorError;
use thiserror::Error;

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    #[error("Database query error: {0}")]
    QueryError(String),

    #[error("Database migration error: {0}")]
    MigrationError(String),

    #[error("Stored envelope {id} could not be decoded: {reason}")]
    CorruptEnvelope { id: i64, reason: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        Self::QueryError(err.to_string())
    }
}

impl From<DatabaseError> for CollaboratorError {
    fn from(err: DatabaseError) -> Self {
        CollaboratorError::unavailable("database", err)
    }
}
