//! Error type of the credential store.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored upstream token could not be encoded or decoded.
    #[error("stored token is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The caller asked for something the schema forbids: a duplicate id, an
    /// unknown client, an empty redirect list.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The system CSPRNG failed.
    #[error("random generator failed")]
    Random,

    /// A previous holder of the connection panicked.
    #[error("database connection poisoned")]
    Poisoned,

    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Map a constraint violation to [`StoreError::InvalidArgument`] with
    /// `message`; pass every other failure through.
    pub(crate) fn on_constraint(err: rusqlite::Error, message: impl FnOnce() -> String) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::InvalidArgument(message())
            }
            other => Self::Sqlite(other),
        }
    }
}
