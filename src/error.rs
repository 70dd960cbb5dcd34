//! Error taxonomy for queue and bookkeeping operations.
use crate::lease::LeaseState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not open a connection or begin a transaction.
    #[error("connection error: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A write touched an unexpected number of rows.
    #[error("integrity violation: {0}")]
    Integrity(String),
    /// `acknowledge`/`abandon` on a lease that is no longer active.
    #[error("lease for message {message_id} is already {state}")]
    Settlement { message_id: i64, state: LeaseState },
    /// The row's claim was released or taken over by another claimant.
    #[error("claim on queue row {row_id} is no longer held")]
    ClaimLost { row_id: i64 },
    #[error("unknown status name {0:?}")]
    UnknownStatus(String),
    #[error("unknown message type {0}")]
    UnknownMessageType(i64),
    #[error("malformed message envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub(crate) fn rows_affected(op: &str, expected: u64, actual: u64) -> Self {
        StoreError::Integrity(format!(
            "{op}: expected {expected} affected row(s), got {actual}"
        ))
    }
}
