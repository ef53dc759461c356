//! Error types for the flow store.

use crate::types::{ClientId, FlowId, HuntState};
use thiserror::Error;

/// Store operation result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Flow store errors.
///
/// Integrity violations coming out of SQLite are translated into the
/// domain variants at the store boundary; callers never see raw
/// constraint errors for the documented failure modes.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The referenced client does not exist.
    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    /// The referenced flow does not exist.
    #[error("Unknown flow: {0}/{1}")]
    UnknownFlow(ClientId, FlowId),

    /// A flow with this key already exists and updates were not allowed.
    #[error("Flow already exists: {0}/{1}")]
    FlowExists(ClientId, FlowId),

    /// A request batch referenced at least one nonexistent flow. Requests
    /// are foreign-keyed to flows, so the whole batch is rejected.
    #[error("At least one flow in {0:?} is unknown")]
    AtLeastOneUnknownFlow(Vec<(ClientId, FlowId)>),

    /// The flow's parent hunt is not in a state suitable for processing.
    #[error("Parent hunt {hunt_id} of flow {client_id}/{flow_id} is not running (state: {hunt_state})")]
    ParentHuntIsNotRunning {
        client_id: ClientId,
        flow_id: FlowId,
        hunt_id: String,
        hunt_state: HuntState,
    },

    /// Another worker holds a non-expired processing lease on the flow.
    #[error("Flow {0}/{1} is already being processed")]
    FlowAlreadyBeingProcessed(ClientId, FlowId),

    /// A stored value could not be interpreted (e.g. unknown state string).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classifies a sqlx error as an integrity violation, if it is one.
pub(crate) fn integrity_kind(err: &sqlx::Error) -> Option<sqlx::error::ErrorKind> {
    match err {
        sqlx::Error::Database(db) => match db.kind() {
            kind @ (sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::ForeignKeyViolation) => Some(kind),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(
        integrity_kind(err),
        Some(sqlx::error::ErrorKind::ForeignKeyViolation)
    )
}

/// How often a transaction that lost a write-contention race is retried
/// before the error is surfaced.
pub(crate) const WRITE_CONTENTION_RETRIES: u32 = 10;

/// SQLITE_BUSY (primary code 5, including extended codes such as
/// SQLITE_BUSY_SNAPSHOT). A transaction that reads before its first
/// write starts deferred; when another writer commits in between, the
/// read-to-write upgrade fails immediately (the busy timeout does not
/// apply to snapshot upgrades). The transaction rolled back cleanly
/// and can be rerun from the top.
pub(crate) fn is_write_contention(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlx(sqlx::Error::Database(db)) => db
            .code()
            .and_then(|code| code.parse::<u32>().ok())
            .map(|code| code & 0xff == 5)
            .unwrap_or(false),
        _ => false,
    }
}

pub(crate) fn contention_backoff(attempt: u32) -> std::time::Duration {
    let base = 10u64 << attempt.min(5);
    let jitter = u64::from(rand::random::<u8>() % 16);
    std::time::Duration::from_millis(base.min(250) + jitter)
}
