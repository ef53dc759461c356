//! Durable flow coordination store for Fleetflow.
//!
//! This crate owns the server-side state behind asynchronous remote
//! execution flows: the flow lifecycle rows, the request/response
//! correlation tables, and the two leased notification queues (flow
//! processing requests and the message handler inbox). Agents reply at
//! their own pace, possibly out of order and with duplicates; everything
//! needed to sequence those replies lives in SQLite and is mutated only
//! inside transactions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fleetflow_store::FlowStore;
//!
//! let store = FlowStore::open("~/.fleetflow/fleetflow.sqlite3").await?;
//!
//! store.write_flow_responses(&responses).await?;
//! let ready = store.lease_flow_processing_requests(8).await?;
//! ```

mod error;
mod schema;
mod types;

// Method implementations organized by domain
mod flows;
mod queue;
mod requests;

pub use error::{Result, StoreError};
pub use types::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Flow coordination store over a SQLite pool.
///
/// Cloning is cheap and shares the pool. Multiple worker processes may
/// operate on the same database file; all coordination state is mutated
/// inside transactions, never in process memory.
#[derive(Clone)]
pub struct FlowStore {
    pub(crate) pool: SqlitePool,
}

impl FlowStore {
    /// Open or create a store at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!(path = %path.display(), "Flow store opened");

        Ok(store)
    }

    /// Open an in-memory store, mostly useful for tests.
    ///
    /// Capped at one connection: every pooled connection would otherwise
    /// see its own private in-memory database.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Get the underlying connection pool (escape hatch for maintenance
    /// queries). Prefer the typed methods.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Client and hunt registries (external collaborators, kept minimal)
    // ========================================================================

    /// Register a client. Idempotent.
    pub async fn write_client(&self, client_id: &ClientId) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO clients (client_id, first_seen_at) VALUES (?, ?)",
        )
        .bind(client_id.as_str())
        .bind(types::now_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a hunt's state. Only the state is consulted by this core.
    pub async fn write_hunt(&self, hunt_id: &str, hunt_state: HuntState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hunts (hunt_id, hunt_state) VALUES (?, ?)
            ON CONFLICT(hunt_id) DO UPDATE SET hunt_state = excluded.hunt_state
            "#,
        )
        .bind(hunt_id)
        .bind(hunt_state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Identifies this worker process in lease columns.
pub(crate) fn process_id_string() -> String {
    format!("worker-{}", std::process::id())
}

/// Lease token with a random salt, so claims made by the same process in
/// the same instant stay distinguishable when re-selecting leased rows.
pub(crate) fn salted_lease_token() -> String {
    format!("{}:{}", process_id_string(), rand::random::<u16>())
}
