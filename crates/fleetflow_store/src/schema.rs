//! Database schema creation for all Fleetflow tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::FlowStore;
use tracing::info;

impl FlowStore {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // Minimal client registry; flows are foreign-keyed to it so that
        // writes against unknown clients are detectable.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS clients (
                client_id TEXT PRIMARY KEY,
                first_seen_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Minimal hunt registry; only hunt_state is consulted here.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS hunts (
                hunt_id TEXT PRIMARY KEY,
                hunt_state TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS flows (
                client_id TEXT NOT NULL REFERENCES clients(client_id),
                flow_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                creator TEXT NOT NULL DEFAULT '',
                parent_flow_id TEXT,
                parent_hunt_id TEXT,
                payload BLOB NOT NULL,
                flow_state TEXT NOT NULL,
                next_request_to_process INTEGER NOT NULL DEFAULT 1,
                processing_on TEXT,
                processing_since INTEGER,
                processing_deadline INTEGER,
                user_cpu_time_micros INTEGER NOT NULL DEFAULT 0,
                system_cpu_time_micros INTEGER NOT NULL DEFAULT 0,
                network_bytes_sent INTEGER NOT NULL DEFAULT 0,
                num_replies_sent INTEGER NOT NULL DEFAULT 0,
                create_time INTEGER NOT NULL,
                last_update INTEGER NOT NULL,
                PRIMARY KEY (client_id, flow_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS flow_requests (
                client_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                request_id INTEGER NOT NULL,
                needs_processing INTEGER NOT NULL DEFAULT 0,
                callback_state TEXT,
                next_response_id INTEGER NOT NULL DEFAULT 1,
                responses_expected INTEGER,
                start_time INTEGER,
                payload BLOB NOT NULL,
                create_time INTEGER NOT NULL,
                PRIMARY KEY (client_id, flow_id, request_id),
                FOREIGN KEY (client_id, flow_id) REFERENCES flows(client_id, flow_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS flow_responses (
                client_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                request_id INTEGER NOT NULL,
                response_id INTEGER NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('RESPONSE', 'STATUS', 'ITERATOR')),
                payload BLOB NOT NULL,
                responses_expected INTEGER,
                create_time INTEGER NOT NULL,
                PRIMARY KEY (client_id, flow_id, request_id, response_id),
                FOREIGN KEY (client_id, flow_id, request_id)
                    REFERENCES flow_requests(client_id, flow_id, request_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS flow_processing_requests (
                client_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                creation_time INTEGER NOT NULL,
                delivery_time INTEGER,
                leased_until INTEGER,
                leased_by TEXT,
                PRIMARY KEY (client_id, flow_id, creation_time)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS message_handler_requests (
                request_id INTEGER PRIMARY KEY,
                handler_name TEXT NOT NULL,
                payload BLOB NOT NULL,
                create_time INTEGER NOT NULL,
                leased_until INTEGER,
                leased_by TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_flows_parent ON flows(parent_flow_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fpr_lease ON flow_processing_requests(leased_by, leased_until)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mhr_lease ON message_handler_requests(leased_by, leased_until)",
        )
        .execute(&self.pool)
        .await?;

        info!("Flow store schema verified");
        Ok(())
    }
}
