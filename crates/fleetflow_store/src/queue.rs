//! Leased notification queues: the flow processing request (FPR) queue
//! and the message handler inbox.
//!
//! Both share one leasing pattern: claim up to `limit` eligible rows by
//! stamping `leased_until`/`leased_by`, then re-select exactly the rows
//! carrying this worker's stamp. Expired leases silently become eligible
//! again - expiry is the only retry trigger, giving at-least-once
//! delivery. Acks are idempotent deletes.

use crate::error::Result;
use crate::salted_lease_token;
use crate::types::{
    from_micros, now_micros, to_micros, ClientId, FlowId, FlowProcessingRequest,
    MessageHandlerRequest,
};
use crate::FlowStore;
use sqlx::{Row, SqliteConnection};
use std::time::Duration;
use tracing::debug;

/// How long a leased FPR stays claimed before it is retried.
const FPR_LEASE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Construction-time descriptor of a leasable table.
struct LeasedTable {
    table: &'static str,
    /// Whether rows carry a `delivery_time` that defers eligibility.
    honors_delivery_time: bool,
}

const FPR_QUEUE: LeasedTable = LeasedTable {
    table: "flow_processing_requests",
    honors_delivery_time: true,
};

const MESSAGE_INBOX: LeasedTable = LeasedTable {
    table: "message_handler_requests",
    honors_delivery_time: false,
};

impl LeasedTable {
    /// Claim up to `limit` eligible rows for `token`. Returns the number
    /// of rows claimed; the caller re-selects them by exact
    /// (token, expiry) match rather than trusting "the last N updated".
    async fn claim(
        &self,
        tx: &mut SqliteConnection,
        now: i64,
        expiry: i64,
        token: &str,
        limit: i64,
    ) -> Result<u64> {
        let delivery_clause = if self.honors_delivery_time {
            "(delivery_time IS NULL OR delivery_time <= ?) AND "
        } else {
            ""
        };
        let sql = format!(
            "UPDATE {table} SET leased_until = ?, leased_by = ? \
             WHERE rowid IN ( \
               SELECT rowid FROM {table} \
               WHERE {delivery_clause}(leased_until IS NULL OR leased_until < ?) \
               LIMIT ?)",
            table = self.table,
            delivery_clause = delivery_clause,
        );
        let mut query = sqlx::query(&sql).bind(expiry).bind(token);
        if self.honors_delivery_time {
            query = query.bind(now);
        }
        let updated = query
            .bind(now)
            .bind(limit)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        Ok(updated)
    }
}

impl FlowStore {
    /// Insert FPRs inside an ongoing transaction. Creation timestamps are
    /// bumped within the batch to keep the composite key unique.
    pub(crate) async fn insert_flow_processing_requests(
        tx: &mut SqliteConnection,
        requests: &[FlowProcessingRequest],
    ) -> Result<()> {
        let base = now_micros();
        for (i, r) in requests.iter().enumerate() {
            sqlx::query(
                "INSERT INTO flow_processing_requests \
                 (client_id, flow_id, creation_time, delivery_time) VALUES (?, ?, ?, ?)",
            )
            .bind(r.client_id.as_str())
            .bind(r.flow_id.as_str())
            .bind(base + i as i64)
            .bind(r.delivery_time.map(to_micros))
            .execute(&mut *tx)
            .await?;
        }
        Ok(())
    }

    /// Write flow processing requests directly (normally they are emitted
    /// by the correlator as a side effect of request/response writes).
    pub async fn write_flow_processing_requests(
        &self,
        requests: &[FlowProcessingRequest],
    ) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        Self::insert_flow_processing_requests(&mut tx, requests).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Read all flow processing requests (maintenance surface).
    pub async fn read_flow_processing_requests(&self) -> Result<Vec<FlowProcessingRequest>> {
        let rows = sqlx::query(
            "SELECT client_id, flow_id, creation_time, delivery_time, leased_until, leased_by \
             FROM flow_processing_requests ORDER BY creation_time",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FlowProcessingRequest {
                client_id: ClientId::new(row.get::<String, _>("client_id")),
                flow_id: FlowId::new(row.get::<String, _>("flow_id")),
                creation_time: Some(from_micros(row.get::<i64, _>("creation_time"))),
                delivery_time: row.get::<Option<i64>, _>("delivery_time").map(from_micros),
                leased_until: row.get::<Option<i64>, _>("leased_until").map(from_micros),
                leased_by: row.get("leased_by"),
            })
            .collect())
    }

    /// Acknowledge processed FPRs by deleting them. Idempotent: acking an
    /// already-deleted request is a no-op.
    pub async fn ack_flow_processing_requests(
        &self,
        requests: &[FlowProcessingRequest],
    ) -> Result<()> {
        // Requests without a creation time were never read back from the
        // store and cannot match any row.
        let keyed: Vec<&FlowProcessingRequest> = requests
            .iter()
            .filter(|r| r.creation_time.is_some())
            .collect();
        if keyed.is_empty() {
            return Ok(());
        }

        let conditions =
            vec!["(client_id = ? AND flow_id = ? AND creation_time = ?)"; keyed.len()].join(" OR ");
        let sql = format!("DELETE FROM flow_processing_requests WHERE {conditions}");
        let mut query = sqlx::query(&sql);
        for r in &keyed {
            let creation = r.creation_time.map(to_micros).unwrap_or_default();
            query = query
                .bind(r.client_id.as_str())
                .bind(r.flow_id.as_str())
                .bind(creation);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Delete every flow processing request (maintenance surface).
    pub async fn delete_all_flow_processing_requests(&self) -> Result<()> {
        sqlx::query("DELETE FROM flow_processing_requests")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lease up to `limit` due, unleased (or lease-expired) FPRs for this
    /// worker with a fixed ten-minute window.
    pub async fn lease_flow_processing_requests(
        &self,
        limit: usize,
    ) -> Result<Vec<FlowProcessingRequest>> {
        let now = now_micros();
        let expiry = now + FPR_LEASE_WINDOW.as_micros() as i64;
        let token = salted_lease_token();

        let mut tx = self.pool.begin().await?;
        let updated = FPR_QUEUE
            .claim(&mut tx, now, expiry, &token, limit as i64)
            .await?;
        if updated == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT client_id, flow_id, creation_time, delivery_time \
             FROM flow_processing_requests \
             WHERE leased_by = ? AND leased_until = ? LIMIT ?",
        )
        .bind(&token)
        .bind(expiry)
        .bind(updated as i64)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(count = rows.len(), %token, "Leased flow processing requests");

        Ok(rows
            .iter()
            .map(|row| FlowProcessingRequest {
                client_id: ClientId::new(row.get::<String, _>("client_id")),
                flow_id: FlowId::new(row.get::<String, _>("flow_id")),
                creation_time: Some(from_micros(row.get::<i64, _>("creation_time"))),
                delivery_time: row.get::<Option<i64>, _>("delivery_time").map(from_micros),
                leased_until: Some(from_micros(expiry)),
                leased_by: Some(token.clone()),
            })
            .collect())
    }

    // ========================================================================
    // Message handler inbox
    // ========================================================================

    /// Write message handler requests. Duplicate request ids are ignored.
    pub async fn write_message_handler_requests(
        &self,
        requests: &[MessageHandlerRequest],
    ) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let values = vec!["(?, ?, ?, ?)"; requests.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO message_handler_requests \
             (request_id, handler_name, payload, create_time) VALUES {values}"
        );
        let now = now_micros();
        let mut query = sqlx::query(&sql);
        for r in requests {
            query = query
                .bind(r.request_id)
                .bind(&r.handler_name)
                .bind(&r.payload)
                .bind(now);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Read all message handler requests, newest first (maintenance
    /// surface).
    pub async fn read_message_handler_requests(&self) -> Result<Vec<MessageHandlerRequest>> {
        let rows = sqlx::query(
            "SELECT request_id, handler_name, payload, create_time, leased_until, leased_by \
             FROM message_handler_requests ORDER BY create_time DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_message_request).collect())
    }

    /// Delete message handler requests by id. Idempotent.
    pub async fn delete_message_handler_requests(
        &self,
        requests: &[MessageHandlerRequest],
    ) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; requests.len()].join(", ");
        let sql = format!(
            "DELETE FROM message_handler_requests WHERE request_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for r in requests {
            query = query.bind(r.request_id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Lease up to `limit` message handler requests for `lease_time`.
    pub async fn lease_message_handler_requests(
        &self,
        lease_time: Duration,
        limit: usize,
    ) -> Result<Vec<MessageHandlerRequest>> {
        let now = now_micros();
        let expiry = now + lease_time.as_micros() as i64;
        let token = salted_lease_token();

        let mut tx = self.pool.begin().await?;
        let updated = MESSAGE_INBOX
            .claim(&mut tx, now, expiry, &token, limit as i64)
            .await?;
        if updated == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT request_id, handler_name, payload, create_time, leased_until, leased_by \
             FROM message_handler_requests \
             WHERE leased_by = ? AND leased_until = ? LIMIT ?",
        )
        .bind(&token)
        .bind(expiry)
        .bind(updated as i64)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(count = rows.len(), %token, "Leased message handler requests");

        Ok(rows.iter().map(row_to_message_request).collect())
    }
}

fn row_to_message_request(row: &sqlx::sqlite::SqliteRow) -> MessageHandlerRequest {
    MessageHandlerRequest {
        request_id: row.get("request_id"),
        handler_name: row.get("handler_name"),
        payload: row.get("payload"),
        create_time: Some(from_micros(row.get::<i64, _>("create_time"))),
        leased_until: row.get::<Option<i64>, _>("leased_until").map(from_micros),
        leased_by: row.get("leased_by"),
    }
}
