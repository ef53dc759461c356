//! Flow lifecycle operations: write/read, processing lease, sparse
//! update and conditional release.

use crate::error::{
    contention_backoff, integrity_kind, is_write_contention, Result, StoreError,
    WRITE_CONTENTION_RETRIES,
};
use crate::types::{
    from_micros, now_micros, to_micros, ClientId, FieldUpdate, Flow, FlowFilter, FlowId,
    FlowState, FlowUpdate, HuntState,
};
use crate::{process_id_string, FlowStore};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::time::Duration;
use tracing::debug;

const FLOW_COLUMNS: &str = "client_id, flow_id, name, creator, parent_flow_id, parent_hunt_id, \
     payload, flow_state, next_request_to_process, processing_on, processing_since, \
     processing_deadline, user_cpu_time_micros, system_cpu_time_micros, network_bytes_sent, \
     num_replies_sent, create_time, last_update";

fn row_to_flow(row: &SqliteRow) -> Result<Flow> {
    let state_str: String = row.get("flow_state");
    let flow_state = FlowState::parse(&state_str)
        .ok_or_else(|| StoreError::InvalidState(format!("Unknown flow state: {}", state_str)))?;

    Ok(Flow {
        client_id: ClientId::new(row.get::<String, _>("client_id")),
        flow_id: FlowId::new(row.get::<String, _>("flow_id")),
        name: row.get("name"),
        creator: row.get("creator"),
        parent_flow_id: row
            .get::<Option<String>, _>("parent_flow_id")
            .map(FlowId::new),
        parent_hunt_id: row.get("parent_hunt_id"),
        payload: row.get("payload"),
        flow_state,
        next_request_to_process: row.get("next_request_to_process"),
        processing_on: row.get("processing_on"),
        processing_since: row
            .get::<Option<i64>, _>("processing_since")
            .map(from_micros),
        processing_deadline: row
            .get::<Option<i64>, _>("processing_deadline")
            .map(from_micros),
        user_cpu_time_micros: row.get("user_cpu_time_micros"),
        system_cpu_time_micros: row.get("system_cpu_time_micros"),
        network_bytes_sent: row.get("network_bytes_sent"),
        num_replies_sent: row.get("num_replies_sent"),
        create_time: Some(from_micros(row.get::<i64, _>("create_time"))),
        last_update_time: Some(from_micros(row.get::<i64, _>("last_update"))),
    })
}

impl FlowStore {
    /// Write a flow object, creating it or (with `allow_update`) replacing
    /// its payload, state, pointer and accounting.
    ///
    /// Fails with [`StoreError::FlowExists`] when the key exists and
    /// updates are not allowed, and with [`StoreError::UnknownClient`]
    /// when the referenced client has never been registered.
    pub async fn write_flow(&self, flow: &Flow, allow_update: bool) -> Result<()> {
        let mut sql = String::from(
            r#"
            INSERT INTO flows (client_id, flow_id, name, creator, parent_flow_id,
                               parent_hunt_id, payload, flow_state, next_request_to_process,
                               user_cpu_time_micros, system_cpu_time_micros,
                               network_bytes_sent, num_replies_sent, create_time, last_update)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        );
        if allow_update {
            sql.push_str(
                r#"
                ON CONFLICT(client_id, flow_id) DO UPDATE SET
                    payload = excluded.payload,
                    flow_state = excluded.flow_state,
                    next_request_to_process = excluded.next_request_to_process,
                    last_update = excluded.last_update
                "#,
            );
        }

        let now = now_micros();
        let result = sqlx::query(&sql)
            .bind(flow.client_id.as_str())
            .bind(flow.flow_id.as_str())
            .bind(&flow.name)
            .bind(&flow.creator)
            .bind(flow.parent_flow_id.as_ref().map(FlowId::as_str))
            .bind(flow.parent_hunt_id.as_deref())
            .bind(&flow.payload)
            .bind(flow.flow_state.as_str())
            .bind(flow.next_request_to_process)
            .bind(flow.user_cpu_time_micros)
            .bind(flow.system_cpu_time_micros)
            .bind(flow.network_bytes_sent)
            .bind(flow.num_replies_sent)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match integrity_kind(&e) {
                Some(sqlx::error::ErrorKind::UniqueViolation) => Err(StoreError::FlowExists(
                    flow.client_id.clone(),
                    flow.flow_id.clone(),
                )),
                Some(sqlx::error::ErrorKind::ForeignKeyViolation) => {
                    Err(StoreError::UnknownClient(flow.client_id.clone()))
                }
                _ => Err(e.into()),
            },
        }
    }

    /// Read a flow object.
    pub async fn read_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Flow> {
        let sql = format!(
            "SELECT {FLOW_COLUMNS} FROM flows WHERE client_id = ? AND flow_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(client_id.as_str())
            .bind(flow_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_flow(&row),
            None => Err(StoreError::UnknownFlow(client_id.clone(), flow_id.clone())),
        }
    }

    /// Read all flows matching the filter. No particular order is
    /// guaranteed.
    pub async fn read_all_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>> {
        let mut sql = format!("SELECT {FLOW_COLUMNS} FROM flows WHERE 1=1");

        if filter.client_id.is_some() {
            sql.push_str(" AND client_id = ?");
        }
        if filter.parent_flow_id.is_some() {
            sql.push_str(" AND parent_flow_id = ?");
        }
        if filter.min_create_time.is_some() {
            sql.push_str(" AND create_time >= ?");
        }
        if filter.max_create_time.is_some() {
            sql.push_str(" AND create_time <= ?");
        }
        if !filter.include_child_flows {
            sql.push_str(" AND parent_flow_id IS NULL");
        }
        if let Some(creators) = &filter.not_created_by {
            let placeholders = vec!["?"; creators.len()].join(", ");
            sql.push_str(&format!(" AND creator NOT IN ({placeholders})"));
        }

        let mut query = sqlx::query(&sql);
        if let Some(client_id) = &filter.client_id {
            query = query.bind(client_id.as_str());
        }
        if let Some(parent) = &filter.parent_flow_id {
            query = query.bind(parent.as_str());
        }
        if let Some(min) = filter.min_create_time {
            query = query.bind(to_micros(min));
        }
        if let Some(max) = filter.max_create_time {
            query = query.bind(to_micros(max));
        }
        if let Some(creators) = &filter.not_created_by {
            for creator in creators {
                query = query.bind(creator.as_str());
            }
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_flow).collect()
    }

    /// Take an exclusive processing lease on a flow and return its
    /// up-to-date state.
    ///
    /// Fails with [`StoreError::FlowAlreadyBeingProcessed`] while another
    /// worker's lease has not expired, and with
    /// [`StoreError::ParentHuntIsNotRunning`] when the flow belongs to a
    /// hunt whose state is unsuitable for processing. The hunt check
    /// happens only here, at lease time; `release_processed_flow`
    /// intentionally does not repeat it.
    pub async fn lease_flow_for_processing(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        processing_time: Duration,
    ) -> Result<Flow> {
        // The transaction reads the flow before writing the lease, so a
        // concurrent leaser can cost it the read-to-write upgrade; rerun
        // until one side wins or the contender's lease becomes visible.
        let mut attempt = 0;
        loop {
            match self
                .try_lease_flow_for_processing(client_id, flow_id, processing_time)
                .await
            {
                Err(e) if is_write_contention(&e) && attempt < WRITE_CONTENTION_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(contention_backoff(attempt)).await;
                }
                result => return result,
            }
        }
    }

    async fn try_lease_flow_for_processing(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        processing_time: Duration,
    ) -> Result<Flow> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {FLOW_COLUMNS} FROM flows WHERE client_id = ? AND flow_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(client_id.as_str())
            .bind(flow_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let mut flow = match row {
            Some(row) => row_to_flow(&row)?,
            None => return Err(StoreError::UnknownFlow(client_id.clone(), flow_id.clone())),
        };

        let now = now_micros();
        if flow.processing_on.is_some() {
            if let Some(deadline) = flow.processing_deadline {
                if to_micros(deadline) > now {
                    return Err(StoreError::FlowAlreadyBeingProcessed(
                        client_id.clone(),
                        flow_id.clone(),
                    ));
                }
            }
        }

        if let Some(hunt_id) = &flow.parent_hunt_id {
            let state: Option<String> =
                sqlx::query_scalar("SELECT hunt_state FROM hunts WHERE hunt_id = ?")
                    .bind(hunt_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(state_str) = state {
                let hunt_state = HuntState::parse(&state_str).ok_or_else(|| {
                    StoreError::InvalidState(format!("Unknown hunt state: {}", state_str))
                })?;
                if !hunt_state.is_suitable_for_flow_processing() {
                    return Err(StoreError::ParentHuntIsNotRunning {
                        client_id: client_id.clone(),
                        flow_id: flow_id.clone(),
                        hunt_id: hunt_id.clone(),
                        hunt_state,
                    });
                }
            }
        }

        let deadline = now + processing_time.as_micros() as i64;
        let token = process_id_string();
        sqlx::query(
            r#"
            UPDATE flows SET processing_on = ?, processing_since = ?, processing_deadline = ?
            WHERE client_id = ? AND flow_id = ?
            "#,
        )
        .bind(&token)
        .bind(now)
        .bind(deadline)
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(client_id = %client_id, flow_id = %flow_id, %token, "Leased flow for processing");

        flow.processing_on = Some(token);
        flow.processing_since = Some(from_micros(now));
        flow.processing_deadline = Some(from_micros(deadline));
        Ok(flow)
    }

    /// Sparse update of a flow row. Only the fields marked changed in the
    /// update are written.
    pub async fn update_flow(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        update: &FlowUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut sets = vec!["last_update = ?".to_string()];
        if update.flow.is_some() {
            sets.push("payload = ?".into());
            sets.push("user_cpu_time_micros = ?".into());
            sets.push("system_cpu_time_micros = ?".into());
            sets.push("network_bytes_sent = ?".into());
            sets.push("num_replies_sent = ?".into());
        }
        // An explicit flow_state wins over the one inside `flow`.
        let state = update
            .flow_state
            .or(update.flow.as_ref().map(|f| f.flow_state));
        if state.is_some() {
            sets.push("flow_state = ?".into());
        }
        match &update.processing_on {
            FieldUpdate::Unchanged => {}
            FieldUpdate::Clear => sets.push("processing_on = NULL".into()),
            FieldUpdate::Set(_) => sets.push("processing_on = ?".into()),
        }
        match &update.processing_since {
            FieldUpdate::Unchanged => {}
            FieldUpdate::Clear => sets.push("processing_since = NULL".into()),
            FieldUpdate::Set(_) => sets.push("processing_since = ?".into()),
        }
        match &update.processing_deadline {
            FieldUpdate::Unchanged => {}
            FieldUpdate::Clear => sets.push("processing_deadline = NULL".into()),
            FieldUpdate::Set(_) => sets.push("processing_deadline = ?".into()),
        }

        let sql = format!(
            "UPDATE flows SET {} WHERE client_id = ? AND flow_id = ?",
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(now_micros());
        if let Some(flow) = &update.flow {
            query = query
                .bind(&flow.payload)
                .bind(flow.user_cpu_time_micros)
                .bind(flow.system_cpu_time_micros)
                .bind(flow.network_bytes_sent)
                .bind(flow.num_replies_sent);
        }
        if let Some(state) = state {
            query = query.bind(state.as_str());
        }
        if let FieldUpdate::Set(on) = &update.processing_on {
            query = query.bind(on.as_str());
        }
        if let FieldUpdate::Set(since) = &update.processing_since {
            query = query.bind(to_micros(*since));
        }
        if let FieldUpdate::Set(deadline) = &update.processing_deadline {
            query = query.bind(to_micros(*deadline));
        }
        query = query.bind(client_id.as_str()).bind(flow_id.as_str());

        let updated = query.execute(&self.pool).await?.rows_affected();
        if updated == 0 {
            return Err(StoreError::UnknownFlow(client_id.clone(), flow_id.clone()));
        }
        Ok(())
    }

    /// Release a flow the worker finished processing: clear the lease,
    /// advance the pointer, and store the new payload, state and
    /// accounting.
    ///
    /// The whole release is one conditional UPDATE guarded by a
    /// correlated subquery: it applies only if the request at the new
    /// `next_request_to_process` is not already waiting to trigger
    /// another cycle. Returns whether the release applied; `false` means
    /// a new trigger raced the worker, which must re-check instead of
    /// publishing stale state.
    pub async fn release_processed_flow(&self, flow: &Flow) -> Result<bool> {
        let now = now_micros();
        let updated = sqlx::query(
            r#"
            UPDATE flows SET
                payload = ?,
                processing_on = NULL,
                processing_since = NULL,
                processing_deadline = NULL,
                next_request_to_process = ?,
                flow_state = ?,
                user_cpu_time_micros = ?,
                system_cpu_time_micros = ?,
                network_bytes_sent = ?,
                num_replies_sent = ?,
                last_update = ?
            WHERE client_id = ? AND flow_id = ?
              AND NOT EXISTS (
                SELECT 1 FROM flow_requests
                WHERE client_id = ? AND flow_id = ? AND request_id = ?
                  AND needs_processing
                  AND (start_time IS NULL OR start_time < ?)
              )
            "#,
        )
        .bind(&flow.payload)
        .bind(flow.next_request_to_process)
        .bind(flow.flow_state.as_str())
        .bind(flow.user_cpu_time_micros)
        .bind(flow.system_cpu_time_micros)
        .bind(flow.network_bytes_sent)
        .bind(flow.num_replies_sent)
        .bind(now)
        .bind(flow.client_id.as_str())
        .bind(flow.flow_id.as_str())
        .bind(flow.client_id.as_str())
        .bind(flow.flow_id.as_str())
        .bind(flow.next_request_to_process)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }
}
