//! Request/response correlation: writing requests and responses,
//! detecting completed requests, and scheduling flow processing
//! requests (FPRs) when a flow's next request becomes ready.

use crate::error::{
    contention_backoff, integrity_kind, is_foreign_key_violation, is_write_contention, Result,
    StoreError, WRITE_CONTENTION_RETRIES,
};
use crate::types::{
    from_micros, now_micros, to_micros, ClientId, FlowId, FlowProcessingRequest, FlowRequest,
    FlowResponse, FlowResponseData,
};
use crate::FlowStore;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Bounds multi-row statement size. SQLite's bind parameter budget is
/// the limiting factor (10 parameters per request row).
const WRITE_ROWS_BATCH_SIZE: usize = 1000;
const DELETE_ROWS_BATCH_SIZE: usize = 1000;

type FlowKey = (ClientId, FlowId);
type RequestKey = (ClientId, FlowId, i64);

fn row_to_request(row: &SqliteRow) -> FlowRequest {
    FlowRequest {
        client_id: ClientId::new(row.get::<String, _>("client_id")),
        flow_id: FlowId::new(row.get::<String, _>("flow_id")),
        request_id: row.get("request_id"),
        payload: row.get("payload"),
        needs_processing: row.get("needs_processing"),
        callback_state: row.get("callback_state"),
        next_response_id: row.get("next_response_id"),
        responses_expected: row.get("responses_expected"),
        start_time: row.get::<Option<i64>, _>("start_time").map(from_micros),
        create_time: Some(from_micros(row.get::<i64, _>("create_time"))),
    }
}

fn row_to_response(row: &SqliteRow) -> Result<FlowResponse> {
    let kind: String = row.get("kind");
    let payload: Vec<u8> = row.get("payload");
    let data = match kind.as_str() {
        "RESPONSE" => FlowResponseData::Response { payload },
        "STATUS" => FlowResponseData::Status {
            payload,
            responses_expected: row
                .get::<Option<i64>, _>("responses_expected")
                .unwrap_or_default(),
        },
        "ITERATOR" => FlowResponseData::Iterator { payload },
        other => {
            return Err(StoreError::InvalidState(format!(
                "Unknown response kind: {}",
                other
            )))
        }
    };
    Ok(FlowResponse {
        client_id: ClientId::new(row.get::<String, _>("client_id")),
        flow_id: FlowId::new(row.get::<String, _>("flow_id")),
        request_id: row.get("request_id"),
        response_id: row.get("response_id"),
        data,
        create_time: Some(from_micros(row.get::<i64, _>("create_time"))),
    })
}

impl FlowStore {
    /// Write a batch of flow requests.
    ///
    /// Requests are foreign-keyed to flows, so a batch referencing any
    /// nonexistent flow is rejected whole with
    /// [`StoreError::AtLeastOneUnknownFlow`]. For every request flagged
    /// `needs_processing` that matches its flow's
    /// `next_request_to_process` - or that carries a `start_time`, which
    /// always triggers - one FPR is emitted in the same transaction.
    pub async fn write_flow_requests(&self, requests: &[FlowRequest]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let now = now_micros();

        for chunk in requests.chunks(WRITE_ROWS_BATCH_SIZE) {
            let values = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO flow_requests (client_id, flow_id, request_id, needs_processing, \
                 callback_state, next_response_id, responses_expected, start_time, payload, \
                 create_time) VALUES {values}"
            );
            let mut query = sqlx::query(&sql);
            for r in chunk {
                query = query
                    .bind(r.client_id.as_str())
                    .bind(r.flow_id.as_str())
                    .bind(r.request_id)
                    .bind(r.needs_processing)
                    // Empty callback states are stored as NULL so they
                    // never count as incrementally processable.
                    .bind(r.callback_state.as_deref().filter(|s| !s.is_empty()))
                    .bind(r.next_response_id)
                    .bind(r.responses_expected)
                    .bind(r.start_time.map(to_micros))
                    .bind(&r.payload)
                    .bind(now);
            }
            if let Err(e) = query.execute(&mut *tx).await {
                if integrity_kind(&e).is_some() {
                    let keys: BTreeSet<FlowKey> = requests
                        .iter()
                        .map(|r| (r.client_id.clone(), r.flow_id.clone()))
                        .collect();
                    return Err(StoreError::AtLeastOneUnknownFlow(
                        keys.into_iter().collect(),
                    ));
                }
                return Err(e.into());
            }
        }

        let mut candidates: BTreeMap<FlowKey, Vec<&FlowRequest>> = BTreeMap::new();
        for r in requests.iter().filter(|r| r.needs_processing) {
            candidates
                .entry((r.client_id.clone(), r.flow_id.clone()))
                .or_default()
                .push(r);
        }

        if !candidates.is_empty() {
            let next_requests =
                Self::read_next_requests_to_process(&mut tx, candidates.keys()).await?;

            let mut fprs = Vec::new();
            for (key, reqs) in &candidates {
                let Some(next) = next_requests.get(key) else {
                    continue;
                };
                for r in reqs {
                    if *next == r.request_id || r.start_time.is_some() {
                        let mut fpr =
                            FlowProcessingRequest::new(r.client_id.clone(), r.flow_id.clone());
                        fpr.delivery_time = r.start_time;
                        fprs.push(fpr);
                    }
                }
            }
            Self::insert_flow_processing_requests(&mut tx, &fprs).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Write a batch of responses and update the affected requests.
    ///
    /// Responses are processed in fixed-size batches; each batch runs
    /// through two steps: (1) idempotent insert plus `responses_expected`
    /// stamping from Status responses, (2) completion detection and FPR
    /// scheduling in a single transaction. Duplicate delivery is silently
    /// absorbed.
    pub async fn write_flow_responses(&self, responses: &[FlowResponse]) -> Result<()> {
        if responses.is_empty() {
            return Ok(());
        }

        for batch in responses.chunks(WRITE_ROWS_BATCH_SIZE) {
            self.write_responses_and_expected_updates(batch).await?;
            self.update_requests_and_schedule_fprs(batch).await?;
        }
        Ok(())
    }

    /// Step 1: store the responses and stamp expected counts.
    async fn write_responses_and_expected_updates(&self, batch: &[FlowResponse]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        Self::insert_responses(&mut tx, batch).await?;

        for r in batch {
            if let FlowResponseData::Status {
                responses_expected, ..
            } = &r.data
            {
                sqlx::query(
                    "UPDATE flow_requests SET responses_expected = ? \
                     WHERE client_id = ? AND flow_id = ? AND request_id = ?",
                )
                .bind(*responses_expected)
                .bind(r.client_id.as_str())
                .bind(r.flow_id.as_str())
                .bind(r.request_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert responses, falling back to row-by-row on a foreign key
    /// violation so one orphan response does not lose the valid replies
    /// sharing its batch. A lone orphan is logged and dropped.
    async fn insert_responses(tx: &mut SqliteConnection, responses: &[FlowResponse]) -> Result<()> {
        match Self::insert_response_rows(tx, responses).await {
            Ok(()) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => {
                if responses.len() == 1 {
                    let r = &responses[0];
                    warn!(
                        client_id = %r.client_id,
                        flow_id = %r.flow_id,
                        request_id = r.request_id,
                        response_id = r.response_id,
                        "Response for unknown request, dropping"
                    );
                    return Ok(());
                }
                for r in responses {
                    match Self::insert_response_rows(tx, std::slice::from_ref(r)).await {
                        Ok(()) => {}
                        Err(e) if is_foreign_key_violation(&e) => {
                            warn!(
                                client_id = %r.client_id,
                                flow_id = %r.flow_id,
                                request_id = r.request_id,
                                response_id = r.response_id,
                                "Response for unknown request, dropping"
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_response_rows(
        tx: &mut SqliteConnection,
        responses: &[FlowResponse],
    ) -> std::result::Result<(), sqlx::Error> {
        if responses.is_empty() {
            return Ok(());
        }
        let values = vec!["(?, ?, ?, ?, ?, ?, ?, ?)"; responses.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO flow_responses (client_id, flow_id, request_id, response_id, \
             kind, payload, responses_expected, create_time) VALUES {values}"
        );
        let now = now_micros();
        let mut query = sqlx::query(&sql);
        for r in responses {
            let expected = match &r.data {
                FlowResponseData::Status {
                    responses_expected, ..
                } => Some(*responses_expected),
                _ => None,
            };
            query = query
                .bind(r.client_id.as_str())
                .bind(r.flow_id.as_str())
                .bind(r.request_id)
                .bind(r.response_id)
                .bind(r.data.kind_str())
                .bind(r.data.payload())
                .bind(expected)
                .bind(now);
        }
        query.execute(&mut *tx).await?;
        Ok(())
    }

    /// Step 2: mark requests whose responses are complete and schedule
    /// FPRs for flows whose next request just became ready.
    ///
    /// Everything happens in one transaction, flows read before requests,
    /// which is the serialization point preventing duplicate or lost FPR
    /// emission when response batches for the same flow commit
    /// concurrently.
    async fn update_requests_and_schedule_fprs(&self, batch: &[FlowResponse]) -> Result<()> {
        // The transaction counts and reads before its first write, so a
        // concurrent batch for the same flow can cost it the
        // read-to-write upgrade. Rerunning from the top recomputes the
        // counts against the winner's committed state.
        let mut attempt = 0;
        loop {
            match self.try_update_requests_and_schedule_fprs(batch).await {
                Err(e) if is_write_contention(&e) && attempt < WRITE_CONTENTION_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(contention_backoff(attempt)).await;
                }
                result => return result,
            }
        }
    }

    async fn try_update_requests_and_schedule_fprs(&self, batch: &[FlowResponse]) -> Result<()> {
        let request_keys: BTreeSet<RequestKey> = batch
            .iter()
            .map(|r| (r.client_id.clone(), r.flow_id.clone(), r.request_id))
            .collect();
        let flow_keys: BTreeSet<FlowKey> = batch
            .iter()
            .map(|r| (r.client_id.clone(), r.flow_id.clone()))
            .collect();

        let mut tx = self.pool.begin().await?;

        let response_counts = Self::read_response_counts(&mut tx, &request_keys).await?;
        let next_requests =
            Self::read_next_requests_to_process(&mut tx, flow_keys.iter()).await?;
        let affected =
            Self::mark_affected_requests(&mut tx, &request_keys, &response_counts).await?;

        if affected.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        let mut fprs = Vec::new();
        for (key, start_time) in &affected {
            let (client_id, flow_id, request_id) = key;
            if next_requests.get(&(client_id.clone(), flow_id.clone())) == Some(request_id) {
                let mut fpr = FlowProcessingRequest::new(client_id.clone(), flow_id.clone());
                fpr.delivery_time = *start_time;
                fprs.push(fpr);
            }
        }
        Self::insert_flow_processing_requests(&mut tx, &fprs).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Counts stored responses per touched request, skipping requests
    /// already marked for processing.
    async fn read_response_counts(
        tx: &mut SqliteConnection,
        request_keys: &BTreeSet<RequestKey>,
    ) -> Result<HashMap<RequestKey, i64>> {
        let conditions = vec![
            "(resp.client_id = ? AND resp.flow_id = ? AND resp.request_id = ?)";
            request_keys.len()
        ]
        .join(" OR ");
        let sql = format!(
            "SELECT req.client_id, req.flow_id, req.request_id, COUNT(*) AS cnt \
             FROM flow_responses resp \
             JOIN flow_requests req \
               ON req.client_id = resp.client_id \
              AND req.flow_id = resp.flow_id \
              AND req.request_id = resp.request_id \
             WHERE req.needs_processing = 0 AND ({conditions}) \
             GROUP BY req.client_id, req.flow_id, req.request_id"
        );
        let mut query = sqlx::query(&sql);
        for (client_id, flow_id, request_id) in request_keys {
            query = query
                .bind(client_id.as_str())
                .bind(flow_id.as_str())
                .bind(*request_id);
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let mut counts = HashMap::new();
        for row in rows {
            counts.insert(
                (
                    ClientId::new(row.get::<String, _>("client_id")),
                    FlowId::new(row.get::<String, _>("flow_id")),
                    row.get::<i64, _>("request_id"),
                ),
                row.get::<i64, _>("cnt"),
            );
        }
        Ok(counts)
    }

    /// Reads the `next_request_to_process` pointer for the given flows.
    /// Runs inside the caller's write transaction, which is what locks
    /// the pointers against concurrent batches.
    async fn read_next_requests_to_process<'a>(
        tx: &mut SqliteConnection,
        flow_keys: impl Iterator<Item = &'a FlowKey>,
    ) -> Result<HashMap<FlowKey, i64>> {
        let keys: Vec<&FlowKey> = flow_keys.collect();
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let conditions = vec!["(client_id = ? AND flow_id = ?)"; keys.len()].join(" OR ");
        let sql = format!(
            "SELECT client_id, flow_id, next_request_to_process FROM flows WHERE {conditions}"
        );
        let mut query = sqlx::query(&sql);
        for (client_id, flow_id) in &keys {
            query = query.bind(client_id.as_str()).bind(flow_id.as_str());
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let mut next = HashMap::new();
        for row in rows {
            next.insert(
                (
                    ClientId::new(row.get::<String, _>("client_id")),
                    FlowId::new(row.get::<String, _>("flow_id")),
                ),
                row.get::<i64, _>("next_request_to_process"),
            );
        }
        Ok(next)
    }

    /// Selects the requests that just became ready (response count equals
    /// the expected count, or a callback state makes them incrementally
    /// processable) and marks the count-complete ones `needs_processing`.
    /// Callback-state requests are deliberately left unmarked so they can
    /// fire again on later responses.
    ///
    /// Returns the ready request keys with their `start_time`.
    async fn mark_affected_requests(
        tx: &mut SqliteConnection,
        request_keys: &BTreeSet<RequestKey>,
        response_counts: &HashMap<RequestKey, i64>,
    ) -> Result<Vec<(RequestKey, Option<chrono::DateTime<chrono::Utc>>)>> {
        let counted: Vec<(&RequestKey, i64)> = request_keys
            .iter()
            .filter_map(|key| response_counts.get(key).map(|count| (key, *count)))
            .collect();
        if counted.is_empty() {
            return Ok(Vec::new());
        }

        let select_conditions = vec![
            "(client_id = ? AND flow_id = ? AND request_id = ? AND \
              (responses_expected = ? OR callback_state IS NOT NULL))";
            counted.len()
        ]
        .join(" OR ");
        let sql = format!(
            "SELECT client_id, flow_id, request_id, start_time FROM flow_requests \
             WHERE ({select_conditions}) AND needs_processing = 0"
        );
        let mut query = sqlx::query(&sql);
        for ((client_id, flow_id, request_id), count) in &counted {
            query = query
                .bind(client_id.as_str())
                .bind(flow_id.as_str())
                .bind(*request_id)
                .bind(*count);
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let affected: Vec<(RequestKey, Option<chrono::DateTime<chrono::Utc>>)> = rows
            .iter()
            .map(|row| {
                (
                    (
                        ClientId::new(row.get::<String, _>("client_id")),
                        FlowId::new(row.get::<String, _>("flow_id")),
                        row.get::<i64, _>("request_id"),
                    ),
                    row.get::<Option<i64>, _>("start_time").map(from_micros),
                )
            })
            .collect();

        // Mark only the count-complete requests; the callback clause is
        // absent here on purpose.
        let update_conditions = vec![
            "(client_id = ? AND flow_id = ? AND request_id = ? AND responses_expected = ?)";
            counted.len()
        ]
        .join(" OR ");
        let sql = format!(
            "UPDATE flow_requests SET needs_processing = 1 \
             WHERE ({update_conditions}) AND needs_processing = 0"
        );
        let mut query = sqlx::query(&sql);
        for ((client_id, flow_id, request_id), count) in &counted {
            query = query
                .bind(client_id.as_str())
                .bind(flow_id.as_str())
                .bind(*request_id)
                .bind(*count);
        }
        query.execute(&mut *tx).await?;

        Ok(affected)
    }

    /// Advance per-request response cursors for incremental consumption.
    /// The updates are independent of each other.
    pub async fn update_next_response_ids(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        updates: &[(i64, i64)],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (request_id, next_response_id) in updates {
            sqlx::query(
                "UPDATE flow_requests SET next_response_id = ? \
                 WHERE client_id = ? AND flow_id = ? AND request_id = ?",
            )
            .bind(*next_response_id)
            .bind(client_id.as_str())
            .bind(flow_id.as_str())
            .bind(*request_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete the given requests and their responses, batched. Responses
    /// go first (referential cleanup order).
    pub async fn delete_flow_requests(&self, requests: &[FlowRequest]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in requests.chunks(DELETE_ROWS_BATCH_SIZE) {
            let keys = vec!["(?, ?, ?)"; chunk.len()].join(", ");
            for table in ["flow_responses", "flow_requests"] {
                let sql = format!(
                    "DELETE FROM {table} \
                     WHERE (client_id, flow_id, request_id) IN (VALUES {keys})"
                );
                let mut query = sqlx::query(&sql);
                for r in chunk {
                    query = query
                        .bind(r.client_id.as_str())
                        .bind(r.flow_id.as_str())
                        .bind(r.request_id);
                }
                query.execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Read every request of a flow paired with its responses. Requests
    /// are sorted by request id, responses by response id, so flow logic
    /// can resume deterministically.
    pub async fn read_all_requests_and_responses(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>> {
        let request_rows = sqlx::query(
            "SELECT client_id, flow_id, request_id, needs_processing, callback_state, \
             next_response_id, responses_expected, start_time, payload, create_time \
             FROM flow_requests WHERE client_id = ? AND flow_id = ?",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let response_rows = sqlx::query(
            "SELECT client_id, flow_id, request_id, response_id, kind, payload, \
             responses_expected, create_time \
             FROM flow_responses WHERE client_id = ? AND flow_id = ?",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut responses: BTreeMap<i64, Vec<FlowResponse>> = BTreeMap::new();
        for row in &response_rows {
            let response = row_to_response(row)?;
            responses
                .entry(response.request_id)
                .or_default()
                .push(response);
        }
        for list in responses.values_mut() {
            list.sort_by_key(|r| r.response_id);
        }

        let mut requests: Vec<FlowRequest> = request_rows.iter().map(row_to_request).collect();
        requests.sort_by_key(|r| r.request_id);

        Ok(requests
            .into_iter()
            .map(|req| {
                let resp = responses.remove(&req.request_id).unwrap_or_default();
                (req, resp)
            })
            .collect())
    }

    /// Delete every request and response of one flow. Other flows' rows
    /// are untouched.
    pub async fn delete_all_requests_and_responses(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM flow_responses WHERE client_id = ? AND flow_id = ?")
            .bind(client_id.as_str())
            .bind(flow_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM flow_requests WHERE client_id = ? AND flow_id = ?")
            .bind(client_id.as_str())
            .bind(flow_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
