//! Value types for flows, requests, responses and queue items.
//!
//! These are plain data carriers; all persistence logic lives in the
//! `FlowStore` impls. Timestamps are `chrono::DateTime<Utc>` in the API
//! and integer microseconds since the Unix epoch in storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers - newtypes to prevent mixing client and flow ids
// ============================================================================

/// Client (endpoint agent) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flow identifier, unique within a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FlowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Flow lifecycle state
// ============================================================================

/// Flow lifecycle state, stored as its canonical string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Unset,
    Running,
    Finished,
    Error,
    Crashed,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Unset => "UNSET",
            FlowState::Running => "RUNNING",
            FlowState::Finished => "FINISHED",
            FlowState::Error => "ERROR",
            FlowState::Crashed => "CRASHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNSET" => Some(FlowState::Unset),
            "RUNNING" => Some(FlowState::Running),
            "FINISHED" => Some(FlowState::Finished),
            "ERROR" => Some(FlowState::Error),
            "CRASHED" => Some(FlowState::Crashed),
            _ => None,
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hunt lifecycle state. Only the suitability predicate matters to this
/// core; hunt lifecycle itself is managed elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HuntState {
    Unset,
    Paused,
    Started,
    Stopped,
    Completed,
}

impl HuntState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HuntState::Unset => "UNSET",
            HuntState::Paused => "PAUSED",
            HuntState::Started => "STARTED",
            HuntState::Stopped => "STOPPED",
            HuntState::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNSET" => Some(HuntState::Unset),
            "PAUSED" => Some(HuntState::Paused),
            "STARTED" => Some(HuntState::Started),
            "STOPPED" => Some(HuntState::Stopped),
            "COMPLETED" => Some(HuntState::Completed),
            _ => None,
        }
    }

    /// Whether flows belonging to a hunt in this state may be leased for
    /// processing. A stopped or unset hunt blocks its flows.
    pub fn is_suitable_for_flow_processing(&self) -> bool {
        matches!(
            self,
            HuntState::Started | HuntState::Paused | HuntState::Completed
        )
    }
}

impl fmt::Display for HuntState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Flow
// ============================================================================

/// Durable record of one flow's lifecycle, accounting and scheduling state.
///
/// The `payload` holds the serialized flow object and is opaque to the
/// store; the typed columns are the source of truth for scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    /// Flow class name, used by `not_created_by`-style filters.
    pub name: String,
    pub creator: String,
    pub parent_flow_id: Option<FlowId>,
    pub parent_hunt_id: Option<String>,
    /// Serialized flow object, opaque to this store.
    pub payload: Vec<u8>,
    pub flow_state: FlowState,
    /// Id of the next request the flow logic has not yet processed.
    pub next_request_to_process: i64,
    /// Worker token holding the processing lease, if any.
    pub processing_on: Option<String>,
    pub processing_since: Option<DateTime<Utc>>,
    pub processing_deadline: Option<DateTime<Utc>>,
    pub user_cpu_time_micros: i64,
    pub system_cpu_time_micros: i64,
    pub network_bytes_sent: i64,
    pub num_replies_sent: i64,
    /// Set by the store on read; ignored on write.
    pub create_time: Option<DateTime<Utc>>,
    /// Set by the store on read; ignored on write.
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Flow {
    /// A new flow in the initial state. Accounting starts at zero and the
    /// first request to process is request 1.
    pub fn new(client_id: ClientId, flow_id: FlowId) -> Self {
        Self {
            client_id,
            flow_id,
            name: String::new(),
            creator: String::new(),
            parent_flow_id: None,
            parent_hunt_id: None,
            payload: Vec::new(),
            flow_state: FlowState::Unset,
            next_request_to_process: 1,
            processing_on: None,
            processing_since: None,
            processing_deadline: None,
            user_cpu_time_micros: 0,
            system_cpu_time_micros: 0,
            network_bytes_sent: 0,
            num_replies_sent: 0,
            create_time: None,
            last_update_time: None,
        }
    }
}

// ============================================================================
// Sparse flow updates
// ============================================================================

/// Field-level update marker for sparse updates.
///
/// `Clear` writes NULL, `Set` writes a value, `Unchanged` leaves the
/// column untouched. This keeps "present but null" distinct from
/// "absent", which matters when clearing a processing lease.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldUpdate<T> {
    #[default]
    Unchanged,
    Clear,
    Set(T),
}

impl<T> FieldUpdate<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, FieldUpdate::Unchanged)
    }
}

/// Sparse update of a flow row. Only fields explicitly set here are
/// written; everything else keeps its stored value.
#[derive(Debug, Clone, Default)]
pub struct FlowUpdate {
    /// Replaces the payload, state and accounting counters together.
    /// Does not touch `next_request_to_process`; the pointer only
    /// advances through `release_processed_flow`.
    pub flow: Option<Flow>,
    pub flow_state: Option<FlowState>,
    pub processing_on: FieldUpdate<String>,
    pub processing_since: FieldUpdate<DateTime<Utc>>,
    pub processing_deadline: FieldUpdate<DateTime<Utc>>,
}

impl FlowUpdate {
    pub(crate) fn is_empty(&self) -> bool {
        self.flow.is_none()
            && self.flow_state.is_none()
            && self.processing_on.is_unchanged()
            && self.processing_since.is_unchanged()
            && self.processing_deadline.is_unchanged()
    }
}

/// Filters for `read_all_flows`.
#[derive(Debug, Clone)]
pub struct FlowFilter {
    pub client_id: Option<ClientId>,
    pub parent_flow_id: Option<FlowId>,
    pub min_create_time: Option<DateTime<Utc>>,
    pub max_create_time: Option<DateTime<Utc>>,
    pub include_child_flows: bool,
    pub not_created_by: Option<Vec<String>>,
}

impl Default for FlowFilter {
    fn default() -> Self {
        Self {
            client_id: None,
            parent_flow_id: None,
            min_create_time: None,
            max_create_time: None,
            include_child_flows: true,
            not_created_by: None,
        }
    }
}

// ============================================================================
// Flow requests and responses
// ============================================================================

/// A unit of work sent toward an agent, awaiting one or more responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: i64,
    /// Serialized request, opaque to this store.
    pub payload: Vec<u8>,
    /// Marks the request as a trigger point for flow resumption.
    pub needs_processing: bool,
    /// Non-empty marks the request eligible for repeated incremental
    /// processing even before a final status arrives.
    pub callback_state: Option<String>,
    /// Cursor for incremental/streaming response consumption.
    pub next_response_id: i64,
    /// Authoritative response count, stamped once a Status response
    /// arrives. Immutable once set.
    pub responses_expected: Option<i64>,
    /// Do-not-process-before time for delayed delivery.
    pub start_time: Option<DateTime<Utc>>,
    /// Set by the store on read; ignored on write.
    pub create_time: Option<DateTime<Utc>>,
}

impl FlowRequest {
    pub fn new(client_id: ClientId, flow_id: FlowId, request_id: i64) -> Self {
        Self {
            client_id,
            flow_id,
            request_id,
            payload: Vec::new(),
            needs_processing: false,
            callback_state: None,
            next_response_id: 1,
            responses_expected: None,
            start_time: None,
            create_time: None,
        }
    }
}

/// The three kinds of agent reply, as an explicit sum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowResponseData {
    /// A data response.
    Response { payload: Vec<u8> },
    /// The terminating status; carries the authoritative number of
    /// responses (this one included) the request will receive.
    Status {
        payload: Vec<u8>,
        responses_expected: i64,
    },
    /// An iterator/continuation marker for paged client actions.
    Iterator { payload: Vec<u8> },
}

impl FlowResponseData {
    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            FlowResponseData::Response { .. } => "RESPONSE",
            FlowResponseData::Status { .. } => "STATUS",
            FlowResponseData::Iterator { .. } => "ITERATOR",
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            FlowResponseData::Response { payload }
            | FlowResponseData::Status { payload, .. }
            | FlowResponseData::Iterator { payload } => payload,
        }
    }
}

/// Data or status returned by an agent for a specific request.
///
/// Insertion is idempotent on (client, flow, request, response) -
/// duplicate delivery from an unreliable transport is expected and
/// silently absorbed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: i64,
    pub response_id: i64,
    pub data: FlowResponseData,
    /// Set by the store on read; ignored on write.
    pub create_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Queue items
// ============================================================================

/// Notification that a flow has a ready request and should be resumed by
/// a worker. Leased with expiry, deleted on ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowProcessingRequest {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    /// Part of the storage key; stamped by the store on write and
    /// returned on read/lease.
    pub creation_time: Option<DateTime<Utc>>,
    /// Do-not-process-before time.
    pub delivery_time: Option<DateTime<Utc>>,
    pub leased_until: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
}

impl FlowProcessingRequest {
    pub fn new(client_id: ClientId, flow_id: FlowId) -> Self {
        Self {
            client_id,
            flow_id,
            creation_time: None,
            delivery_time: None,
            leased_until: None,
            leased_by: None,
        }
    }
}

/// A non-flow-scoped inbox item for a named message handler. Same
/// leasing mechanics as `FlowProcessingRequest`, no correlation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHandlerRequest {
    pub handler_name: String,
    pub request_id: i64,
    pub payload: Vec<u8>,
    /// Set by the store on read; ignored on write.
    pub create_time: Option<DateTime<Utc>>,
    pub leased_until: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
}

impl MessageHandlerRequest {
    pub fn new(handler_name: impl Into<String>, request_id: i64, payload: Vec<u8>) -> Self {
        Self {
            handler_name: handler_name.into(),
            request_id,
            payload,
            create_time: None,
            leased_until: None,
            leased_by: None,
        }
    }
}

// ============================================================================
// Time conversion helpers (storage uses integer microseconds)
// ============================================================================

pub(crate) fn to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default()
}

pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}
