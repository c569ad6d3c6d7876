#![forbid(unsafe_code)]

//! Client side of the cloud authority's REST surface.
//!
//! The cloud exposes PostgREST-shaped resources: an append-only access-log
//! table, a permission table keyed by `(uid, room, building)` and a device
//! table carrying room assignments. Every failure is classified exactly once
//! here, by [`CloudError::class`], so callers never inspect payloads.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use doorkeep_contracts::access::{
    AccessLogEntry, AccessPermission, BuildingId, CardId, DeviceId, RoomId, SyncCursor,
};
use doorkeep_contracts::dashboard::{BlockRequest, LogQuery};
use doorkeep_contracts::identity::DeviceIdentity;
use doorkeep_contracts::UnixTimeNs;

pub const EDGE_EVENT_KEY_LEN: usize = 32;
pub const CLOUD_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const CLOUD_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 10_000;

const REST_PATH: [&str; 2] = ["rest", "v1"];
const PERMISSION_ORDER: &str = "updated_at.asc,uid.asc,room.asc,building.asc.nullsfirst";
const CURSOR_KEY_SEPARATOR: char = '#';
const SCHEMA_ERROR_CODES: [&str; 5] = ["PGRST205", "PGRST204", "PGRST200", "42P01", "42703"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorClass {
    /// Worth retrying after a delay: the cloud was unreachable or overloaded.
    Transient,
    /// Resource misnamed, missing or unauthorized. Retrying will not help
    /// until configuration changes.
    Schema,
    /// The cloud understood and refused this particular request.
    Rejected,
}

impl CloudErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            CloudErrorClass::Transient => "transient",
            CloudErrorClass::Schema => "schema",
            CloudErrorClass::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("cloud not configured: {reason}")]
    NotConfigured { reason: String },
    #[error("cloud transport error: {0}")]
    Transport(String),
    #[error("cloud returned http {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("cloud response could not be decoded: {0}")]
    Decode(String),
}

impl CloudError {
    pub fn class(&self) -> CloudErrorClass {
        match self {
            CloudError::Transport(_) => CloudErrorClass::Transient,
            CloudError::NotConfigured { .. } | CloudError::Decode(_) => CloudErrorClass::Schema,
            CloudError::Status { status, code, .. } => {
                if code
                    .as_deref()
                    .is_some_and(|c| SCHEMA_ERROR_CODES.contains(&c))
                {
                    return CloudErrorClass::Schema;
                }
                match *status {
                    408 | 429 => CloudErrorClass::Transient,
                    s if s >= 500 => CloudErrorClass::Transient,
                    401 | 403 | 404 => CloudErrorClass::Schema,
                    _ => CloudErrorClass::Rejected,
                }
            }
        }
    }
}

/// Outcome of a block: the permission row was updated in place, or none
/// matched and one was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Updated { rows: usize },
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionChanges {
    pub rows: Vec<AccessPermission>,
    /// Watermark to resume from; `None` when the page was empty.
    pub next_cursor: Option<SyncCursor>,
    /// Rows returned by the cloud that failed validation and were dropped.
    pub skipped: usize,
}

/// One access-log row as the dashboard sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudLogRow {
    pub student: String,
    pub room: String,
    pub building: String,
    pub timestamp: String,
    pub decision: Option<String>,
    pub reason: Option<String>,
    pub device_id: Option<String>,
    pub blocked: bool,
}

/// Operations the edge node and the operator tools need from the cloud.
///
/// Implementations perform blocking I/O; callers on an async runtime must
/// move calls onto a blocking thread.
pub trait CloudApi: Send + Sync {
    fn push_access_logs(&self, entries: &[AccessLogEntry]) -> Result<(), CloudError>;
    fn pull_permission_changes(
        &self,
        since: Option<&SyncCursor>,
        limit: usize,
    ) -> Result<PermissionChanges, CloudError>;
    fn fetch_device_assignment(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>, CloudError>;
    fn block_card(
        &self,
        request: &BlockRequest,
        now: UnixTimeNs,
    ) -> Result<BlockOutcome, CloudError>;
    fn query_access_logs(&self, query: &LogQuery) -> Result<Vec<CloudLogRow>, CloudError>;
}

/// Table and column names, all overridable because deployments differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSchema {
    pub access_logs_table: String,
    pub access_permissions_table: String,
    pub devices_table: String,
    pub student_field: String,
    pub room_field: String,
    pub building_field: String,
    /// Optional log columns; `None` leaves the column out of pushed rows.
    pub reason_field: Option<String>,
    pub device_field: Option<String>,
    /// Unique column used to make log pushes idempotent; `None` disables it.
    pub dedupe_field: Option<String>,
}

impl Default for CloudSchema {
    fn default() -> Self {
        Self {
            access_logs_table: "access_logs".to_string(),
            access_permissions_table: "access_permissions".to_string(),
            devices_table: "devices".to_string(),
            student_field: "student_name".to_string(),
            room_field: "room".to_string(),
            building_field: "building".to_string(),
            reason_field: Some("reason".to_string()),
            device_field: Some("device_id".to_string()),
            dedupe_field: Some("edge_event_key".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEndpoint {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudClientConfig {
    pub endpoint: Option<CloudEndpoint>,
    pub schema: CloudSchema,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for CloudClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            schema: CloudSchema::default(),
            connect_timeout_ms: CLOUD_CONNECT_TIMEOUT_MS_DEFAULT,
            request_timeout_ms: CLOUD_REQUEST_TIMEOUT_MS_DEFAULT,
        }
    }
}

/// Builds the cloud client for a config: the REST client when an endpoint is
/// configured, otherwise [`OfflineCloud`].
pub fn cloud_from_config(config: &CloudClientConfig) -> Result<Arc<dyn CloudApi>, CloudError> {
    match config.endpoint.as_ref() {
        Some(endpoint) => Ok(Arc::new(PostgrestCloudClient::new(
            endpoint.clone(),
            config.schema.clone(),
            config.connect_timeout_ms,
            config.request_timeout_ms,
        )?)),
        None => Ok(Arc::new(OfflineCloud)),
    }
}

/// Key columns of the last permission row applied, as the cloud spelled them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PermissionCursorKey {
    pub uid: String,
    pub room: String,
    pub building: Option<String>,
}

impl PermissionCursorKey {
    pub fn of(permission: &AccessPermission) -> Self {
        Self {
            uid: permission.card_id.as_str().to_string(),
            room: permission.room.as_str().to_string(),
            building: permission.building.as_ref().map(|b| b.as_str().to_string()),
        }
    }
}

/// Position in the permission table, ordered by `(updated_at, uid, room,
/// building)`. Rows sharing one `updated_at` page in key order, so a bulk
/// update stamped with a single timestamp cannot pin the pull to one page.
///
/// Encoded as the RFC 3339 timestamp, followed by `#` and the key as a JSON
/// array when present. A bare timestamp resumes at `updated_at >= T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCursor {
    pub updated_at: UnixTimeNs,
    pub after: Option<PermissionCursorKey>,
}

impl PermissionCursor {
    pub fn at(updated_at: UnixTimeNs) -> Self {
        Self {
            updated_at,
            after: None,
        }
    }

    pub fn after(permission: &AccessPermission) -> Self {
        Self {
            updated_at: permission.updated_at,
            after: Some(PermissionCursorKey::of(permission)),
        }
    }

    pub fn encode(&self) -> Option<SyncCursor> {
        let stamp = format_timestamp(self.updated_at);
        let raw = match self.after.as_ref() {
            None => stamp,
            Some(key) => {
                let key = serde_json::to_string(&(&key.uid, &key.room, &key.building)).ok()?;
                format!("{stamp}{CURSOR_KEY_SEPARATOR}{key}")
            }
        };
        SyncCursor::new(raw).ok()
    }

    pub fn decode(cursor: &SyncCursor) -> Option<Self> {
        let (stamp, key) = match cursor.as_str().split_once(CURSOR_KEY_SEPARATOR) {
            Some((stamp, key)) => (stamp, Some(key)),
            None => (cursor.as_str(), None),
        };
        let updated_at = parse_timestamp(stamp)?;
        let after = match key {
            None => None,
            Some(key) => {
                let (uid, room, building): (String, String, Option<String>) =
                    serde_json::from_str(key).ok()?;
                Some(PermissionCursorKey {
                    uid,
                    room,
                    building,
                })
            }
        };
        Some(Self { updated_at, after })
    }

    /// Whether a row at `updated_at` with `key` lies past this position.
    pub fn includes(&self, updated_at: UnixTimeNs, key: &PermissionCursorKey) -> bool {
        match self.after.as_ref() {
            None => updated_at >= self.updated_at,
            Some(after) => (updated_at, key) > (self.updated_at, after),
        }
    }

    /// PostgREST filter selecting the rows past this position. `NULL`
    /// buildings sort first, as in the pull's `order`.
    pub fn filter_param(&self) -> (&'static str, String) {
        let stamp = format_timestamp(self.updated_at);
        let Some(key) = self.after.as_ref() else {
            return ("updated_at", format!("gte.{stamp}"));
        };
        let at = quote_filter_value(&stamp);
        let uid = quote_filter_value(&key.uid);
        let room = quote_filter_value(&key.room);
        let building_after = match key.building.as_ref() {
            Some(building) => format!("building.gt.{}", quote_filter_value(building)),
            None => "building.not.is.null".to_string(),
        };
        (
            "or",
            format!(
                "(updated_at.gt.{at},\
                 and(updated_at.eq.{at},uid.gt.{uid}),\
                 and(updated_at.eq.{at},uid.eq.{uid},room.gt.{room}),\
                 and(updated_at.eq.{at},uid.eq.{uid},room.eq.{room},{building_after}))"
            ),
        )
    }
}

fn quote_filter_value(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn format_timestamp(at: UnixTimeNs) -> String {
    let secs = (at.0 / 1_000_000_000) as i64;
    let nanos = (at.0 % 1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 with any offset, or a naive timestamp read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<UnixTimeNs> {
    let raw = raw.trim();
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc())
        })
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|dt| dt.and_utc())
        })
        .ok()?;
    let nanos = parsed.timestamp_nanos_opt()?;
    u64::try_from(nanos).ok().map(UnixTimeNs)
}

/// Deterministic cloud-side identity of a local log entry. Re-pushing the
/// same entry always produces the same key.
pub fn edge_event_key(entry: &AccessLogEntry) -> String {
    let material = format!(
        "{}:{}:{}:{}",
        entry.device_id.as_str(),
        entry.id.0,
        entry.card_id.as_str(),
        entry.observed_at.0
    );
    let digest = Sha256::digest(material.as_bytes());
    let mut out = String::with_capacity(EDGE_EVENT_KEY_LEN);
    for byte in digest.iter() {
        if out.len() >= EDGE_EVENT_KEY_LEN {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(EDGE_EVENT_KEY_LEN);
    out
}

/// JSON row pushed to the access-log table for one entry.
pub fn access_log_row(schema: &CloudSchema, entry: &AccessLogEntry) -> Value {
    let mut row = Map::new();
    row.insert(
        schema.student_field.clone(),
        Value::String(entry.card_id.as_str().to_string()),
    );
    row.insert(
        schema.room_field.clone(),
        Value::String(entry.room.as_str().to_string()),
    );
    row.insert(
        schema.building_field.clone(),
        entry
            .building
            .as_ref()
            .map(|b| Value::String(b.as_str().to_string()))
            .unwrap_or(Value::Null),
    );
    row.insert(
        "timestamp".to_string(),
        Value::String(format_timestamp(entry.observed_at)),
    );
    row.insert(
        "decision".to_string(),
        Value::String(entry.decision.as_str().to_string()),
    );
    if let Some(field) = schema.reason_field.as_ref() {
        row.insert(field.clone(), Value::String(entry.reason.clone()));
    }
    if let Some(field) = schema.device_field.as_ref() {
        row.insert(
            field.clone(),
            Value::String(entry.device_id.as_str().to_string()),
        );
    }
    if let Some(field) = schema.dedupe_field.as_ref() {
        row.insert(field.clone(), Value::String(edge_event_key(entry)));
    }
    Value::Object(row)
}

/// Stand-in used when no cloud endpoint is configured. Every call fails with
/// a schema-class error so the sync worker settles into degraded mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineCloud;

impl OfflineCloud {
    fn error() -> CloudError {
        CloudError::NotConfigured {
            reason: "no cloud url/key set".to_string(),
        }
    }
}

impl CloudApi for OfflineCloud {
    fn push_access_logs(&self, _entries: &[AccessLogEntry]) -> Result<(), CloudError> {
        Err(Self::error())
    }

    fn pull_permission_changes(
        &self,
        _since: Option<&SyncCursor>,
        _limit: usize,
    ) -> Result<PermissionChanges, CloudError> {
        Err(Self::error())
    }

    fn fetch_device_assignment(
        &self,
        _device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>, CloudError> {
        Err(Self::error())
    }

    fn block_card(
        &self,
        _request: &BlockRequest,
        _now: UnixTimeNs,
    ) -> Result<BlockOutcome, CloudError> {
        Err(Self::error())
    }

    fn query_access_logs(&self, _query: &LogQuery) -> Result<Vec<CloudLogRow>, CloudError> {
        Err(Self::error())
    }
}

pub struct PostgrestCloudClient {
    agent: ureq::Agent,
    base: Url,
    api_key: String,
    schema: CloudSchema,
}

impl std::fmt::Debug for PostgrestCloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestCloudClient")
            .field("base", &self.base.as_str())
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl PostgrestCloudClient {
    pub fn new(
        endpoint: CloudEndpoint,
        schema: CloudSchema,
        connect_timeout_ms: u64,
        request_timeout_ms: u64,
    ) -> Result<Self, CloudError> {
        if endpoint.api_key.trim().is_empty() {
            return Err(CloudError::NotConfigured {
                reason: "cloud key is empty".to_string(),
            });
        }
        let base = Url::parse(endpoint.base_url.trim()).map_err(|err| {
            CloudError::NotConfigured {
                reason: format!("invalid cloud url: {err}"),
            }
        })?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(CloudError::NotConfigured {
                reason: "cloud url must be an http(s) base url".to_string(),
            });
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(connect_timeout_ms.max(100)))
            .timeout_read(Duration::from_millis(request_timeout_ms.max(100)))
            .timeout_write(Duration::from_millis(request_timeout_ms.max(100)))
            .user_agent(concat!("doorkeep/", env!("CARGO_PKG_VERSION")))
            .build();
        Ok(Self {
            agent,
            base,
            api_key: endpoint.api_key,
            schema,
        })
    }

    pub fn schema(&self) -> &CloudSchema {
        &self.schema
    }

    fn table_url(&self, table: &str, params: &[(&str, String)]) -> Result<Url, CloudError> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| CloudError::NotConfigured {
                reason: "cloud url must be an http(s) base url".to_string(),
            })?;
            segments.pop_if_empty().extend(REST_PATH).push(table);
        }
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        self.agent
            .request_url(method, url)
            .set("apikey", &self.api_key)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Accept", "application/json")
    }

    fn fetch_rows(&self, url: &Url) -> Result<Vec<Map<String, Value>>, CloudError> {
        let response = self.request("GET", url).call().map_err(error_from_ureq)?;
        decode_rows(response)
    }
}

impl CloudApi for PostgrestCloudClient {
    fn push_access_logs(&self, entries: &[AccessLogEntry]) -> Result<(), CloudError> {
        if entries.is_empty() {
            return Ok(());
        }
        let rows: Vec<Value> = entries
            .iter()
            .map(|entry| access_log_row(&self.schema, entry))
            .collect();
        let mut params = Vec::new();
        let prefer = match self.schema.dedupe_field.as_ref() {
            Some(field) => {
                params.push(("on_conflict", field.clone()));
                "return=minimal,resolution=ignore-duplicates"
            }
            None => "return=minimal",
        };
        let url = self.table_url(&self.schema.access_logs_table, &params)?;
        self.request("POST", &url)
            .set("Prefer", prefer)
            .send_json(Value::Array(rows))
            .map_err(error_from_ureq)?;
        debug!(count = entries.len(), "access logs pushed");
        Ok(())
    }

    fn pull_permission_changes(
        &self,
        since: Option<&SyncCursor>,
        limit: usize,
    ) -> Result<PermissionChanges, CloudError> {
        let mut params = vec![
            ("select", "*".to_string()),
            ("order", PERMISSION_ORDER.to_string()),
            ("limit", limit.max(1).to_string()),
        ];
        if let Some(cursor) = since {
            match PermissionCursor::decode(cursor) {
                Some(position) => params.push(position.filter_param()),
                None => warn!(cursor = cursor.as_str(), "unreadable sync cursor, pulling from start"),
            }
        }
        let url = self.table_url(&self.schema.access_permissions_table, &params)?;
        let rows = self.fetch_rows(&url)?;
        Ok(permission_changes_from_rows(&rows))
    }

    fn fetch_device_assignment(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>, CloudError> {
        let params = [
            ("device_id", format!("eq.{}", device_id.as_str())),
            ("select", "device_id,room,building".to_string()),
            ("limit", "1".to_string()),
        ];
        let url = self.table_url(&self.schema.devices_table, &params)?;
        let rows = self.fetch_rows(&url)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let Some(room) = text_field(row, &["room", "room_id"]) else {
            return Ok(None);
        };
        let building = text_field(row, &["building"]);
        DeviceIdentity::from_raw(device_id.as_str(), &room, building.as_deref())
            .map(Some)
            .map_err(|err| CloudError::Decode(format!("device row: {err}")))
    }

    fn block_card(
        &self,
        request: &BlockRequest,
        now: UnixTimeNs,
    ) -> Result<BlockOutcome, CloudError> {
        let stamp = format_timestamp(now);
        let mut payload = Map::new();
        payload.insert("is_blocked".to_string(), Value::Bool(true));
        payload.insert("blocked_at".to_string(), Value::String(stamp.clone()));
        payload.insert("updated_at".to_string(), Value::String(stamp));
        if let Some(reason) = request.reason.as_ref() {
            payload.insert("block_reason".to_string(), Value::String(reason.clone()));
        }

        let mut params = vec![
            ("uid", format!("eq.{}", request.card_id.as_str())),
            ("room", format!("eq.{}", request.room.as_str())),
        ];
        if let Some(building) = request.building.as_ref() {
            params.push(("building", format!("eq.{}", building.as_str())));
        }
        let url = self.table_url(&self.schema.access_permissions_table, &params)?;
        let response = self
            .request("PATCH", &url)
            .set("Prefer", "return=representation")
            .send_json(Value::Object(payload.clone()))
            .map_err(error_from_ureq)?;
        let updated = decode_rows(response)?;
        if !updated.is_empty() {
            return Ok(BlockOutcome::Updated {
                rows: updated.len(),
            });
        }

        payload.insert(
            "uid".to_string(),
            Value::String(request.card_id.as_str().to_string()),
        );
        payload.insert(
            "room".to_string(),
            Value::String(request.room.as_str().to_string()),
        );
        if let Some(building) = request.building.as_ref() {
            payload.insert(
                "building".to_string(),
                Value::String(building.as_str().to_string()),
            );
        }
        let url = self.table_url(
            &self.schema.access_permissions_table,
            &[("on_conflict", "uid,room,building".to_string())],
        )?;
        self.request("POST", &url)
            .set("Prefer", "return=minimal,resolution=merge-duplicates")
            .send_json(Value::Object(payload))
            .map_err(error_from_ureq)?;
        Ok(BlockOutcome::Created)
    }

    fn query_access_logs(&self, query: &LogQuery) -> Result<Vec<CloudLogRow>, CloudError> {
        let mut params = vec![("select", "*".to_string())];
        if let Some(student) = query.student.as_ref() {
            params.push((self.schema.student_field.as_str(), format!("ilike.*{student}*")));
        }
        if let Some(room) = query.room.as_ref() {
            params.push((self.schema.room_field.as_str(), format!("eq.{}", room.as_str())));
        }
        if let Some(building) = query.building.as_ref() {
            params.push((
                self.schema.building_field.as_str(),
                format!("eq.{}", building.as_str()),
            ));
        }
        if let Some(start) = query.start {
            params.push(("timestamp", format!("gte.{}", format_timestamp(start))));
        }
        if let Some(end) = query.end {
            params.push(("timestamp", format!("lte.{}", format_timestamp(end))));
        }
        params.push(("order", "timestamp.desc".to_string()));
        params.push(("limit", query.limit.to_string()));
        let url = self.table_url(&self.schema.access_logs_table, &params)?;
        let rows = self.fetch_rows(&url)?;
        Ok(rows
            .iter()
            .map(|row| normalize_log_row(&self.schema, row))
            .collect())
    }
}

fn decode_rows(response: ureq::Response) -> Result<Vec<Map<String, Value>>, CloudError> {
    let body = response
        .into_string()
        .map_err(|err| CloudError::Transport(format!("reading body: {err}")))?;
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(&body).map_err(|err| CloudError::Decode(err.to_string()))?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(CloudError::Decode(format!("expected row object, got {other}"))),
            })
            .collect(),
        other => Err(CloudError::Decode(format!(
            "expected row array, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn error_from_ureq(err: ureq::Error) -> CloudError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            status_error(status, &body)
        }
        ureq::Error::Transport(transport) => CloudError::Transport(transport.to_string()),
    }
}

/// Maps an error response to [`CloudError::Status`], lifting the PostgREST
/// `code` and `message` out of the body when present.
pub fn status_error(status: u16, body: &str) -> CloudError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let message = field("message").unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            format!("http status {status}")
        } else {
            trimmed.chars().take(200).collect()
        }
    });
    CloudError::Status {
        status,
        code: field("code"),
        message,
    }
}

fn text_field(row: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match row.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn bool_field(row: &Map<String, Value>, name: &str) -> bool {
    match row.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => matches!(s.trim(), "true" | "t" | "1"),
        _ => false,
    }
}

fn permission_from_row(row: &Map<String, Value>) -> Option<(AccessPermission, UnixTimeNs)> {
    let updated_at = parse_timestamp(&text_field(row, &["updated_at"])?)?;
    let card_id = CardId::new(text_field(row, &["uid", "card_id"])?).ok()?;
    let room = RoomId::new(text_field(row, &["room"])?).ok()?;
    let building = match text_field(row, &["building"]) {
        Some(b) => Some(BuildingId::new(b).ok()?),
        None => None,
    };
    let permission = AccessPermission::v1(
        card_id,
        room,
        building,
        bool_field(row, "is_blocked"),
        text_field(row, &["block_reason"]),
        updated_at,
    )
    .ok()?;
    Some((permission, updated_at))
}

fn cursor_from_row(row: &Map<String, Value>) -> Option<PermissionCursor> {
    let updated_at = parse_timestamp(&text_field(row, &["updated_at"])?)?;
    let after = match (text_field(row, &["uid", "card_id"]), text_field(row, &["room"])) {
        (Some(uid), Some(room)) => Some(PermissionCursorKey {
            uid,
            room,
            building: text_field(row, &["building"]),
        }),
        _ => None,
    };
    Some(PermissionCursor { updated_at, after })
}

/// Converts one page of permission rows, in the order the cloud returned
/// them. The cursor lands on the last row with a readable `updated_at`,
/// including rows dropped as invalid, so a bad row cannot wedge the pull.
pub fn permission_changes_from_rows(rows: &[Map<String, Value>]) -> PermissionChanges {
    let mut out = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in rows {
        match permission_from_row(row) {
            Some((permission, _)) => out.push(permission),
            None => {
                skipped += 1;
                let raw = Value::Object(row.clone());
                warn!(row = %raw, "skipping invalid permission row");
            }
        }
    }
    PermissionChanges {
        rows: out,
        next_cursor: rows
            .iter()
            .rev()
            .find_map(cursor_from_row)
            .and_then(|position| position.encode()),
        skipped,
    }
}

/// Reads a log row with the configured column names first, then the names
/// older deployments used.
pub fn normalize_log_row(schema: &CloudSchema, row: &Map<String, Value>) -> CloudLogRow {
    let student = text_field(
        row,
        &[
            schema.student_field.as_str(),
            "student_name",
            "user_name",
            "student",
        ],
    );
    let room = text_field(row, &[schema.room_field.as_str(), "room", "salon"]);
    let building = text_field(row, &[schema.building_field.as_str(), "building", "edificio"]);
    CloudLogRow {
        student: student.unwrap_or_default(),
        room: room.unwrap_or_default(),
        building: building.unwrap_or_default(),
        timestamp: text_field(row, &["timestamp"]).unwrap_or_default(),
        decision: text_field(row, &["decision"]),
        reason: text_field(
            row,
            &[schema.reason_field.as_deref().unwrap_or("reason"), "reason"],
        ),
        device_id: text_field(
            row,
            &[schema.device_field.as_deref().unwrap_or("device_id"), "device_id"],
        ),
        blocked: bool_field(row, "is_blocked"),
    }
}

#[derive(Debug, Default)]
struct MemoryCloudState {
    logs: Vec<AccessLogEntry>,
    log_keys: BTreeSet<String>,
    permissions: Vec<AccessPermission>,
    devices: BTreeMap<DeviceId, DeviceIdentity>,
    push_failures: VecDeque<CloudError>,
    pull_failures: VecDeque<CloudError>,
    push_calls: u32,
    pull_calls: u32,
}

/// In-process cloud used by tests and local demos. Applies the same
/// idempotence rules as the real tables and can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryCloud {
    state: Mutex<MemoryCloudState>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryCloudState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Inserts or replaces the permission with the same key.
    pub fn put_permission(&self, permission: AccessPermission) {
        self.with_state(|state| {
            let key = permission.key();
            state.permissions.retain(|p| p.key() != key);
            state.permissions.push(permission);
        });
    }

    pub fn assign_device(&self, identity: DeviceIdentity) {
        self.with_state(|state| {
            state.devices.insert(identity.device_id.clone(), identity);
        });
    }

    /// Queues errors returned by the next push calls, one per call.
    pub fn fail_pushes(&self, errors: impl IntoIterator<Item = CloudError>) {
        self.with_state(|state| state.push_failures.extend(errors));
    }

    /// Queues errors returned by the next pull calls (device or permission),
    /// one per call.
    pub fn fail_pulls(&self, errors: impl IntoIterator<Item = CloudError>) {
        self.with_state(|state| state.pull_failures.extend(errors));
    }

    pub fn pushed_logs(&self) -> Vec<AccessLogEntry> {
        self.with_state(|state| state.logs.clone())
    }

    pub fn permissions(&self) -> Vec<AccessPermission> {
        self.with_state(|state| state.permissions.clone())
    }

    pub fn push_calls(&self) -> u32 {
        self.with_state(|state| state.push_calls)
    }

    pub fn pull_calls(&self) -> u32 {
        self.with_state(|state| state.pull_calls)
    }
}

impl CloudApi for MemoryCloud {
    fn push_access_logs(&self, entries: &[AccessLogEntry]) -> Result<(), CloudError> {
        self.with_state(|state| {
            state.push_calls += 1;
            if let Some(err) = state.push_failures.pop_front() {
                return Err(err);
            }
            for entry in entries {
                if state.log_keys.insert(edge_event_key(entry)) {
                    state.logs.push(entry.clone());
                }
            }
            Ok(())
        })
    }

    fn pull_permission_changes(
        &self,
        since: Option<&SyncCursor>,
        limit: usize,
    ) -> Result<PermissionChanges, CloudError> {
        self.with_state(|state| {
            state.pull_calls += 1;
            if let Some(err) = state.pull_failures.pop_front() {
                return Err(err);
            }
            let position = since.and_then(PermissionCursor::decode);
            let mut rows: Vec<AccessPermission> = state
                .permissions
                .iter()
                .filter(|p| match position.as_ref() {
                    Some(pos) => pos.includes(p.updated_at, &PermissionCursorKey::of(p)),
                    None => true,
                })
                .cloned()
                .collect();
            rows.sort_by_cached_key(|p| (p.updated_at, PermissionCursorKey::of(p)));
            rows.truncate(limit.max(1));
            let next_cursor = rows
                .last()
                .and_then(|p| PermissionCursor::after(p).encode());
            Ok(PermissionChanges {
                rows,
                next_cursor,
                skipped: 0,
            })
        })
    }

    fn fetch_device_assignment(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>, CloudError> {
        self.with_state(|state| {
            state.pull_calls += 1;
            if let Some(err) = state.pull_failures.pop_front() {
                return Err(err);
            }
            Ok(state.devices.get(device_id).cloned())
        })
    }

    fn block_card(
        &self,
        request: &BlockRequest,
        now: UnixTimeNs,
    ) -> Result<BlockOutcome, CloudError> {
        self.with_state(|state| {
            let mut rows = 0usize;
            for permission in state.permissions.iter_mut() {
                let building_matches = request
                    .building
                    .as_ref()
                    .map_or(true, |b| permission.building.as_ref() == Some(b));
                if permission.card_id == request.card_id
                    && permission.room == request.room
                    && building_matches
                {
                    permission.blocked = true;
                    permission.block_reason = request.reason.clone();
                    permission.updated_at = now;
                    rows += 1;
                }
            }
            if rows > 0 {
                return Ok(BlockOutcome::Updated { rows });
            }
            state.permissions.push(AccessPermission {
                card_id: request.card_id.clone(),
                room: request.room.clone(),
                building: request.building.clone(),
                blocked: true,
                block_reason: request.reason.clone(),
                updated_at: now,
            });
            Ok(BlockOutcome::Created)
        })
    }

    fn query_access_logs(&self, query: &LogQuery) -> Result<Vec<CloudLogRow>, CloudError> {
        self.with_state(|state| {
            let student = query.student.as_ref().map(|s| s.to_lowercase());
            let mut matched: Vec<&AccessLogEntry> = state
                .logs
                .iter()
                .filter(|e| {
                    student
                        .as_ref()
                        .map_or(true, |s| e.card_id.as_str().to_lowercase().contains(s))
                })
                .filter(|e| query.room.as_ref().map_or(true, |r| &e.room == r))
                .filter(|e| {
                    query
                        .building
                        .as_ref()
                        .map_or(true, |b| e.building.as_ref() == Some(b))
                })
                .filter(|e| query.start.map_or(true, |s| e.observed_at >= s))
                .filter(|e| query.end.map_or(true, |end| e.observed_at <= end))
                .collect();
            matched.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
            matched.truncate(query.limit as usize);
            Ok(matched
                .into_iter()
                .map(|e| CloudLogRow {
                    student: e.card_id.as_str().to_string(),
                    room: e.room.as_str().to_string(),
                    building: e
                        .building
                        .as_ref()
                        .map(|b| b.as_str().to_string())
                        .unwrap_or_default(),
                    timestamp: format_timestamp(e.observed_at),
                    decision: Some(e.decision.as_str().to_string()),
                    reason: Some(e.reason.clone()),
                    device_id: Some(e.device_id.as_str().to_string()),
                    blocked: false,
                })
                .collect())
        })
    }
}
