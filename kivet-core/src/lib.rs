use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

pub mod trace;

/// Role assigned to a replica by the coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

/// Role a replica asks for when registering. `Auto` lets the coordinator
/// decide; a `Leader` request is demoted while an active incumbent exists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedRole {
    #[default]
    Auto,
    Leader,
    Follower,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventOp {
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DEL")]
    Del,
}

/// Replication event carried on the bus. Self-describing so that every
/// replica can apply it without extra context; the encoding is canonical
/// JSON and all replicas must agree on it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub op: EventOp,
    pub table_name: String,
    pub pk: String,
    pub sk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    pub version: i64,
    pub origin: String,
}

impl Event {
    pub fn put(
        table_name: impl Into<String>,
        pk: impl Into<String>,
        sk: impl Into<String>,
        value: serde_json::Value,
        version: i64,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            op: EventOp::Put,
            table_name: table_name.into(),
            pk: pk.into(),
            sk: sk.into(),
            value: Some(value),
            version,
            origin: origin.into(),
        }
    }

    pub fn del(
        table_name: impl Into<String>,
        pk: impl Into<String>,
        sk: impl Into<String>,
        version: i64,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            op: EventOp::Del,
            table_name: table_name.into(),
            pk: pk.into(),
            sk: sk.into(),
            value: None,
            version,
            origin: origin.into(),
        }
    }
}

/// Operator-registered table definition. Only consulted for existence
/// checks when routing; immutable after registration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub table_name: String,
    pub partition_key: String,
    pub sort_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterReplicaRequest {
    pub shard_name: String,
    pub replica_url: String,
    #[serde(default)]
    pub replica_id: Option<String>,
    #[serde(default)]
    pub role: RequestedRole,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterReplicaResponse {
    pub shard_name: String,
    pub assigned_role: Role,
    pub leader_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub shard_name: String,
    pub replica_url: String,
    #[serde(default)]
    pub replica_id: Option<String>,
    pub role: Role,
    pub last_seen_unix: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub table_name: String,
    pub pk: String,
    pub sk: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Record shape returned by both the coordinator and the shard nodes.
/// `value` is always present in the serialized form; `null` means the
/// record does not exist (a read miss is a 200, never a 404).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordResponse {
    pub table_name: String,
    pub pk: String,
    pub sk: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

/// Live record as carried by `/internal/keys` and the migration bulk
/// endpoints. Version and origin travel with the value so LWW state is
/// preserved at the destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyItem {
    pub table_name: String,
    pub pk: String,
    pub sk: String,
    #[serde(default)]
    pub value: serde_json::Value,
    pub version: i64,
    pub origin: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysDumpResponse {
    pub items: Vec<KeyItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkKeysRequest {
    pub items: Vec<KeyItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigratePutResponse {
    pub migrated: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrateDelResponse {
    pub deleted: usize,
}

/// One slot from a diagnostic dump; tombstones included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpItem {
    pub pk: String,
    pub sk: String,
    pub value: serde_json::Value,
    pub version: i64,
    pub origin: String,
    pub deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpResponse {
    pub table_name: String,
    pub items: Vec<DumpItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestItem {
    pub pk: String,
    pub sk: String,
    #[serde(default)]
    pub value: serde_json::Value,
    pub version: i64,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub table_name: String,
    #[serde(default)]
    pub items: Vec<IngestItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub count: usize,
}

/// Per-table live key counts; tombstones excluded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub tables: HashMap<String, usize>,
    pub total_keys: usize,
}

/// Wall-clock nanoseconds since the Unix epoch. Minted by the accepting
/// leader as the LWW version of every write.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Process-wide Prometheus recorder. The first caller installs the global
/// recorder; later callers (other services hosted in the same process,
/// as happens in tests) share the same handle.
pub fn metrics_recorder() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format_is_self_describing() {
        let ev = Event::put("users", "u1", "2024", serde_json::json!({"name": "Ada"}), 42, "r1");
        let encoded = serde_json::to_value(&ev).unwrap();
        assert_eq!(encoded["op"], "PUT");
        assert_eq!(encoded["table_name"], "users");
        assert_eq!(encoded["version"], 42);
        assert_eq!(encoded["origin"], "r1");

        let decoded: Event = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn del_events_omit_the_value() {
        let ev = Event::del("users", "u1", "2024", 7, "r1");
        let encoded = serde_json::to_string(&ev).unwrap();
        assert!(!encoded.contains("\"value\""));
        let decoded: Event = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.value, None);
        assert_eq!(decoded.op, EventOp::Del);
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Leader).unwrap(), "\"leader\"");
        let parsed: RequestedRole = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(parsed, RequestedRole::Auto);
    }

    #[test]
    fn now_ns_is_monotonic_enough() {
        let a = now_ns();
        let b = now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
