//! Per-replica in-memory versioned key-value table.
//!
//! Every mutation carries a `(version, origin)` pair and applies under
//! last-writer-wins: a slot is overwritten iff the incoming pair is
//! lexicographically greater than the stored one. Applies are therefore
//! deterministic and commutative, so the replication log may be reordered
//! or redelivered without replicas diverging. Deletes leave tombstones so
//! stale writes arriving later still lose.

use std::collections::HashMap;
use std::sync::RwLock;

use kivet_core::{Event, EventOp, StatsResponse};
use serde_json::Value;

type Key = (String, String);

#[derive(Clone, Debug)]
struct Slot {
    value: Value,
    version: i64,
    origin: String,
    deleted: bool,
}

/// One full record as streamed by `iter_records`; tombstones included.
#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub table_name: String,
    pub pk: String,
    pub sk: String,
    pub value: Value,
    pub version: i64,
    pub origin: String,
    pub deleted: bool,
}

/// In-memory shard store. One coarse lock covers all tables; the
/// replication consumer and request handlers contend here.
#[derive(Default)]
pub struct ShardStore {
    tables: RwLock<HashMap<String, HashMap<Key, Slot>>>,
}

fn wins(incoming: (i64, &str), current: &Slot) -> bool {
    incoming > (current.version, current.origin.as_str())
}

impl ShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a PUT. Stale `(version, origin)` pairs are dropped silently.
    pub fn put(&self, table: &str, pk: &str, sk: &str, value: Value, version: i64, origin: &str) {
        let mut tables = self.tables.write().expect("store lock poisoned");
        let slots = tables.entry(table.to_string()).or_default();
        let key = (pk.to_string(), sk.to_string());
        let apply = match slots.get(&key) {
            Some(current) => wins((version, origin), current),
            None => true,
        };
        if apply {
            slots.insert(
                key,
                Slot {
                    value,
                    version,
                    origin: origin.to_string(),
                    deleted: false,
                },
            );
        }
    }

    /// Apply a DEL, writing a tombstone when it wins. Returns the value
    /// that was live before the call, whether or not the delete applied;
    /// `None` means there was nothing live to delete.
    pub fn delete(
        &self,
        table: &str,
        pk: &str,
        sk: &str,
        version: i64,
        origin: &str,
    ) -> Option<Value> {
        let mut tables = self.tables.write().expect("store lock poisoned");
        let slots = tables.entry(table.to_string()).or_default();
        let key = (pk.to_string(), sk.to_string());
        let current = slots.get(&key);
        let prev = current.and_then(|c| (!c.deleted).then(|| c.value.clone()));
        let apply = match current {
            Some(current) => wins((version, origin), current),
            None => true,
        };
        if apply {
            slots.insert(
                key,
                Slot {
                    value: Value::Object(serde_json::Map::new()),
                    version,
                    origin: origin.to_string(),
                    deleted: true,
                },
            );
        }
        prev
    }

    pub fn get(&self, table: &str, pk: &str, sk: &str) -> Option<Value> {
        self.get_with_version(table, pk, sk).map(|(value, _, _)| value)
    }

    /// The live value plus its `(version, origin)`; `None` when the slot is
    /// absent or tombstoned.
    pub fn get_with_version(&self, table: &str, pk: &str, sk: &str) -> Option<(Value, i64, String)> {
        let tables = self.tables.read().expect("store lock poisoned");
        let slot = tables
            .get(table)?
            .get(&(pk.to_string(), sk.to_string()))?;
        if slot.deleted {
            return None;
        }
        Some((slot.value.clone(), slot.version, slot.origin.clone()))
    }

    pub fn exists(&self, table: &str, pk: &str, sk: &str) -> bool {
        self.get_with_version(table, pk, sk).is_some()
    }

    /// Snapshot of every slot, tombstones included. Used by migration and
    /// the diagnostic dump endpoints.
    pub fn iter_records(&self) -> Vec<StoredRecord> {
        let tables = self.tables.read().expect("store lock poisoned");
        let mut records = Vec::new();
        for (table, slots) in tables.iter() {
            for ((pk, sk), slot) in slots {
                records.push(StoredRecord {
                    table_name: table.clone(),
                    pk: pk.clone(),
                    sk: sk.clone(),
                    value: slot.value.clone(),
                    version: slot.version,
                    origin: slot.origin.clone(),
                    deleted: slot.deleted,
                });
            }
        }
        records.sort_by(|a, b| {
            (a.table_name.as_str(), a.pk.as_str(), a.sk.as_str())
                .cmp(&(b.table_name.as_str(), b.pk.as_str(), b.sk.as_str()))
        });
        records
    }

    /// Per-table live key counts, tombstones excluded.
    pub fn stats(&self) -> StatsResponse {
        let tables = self.tables.read().expect("store lock poisoned");
        let mut out = HashMap::new();
        let mut total = 0;
        for (table, slots) in tables.iter() {
            let alive = slots.values().filter(|s| !s.deleted).count();
            out.insert(table.clone(), alive);
            total += alive;
        }
        StatsResponse {
            tables: out,
            total_keys: total,
        }
    }

    /// Apply a replication event. Idempotent; redelivery is harmless.
    pub fn apply_event(&self, event: &Event) {
        match event.op {
            EventOp::Put => self.put(
                &event.table_name,
                &event.pk,
                &event.sk,
                event.value.clone().unwrap_or(Value::Null),
                event.version,
                &event.origin,
            ),
            EventOp::Del => {
                self.delete(
                    &event.table_name,
                    &event.pk,
                    &event.sk,
                    event.version,
                    &event.origin,
                );
            }
        }
    }
}
