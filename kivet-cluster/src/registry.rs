use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use kivet_core::{ReplicaInfo, RequestedRole, Role};

/// One registered replica of a shard.
#[derive(Clone, Debug)]
pub struct ReplicaRecord {
    pub shard_name: String,
    pub replica_url: String,
    pub replica_id: Option<String>,
    pub role: Role,
    last_seen: Instant,
    last_seen_unix: f64,
}

impl ReplicaRecord {
    pub fn info(&self) -> ReplicaInfo {
        ReplicaInfo {
            shard_name: self.shard_name.clone(),
            replica_url: self.replica_url.clone(),
            replica_id: self.replica_id.clone(),
            role: self.role,
            last_seen_unix: self.last_seen_unix,
        }
    }
}

#[derive(Default)]
struct ShardReplicas {
    by_url: HashMap<String, ReplicaRecord>,
    leader_url: Option<String>,
    rr_cursor: usize,
}

/// Per-shard directory of live replicas with a designated leader.
///
/// Election is first-come: the first replica to register while no active
/// leader exists becomes leader, and keeps the role for as long as it
/// re-registers within the TTL. Staleness is detected lazily on query; a
/// dead leader stays in storage but is hidden from `leader_url` until some
/// other replica registers and takes over.
pub struct ReplicaRegistry {
    ttl: Duration,
    shards: HashMap<String, ShardReplicas>,
}

impl ReplicaRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            shards: HashMap::new(),
        }
    }

    /// Register or refresh a replica, returning its assigned role and the
    /// shard's current leader URL. The requested role documents intent
    /// only: the first registrant becomes leader whatever it asked for,
    /// and a `leader` request never preempts an active incumbent.
    pub fn register(
        &mut self,
        shard_name: &str,
        replica_url: &str,
        replica_id: Option<String>,
        _requested_role: RequestedRole,
    ) -> (Role, String) {
        let replica_url = replica_url.trim_end_matches('/').to_string();
        let ttl = self.ttl;
        let shard = self.shards.entry(shard_name.to_string()).or_default();

        // Drop an expired incumbent before deciding the new role. An expired
        // leader that re-registers goes through the same first-come rule as
        // anyone else.
        if let Some(url) = shard.leader_url.clone() {
            let active = shard
                .by_url
                .get(&url)
                .map(|r| r.last_seen.elapsed() <= ttl)
                .unwrap_or(false);
            if !active {
                shard.leader_url = None;
            }
        }

        let mut assigned = match shard.leader_url {
            None => {
                shard.leader_url = Some(replica_url.clone());
                Role::Leader
            }
            Some(_) => Role::Follower,
        };

        // A replica that already holds the leadership keeps it when it
        // re-registers, whatever role it asked for.
        let was_leader = shard
            .by_url
            .get(&replica_url)
            .map(|prev| prev.role == Role::Leader)
            .unwrap_or(false);
        if was_leader && shard.leader_url.as_deref() == Some(&replica_url) {
            assigned = Role::Leader;
        }

        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        shard.by_url.insert(
            replica_url.clone(),
            ReplicaRecord {
                shard_name: shard_name.to_string(),
                replica_url: replica_url.clone(),
                replica_id,
                role: assigned,
                last_seen: Instant::now(),
                last_seen_unix: now_unix,
            },
        );

        // Re-assert the stored leader's record role so listings stay honest
        // even after the leader registered as `auto`.
        if let Some(url) = shard.leader_url.clone() {
            if let Some(record) = shard.by_url.get_mut(&url) {
                record.role = Role::Leader;
            }
        }

        let leader_url = shard
            .leader_url
            .clone()
            .unwrap_or_else(|| replica_url.clone());
        (assigned, leader_url)
    }

    /// The shard's leader URL, only while its record is still within TTL.
    pub fn leader_url(&self, shard_name: &str) -> Option<String> {
        let shard = self.shards.get(shard_name)?;
        let url = shard.leader_url.as_ref()?;
        let record = shard.by_url.get(url)?;
        (record.last_seen.elapsed() <= self.ttl).then(|| url.clone())
    }

    /// All replicas of the shard seen within the TTL window.
    pub fn active_replicas(&self, shard_name: &str) -> Vec<ReplicaRecord> {
        let Some(shard) = self.shards.get(shard_name) else {
            return Vec::new();
        };
        let mut active: Vec<ReplicaRecord> = shard
            .by_url
            .values()
            .filter(|r| r.last_seen.elapsed() <= self.ttl)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.replica_url.cmp(&b.replica_url));
        active
    }

    /// Round-robin over the active replicas, spreading reads.
    pub fn pick_read_replica(&mut self, shard_name: &str) -> Option<String> {
        let active = self.active_replicas(shard_name);
        if active.is_empty() {
            return None;
        }
        let shard = self.shards.get_mut(shard_name)?;
        let i = shard.rr_cursor % active.len();
        shard.rr_cursor = i + 1;
        Some(active[i].replica_url.clone())
    }

    /// Every known record, active or not. Diagnostics only.
    pub fn list_all(&self) -> Vec<ReplicaRecord> {
        let mut all: Vec<ReplicaRecord> = self
            .shards
            .values()
            .flat_map(|s| s.by_url.values().cloned())
            .collect();
        all.sort_by(|a, b| {
            (a.shard_name.as_str(), a.replica_url.as_str())
                .cmp(&(b.shard_name.as_str(), b.replica_url.as_str()))
        });
        all
    }
}
