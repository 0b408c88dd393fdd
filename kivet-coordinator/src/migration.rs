//! Migration controller: moves exactly the keys whose ownership changed
//! when the ring grew, while the routing tier keeps the old owner readable
//! through the snapshotted pre-migration ring.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kivet_client::ShardClient;
use kivet_cluster::HashRing;
use kivet_core::{now_ns, KeyItem};
use tracing::{info, warn};

use crate::AppState;

#[derive(Default)]
struct MigrationState {
    in_progress: bool,
    old_ring: Option<HashRing>,
}

/// One migration at a time. Ring changes that arrive while a migration is
/// running coalesce into it and are not rebalanced separately; the mutex is
/// held only across flag transitions, never across the migration body.
#[derive(Default)]
pub struct MigrationController {
    state: Mutex<MigrationState>,
}

impl MigrationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the migration slot, storing a by-value snapshot of the ring as
    /// it was before the change. Returns false while a migration runs.
    pub fn try_begin(&self, old_ring: HashRing) -> bool {
        let mut state = self.state.lock().expect("migration lock poisoned");
        if state.in_progress {
            return false;
        }
        state.in_progress = true;
        state.old_ring = Some(old_ring);
        true
    }

    pub fn finish(&self) {
        let mut state = self.state.lock().expect("migration lock poisoned");
        state.in_progress = false;
        state.old_ring = None;
    }

    pub fn in_progress(&self) -> bool {
        self.state
            .lock()
            .expect("migration lock poisoned")
            .in_progress
    }

    /// The pre-migration ring, only while a migration is running. Cloned so
    /// the read fallback keeps working against the old topology even as the
    /// live ring keeps changing.
    pub fn old_ring(&self) -> Option<HashRing> {
        self.state
            .lock()
            .expect("migration lock poisoned")
            .old_ring
            .clone()
    }
}

/// Walk every shard of the old ring, pull its live keys, and move the ones
/// whose owner changed: copy to the new owner first (preserving version and
/// origin so LWW state is intact there), then tombstone on the old owner
/// with a freshly minted version that beats anything the records carried.
/// Per-shard failures are logged and skipped; the rest still migrates.
pub(crate) async fn run_migration(state: AppState, old_ring: HashRing) {
    // Bulk dumps and puts move entire keyspaces; give them more room than
    // the per-record forwarding timeout.
    let shards = ShardClient::new(Duration::from_secs(30));

    for src_shard in old_ring.nodes() {
        let Some(src_leader) = state
            .replicas
            .lock()
            .expect("replicas lock poisoned")
            .leader_url(&src_shard)
        else {
            warn!(shard = %src_shard, "skipping migration source without a leader");
            continue;
        };

        let items = match shards.internal_keys(&src_leader, None).await {
            Ok(items) => items,
            Err(err) => {
                warn!(shard = %src_shard, %err, "failed to dump keys; skipping shard");
                continue;
            }
        };

        let mut buckets: HashMap<String, Vec<KeyItem>> = HashMap::new();
        {
            let ring = state.ring.read().expect("ring lock poisoned");
            for item in items {
                let Some(new_owner) = ring.get(&item.pk) else {
                    continue;
                };
                if new_owner != src_shard {
                    buckets.entry(new_owner.to_string()).or_default().push(item);
                }
            }
        }

        for (dst_shard, moved) in buckets {
            let Some(dst_leader) = state
                .replicas
                .lock()
                .expect("replicas lock poisoned")
                .leader_url(&dst_shard)
            else {
                warn!(shard = %dst_shard, "skipping migration target without a leader");
                continue;
            };

            if let Err(err) = shards.migrate_put(&dst_leader, moved.clone()).await {
                warn!(src = %src_shard, dst = %dst_shard, %err, "migrate-put failed");
                continue;
            }

            let tombstone_version = now_ns();
            let dels: Vec<KeyItem> = moved
                .iter()
                .map(|item| KeyItem {
                    table_name: item.table_name.clone(),
                    pk: item.pk.clone(),
                    sk: item.sk.clone(),
                    value: item.value.clone(),
                    version: tombstone_version,
                    origin: "migration".to_string(),
                })
                .collect();
            match shards.migrate_del(&src_leader, dels).await {
                Ok(count) => {
                    info!(src = %src_shard, dst = %dst_shard, moved = count, "migrated bucket");
                }
                Err(err) => {
                    warn!(src = %src_shard, dst = %dst_shard, %err, "migrate-del failed");
                }
            }
        }
    }

    state.migration.finish();
}
