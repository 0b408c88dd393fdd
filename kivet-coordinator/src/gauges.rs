//! Periodic cluster gauges: ring membership, per-shard replica liveness,
//! leader presence, stored key counts, and keyspace share.

use std::time::Duration;

use metrics::gauge;
use tracing::warn;

use crate::AppState;

pub(crate) async fn emit_cluster_gauges(state: AppState) {
    let mut tick = tokio::time::interval(Duration::from_secs(10));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;

        let shards = state.ring.read().expect("ring lock poisoned").nodes();
        gauge!("cluster_shards_in_ring").set(shards.len() as f64);

        for shard in &shards {
            let (active, leader) = {
                let replicas = state.replicas.lock().expect("replicas lock poisoned");
                (
                    replicas.active_replicas(shard).len(),
                    replicas.leader_url(shard),
                )
            };
            gauge!("cluster_active_replicas", "shard" => shard.clone()).set(active as f64);
            gauge!("cluster_leader_present", "shard" => shard.clone())
                .set(if leader.is_some() { 1.0 } else { 0.0 });

            if let Some(leader) = leader {
                match state.shards.internal_stats(&leader).await {
                    Ok(stats) => {
                        gauge!("shard_stored_keys", "shard" => shard.clone())
                            .set(stats.total_keys as f64);
                    }
                    Err(err) => warn!(shard = %shard, %err, "stats poll failed"),
                }
            }
        }

        let counts = state
            .ring
            .read()
            .expect("ring lock poisoned")
            .vnode_counts();
        let total: usize = counts.values().sum();
        if total > 0 {
            for (shard, count) in counts {
                gauge!("shard_keyspace_percent", "shard" => shard)
                    .set(count as f64 * 100.0 / total as f64);
            }
        }
    }
}
