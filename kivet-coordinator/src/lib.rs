//! Stateless routing tier.
//!
//! The coordinator owns no data: it maps partition keys to shards through
//! the consistent-hash ring, forwards writes to the owning shard's leader,
//! spreads reads across the shard's live replicas, and kicks off a
//! migration whenever a registration puts a new shard into the ring.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kivet_client::{ClientError, ShardClient};
use kivet_cluster::{HashRing, ReplicaRegistry, TableRegistry};
use kivet_core::{
    CreateRecordRequest, ExistsResponse, RecordResponse, RegisterReplicaRequest,
    RegisterReplicaResponse, ReplicaInfo, TableDef,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod gauges;
mod migration;
mod obs;

pub use migration::MigrationController;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Virtual nodes per shard on the ring.
    pub ring_replicas: usize,
    /// Liveness window; replicas must re-register faster than this.
    pub replica_ttl: Duration,
    /// Timeout for forwarded record operations.
    pub request_timeout: Duration,
    pub build_version: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ring_replicas: kivet_cluster::DEFAULT_VNODES,
            replica_ttl: Duration::from_secs(30),
            request_timeout: Duration::from_secs(2),
            build_version: "dev".to_string(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    tables: Arc<Mutex<TableRegistry>>,
    ring: Arc<RwLock<HashRing>>,
    replicas: Arc<Mutex<ReplicaRegistry>>,
    migration: Arc<MigrationController>,
    shards: ShardClient,
    config: Arc<CoordinatorConfig>,
    metrics: PrometheusHandle,
}

impl AppState {
    fn new(config: CoordinatorConfig) -> Self {
        Self {
            tables: Arc::new(Mutex::new(TableRegistry::new())),
            ring: Arc::new(RwLock::new(HashRing::new(config.ring_replicas))),
            replicas: Arc::new(Mutex::new(ReplicaRegistry::new(config.replica_ttl))),
            migration: Arc::new(MigrationController::new()),
            shards: ShardClient::new(config.request_timeout),
            config: Arc::new(config),
            metrics: kivet_core::metrics_recorder(),
        }
    }

    fn require_table(&self, table_name: &str) -> Result<(), CoordError> {
        let tables = self.tables.lock().expect("tables lock poisoned");
        if tables.exists(table_name) {
            Ok(())
        } else {
            Err(CoordError::UnknownTable(table_name.to_string()))
        }
    }

    /// Owner shard of `pk` under the current ring.
    fn shard_for(&self, pk: &str) -> Result<String, CoordError> {
        self.ring
            .read()
            .expect("ring lock poisoned")
            .get(pk)
            .map(str::to_string)
            .ok_or(CoordError::EmptyRing)
    }

    fn leader_for(&self, shard: &str) -> Result<String, CoordError> {
        self.replicas
            .lock()
            .expect("replicas lock poisoned")
            .leader_url(shard)
            .ok_or_else(|| CoordError::NoLeader(shard.to_string()))
    }

    fn read_replica_for(&self, shard: &str) -> Result<String, CoordError> {
        self.replicas
            .lock()
            .expect("replicas lock poisoned")
            .pick_read_replica(shard)
            .ok_or_else(|| CoordError::NoReplicas(shard.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("table {0} is not registered; register it first")]
    UnknownTable(String),

    #[error("no shards registered")]
    EmptyRing,

    #[error("no leader available for shard {0}")]
    NoLeader(String),

    #[error("no active replicas for shard {0}")]
    NoReplicas(String),

    #[error("exists failed on leader: {0}")]
    LeaderCheckFailed(String),

    #[error("shard request failed: {0}")]
    ShardTransport(String),

    #[error("shard error: {detail}")]
    Downstream { status: StatusCode, detail: String },

    #[error("{0} must not be empty")]
    Validation(&'static str),
}

impl IntoResponse for CoordError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordError::UnknownTable(_) => StatusCode::NOT_FOUND,
            CoordError::EmptyRing
            | CoordError::NoLeader(_)
            | CoordError::NoReplicas(_)
            | CoordError::LeaderCheckFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordError::ShardTransport(_) => StatusCode::BAD_GATEWAY,
            CoordError::Downstream { status, .. } => *status,
            CoordError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (
            status,
            Json(serde_json::json!({ "detail": self.to_string() })),
        )
            .into_response()
    }
}

/// Even an unexpected failure must answer with a diagnostic body, never an
/// empty 500.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unexpected internal error".to_string()
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "detail": format!("Internal error: {detail}") })),
    )
        .into_response()
}

/// A shard that answered with an error keeps its status; a shard we could
/// not reach at all is a bad gateway.
fn downstream(err: ClientError) -> CoordError {
    match err {
        ClientError::Transport(err) => CoordError::ShardTransport(err.to_string()),
        // reqwest and axum sit on different http major versions; carry the
        // status across by value.
        ClientError::Api { status, detail } => CoordError::Downstream {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            detail,
        },
    }
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), CoordError> {
    if value.is_empty() {
        return Err(CoordError::Validation(field));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RecordQuery {
    table_name: String,
    pk: String,
    sk: String,
}

impl RecordQuery {
    fn validate(&self) -> Result<(), CoordError> {
        require_non_empty(&self.table_name, "table_name")?;
        require_non_empty(&self.pk, "pk")?;
        require_non_empty(&self.sk, "sk")
    }
}

fn null_record(table_name: String, pk: String, sk: String, shard_url: String) -> RecordResponse {
    RecordResponse {
        table_name,
        pk,
        sk,
        value: None,
        version: None,
        origin: None,
        shard_url: Some(shard_url),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": state.config.build_version }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

async fn register_table(
    State(state): State<AppState>,
    Json(def): Json<TableDef>,
) -> Result<Json<TableDef>, CoordError> {
    require_non_empty(&def.table_name, "table_name")?;
    require_non_empty(&def.partition_key, "partition_key")?;
    require_non_empty(&def.sort_key, "sort_key")?;
    let registered = state
        .tables
        .lock()
        .expect("tables lock poisoned")
        .register(def);
    Ok(Json(registered))
}

async fn list_tables(State(state): State<AppState>) -> Json<Vec<TableDef>> {
    Json(state.tables.lock().expect("tables lock poisoned").list())
}

async fn get_table(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
) -> Result<Json<TableDef>, CoordError> {
    state
        .tables
        .lock()
        .expect("tables lock poisoned")
        .get(&table_name)
        .map(Json)
        .ok_or(CoordError::UnknownTable(table_name))
}

/// Registration doubles as the liveness heartbeat and the ring trigger: a
/// shard enters the ring once it has an active leader, and a shard that is
/// new to the ring starts a migration from a snapshot of the previous ring.
async fn register_replica(
    State(state): State<AppState>,
    Json(req): Json<RegisterReplicaRequest>,
) -> Result<Json<RegisterReplicaResponse>, CoordError> {
    require_non_empty(&req.shard_name, "shard_name")?;
    require_non_empty(&req.replica_url, "replica_url")?;

    let before = state.ring.read().expect("ring lock poisoned").nodes();

    let (assigned_role, leader_url) = state
        .replicas
        .lock()
        .expect("replicas lock poisoned")
        .register(&req.shard_name, &req.replica_url, req.replica_id, req.role);

    let has_leader = state
        .replicas
        .lock()
        .expect("replicas lock poisoned")
        .leader_url(&req.shard_name)
        .is_some();
    if has_leader {
        state
            .ring
            .write()
            .expect("ring lock poisoned")
            .add(&req.shard_name);
    }

    let newly_in_ring = has_leader && !before.iter().any(|s| s == &req.shard_name);
    if newly_in_ring && !before.is_empty() {
        let mut old_ring = HashRing::new(state.config.ring_replicas);
        for shard in &before {
            old_ring.add(shard);
        }
        if state.migration.try_begin(old_ring.clone()) {
            info!(shard = %req.shard_name, "ring grew; starting key migration");
            tokio::spawn(migration::run_migration(state.clone(), old_ring));
        }
    }

    Ok(Json(RegisterReplicaResponse {
        shard_name: req.shard_name,
        assigned_role,
        leader_url,
    }))
}

async fn list_replicas(State(state): State<AppState>) -> Json<Vec<ReplicaInfo>> {
    let replicas = state.replicas.lock().expect("replicas lock poisoned");
    Json(replicas.list_all().iter().map(|r| r.info()).collect())
}

async fn create_record(
    State(state): State<AppState>,
    Json(req): Json<CreateRecordRequest>,
) -> Result<Json<RecordResponse>, CoordError> {
    require_non_empty(&req.table_name, "table_name")?;
    require_non_empty(&req.pk, "pk")?;
    require_non_empty(&req.sk, "sk")?;
    state.require_table(&req.table_name)?;

    let shard = state.shard_for(&req.pk)?;
    let leader = state.leader_for(&shard)?;
    let mut record = state
        .shards
        .create_record(&leader, &req)
        .await
        .map_err(downstream)?;
    record.shard_url = Some(leader);
    Ok(Json(record))
}

async fn read_record(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<RecordResponse>, CoordError> {
    query.validate()?;
    state.require_table(&query.table_name)?;

    let shard = state.shard_for(&query.pk)?;
    let replica = state.read_replica_for(&shard)?;

    let found = state
        .shards
        .read_record(&replica, &query.table_name, &query.pk, &query.sk)
        .await
        .map_err(downstream)?;
    if let Some(mut record) = found {
        record.shard_url = Some(replica);
        return Ok(Json(record));
    }

    // Not found at the current owner. While a migration is running the old
    // owner keeps serving keys whose move has not completed; consult the
    // snapshotted pre-migration ring before reporting a miss.
    if let Some(old_ring) = state.migration.old_ring() {
        if let Some(old_shard) = old_ring.get(&query.pk) {
            if old_shard != shard {
                if let Ok(fallback) = state.read_replica_for(old_shard) {
                    if let Ok(Some(mut record)) = state
                        .shards
                        .read_record(&fallback, &query.table_name, &query.pk, &query.sk)
                        .await
                    {
                        record.shard_url = Some(fallback);
                        return Ok(Json(record));
                    }
                }
            }
        }
    }

    Ok(Json(null_record(query.table_name, query.pk, query.sk, replica)))
}

async fn delete_record(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<RecordResponse>, CoordError> {
    query.validate()?;
    state.require_table(&query.table_name)?;

    let shard = state.shard_for(&query.pk)?;
    let leader = state.leader_for(&shard)?;
    let deleted = state
        .shards
        .delete_record(&leader, &query.table_name, &query.pk, &query.sk)
        .await
        .map_err(downstream)?;
    Ok(Json(match deleted {
        Some(mut record) => {
            record.shard_url = Some(leader);
            record
        }
        // Deleting what is not there succeeds; delete is idempotent.
        None => null_record(query.table_name, query.pk, query.sk, leader),
    }))
}

/// Leader answer is authoritative; a leader error is a 503 with no
/// fallback. Only an explicit "false" consults the followers, masking
/// briefly stale negative answers right after a write.
async fn exists(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<ExistsResponse>, CoordError> {
    query.validate()?;
    state.require_table(&query.table_name)?;

    let shard = state.shard_for(&query.pk)?;
    let leader = state.leader_for(&shard)?;

    let on_leader = state
        .shards
        .exists(&leader, &query.table_name, &query.pk, &query.sk)
        .await
        .map_err(|err| CoordError::LeaderCheckFailed(err.to_string()))?;
    if on_leader {
        return Ok(Json(ExistsResponse { exists: true }));
    }

    let followers: Vec<String> = {
        let replicas = state.replicas.lock().expect("replicas lock poisoned");
        replicas
            .active_replicas(&shard)
            .into_iter()
            .map(|r| r.replica_url)
            .filter(|url| url != &leader)
            .collect()
    };
    for follower in followers {
        if let Ok(true) = state
            .shards
            .exists(&follower, &query.table_name, &query.pk, &query.sk)
            .await
        {
            return Ok(Json(ExistsResponse { exists: true }));
        }
    }

    Ok(Json(ExistsResponse { exists: false }))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(render_metrics))
        .route("/tables", post(register_table).get(list_tables))
        .route("/tables/:table_name", get(get_table))
        .route("/register-replica", post(register_replica))
        .route("/replicas", get(list_replicas))
        .route(
            "/records",
            post(create_record).get(read_record).delete(delete_record),
        )
        .route("/exists", get(exists))
        .layer(axum::middleware::from_fn(obs::trace_and_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Serve the coordinator API on `listener` until `shutdown` resolves. Also
/// runs the periodic cluster gauge worker.
pub async fn start_server(
    listener: TcpListener,
    config: CoordinatorConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> JoinHandle<Result<(), std::io::Error>> {
    let state = AppState::new(config);
    let gauges = tokio::spawn(gauges::emit_cluster_gauges(state.clone()));
    let app = build_router(state);
    tokio::spawn(async move {
        info!("coordinator serving");
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;
        gauges.abort();
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kivet_bus::memory::MemoryBroker;
    use kivet_bus::BusConfig;
    use kivet_core::now_ns;
    use kivet_core::KeyItem;
    use kivet_shard::ShardConfig;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            ring_replicas: 32,
            replica_ttl: Duration::from_secs(30),
            request_timeout: Duration::from_secs(2),
            build_version: "test".to_string(),
        }
    }

    async fn start_leader_shard(
        shard_name: &str,
        queue: &str,
    ) -> (String, oneshot::Sender<()>) {
        let broker = Arc::new(MemoryBroker::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");
        let (tx, rx) = oneshot::channel();
        kivet_shard::start_server(
            listener,
            ShardConfig::new(shard_name, url.clone()),
            broker,
            BusConfig {
                queue: queue.to_string(),
                publish_timeout: Duration::from_millis(500),
                publish_retries: 2,
                reconnect_backoff: Duration::from_millis(20),
                keepalive_tick: Duration::from_millis(100),
                prefetch: 50,
            },
            async move {
                let _ = rx.await;
            },
        )
        .await;
        (url, tx)
    }

    fn register_table_and_shard(state: &AppState, shard: &str, replica_url: &str) {
        state.tables.lock().unwrap().register(TableDef {
            table_name: "users".into(),
            partition_key: "id".into(),
            sort_key: "ts".into(),
        });
        state.replicas.lock().unwrap().register(
            shard,
            replica_url,
            None,
            kivet_core::RequestedRole::Auto,
        );
        state.ring.write().unwrap().add(shard);
    }

    /// A key the new ring assigns to `target` but the old (single-shard)
    /// ring assigns elsewhere.
    fn key_owned_by(ring: &HashRing, target: &str) -> String {
        (0..10_000)
            .map(|i| format!("probe-{i}"))
            .find(|k| ring.get(k) == Some(target))
            .expect("no key hashed to the target shard")
    }

    #[test]
    fn migrations_coalesce_while_one_is_running() {
        let controller = MigrationController::new();
        assert!(controller.try_begin(HashRing::new(8)));
        assert!(!controller.try_begin(HashRing::new(8)));
        assert!(controller.in_progress());
        controller.finish();
        assert!(controller.old_ring().is_none());
        assert!(controller.try_begin(HashRing::new(8)));
    }

    #[tokio::test]
    async fn reads_fall_back_to_the_old_owner_during_migration() {
        let state = AppState::new(test_config());
        let (s1_url, _stop_s1) = start_leader_shard("s1", "s1.events").await;
        let (s2_url, _stop_s2) = start_leader_shard("s2", "s2.events").await;

        register_table_and_shard(&state, "s1", &s1_url);
        state
            .replicas
            .lock()
            .unwrap()
            .register("s2", &s2_url, None, kivet_core::RequestedRole::Auto);
        state.ring.write().unwrap().add("s2");

        // A key that moved to s2 when it joined, but whose data still lives
        // on s1 because migrate-del has not run yet.
        let key = {
            let ring = state.ring.read().unwrap();
            key_owned_by(&ring, "s2")
        };
        state
            .shards
            .create_record(
                &s1_url,
                &CreateRecordRequest {
                    table_name: "users".into(),
                    pk: key.clone(),
                    sk: "1".into(),
                    value: json!({"name": "Ada"}),
                },
            )
            .await
            .unwrap();

        let mut old_ring = HashRing::new(state.config.ring_replicas);
        old_ring.add("s1");
        assert!(state.migration.try_begin(old_ring));

        let app = build_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = reqwest::Client::new();
        let read: serde_json::Value = client
            .get(format!("http://{addr}/records"))
            .query(&[("table_name", "users"), ("pk", key.as_str()), ("sk", "1")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(read["value"], json!({"name": "Ada"}), "old owner must serve the key");
        assert_eq!(read["shard_url"], json!(s1_url));

        // Complete the move by hand: copy to s2, tombstone on s1, finish.
        let items = vec![KeyItem {
            table_name: "users".into(),
            pk: key.clone(),
            sk: "1".into(),
            value: json!({"name": "Ada"}),
            version: read["version"].as_i64().unwrap(),
            origin: read["origin"].as_str().unwrap().to_string(),
        }];
        state.shards.migrate_put(&s2_url, items.clone()).await.unwrap();
        let dels = vec![KeyItem {
            version: now_ns(),
            origin: "migration".into(),
            ..items[0].clone()
        }];
        state.shards.migrate_del(&s1_url, dels).await.unwrap();
        state.migration.finish();

        // The reader must never regress: the key now comes from s2.
        let read: serde_json::Value = client
            .get(format!("http://{addr}/records"))
            .query(&[("table_name", "users"), ("pk", key.as_str()), ("sk", "1")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(read["value"], json!({"name": "Ada"}));
        assert_eq!(read["shard_url"], json!(s2_url));

        // And the old owner no longer reports it.
        assert!(!state
            .shards
            .exists(&s1_url, "users", &key, "1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_record_is_a_null_valued_200() {
        let state = AppState::new(test_config());
        let (s1_url, _stop) = start_leader_shard("s1", "s1.events").await;
        register_table_and_shard(&state, "s1", &s1_url);

        let app = build_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{addr}/records"))
            .query(&[("table_name", "users"), ("pk", "nobody"), ("sk", "1")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["value"], serde_json::Value::Null);
    }
}
