//! Shard replica node.
//!
//! Each process stores a complete copy of its shard's data. The leader
//! accepts writes by publishing a replication event (durably confirmed)
//! and then applying it locally; followers serve reads, consume the
//! replication queue, and either proxy writes to the leader or redirect
//! the client there. A background worker re-registers the replica with the
//! coordinator to keep its registry record alive.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kivet_bus::{ApplyError, ApplyEvent, Broker, BusConfig, BusError, Replicator};
use kivet_client::{ClientError, CoordinatorClient, ShardClient};
use kivet_core::{
    now_ns, BulkKeysRequest, CreateRecordRequest, DumpItem, DumpResponse, Event, ExistsResponse,
    IngestRequest, IngestResponse, KeyItem, KeysDumpResponse, MigrateDelResponse,
    MigratePutResponse, RecordResponse, RegisterReplicaRequest, RequestedRole, Role,
};
use kivet_store::ShardStore;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod obs;

#[derive(Clone, Debug)]
pub struct ShardConfig {
    /// Coordinator base URL. When absent the replica runs standalone and
    /// assumes leadership of its shard (single-node and test mode).
    pub coordinator_url: Option<String>,
    /// This replica's externally reachable base URL.
    pub shard_url: String,
    pub shard_name: String,
    pub replica_id: String,
    /// Stable identity used as the LWW tie-breaker on writes this replica
    /// accepts as leader.
    pub origin: String,
    pub register_interval: Duration,
    pub proxy_writes: bool,
    pub http_timeout: Duration,
    pub build_version: String,
}

impl ShardConfig {
    pub fn new(shard_name: impl Into<String>, shard_url: impl Into<String>) -> Self {
        let replica_id = uuid::Uuid::new_v4().simple().to_string();
        let shard_url: String = shard_url.into();
        Self {
            coordinator_url: None,
            shard_url: shard_url.trim_end_matches('/').to_string(),
            shard_name: shard_name.into(),
            origin: replica_id.clone(),
            replica_id,
            register_interval: Duration::from_secs(10),
            proxy_writes: true,
            http_timeout: Duration::from_secs(5),
            build_version: "dev".to_string(),
        }
    }

    pub fn with_coordinator(mut self, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.coordinator_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    pub fn with_replica_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if self.origin == self.replica_id {
            self.origin = id.clone();
        }
        self.replica_id = id;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }

    pub fn with_proxy_writes(mut self, proxy: bool) -> Self {
        self.proxy_writes = proxy;
        self
    }
}

/// Role and leader URL as last reported by the coordinator.
#[derive(Default)]
pub struct RegistrationState {
    inner: RwLock<Registration>,
}

#[derive(Clone, Default)]
struct Registration {
    role: Option<Role>,
    leader_url: Option<String>,
}

impl RegistrationState {
    pub fn role(&self) -> Option<Role> {
        self.inner.read().expect("registration lock poisoned").role
    }

    pub fn leader_url(&self) -> Option<String> {
        self.inner
            .read()
            .expect("registration lock poisoned")
            .leader_url
            .clone()
    }

    pub fn update(&self, role: Role, leader_url: String) {
        let mut inner = self.inner.write().expect("registration lock poisoned");
        inner.role = Some(role);
        inner.leader_url = Some(leader_url.trim_end_matches('/').to_string());
    }
}

struct StoreSink(Arc<ShardStore>);

impl ApplyEvent for StoreSink {
    fn apply(&self, event: Event) -> Result<(), ApplyError> {
        self.0.apply_event(&event);
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<ShardStore>,
    replicator: Arc<Replicator>,
    registration: Arc<RegistrationState>,
    config: Arc<ShardConfig>,
    shard_client: ShardClient,
    metrics: PrometheusHandle,
}

impl AppState {
    fn new(config: ShardConfig, broker: Arc<dyn Broker>, bus: BusConfig) -> Self {
        let store = Arc::new(ShardStore::new());
        let replicator = Arc::new(Replicator::start(
            broker,
            Arc::new(StoreSink(store.clone())),
            bus,
        ));
        let registration = Arc::new(RegistrationState::default());
        if config.coordinator_url.is_none() {
            registration.update(Role::Leader, config.shard_url.clone());
        }
        let shard_client = ShardClient::new(config.http_timeout);
        Self {
            store,
            replicator,
            registration,
            config: Arc::new(config),
            shard_client,
            metrics: kivet_core::metrics_recorder(),
        }
    }

    fn leader_or_unavailable(&self) -> Result<String, ShardApiError> {
        self.registration
            .leader_url()
            .ok_or(ShardApiError::NoLeader)
    }

    fn require_leader(&self) -> Result<(), ShardApiError> {
        if self.registration.role() == Some(Role::Leader) {
            Ok(())
        } else {
            Err(ShardApiError::NotLeader)
        }
    }

    /// Publish an event with the broker confirm, then apply it locally.
    /// The local store is untouched when publication fails, so a client
    /// that saw the failure can retry safely.
    async fn publish_and_apply(&self, event: Event) -> Result<(), ShardApiError> {
        self.replicator.publish(event.clone()).await?;
        self.store.apply_event(&event);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ShardApiError {
    #[error("record not found")]
    NotFound,

    #[error("{0} must not be empty")]
    Validation(&'static str),

    #[error("not leader")]
    NotLeader,

    #[error("no leader known yet (replica not registered or coordinator unreachable)")]
    NoLeader,

    #[error("replication log publish failed: {0}")]
    Publish(#[from] BusError),

    #[error("leader proxy failed: {0}")]
    LeaderProxy(String),

    #[error("leader error: {detail}")]
    Downstream { status: StatusCode, detail: String },

    #[error("redirecting to leader at {0}")]
    RedirectToLeader(String),
}

impl IntoResponse for ShardApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ShardApiError::NotFound => StatusCode::NOT_FOUND,
            ShardApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ShardApiError::NotLeader => StatusCode::CONFLICT,
            ShardApiError::NoLeader | ShardApiError::Publish(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShardApiError::LeaderProxy(_) => StatusCode::BAD_GATEWAY,
            ShardApiError::Downstream { status, .. } => *status,
            ShardApiError::RedirectToLeader(_) => StatusCode::TEMPORARY_REDIRECT,
        };
        let mut response = (
            status,
            Json(serde_json::json!({ "detail": self.to_string() })),
        )
            .into_response();

        if let ShardApiError::RedirectToLeader(leader) = &self {
            let target = format!("{leader}/records");
            if let Ok(value) = axum::http::HeaderValue::from_str(&target) {
                response
                    .headers_mut()
                    .insert(axum::http::header::LOCATION, value);
            }
        }

        response
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

fn proxy_error(err: ClientError) -> ShardApiError {
    match err {
        ClientError::Transport(err) => ShardApiError::LeaderProxy(err.to_string()),
        // reqwest and axum sit on different http major versions; carry the
        // status across by value.
        ClientError::Api { status, detail } => ShardApiError::Downstream {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            detail,
        },
    }
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), ShardApiError> {
    if value.is_empty() {
        return Err(ShardApiError::Validation(field));
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
    fn validate(&self) -> Result<(), ShardApiError> {
        require_non_empty(&self.table_name, "table_name")?;
        require_non_empty(&self.pk, "pk")?;
        require_non_empty(&self.sk, "sk")
    }
}

#[derive(Debug, Deserialize)]
struct KeysQuery {
    table_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DumpQuery {
    table_name: String,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "role": state.registration.role().map(|r| r.as_str()),
        "leader_url": state.registration.leader_url(),
    }))
}

async fn version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "shard",
        "build_version": state.config.build_version,
        "shard_name": state.config.shard_name,
        "origin": state.config.origin,
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

async fn stats(State(state): State<AppState>) -> Json<kivet_core::StatsResponse> {
    Json(state.store.stats())
}

async fn create_record(
    State(state): State<AppState>,
    Json(req): Json<CreateRecordRequest>,
) -> Result<Json<RecordResponse>, ShardApiError> {
    require_non_empty(&req.table_name, "table_name")?;
    require_non_empty(&req.pk, "pk")?;
    require_non_empty(&req.sk, "sk")?;

    if state.registration.role() != Some(Role::Leader) {
        let leader = state.leader_or_unavailable()?;
        if !state.config.proxy_writes {
            return Err(ShardApiError::RedirectToLeader(leader));
        }
        let resp = state
            .shard_client
            .create_record(&leader, &req)
            .await
            .map_err(proxy_error)?;
        return Ok(Json(resp));
    }

    let version = now_ns();
    let event = Event::put(
        &req.table_name,
        &req.pk,
        &req.sk,
        req.value.clone(),
        version,
        &state.config.origin,
    );
    state.publish_and_apply(event).await?;

    Ok(Json(RecordResponse {
        table_name: req.table_name,
        pk: req.pk,
        sk: req.sk,
        value: Some(req.value),
        version: Some(version),
        origin: Some(state.config.origin.clone()),
        shard_url: None,
    }))
}

async fn read_record(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<RecordResponse>, ShardApiError> {
    query.validate()?;
    let (value, version, origin) = state
        .store
        .get_with_version(&query.table_name, &query.pk, &query.sk)
        .ok_or(ShardApiError::NotFound)?;
    Ok(Json(RecordResponse {
        table_name: query.table_name,
        pk: query.pk,
        sk: query.sk,
        value: Some(value),
        version: Some(version),
        origin: Some(origin),
        shard_url: None,
    }))
}

async fn delete_record(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<RecordResponse>, ShardApiError> {
    query.validate()?;

    if state.registration.role() != Some(Role::Leader) {
        let leader = state.leader_or_unavailable()?;
        if !state.config.proxy_writes {
            return Err(ShardApiError::RedirectToLeader(leader));
        }
        let resp = state
            .shard_client
            .delete_record(&leader, &query.table_name, &query.pk, &query.sk)
            .await
            .map_err(proxy_error)?
            .ok_or(ShardApiError::NotFound)?;
        return Ok(Json(resp));
    }

    let version = now_ns();
    let event = Event::del(
        &query.table_name,
        &query.pk,
        &query.sk,
        version,
        &state.config.origin,
    );
    state.replicator.publish(event).await?;
    let prev = state.store.delete(
        &query.table_name,
        &query.pk,
        &query.sk,
        version,
        &state.config.origin,
    );
    let prev = prev.ok_or(ShardApiError::NotFound)?;
    Ok(Json(RecordResponse {
        table_name: query.table_name,
        pk: query.pk,
        sk: query.sk,
        value: Some(prev),
        version: Some(version),
        origin: Some(state.config.origin.clone()),
        shard_url: None,
    }))
}

async fn exists(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<ExistsResponse>, ShardApiError> {
    query.validate()?;
    Ok(Json(ExistsResponse {
        exists: state.store.exists(&query.table_name, &query.pk, &query.sk),
    }))
}

async fn internal_keys(
    State(state): State<AppState>,
    Query(query): Query<KeysQuery>,
) -> Json<KeysDumpResponse> {
    let items = state
        .store
        .iter_records()
        .into_iter()
        .filter(|r| !r.deleted)
        .filter(|r| {
            query
                .table_name
                .as_deref()
                .map_or(true, |t| r.table_name == t)
        })
        .map(|r| KeyItem {
            table_name: r.table_name,
            pk: r.pk,
            sk: r.sk,
            value: r.value,
            version: r.version,
            origin: r.origin,
        })
        .collect();
    Json(KeysDumpResponse { items })
}

async fn internal_dump(
    State(state): State<AppState>,
    Query(query): Query<DumpQuery>,
) -> Result<Json<DumpResponse>, ShardApiError> {
    require_non_empty(&query.table_name, "table_name")?;
    let items = state
        .store
        .iter_records()
        .into_iter()
        .filter(|r| r.table_name == query.table_name)
        .map(|r| DumpItem {
            pk: r.pk,
            sk: r.sk,
            value: r.value,
            version: r.version,
            origin: r.origin,
            deleted: r.deleted,
        })
        .collect();
    Ok(Json(DumpResponse {
        table_name: query.table_name,
        items,
    }))
}

async fn internal_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ShardApiError> {
    require_non_empty(&req.table_name, "table_name")?;
    let count = req.items.len();
    for item in req.items {
        let origin = item.origin.unwrap_or_else(|| "ingest".to_string());
        if item.deleted {
            state
                .store
                .delete(&req.table_name, &item.pk, &item.sk, item.version, &origin);
        } else {
            state.store.put(
                &req.table_name,
                &item.pk,
                &item.sk,
                item.value,
                item.version,
                &origin,
            );
        }
    }
    Ok(Json(IngestResponse {
        status: "ok".to_string(),
        count,
    }))
}

async fn internal_migrate_put(
    State(state): State<AppState>,
    Json(req): Json<BulkKeysRequest>,
) -> Result<Json<MigratePutResponse>, ShardApiError> {
    state.require_leader()?;
    let count = req.items.len();
    for item in req.items {
        let event = Event::put(
            &item.table_name,
            &item.pk,
            &item.sk,
            item.value,
            item.version,
            &item.origin,
        );
        state.publish_and_apply(event).await?;
    }
    Ok(Json(MigratePutResponse { migrated: count }))
}

async fn internal_migrate_del(
    State(state): State<AppState>,
    Json(req): Json<BulkKeysRequest>,
) -> Result<Json<MigrateDelResponse>, ShardApiError> {
    state.require_leader()?;
    let count = req.items.len();
    for item in req.items {
        let event = Event::del(
            &item.table_name,
            &item.pk,
            &item.sk,
            item.version,
            &item.origin,
        );
        state.publish_and_apply(event).await?;
    }
    Ok(Json(MigrateDelResponse { deleted: count }))
}

fn build_router(state: AppState) -> Router {
    let obs_state = obs::ObsState {
        registration: state.registration.clone(),
        shard_name: state.config.shard_name.clone(),
        replica_id: state.config.replica_id.clone(),
    };
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(render_metrics))
        .route("/stats", get(stats))
        .route(
            "/records",
            post(create_record).get(read_record).delete(delete_record),
        )
        .route("/exists", get(exists))
        .route("/internal/stats", get(stats))
        .route("/internal/keys", get(internal_keys))
        .route("/internal/dump", get(internal_dump))
        .route("/internal/ingest", post(internal_ingest))
        .route("/internal/migrate-put", post(internal_migrate_put))
        .route("/internal/migrate-del", post(internal_migrate_del))
        .layer(axum::middleware::from_fn_with_state(
            obs_state,
            obs::trace_and_metrics,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Re-register with the coordinator forever. The interval must stay below
/// the registry TTL or the replica is considered absent.
async fn register_forever(
    coordinator: CoordinatorClient,
    config: Arc<ShardConfig>,
    registration: Arc<RegistrationState>,
) {
    let mut tick = tokio::time::interval(config.register_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let req = RegisterReplicaRequest {
            shard_name: config.shard_name.clone(),
            replica_url: config.shard_url.clone(),
            replica_id: Some(config.replica_id.clone()),
            role: RequestedRole::Auto,
        };
        match coordinator.register_replica(&req).await {
            Ok(resp) => {
                registration.update(resp.assigned_role, resp.leader_url);
                counter!(
                    "registration_heartbeat_total",
                    "shard" => config.shard_name.clone(),
                    "replica" => config.replica_id.clone(),
                    "role" => resp.assigned_role.as_str()
                )
                .increment(1);
            }
            Err(err) => {
                warn!(%err, shard = %config.shard_name, "replica registration failed");
            }
        }
    }
}

/// Serve the shard API on `listener` until `shutdown` resolves. Spawns the
/// replication workers and, when a coordinator is configured, the
/// registration heartbeat.
pub async fn start_server(
    listener: TcpListener,
    config: ShardConfig,
    broker: Arc<dyn Broker>,
    bus: BusConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> JoinHandle<Result<(), std::io::Error>> {
    let state = AppState::new(config, broker, bus);

    let heartbeat = state.config.coordinator_url.as_ref().map(|url| {
        let coordinator = CoordinatorClient::new(url.clone(), state.config.http_timeout);
        tokio::spawn(register_forever(
            coordinator,
            state.config.clone(),
            state.registration.clone(),
        ))
    });

    let app = build_router(state.clone());
    tokio::spawn(async move {
        info!(shard = %state.config.shard_name, replica = %state.config.replica_id, "shard node serving");
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        state.replicator.stop();
        result
    })
}
