//! End-to-end cluster scenarios: a real coordinator and real shard nodes
//! wired together over the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use kivet_bus::memory::MemoryBroker;
use kivet_bus::BusConfig;
use kivet_client::CoordinatorClient;
use kivet_coordinator::{start_server, CoordinatorConfig};
use kivet_core::{CreateRecordRequest, Role, TableDef};
use kivet_shard::ShardConfig;
use reqwest::StatusCode;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::sleep;

fn fast_bus(queue: &str) -> BusConfig {
    BusConfig {
        queue: queue.to_string(),
        publish_timeout: Duration::from_millis(500),
        publish_retries: 2,
        reconnect_backoff: Duration::from_millis(20),
        keepalive_tick: Duration::from_millis(100),
        prefetch: 50,
    }
}

async fn start_coordinator(config: CoordinatorConfig) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    start_server(listener, config, async move {
        let _ = rx.await;
    })
    .await;
    (format!("http://{addr}"), tx)
}

async fn start_shard(
    coordinator_url: &str,
    shard_name: &str,
    broker: Arc<MemoryBroker>,
    interval: Duration,
) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{addr}");
    let config = ShardConfig::new(shard_name, url.clone())
        .with_coordinator(coordinator_url)
        .with_register_interval(interval);
    let (tx, rx) = oneshot::channel();
    kivet_shard::start_server(
        listener,
        config,
        broker,
        fast_bus(&format!("{shard_name}.events")),
        async move {
            let _ = rx.await;
        },
    )
    .await;
    (url, tx)
}

fn users_table() -> TableDef {
    TableDef {
        table_name: "users".into(),
        partition_key: "id".into(),
        sort_key: "ts".into(),
    }
}

fn record(pk: &str, sk: &str, value: serde_json::Value) -> CreateRecordRequest {
    CreateRecordRequest {
        table_name: "users".into(),
        pk: pk.into(),
        sk: sk.into(),
        value,
    }
}

async fn wait_for<F, Fut>(deadline: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check().await
}

/// Writes 503 until the shard's first heartbeat lands; retry until the
/// cluster is ready to accept them.
async fn write_until_accepted(
    client: &CoordinatorClient,
    req: &CreateRecordRequest,
    deadline: Duration,
) -> kivet_core::RecordResponse {
    let start = tokio::time::Instant::now();
    loop {
        match client.create_record(req).await {
            Ok(resp) => return resp,
            Err(err) if start.elapsed() < deadline => {
                let _ = err;
                sleep(Duration::from_millis(50)).await;
            }
            Err(err) => panic!("write never accepted: {err}"),
        }
    }
}

#[tokio::test]
async fn single_shard_write_and_read() {
    let (coordinator, _stop_coord) = start_coordinator(CoordinatorConfig::default()).await;
    let broker = Arc::new(MemoryBroker::new());
    let (shard_url, _stop_shard) =
        start_shard(&coordinator, "s1", broker, Duration::from_millis(50)).await;

    let client = CoordinatorClient::new(coordinator.clone(), Duration::from_secs(2));
    client.health().await.unwrap();
    let version = client.version().await.unwrap();
    assert_eq!(version["version"], json!("dev"));

    client.register_table(&users_table()).await.unwrap();
    assert_eq!(client.list_tables().await.unwrap().len(), 1);
    assert_eq!(client.get_table("users").await.unwrap().partition_key, "id");

    let written = write_until_accepted(
        &client,
        &record("u1", "2024", json!({"name": "Ada"})),
        Duration::from_secs(5),
    )
    .await;
    assert!(written.version.unwrap() > 0);
    assert_eq!(written.shard_url.as_deref(), Some(shard_url.as_str()));

    let read = client.read_record("users", "u1", "2024").await.unwrap();
    assert_eq!(read.value, Some(json!({"name": "Ada"})));
    assert_eq!(read.version, written.version);

    assert!(client.exists("users", "u1", "2024").await.unwrap());
    assert!(!client.exists("users", "nobody", "2024").await.unwrap());

    // Trace ids round-trip through the coordinator.
    let http = reqwest::Client::new();
    let response = http
        .get(format!("{coordinator}/records"))
        .query(&[("table_name", "users"), ("pk", "u1"), ("sk", "2024")])
        .header("x-trace-id", "trace-e2e-1")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-trace-id").unwrap().to_str().unwrap(),
        "trace-e2e-1"
    );
}

#[tokio::test]
async fn writes_replicate_to_followers() {
    let (coordinator, _stop_coord) = start_coordinator(CoordinatorConfig::default()).await;
    let broker = Arc::new(MemoryBroker::new());
    let (r1_url, _stop_r1) =
        start_shard(&coordinator, "s1", broker.clone(), Duration::from_millis(50)).await;
    let client = CoordinatorClient::new(coordinator.clone(), Duration::from_secs(2));
    client.register_table(&users_table()).await.unwrap();

    // r1 registers first and takes the leadership before r2 comes up.
    assert!(
        wait_for(Duration::from_secs(5), || async {
            client
                .list_replicas()
                .await
                .map(|replicas| {
                    replicas
                        .iter()
                        .any(|r| r.role == Role::Leader && r.replica_url == r1_url)
                })
                .unwrap_or(false)
        })
        .await
    );

    let (r2_url, _stop_r2) =
        start_shard(&coordinator, "s1", broker.clone(), Duration::from_millis(50)).await;
    assert!(
        wait_for(Duration::from_secs(5), || async {
            client
                .list_replicas()
                .await
                .map(|replicas| {
                    replicas
                        .iter()
                        .any(|r| r.role == Role::Follower && r.replica_url == r2_url)
                })
                .unwrap_or(false)
        })
        .await
    );

    client
        .create_record(&record("k1", "1", json!({"v": 7})))
        .await
        .unwrap();

    // The follower applies the event from the bus within the publish
    // timeout budget.
    let http = reqwest::Client::new();
    let converged = wait_for(Duration::from_secs(2), || {
        let http = http.clone();
        let url = format!("{r2_url}/records");
        async move {
            let resp = http
                .get(url)
                .query(&[("table_name", "users"), ("pk", "k1"), ("sk", "1")])
                .send()
                .await
                .unwrap();
            if resp.status() != StatusCode::OK {
                return false;
            }
            let body: serde_json::Value = resp.json().await.unwrap();
            body["value"] == json!({"v": 7})
        }
    })
    .await;
    assert!(converged, "follower never converged");
}

#[tokio::test]
async fn leadership_moves_after_the_leader_goes_silent() {
    let config = CoordinatorConfig {
        replica_ttl: Duration::from_millis(400),
        ..CoordinatorConfig::default()
    };
    let (coordinator, _stop_coord) = start_coordinator(config).await;
    let broker = Arc::new(MemoryBroker::new());
    let client = CoordinatorClient::new(coordinator.clone(), Duration::from_secs(2));
    client.register_table(&users_table()).await.unwrap();

    let (r1_url, stop_r1) =
        start_shard(&coordinator, "s1", broker.clone(), Duration::from_millis(100)).await;
    assert!(
        wait_for(Duration::from_secs(5), || async {
            client
                .list_replicas()
                .await
                .map(|rs| rs.iter().any(|r| r.role == Role::Leader && r.replica_url == r1_url))
                .unwrap_or(false)
        })
        .await
    );

    let (r2_url, _stop_r2) =
        start_shard(&coordinator, "s1", broker.clone(), Duration::from_millis(100)).await;
    assert!(
        wait_for(Duration::from_secs(5), || async {
            client
                .list_replicas()
                .await
                .map(|rs| rs.iter().any(|r| r.replica_url == r2_url))
                .unwrap_or(false)
        })
        .await
    );

    // Simulate leader death: r1 stops serving and stops heartbeating.
    stop_r1.send(()).unwrap();

    // After the TTL lapses, r2's next heartbeat claims the leadership and
    // subsequent writes land on it.
    let written = {
        let start = tokio::time::Instant::now();
        loop {
            match client.create_record(&record("after", "1", json!({"v": 1}))).await {
                Ok(resp) if resp.shard_url.as_deref() == Some(r2_url.as_str()) => break resp,
                _ if start.elapsed() > Duration::from_secs(10) => {
                    panic!("r2 never took over leadership")
                }
                _ => sleep(Duration::from_millis(100)).await,
            }
        }
    };
    assert_eq!(written.shard_url.as_deref(), Some(r2_url.as_str()));

    let read = client.read_record("users", "after", "1").await.unwrap();
    assert_eq!(read.value, Some(json!({"v": 1})));
}

#[tokio::test]
async fn a_new_shard_takes_over_part_of_the_keyspace() {
    let (coordinator, _stop_coord) = start_coordinator(CoordinatorConfig::default()).await;
    let broker = Arc::new(MemoryBroker::new());
    let (s1_url, _stop_s1) =
        start_shard(&coordinator, "s1", broker.clone(), Duration::from_millis(50)).await;
    let client = CoordinatorClient::new(coordinator.clone(), Duration::from_secs(2));
    client.register_table(&users_table()).await.unwrap();

    let total: u64 = 200;
    write_until_accepted(
        &client,
        &record("warmup-0", "1", json!({"i": -1})),
        Duration::from_secs(5),
    )
    .await;
    for i in 0..total {
        client
            .create_record(&record(&format!("key-{i}"), "1", json!({"i": i})))
            .await
            .unwrap();
    }

    let (s2_url, _stop_s2) =
        start_shard(&coordinator, "s2", broker.clone(), Duration::from_millis(50)).await;

    // Migration is done once every live key sits on exactly one owner and
    // the new shard holds a non-trivial share.
    let http = reqwest::Client::new();
    let stats = |url: String| {
        let http = http.clone();
        async move {
            let body: serde_json::Value = http
                .get(format!("{url}/internal/stats"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            body["total_keys"].as_u64().unwrap()
        }
    };
    let migrated = wait_for(Duration::from_secs(15), || {
        let s1 = stats(s1_url.clone());
        let s2 = stats(s2_url.clone());
        async move {
            let (on_s1, on_s2) = (s1.await, s2.await);
            on_s2 > 0 && on_s1 + on_s2 == total + 1
        }
    })
    .await;
    assert!(migrated, "migration never completed");

    // Every key reads correctly through the routing tier, and the reads
    // that moved are now served by s2.
    let mut served_by_s2 = 0u64;
    for i in 0..total {
        let read = client
            .read_record("users", &format!("key-{i}"), "1")
            .await
            .unwrap();
        assert_eq!(read.value, Some(json!({"i": i})), "key-{i} lost in migration");
        if read.shard_url.as_deref() == Some(s2_url.as_str()) {
            served_by_s2 += 1;
        }
    }
    assert!(
        served_by_s2 > 0,
        "no key resolved to the new shard after rebalance"
    );
    assert_eq!(served_by_s2, stats(s2_url.clone()).await);
}

#[tokio::test]
async fn delete_is_idempotent_through_the_coordinator() {
    let (coordinator, _stop_coord) = start_coordinator(CoordinatorConfig::default()).await;
    let broker = Arc::new(MemoryBroker::new());
    let (_shard_url, _stop_shard) =
        start_shard(&coordinator, "s1", broker, Duration::from_millis(50)).await;
    let client = CoordinatorClient::new(coordinator, Duration::from_secs(2));
    client.register_table(&users_table()).await.unwrap();

    write_until_accepted(
        &client,
        &record("gone", "1", json!({"v": 1})),
        Duration::from_secs(5),
    )
    .await;

    let first = client.delete_record("users", "gone", "1").await.unwrap();
    assert_eq!(first.value, Some(json!({"v": 1})));

    let second = client.delete_record("users", "gone", "1").await.unwrap();
    assert_eq!(second.value, None);

    // Deleting a key that never existed is also a 200 with a null value.
    let never = client.delete_record("users", "never", "1").await.unwrap();
    assert_eq!(never.value, None);

    let read = client.read_record("users", "gone", "1").await.unwrap();
    assert_eq!(read.value, None);
}

#[tokio::test]
async fn routing_errors_have_the_right_status_codes() {
    let (coordinator, _stop_coord) = start_coordinator(CoordinatorConfig::default()).await;
    let http = reqwest::Client::new();

    // Unknown table is a 404.
    let response = http
        .post(format!("{coordinator}/records"))
        .json(&json!({"table_name": "ghosts", "pk": "a", "sk": "1", "value": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(!body["detail"].as_str().unwrap().is_empty());

    // Known table with no shards registered is a 503.
    let client = CoordinatorClient::new(coordinator.clone(), Duration::from_secs(2));
    client.register_table(&users_table()).await.unwrap();
    let response = http
        .post(format!("{coordinator}/records"))
        .json(&json!({"table_name": "users", "pk": "a", "sk": "1", "value": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Validation failures are 422s.
    let response = http
        .post(format!("{coordinator}/records"))
        .json(&json!({"table_name": "users", "pk": "", "sk": "1", "value": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // Unknown table on the table lookup surface too.
    let response = http
        .get(format!("{coordinator}/tables/ghosts"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
