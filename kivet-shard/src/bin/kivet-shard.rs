use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kivet_bus::memory::MemoryBroker;
use kivet_bus::BusConfig;
use kivet_shard::{start_server, ShardConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kivet-shard", about = "Kivet shard replica node")]
struct Cli {
    /// HTTP listening port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Coordinator base URL; omit to run standalone as leader
    #[arg(long, env = "COORDINATOR_URL")]
    coordinator_url: Option<String>,

    /// This replica's externally reachable base URL
    #[arg(long, env = "SHARD_URL")]
    shard_url: Option<String>,

    /// Logical shard this replica belongs to
    #[arg(long, env = "SHARD_NAME", default_value = "shard-0")]
    shard_name: String,

    /// Stable replica identity
    #[arg(long, env = "REPLICA_ID")]
    replica_id: Option<String>,

    /// LWW origin string; defaults to the replica id
    #[arg(long, env = "ORIGIN")]
    origin: Option<String>,

    /// Registration heartbeat interval; must stay below the registry TTL
    #[arg(long, env = "REGISTER_INTERVAL_SEC", default_value_t = 10.0)]
    register_interval_sec: f64,

    /// Proxy follower writes to the leader instead of redirecting
    #[arg(long, env = "PROXY_WRITES", default_value_t = true, action = clap::ArgAction::Set)]
    proxy_writes: bool,

    /// Timeout for outbound HTTP calls
    #[arg(long, env = "HTTP_TIMEOUT_SEC", default_value_t = 5.0)]
    http_timeout_sec: f64,

    /// Replication queue name; defaults to "<shard_name>.events"
    #[arg(long, env = "BUS_QUEUE")]
    bus_queue: Option<String>,

    /// Publish confirm timeout
    #[arg(long, env = "BUS_PUBLISH_TIMEOUT_SEC", default_value_t = 5.0)]
    bus_publish_timeout_sec: f64,

    /// Publish attempts before a write is refused
    #[arg(long, env = "BUS_PUBLISH_RETRIES", default_value_t = 5)]
    bus_publish_retries: usize,

    /// Backoff between broker reconnect attempts
    #[arg(long, env = "BUS_RECONNECT_BACKOFF_SEC", default_value_t = 1.0)]
    bus_reconnect_backoff_sec: f64,

    /// Consumer prefetch window
    #[arg(long, env = "BUS_PREFETCH", default_value_t = 50)]
    bus_prefetch: usize,

    #[arg(long, env = "BUILD_VERSION", default_value = "dev")]
    build_version: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_observability();
    let cli = Cli::parse();

    let shard_url = cli
        .shard_url
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", cli.port));

    let mut config = ShardConfig::new(cli.shard_name.clone(), shard_url);
    if let Some(coordinator) = cli.coordinator_url {
        config = config.with_coordinator(coordinator);
    }
    if let Some(replica_id) = cli.replica_id {
        config = config.with_replica_id(replica_id);
    }
    if let Some(origin) = cli.origin {
        config = config.with_origin(origin);
    }
    config = config
        .with_register_interval(Duration::from_secs_f64(cli.register_interval_sec))
        .with_proxy_writes(cli.proxy_writes);
    config.http_timeout = Duration::from_secs_f64(cli.http_timeout_sec);
    config.build_version = cli.build_version;

    let bus = BusConfig {
        queue: cli
            .bus_queue
            .unwrap_or_else(|| format!("{}.events", cli.shard_name)),
        publish_timeout: Duration::from_secs_f64(cli.bus_publish_timeout_sec),
        publish_retries: cli.bus_publish_retries,
        reconnect_backoff: Duration::from_secs_f64(cli.bus_reconnect_backoff_sec),
        keepalive_tick: Duration::from_secs(1),
        prefetch: cli.bus_prefetch,
    };

    // The broker product is deployment-specific; this binary wires the
    // in-process implementation, which replicates within one process.
    let broker = Arc::new(MemoryBroker::new());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port)).await?;
    info!(shard = %cli.shard_name, port = cli.port, "kivet-shard listening");

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("shutdown signal received");
    };

    let handle = start_server(listener, config, broker, bus, shutdown).await;
    handle.await??;
    info!("shard node stopped");
    Ok(())
}

fn init_observability() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .json();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kivet_shard=debug,kivet_bus=debug".into());
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
