use std::time::Duration;

use clap::Parser;
use kivet_coordinator::{start_server, CoordinatorConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kivet-coordinator", about = "Kivet cluster coordinator")]
struct Cli {
    /// HTTP listening port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Virtual nodes per shard on the hash ring
    #[arg(long, env = "RING_REPLICAS", default_value_t = 128)]
    ring_replicas: usize,

    /// Replica liveness window; registrations must arrive faster
    #[arg(long, env = "REPLICA_TTL_SEC", default_value_t = 30.0)]
    replica_ttl_sec: f64,

    /// Timeout for forwarded record operations
    #[arg(long, env = "REQ_TIMEOUT_SEC", default_value_t = 2.0)]
    req_timeout_sec: f64,

    #[arg(long, env = "BUILD_VERSION", default_value = "dev")]
    build_version: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_observability();
    let cli = Cli::parse();

    let config = CoordinatorConfig {
        ring_replicas: cli.ring_replicas,
        replica_ttl: Duration::from_secs_f64(cli.replica_ttl_sec),
        request_timeout: Duration::from_secs_f64(cli.req_timeout_sec),
        build_version: cli.build_version,
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port)).await?;
    info!(port = cli.port, "kivet-coordinator listening");

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("shutdown signal received");
    };

    let handle = start_server(listener, config, shutdown).await;
    handle.await??;
    info!("coordinator stopped");
    Ok(())
}

fn init_observability() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .json();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kivet_coordinator=debug".into());
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
