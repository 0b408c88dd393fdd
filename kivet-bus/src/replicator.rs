use std::sync::Arc;
use std::time::Duration;

use kivet_core::{now_ns, Event};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, warn};

use crate::{ApplyError, Broker, BusConfig, BusError};

/// Callback the consumer worker drives for every delivered event. An error
/// leaves the message un-acked so the broker redelivers it.
pub trait ApplyEvent: Send + Sync + 'static {
    fn apply(&self, event: Event) -> Result<(), ApplyError>;
}

struct PublishRequest {
    event: Event,
    done: oneshot::Sender<Result<(), BusError>>,
}

/// Leader-side publisher and replica-side consumer over one queue.
///
/// A single dedicated task owns the publisher channel: request handlers
/// enqueue `(event, completion)` pairs and block on the completion up to
/// the publish timeout, so a client write is refused before any local
/// apply when the broker will not confirm it. A second task owns its own
/// consumer channel and applies deliveries to the local store.
pub struct Replicator {
    tx: mpsc::Sender<PublishRequest>,
    publish_timeout: Duration,
    workers: Vec<JoinHandle<()>>,
}

impl Replicator {
    pub fn start(broker: Arc<dyn Broker>, apply: Arc<dyn ApplyEvent>, config: BusConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let publisher = tokio::spawn(publisher_loop(broker.clone(), rx, config.clone()));
        let consumer = tokio::spawn(consumer_loop(broker, apply, config.clone()));
        Self {
            tx,
            publish_timeout: config.publish_timeout,
            workers: vec![publisher, consumer],
        }
    }

    /// Queue an event for durable publication and wait for the broker
    /// confirmation. Safe to call from any task. On any error the event is
    /// NOT on the bus and the caller must refuse the write.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        let (done, confirmed) = oneshot::channel();
        self.tx
            .send(PublishRequest { event, done })
            .await
            .map_err(|_| BusError::PublisherGone)?;
        match timeout(self.publish_timeout, confirmed).await {
            Err(_) => Err(BusError::PublishTimeout(self.publish_timeout)),
            Ok(Err(_)) => Err(BusError::PublisherGone),
            Ok(Ok(result)) => result,
        }
    }

    /// Abort both workers. Used on server shutdown; in-flight publishes
    /// complete with `PublisherGone`.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn publisher_loop(
    broker: Arc<dyn Broker>,
    mut rx: mpsc::Receiver<PublishRequest>,
    config: BusConfig,
) {
    let mut channel: Option<Box<dyn crate::BusPublisher>> = None;
    loop {
        let request = match timeout(config.keepalive_tick, rx.recv()).await {
            // Idle tick: service the connection heartbeat.
            Err(_) => {
                if let Some(ch) = channel.as_mut() {
                    if ch.keepalive().await.is_err() {
                        channel = None;
                    }
                }
                continue;
            }
            Ok(None) => return,
            Ok(Some(request)) => request,
        };

        let payload = match serde_json::to_vec(&request.event) {
            Ok(payload) => payload,
            Err(err) => {
                let _ = request.done.send(Err(BusError::Encode(err)));
                continue;
            }
        };

        let mut result = Err(BusError::PublishFailed {
            attempts: 0,
            last: "no attempts made".to_string(),
        });
        for attempt in 1..=config.publish_retries {
            if channel.is_none() {
                match broker.open_publisher(&config.queue).await {
                    Ok(ch) => channel = Some(ch),
                    Err(err) => {
                        warn!(attempt, %err, "broker connect failed");
                        result = Err(BusError::PublishFailed {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                        sleep(config.reconnect_backoff).await;
                        continue;
                    }
                }
            }
            let Some(ch) = channel.as_mut() else {
                continue;
            };
            match ch.publish(payload.clone()).await {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(err) => {
                    warn!(attempt, %err, "publish attempt failed");
                    counter!("bus_publish_retries_total").increment(1);
                    result = Err(BusError::PublishFailed {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                    channel = None;
                    sleep(config.reconnect_backoff).await;
                }
            }
        }
        if result.is_err() {
            counter!("bus_publish_failures_total").increment(1);
        }
        let _ = request.done.send(result);
    }
}

async fn consumer_loop(broker: Arc<dyn Broker>, apply: Arc<dyn ApplyEvent>, config: BusConfig) {
    loop {
        let mut consumer = match broker.open_consumer(&config.queue, config.prefetch).await {
            Ok(consumer) => consumer,
            Err(err) => {
                warn!(%err, queue = %config.queue, "consumer connect failed");
                sleep(config.reconnect_backoff).await;
                continue;
            }
        };

        loop {
            let delivery = match consumer.next().await {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(%err, "consumer channel failed");
                    break;
                }
            };

            let event: Event = match serde_json::from_slice(&delivery.payload) {
                Ok(event) => event,
                Err(err) => {
                    // Left un-acked on purpose; the broker redelivers after
                    // the channel is re-opened.
                    error!(%err, "undecodable event on the bus");
                    break;
                }
            };

            let lag_ms = now_ns().saturating_sub(event.version) as f64 / 1e6;
            match apply.apply(event) {
                Ok(()) => {
                    histogram!("replication_lag_ms").record(lag_ms);
                    if let Err(err) = delivery.ack().await {
                        warn!(%err, "ack failed");
                        break;
                    }
                }
                Err(err) => {
                    error!(%err, "apply failed; leaving message un-acked");
                    break;
                }
            }
        }

        sleep(config.reconnect_backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use kivet_store::ShardStore;
    use serde_json::json;

    struct StoreSink(Arc<ShardStore>);

    impl ApplyEvent for StoreSink {
        fn apply(&self, event: Event) -> Result<(), ApplyError> {
            self.0.apply_event(&event);
            Ok(())
        }
    }

    fn fast_config(queue: &str) -> BusConfig {
        BusConfig {
            queue: queue.to_string(),
            publish_timeout: Duration::from_millis(500),
            publish_retries: 2,
            reconnect_backoff: Duration::from_millis(20),
            keepalive_tick: Duration::from_millis(50),
            prefetch: 50,
        }
    }

    async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn published_events_reach_every_subscribed_store() {
        let broker = Arc::new(MemoryBroker::new());
        let store_a = Arc::new(ShardStore::new());
        let store_b = Arc::new(ShardStore::new());

        let rep_a = Replicator::start(
            broker.clone(),
            Arc::new(StoreSink(store_a.clone())),
            fast_config("s1.events"),
        );
        let _rep_b = Replicator::start(
            broker.clone(),
            Arc::new(StoreSink(store_b.clone())),
            fast_config("s1.events"),
        );

        rep_a
            .publish(Event::put("t", "pk", "sk", json!({"v": 1}), 10, "r1"))
            .await
            .unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || {
                store_a.exists("t", "pk", "sk") && store_b.exists("t", "pk", "sk")
            })
            .await
        );
    }

    #[tokio::test]
    async fn publish_fails_fast_while_broker_is_down() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_available(false);
        let store = Arc::new(ShardStore::new());
        let rep = Replicator::start(
            broker.clone(),
            Arc::new(StoreSink(store.clone())),
            fast_config("s1.events"),
        );

        let err = rep
            .publish(Event::put("t", "pk", "sk", json!({}), 10, "r1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::PublishFailed { .. } | BusError::PublishTimeout(_)
        ));
        assert!(!store.exists("t", "pk", "sk"));

        // Broker recovers; the next publish goes through and replicates.
        broker.set_available(true);
        rep.publish(Event::put("t", "pk", "sk", json!({"v": 2}), 20, "r1"))
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || store.exists("t", "pk", "sk")).await);
    }

    #[tokio::test]
    async fn consumer_retries_after_transient_outage() {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(ShardStore::new());
        let rep = Replicator::start(
            broker.clone(),
            Arc::new(StoreSink(store.clone())),
            fast_config("s1.events"),
        );

        rep.publish(Event::put("t", "a", "1", json!({}), 1, "r1"))
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || store.exists("t", "a", "1")).await);

        broker.set_available(false);
        sleep(Duration::from_millis(100)).await;
        broker.set_available(true);

        rep.publish(Event::put("t", "b", "1", json!({}), 2, "r1"))
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || store.exists("t", "b", "1")).await);
    }
}
