//! Replication bus client.
//!
//! The broker itself is an external product; this crate pins down the
//! contract the replication engine needs from it — a durable FIFO topic
//! with publisher confirms, consumer prefetch with manual acks, and
//! at-least-once delivery — and builds the leader-side publisher and the
//! replica-side consumer on top of that contract. [`memory::MemoryBroker`]
//! implements the contract in-process for tests and single-process
//! clusters; a production deployment plugs its broker in behind the same
//! traits.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
mod replicator;

pub use replicator::{ApplyEvent, Replicator};

/// Error surfaced by an [`ApplyEvent`] sink. The consumer never acks a
/// delivery whose apply failed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApplyError(pub String);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker unavailable")]
    Unavailable,

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("publish failed after {attempts} attempts: {last}")]
    PublishFailed { attempts: usize, last: String },

    #[error("publisher worker is gone")]
    PublisherGone,

    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A broker endpoint. Publisher and consumer channels are opened
/// separately and must never be shared between workers.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn open_publisher(&self, queue: &str) -> Result<Box<dyn BusPublisher>, BusError>;
    async fn open_consumer(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Box<dyn BusConsumer>, BusError>;
}

#[async_trait]
pub trait BusPublisher: Send {
    /// Publish one message with persistent delivery. Resolves only once the
    /// broker has durably accepted it.
    async fn publish(&mut self, payload: Vec<u8>) -> Result<(), BusError>;

    /// Drive the connection while the publisher is idle so the broker does
    /// not close it. Called at least every heartbeat/2.
    async fn keepalive(&mut self) -> Result<(), BusError>;
}

#[async_trait]
pub trait BusConsumer: Send {
    /// The next delivery, waiting while the queue is drained or the
    /// prefetch window is full of un-acked messages.
    async fn next(&mut self) -> Result<Delivery, BusError>;
}

#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
}

/// One consumed message. Dropping it without `ack` leaves it on the queue
/// for redelivery.
pub struct Delivery {
    pub payload: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self { payload, acker }
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }
}

/// Tunables for the publisher and consumer workers. Defaults follow the
/// deployment environment: 5s publish timeout, 5 retries, 1s linear
/// reconnect backoff, 1s keepalive tick, prefetch 50.
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub queue: String,
    pub publish_timeout: Duration,
    pub publish_retries: usize,
    pub reconnect_backoff: Duration,
    pub keepalive_tick: Duration,
    pub prefetch: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue: "shard-events".to_string(),
            publish_timeout: Duration::from_secs(5),
            publish_retries: 5,
            reconnect_backoff: Duration::from_secs(1),
            keepalive_tick: Duration::from_secs(1),
            prefetch: 50,
        }
    }
}

impl BusConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }
}
