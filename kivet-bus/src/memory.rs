//! In-process broker honoring the bus contract: durable per-queue logs,
//! publisher confirms, prefetch with manual acks, and redelivery for
//! consumers that reconnect without acking. Every consumer channel reads
//! the full log from the start, so a replica that joins late still
//! converges by replaying history (applies are idempotent).
//!
//! `set_available(false)` simulates a broker outage: open channels error
//! out and new ones cannot be opened until the broker comes back. The logs
//! survive the outage, as a durable queue would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{Acker, Broker, BusConsumer, BusError, BusPublisher, Delivery};

#[derive(Default)]
struct QueueLog {
    next_tag: u64,
    entries: Vec<(u64, Arc<Vec<u8>>)>,
}

struct BrokerState {
    available: bool,
    queues: HashMap<String, QueueLog>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: tokio::sync::Notify,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    available: true,
                    queues: HashMap::new(),
                }),
                notify: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Take the broker down or bring it back. Queue contents persist
    /// across the outage.
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.inner.state.lock().expect("broker state poisoned");
            state.available = available;
        }
        self.inner.notify.notify_waiters();
    }

    /// Messages currently stored for `queue`. Diagnostics and tests.
    pub fn queue_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().expect("broker state poisoned");
        state.queues.get(queue).map(|q| q.entries.len()).unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_publisher(&self, queue: &str) -> Result<Box<dyn BusPublisher>, BusError> {
        let state = self.inner.state.lock().expect("broker state poisoned");
        if !state.available {
            return Err(BusError::Unavailable);
        }
        Ok(Box::new(MemoryPublisher {
            inner: self.inner.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn open_consumer(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Box<dyn BusConsumer>, BusError> {
        let state = self.inner.state.lock().expect("broker state poisoned");
        if !state.available {
            return Err(BusError::Unavailable);
        }
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            prefetch: prefetch.max(1),
            cursor: 0,
            unacked: Arc::new(Mutex::new(HashSet::new())),
        }))
    }
}

struct MemoryPublisher {
    inner: Arc<BrokerInner>,
    queue: String,
}

#[async_trait]
impl BusPublisher for MemoryPublisher {
    async fn publish(&mut self, payload: Vec<u8>) -> Result<(), BusError> {
        {
            let mut state = self.inner.state.lock().expect("broker state poisoned");
            if !state.available {
                return Err(BusError::Unavailable);
            }
            let log = state.queues.entry(self.queue.clone()).or_default();
            let tag = log.next_tag;
            log.next_tag += 1;
            log.entries.push((tag, Arc::new(payload)));
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn keepalive(&mut self) -> Result<(), BusError> {
        let state = self.inner.state.lock().expect("broker state poisoned");
        if !state.available {
            return Err(BusError::Unavailable);
        }
        Ok(())
    }
}

struct MemoryConsumer {
    inner: Arc<BrokerInner>,
    queue: String,
    prefetch: usize,
    cursor: usize,
    unacked: Arc<Mutex<HashSet<u64>>>,
}

impl MemoryConsumer {
    fn try_next(&mut self) -> Result<Option<Delivery>, BusError> {
        let state = self.inner.state.lock().expect("broker state poisoned");
        if !state.available {
            return Err(BusError::Unavailable);
        }
        if self.unacked.lock().expect("unacked poisoned").len() >= self.prefetch {
            return Ok(None);
        }
        let Some(log) = state.queues.get(&self.queue) else {
            return Ok(None);
        };
        let Some((tag, payload)) = log.entries.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        self.unacked
            .lock()
            .expect("unacked poisoned")
            .insert(*tag);
        Ok(Some(Delivery::new(
            payload.as_ref().clone(),
            Box::new(MemoryAcker {
                inner: self.inner.clone(),
                unacked: self.unacked.clone(),
                tag: *tag,
            }),
        )))
    }
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Delivery, BusError> {
        loop {
            // Register interest before checking state so a publish racing
            // with the check cannot be missed.
            let inner = self.inner.clone();
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(delivery) = self.try_next()? {
                return Ok(delivery);
            }
            notified.await;
        }
    }
}

struct MemoryAcker {
    inner: Arc<BrokerInner>,
    unacked: Arc<Mutex<HashSet<u64>>>,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.unacked
            .lock()
            .expect("unacked poisoned")
            .remove(&self.tag);
        // Frees a prefetch slot; wake any waiting consumer.
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
