//! Publish engine: partition-aware routing, bounded retry with per-error
//! classification, and batched fan-out.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProducerConfig;
use crate::error::{BrokerCode, PublishClass, RiverqError};
use crate::lookup::{LookupEndpoints, LookupTransport, Router};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::pool::{ConnectionFactory, ConnectionPool, PooledConn};
use crate::protocol::{Command, Frame, Message, MessageBody, MessageReceipt, PartitionId};

/// Producer handle. Cheap to clone; all clones share one pool and router.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    config: ProducerConfig,
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<ClientMetrics>,
    topic_last_active: DashMap<String, Instant>,
    /// Addresses whose sub-pool has already been warmed to the idle minimum
    warmed: DashMap<crate::lookup::Address, ()>,
    batch_permits: Arc<Semaphore>,
    closed: AtomicBool,
    cleaner: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// Build a producer over the given lookup transport
    pub fn new(
        config: ProducerConfig,
        lookup: Arc<dyn LookupTransport>,
    ) -> Result<Self, RiverqError> {
        config.validate()?;
        let endpoints = Arc::new(LookupEndpoints::new(config.client.lookup_endpoints.clone()));
        let router = Arc::new(Router::new(lookup, endpoints));
        let metrics = Arc::new(ClientMetrics::default());
        let factory = ConnectionFactory::new(config.client.clone(), None, metrics.clone());
        let pool = Arc::new(ConnectionPool::new(
            factory,
            config.connections_per_broker,
            config.borrow_timeout,
        ));
        let batch_permits = Arc::new(Semaphore::new(config.publish_workers));

        let inner = Arc::new(ProducerInner {
            config,
            router,
            pool,
            metrics,
            topic_last_active: DashMap::new(),
            warmed: DashMap::new(),
            batch_permits,
            closed: AtomicBool::new(false),
            cleaner: parking_lot::Mutex::new(None),
        });

        if let Some(max_idle) = inner.config.idle_topic_cleanup {
            let handle = tokio::spawn(idle_topic_cleaner(Arc::downgrade(&inner), max_idle));
            *inner.cleaner.lock() = Some(handle);
        }

        info!(
            retry = inner.config.publish_retry,
            per_broker = inner.config.connections_per_broker,
            "producer started"
        );
        Ok(Self { inner })
    }

    /// Publish one message and wait for the broker acknowledgement
    pub async fn publish(&self, message: Message) -> Result<MessageReceipt, RiverqError> {
        let Message {
            topic,
            body,
            sharding_key,
            ..
        } = message;
        let message_count = body.count() as u64;
        match body {
            MessageBody::Single(payload) => {
                self.inner
                    .publish_with_retry(&topic, sharding_key, message_count, |partition| {
                        Command::Pub {
                            topic: topic.clone(),
                            partition,
                            body: payload.clone(),
                        }
                    })
                    .await
            }
            MessageBody::Batch(bodies) => {
                self.inner
                    .publish_with_retry(&topic, sharding_key, message_count, |partition| {
                        Command::Mpub {
                            topic: topic.clone(),
                            partition,
                            bodies: bodies.clone(),
                        }
                    })
                    .await
            }
        }
    }

    /// Publish many payloads as bounded concurrent sub-batches.
    ///
    /// Returns the payloads whose sub-batch could not be published after all
    /// retries; an empty vector means everything was acknowledged. Sub-batches
    /// fail or succeed whole.
    pub async fn publish_batch(
        &self,
        topic: &str,
        bodies: Vec<Bytes>,
    ) -> Result<Vec<Bytes>, RiverqError> {
        if bodies.is_empty() {
            return Ok(Vec::new());
        }
        let chunks: Vec<Vec<Bytes>> = bodies
            .chunks(self.inner.config.batch_size)
            .map(|c| c.to_vec())
            .collect();

        let mut tasks = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let inner = self.inner.clone();
            let topic = topic.to_string();
            let permit = self
                .inner
                .batch_permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RiverqError::connection("producer is closed"))?;
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let count = chunk.len() as u64;
                let result = inner
                    .publish_with_retry(&topic, None, count, |partition| Command::Mpub {
                        topic: topic.clone(),
                        partition,
                        bodies: chunk.clone(),
                    })
                    .await;
                (chunk, result)
            }));
        }

        let mut failed = Vec::new();
        for task in tasks {
            let (chunk, result) = task
                .await
                .map_err(|e| RiverqError::connection(format!("batch task failed: {e}")))?;
            if let Err(e) = result {
                warn!(topic, count = chunk.len(), error = %e, "sub-batch failed");
                failed.extend(chunk);
            }
        }
        Ok(failed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Shut the producer down: stop the cleaner and close the pool. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.cleaner.lock().take() {
            handle.abort();
        }
        self.inner.pool.close();
        info!("producer closed");
    }
}

impl ProducerInner {
    /// The retry loop. Each attempt routes, borrows, sends and classifies the
    /// outcome; the per-attempt errors accumulate into the final failure.
    async fn publish_with_retry<F>(
        &self,
        topic: &str,
        sharding_key: Option<u64>,
        message_count: u64,
        make_command: F,
    ) -> Result<MessageReceipt, RiverqError>
    where
        F: Fn(Option<PartitionId>) -> Command,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(RiverqError::connection("producer is closed"));
        }
        self.topic_last_active
            .insert(topic.to_string(), Instant::now());

        let mut attempts: Vec<RiverqError> = Vec::new();
        for attempt in 1..=self.config.publish_retry {
            self.metrics.record_publish_attempt();

            let candidates = match self.router.route(topic, sharding_key).await {
                Ok(candidates) => candidates,
                Err(e) if e.is_terminal_lookup() => return Err(e),
                Err(e) => {
                    debug!(topic, attempt, error = %e, "routing failed");
                    attempts.push(e);
                    continue;
                }
            };

            self.warm_pools(&candidates);

            let pooled = match self.borrow_any(&candidates).await {
                Ok(pooled) => pooled,
                Err(e) => {
                    debug!(topic, attempt, error = %e, "no connection");
                    attempts.push(e);
                    continue;
                }
            };

            let command = make_command(pooled.address().partition);
            match pooled.conn.call(command).await {
                Ok(Frame::Response(body)) => {
                    let receipt = MessageReceipt {
                        address: pooled.address().to_string(),
                        topic: topic.to_string(),
                        partition: pooled.address().partition,
                        receipt_id: parse_receipt_id(&body),
                    };
                    self.pool.give_back(pooled);
                    self.metrics.record_publish(message_count);
                    return Ok(receipt);
                }
                Ok(Frame::Error(broker_err)) => {
                    let code = BrokerCode::parse(&broker_err.code);
                    let error = code.to_publish_error(topic, &broker_err.detail);
                    match code.classify_for_publish() {
                        PublishClass::Fatal => {
                            self.pool.give_back(pooled);
                            self.metrics.record_publish_error();
                            return Err(error);
                        }
                        PublishClass::RoutingStale => {
                            warn!(topic, attempt, code = %broker_err.code, "routing stale");
                            self.router.invalidate(topic);
                            self.pool.give_back(pooled);
                            tokio::time::sleep(self.config.consensus_backoff).await;
                            attempts.push(error);
                        }
                        PublishClass::Transport => {
                            warn!(topic, attempt, code = %broker_err.code, "broker rejected");
                            self.pool.invalidate(pooled);
                            attempts.push(error);
                        }
                    }
                }
                Ok(Frame::Message(_)) => {
                    self.pool.invalidate(pooled);
                    attempts.push(RiverqError::protocol(
                        "message frame in response to publish",
                    ));
                }
                Err(e) => {
                    debug!(topic, attempt, error = %e, "publish transport failure");
                    self.pool.invalidate(pooled);
                    attempts.push(e);
                }
            }
        }

        self.metrics.record_publish_error();
        Err(RiverqError::PublishFailed {
            topic: topic.to_string(),
            attempts,
        })
    }

    /// Warm newly seen sub-pools up to the idle minimum, in the background
    fn warm_pools(&self, candidates: &[crate::lookup::Address]) {
        let min_idle = self.config.min_idle_per_broker;
        if min_idle == 0 {
            return;
        }
        for address in candidates {
            if self.warmed.insert(address.clone(), ()).is_none() {
                let pool = self.pool.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    pool.prepare(&address, min_idle).await;
                });
            }
        }
    }

    /// Borrow from the first candidate address that yields a connection
    async fn borrow_any(&self, candidates: &[crate::lookup::Address]) -> Result<PooledConn, RiverqError> {
        let mut last_err = None;
        for address in candidates {
            match self.pool.borrow(address).await {
                Ok(pooled) => return Ok(pooled),
                Err(e) => {
                    debug!(address = %address, error = %e, "borrow failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RiverqError::NoConnection {
            address: "<no candidates>".to_string(),
        }))
    }
}

/// Acknowledgements are "OK" or "OK <receipt>"
fn parse_receipt_id(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let rest = text.strip_prefix("OK")?.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Periodically drops routing state for topics nobody has published to
/// recently. Holds only a weak handle so it never keeps a closed producer
/// alive.
async fn idle_topic_cleaner(inner: Weak<ProducerInner>, max_idle: Duration) {
    let mut interval = tokio::time::interval(max_idle / 2);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        let stale: Vec<String> = inner
            .topic_last_active
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();
        if stale.is_empty() {
            continue;
        }
        debug!(count = stale.len(), "dropping idle topic routing");
        inner.router.remove_topics(stale.iter().map(|s| s.as_str()));
        for topic in &stale {
            inner.topic_last_active.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_receipt_id() {
        assert_eq!(parse_receipt_id(b"OK"), None);
        assert_eq!(parse_receipt_id(b"OK abc123"), Some("abc123".to_string()));
        assert_eq!(parse_receipt_id(b"NOT_OK"), None);
        assert_eq!(parse_receipt_id(&[0xff, 0xfe]), None);
    }
}
