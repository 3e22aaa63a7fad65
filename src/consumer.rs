//! Consumption engine: subscribed connections per broker, a bounded handler
//! worker pool, READY-based flow control and a periodic reconciliation sweep
//! that converges the held connections onto the lookup view.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{BrokerCode, RiverqError};
use crate::lookup::{Address, LookupEndpoints, LookupTransport, Router};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::pool::{ConnectionFactory, ConnectionPool, PooledConn};
use crate::protocol::{Command, Frame, InboundMessage};

/// Application message handler. Called from the worker pool; returning an
/// error counts as a failed consumption attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        message: &mut InboundMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Interval between a throttle and the saturation recheck that may lift it
const RESTORE_CHECK_DELAY: Duration = Duration::from_secs(1);

/// Handler invocation attempts per delivery
const HANDLER_ATTEMPTS: usize = 2;

/// READY credit governor. Saturation is the fraction of busy handler workers;
/// heavy saturation drops the per-connection credit to a trickle and a
/// deferred recheck restores it once the backlog drains.
struct FlowController {
    default_rdy: u32,
    current: AtomicU32,
}

impl FlowController {
    fn new(default_rdy: u32) -> Self {
        Self {
            default_rdy,
            current: AtomicU32::new(default_rdy),
        }
    }

    fn desired(&self, saturation: f64) -> u32 {
        if saturation >= 0.9 {
            1
        } else if saturation >= 0.8 {
            ((self.default_rdy as f64 * 0.3) as u32).max(1)
        } else {
            self.default_rdy
        }
    }

    fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Apply the credit for the given saturation. Returns the new value when
    /// it changed.
    fn adjust(&self, saturation: f64) -> Option<u32> {
        let desired = self.desired(saturation);
        let previous = self.current.swap(desired, Ordering::AcqRel);
        (previous != desired).then_some(desired)
    }

    fn is_throttled(&self) -> bool {
        self.current() < self.default_rdy
    }

    /// Lift the throttle if the backlog has drained. Returns true when
    /// restored (or not throttled at all).
    fn try_restore(&self, saturation: f64) -> bool {
        if !self.is_throttled() {
            return true;
        }
        if saturation <= 0.3 {
            self.current.store(self.default_rdy, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// Consumer handle. Cheap to clone; all clones share the same subscriptions.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("worker_pool_size", &self.inner.worker_pool_size)
            .finish()
    }
}

struct ConsumerInner {
    config: ConsumerConfig,
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<ClientMetrics>,
    handler: Arc<dyn MessageHandler>,
    /// Subscribed connections, keyed by broker address
    holding: DashMap<Address, Vec<PooledConn>>,
    workers: Arc<Semaphore>,
    worker_pool_size: usize,
    flow: FlowController,
    restore_tx: mpsc::UnboundedSender<()>,
    closed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Consumer {
    /// Start consuming. Subscriptions are established by the first
    /// reconciliation sweep, which runs before this returns.
    pub async fn start(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        lookup: Arc<dyn LookupTransport>,
    ) -> Result<Self, RiverqError> {
        config.validate()?;
        let endpoints = Arc::new(LookupEndpoints::new(config.client.lookup_endpoints.clone()));
        let router = Arc::new(Router::new(lookup, endpoints));
        let metrics = Arc::new(ClientMetrics::default());

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let factory = ConnectionFactory::new(config.client.clone(), Some(delivery_tx), metrics.clone());
        let pool = Arc::new(ConnectionPool::new(
            factory,
            config.io_parallelism,
            config.borrow_timeout,
        ));

        let worker_pool_size = config.effective_worker_pool_size();
        let (restore_tx, restore_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ConsumerInner {
            flow: FlowController::new(config.rdy),
            config,
            router,
            pool,
            metrics,
            handler,
            holding: DashMap::new(),
            workers: Arc::new(Semaphore::new(worker_pool_size)),
            worker_pool_size,
            restore_tx,
            closed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        inner.reconcile().await;
        if inner.holding.is_empty() {
            inner.pool.close();
            return Err(RiverqError::NoDataNodes {
                topic: inner.config.topic.clone(),
            });
        }

        let scheduler = tokio::spawn(scheduler_loop(Arc::downgrade(&inner), restore_rx));
        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), delivery_rx));
        inner.tasks.lock().extend([scheduler, dispatcher]);

        info!(
            topic = %inner.config.topic,
            channel = %inner.config.channel,
            workers = worker_pool_size,
            "consumer started"
        );
        Ok(Self { inner })
    }

    /// Acknowledge a message, removing it from the broker's in-flight set
    pub fn finish(&self, message: &InboundMessage) -> Result<(), RiverqError> {
        let conn = self.inner.find_connection(message)?;
        conn.cast(Command::Finish(message.id))?;
        self.inner.metrics.record_finished();
        Ok(())
    }

    /// Return a message to the broker for redelivery after its requeue delay
    pub fn requeue(&self, message: &InboundMessage) -> Result<(), RiverqError> {
        let conn = self.inner.find_connection(message)?;
        let delay_secs = message
            .next_requeue_delay()
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        conn.cast(Command::Requeue(message.id, delay_secs))?;
        self.inner.metrics.record_requeued();
        Ok(())
    }

    /// Reset the broker-side processing deadline for a message
    pub fn touch(&self, message: &InboundMessage) -> Result<(), RiverqError> {
        let conn = self.inner.find_connection(message)?;
        conn.cast(Command::Touch(message.id))
    }

    /// Broker addresses currently subscribed
    pub fn held_addresses(&self) -> Vec<Address> {
        self.inner
            .holding
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop consuming: close subscriptions gracefully and tear down the pool.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        let addresses: Vec<Address> = self
            .inner
            .holding
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for address in addresses {
            if let Some((_, conns)) = self.inner.holding.remove(&address) {
                for pooled in conns {
                    let _ = pooled.conn.call(Command::Close).await;
                    self.inner.pool.invalidate(pooled);
                }
            }
        }
        self.inner.pool.close();
        info!(topic = %self.inner.config.topic, "consumer closed");
    }
}

impl ConsumerInner {
    fn find_connection_by_id(
        &self,
        connection_id: u64,
    ) -> Option<Arc<crate::connection::Connection>> {
        for entry in self.holding.iter() {
            for pooled in entry.value() {
                if pooled.conn.id() == connection_id {
                    return Some(pooled.conn.clone());
                }
            }
        }
        None
    }

    fn find_connection(
        &self,
        message: &InboundMessage,
    ) -> Result<Arc<crate::connection::Connection>, RiverqError> {
        self.find_connection_by_id(message.connection_id)
            .ok_or_else(|| RiverqError::NoConnection {
                address: message.address.clone(),
            })
    }

    fn saturation(&self) -> f64 {
        let available = self.workers.available_permits();
        (self.worker_pool_size - available) as f64 / self.worker_pool_size as f64
    }

    fn broadcast_rdy(&self, rdy: u32) {
        for entry in self.holding.iter() {
            for pooled in entry.value() {
                if let Err(e) = pooled.conn.cast(Command::Rdy(rdy)) {
                    debug!(address = %entry.key(), error = %e, "rdy update failed");
                }
            }
        }
    }

    /// Recompute the credit after a worker-pool event. The new credit goes to
    /// the connection the event came from; the others pick it up as their own
    /// deliveries trigger adjustments. Restores broadcast.
    fn adjust_flow(&self, connection_id: u64) {
        let was_throttled = self.flow.is_throttled();
        if let Some(rdy) = self.flow.adjust(self.saturation()) {
            self.metrics.record_rdy_adjustment();
            match self.find_connection_by_id(connection_id) {
                Some(conn) => {
                    if let Err(e) = conn.cast(Command::Rdy(rdy)) {
                        debug!(connection_id, error = %e, "rdy update failed");
                    }
                }
                None => debug!(connection_id, "rdy update skipped, connection gone"),
            }
        }
        if self.flow.is_throttled() && !was_throttled {
            let _ = self.restore_tx.send(());
        }
    }

    /// One reconciliation sweep: detect broken connections, refresh the
    /// lookup view, subscribe to new brokers, close departed ones.
    async fn reconcile(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let topic = self.config.topic.clone();

        // Broken connections mark their whole address for a rebuild.
        let mut broken: HashSet<Address> = HashSet::new();
        for entry in self.holding.iter() {
            if entry.value().iter().any(|p| !p.conn.is_connected()) {
                broken.insert(entry.key().clone());
            }
        }

        let current = match self.router.consumer_addresses(&topic).await {
            Ok(addresses) => addresses,
            Err(e) => {
                // Keep what we have; a transient lookup outage must not tear
                // down working subscriptions.
                warn!(topic = %topic, error = %e, "reconcile lookup failed");
                for address in broken {
                    self.clear_data_node(&address);
                }
                return;
            }
        };
        let current: HashSet<Address> = current.into_iter().collect();
        let held: HashSet<Address> = self.holding.iter().map(|e| e.key().clone()).collect();

        for address in current.iter() {
            if !held.contains(address) || broken.contains(address) {
                self.clear_data_node(address);
                self.subscribe_broker(address).await;
            }
        }

        for address in held.iter() {
            if !current.contains(address) {
                info!(address = %address, topic = %topic, "broker left the topic");
                self.close_data_node(address).await;
            } else if broken.contains(address) && !self.holding.contains_key(address) {
                // Rebuild above failed; nothing held for it anymore.
                debug!(address = %address, "broker rebuild pending next sweep");
            }
        }
    }

    /// Open and subscribe `io_parallelism` connections to one broker
    async fn subscribe_broker(&self, address: &Address) {
        let mut kept = Vec::new();
        for _ in 0..self.config.io_parallelism {
            let pooled = match self.pool.borrow(address).await {
                Ok(pooled) => pooled,
                Err(e) => {
                    warn!(address = %address, error = %e, "subscribe borrow failed");
                    break;
                }
            };
            let sub = Command::Sub {
                topic: self.config.topic.clone(),
                channel: self.config.channel.clone(),
            };
            match pooled.conn.call(sub).await {
                Ok(Frame::Response(_)) => {
                    if let Err(e) = pooled.conn.cast(Command::Rdy(self.flow.current())) {
                        warn!(address = %address, error = %e, "initial rdy failed");
                        self.pool.invalidate(pooled);
                        continue;
                    }
                    kept.push(pooled);
                }
                Ok(Frame::Error(broker_err)) => {
                    let code = BrokerCode::parse(&broker_err.code);
                    if code.abandons_broker_on_subscribe() {
                        warn!(
                            address = %address,
                            code = %broker_err.code,
                            "broker refused subscription, abandoning"
                        );
                        self.pool.invalidate(pooled);
                        for p in kept.drain(..) {
                            self.pool.invalidate(p);
                        }
                        self.clear_data_node(address);
                        return;
                    }
                    warn!(address = %address, code = %broker_err.code, "subscribe rejected");
                    self.pool.invalidate(pooled);
                }
                Ok(other) => {
                    warn!(address = %address, frame = ?other, "unexpected subscribe reply");
                    self.pool.invalidate(pooled);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "subscribe failed");
                    self.pool.invalidate(pooled);
                }
            }
        }
        if !kept.is_empty() {
            debug!(address = %address, connections = kept.len(), "subscribed");
            self.holding.insert(address.clone(), kept);
        }
    }

    /// Drop everything held for a broker without a graceful CLS
    fn clear_data_node(&self, address: &Address) {
        if let Some((_, conns)) = self.holding.remove(address) {
            for pooled in conns {
                self.pool.invalidate(pooled);
            }
        }
        self.pool.clear(address);
    }

    /// Gracefully close a departed broker's subscriptions
    async fn close_data_node(&self, address: &Address) {
        if let Some((_, conns)) = self.holding.remove(address) {
            for pooled in conns {
                if let Err(e) = pooled.conn.call(Command::Close).await {
                    debug!(address = %address, error = %e, "close command failed");
                }
                self.pool.invalidate(pooled);
            }
        }
        self.pool.clear(address);
    }

    /// Run the handler and emit the outcome command
    async fn consume(self: Arc<Self>, mut message: InboundMessage, permit: OwnedSemaphorePermit) {
        let mut succeeded = false;
        for attempt in 1..=HANDLER_ATTEMPTS {
            match self.handler.handle(&mut message).await {
                Ok(()) => {
                    succeeded = true;
                    break;
                }
                Err(e) => {
                    self.metrics.record_handler_failure();
                    warn!(
                        id = %message.id,
                        attempt,
                        error = %e,
                        "handler failed"
                    );
                }
            }
        }

        let outcome = if self.config.auto_finish {
            if succeeded {
                Some(Command::Finish(message.id))
            } else {
                // A failure with no requested redelivery delay is swallowed;
                // only the handler can ask for the message back.
                match message.next_requeue_delay() {
                    Some(d) => Some(Command::Requeue(message.id, d.as_secs() as u32)),
                    None => Some(Command::Finish(message.id)),
                }
            }
        } else if !succeeded {
            message
                .next_requeue_delay()
                .map(|d| Command::Requeue(message.id, d.as_secs() as u32))
        } else {
            None
        };

        if let Some(command) = outcome {
            let finished = matches!(command, Command::Finish(_));
            match self.find_connection(&message) {
                Ok(conn) => {
                    if let Err(e) = conn.cast(command) {
                        warn!(id = %message.id, error = %e, "outcome command failed");
                    } else if finished {
                        self.metrics.record_finished();
                    } else {
                        self.metrics.record_requeued();
                    }
                }
                Err(e) => {
                    // The connection went away while we were handling; the
                    // broker will redeliver after the message times out.
                    debug!(id = %message.id, error = %e, "origin connection gone");
                }
            }
        }

        drop(permit);
        self.adjust_flow(message.connection_id);
    }
}

/// Periodic reconciliation plus the deferred flow-restore checks
async fn scheduler_loop(inner: Weak<ConsumerInner>, mut restore_rx: mpsc::UnboundedReceiver<()>) {
    let interval = {
        let Some(inner) = inner.upgrade() else { return };
        inner.config.reconnect_interval
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; the initial reconcile already ran.
    ticker.tick().await;

    let mut restores: DelayQueue<()> = DelayQueue::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { return };
                inner.reconcile().await;
            }
            request = restore_rx.recv() => {
                match request {
                    Some(()) => {
                        restores.insert((), RESTORE_CHECK_DELAY);
                    }
                    None => return,
                }
            }
            Some(_) = restores.next() => {
                let Some(inner) = inner.upgrade() else { return };
                let was_throttled = inner.flow.is_throttled();
                if inner.flow.try_restore(inner.saturation()) {
                    if was_throttled {
                        debug!("flow throttle lifted");
                        inner.metrics.record_rdy_adjustment();
                        inner.broadcast_rdy(inner.flow.current());
                    }
                } else {
                    restores.insert((), RESTORE_CHECK_DELAY);
                }
            }
        }
    }
}

/// Pulls deliveries off the shared channel and hands them to the worker pool.
/// When the pool is saturated the message goes straight back to the broker.
async fn dispatch_loop(
    inner: Weak<ConsumerInner>,
    mut delivery_rx: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = delivery_rx.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        inner.metrics.record_received();

        match inner.workers.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(inner.clone().consume(message, permit));
            }
            Err(_) => {
                // Worker pool exhausted: shed the message and throttle intake.
                let delay = inner.config.saturated_requeue_delay.as_secs() as u32;
                match inner.find_connection(&message) {
                    Ok(conn) => {
                        if conn.cast(Command::Requeue(message.id, delay)).is_ok() {
                            inner.metrics.record_requeued();
                        }
                    }
                    Err(e) => {
                        error!(id = %message.id, error = %e, "cannot shed message");
                    }
                }
                inner.adjust_flow(message.connection_id);
            }
        }
    }
}
