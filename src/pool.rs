//! Keyed connection pool: bounded per-address sub-pools with borrow/return
//! semantics.
//!
//! Capacity accounting rides on a semaphore per address. A borrowed connection
//! carries its permit, so the sub-pool can never exceed its bound no matter how
//! returns and invalidations interleave.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::RiverqError;
use crate::lookup::Address;
use crate::metrics::ClientMetrics;
use crate::negotiate;
use crate::protocol::InboundMessage;

/// Builds negotiated connections for the pool
pub(crate) struct ConnectionFactory {
    config: ClientConfig,
    next_id: AtomicU64,
    delivery: Option<mpsc::UnboundedSender<InboundMessage>>,
    metrics: Arc<ClientMetrics>,
}

impl ConnectionFactory {
    pub(crate) fn new(
        config: ClientConfig,
        delivery: Option<mpsc::UnboundedSender<InboundMessage>>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            delivery,
            metrics,
        }
    }

    async fn create(&self, address: &Address) -> Result<Arc<Connection>, RiverqError> {
        let framed = match negotiate::connect(&address.host, address.port, &self.config).await {
            Ok(framed) => framed,
            Err(e) => {
                self.metrics.record_connection_failed();
                return Err(e);
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_connection_created();
        debug!(address = %address, id, "connection established");
        Ok(Connection::spawn(
            address.to_string(),
            id,
            framed,
            self.config.request_timeout,
            self.delivery.clone(),
        ))
    }
}

struct SubPool {
    idle: Mutex<VecDeque<Arc<Connection>>>,
    permits: Arc<Semaphore>,
}

impl SubPool {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }
}

/// A borrowed connection. Return it with `ConnectionPool::give_back` or
/// discard it with `ConnectionPool::invalidate`; dropping it without either
/// releases the capacity permit but leaves the connection task running until
/// its handle count reaches zero.
pub struct PooledConn {
    pub conn: Arc<Connection>,
    address: Address,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("address", &self.address)
            .field("id", &self.conn.id())
            .finish()
    }
}

/// Connection pool keyed by broker address
pub struct ConnectionPool {
    pools: DashMap<Address, Arc<SubPool>>,
    factory: ConnectionFactory,
    capacity_per_address: usize,
    borrow_timeout: Duration,
    metrics: Arc<ClientMetrics>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(
        factory: ConnectionFactory,
        capacity_per_address: usize,
        borrow_timeout: Duration,
    ) -> Self {
        let metrics = factory.metrics.clone();
        Self {
            pools: DashMap::new(),
            factory,
            capacity_per_address,
            borrow_timeout,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    fn sub_pool(&self, address: &Address) -> Arc<SubPool> {
        self.pools
            .entry(address.clone())
            .or_insert_with(|| Arc::new(SubPool::new(self.capacity_per_address)))
            .clone()
    }

    /// Borrow a connection for `address`, creating one if the sub-pool has
    /// spare capacity. Waits at most `borrow_timeout` for capacity.
    pub async fn borrow(&self, address: &Address) -> Result<PooledConn, RiverqError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RiverqError::connection("pool is closed"));
        }
        let sub = self.sub_pool(address);
        let permit = timeout(
            self.borrow_timeout,
            sub.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| RiverqError::NoConnection {
            address: address.to_string(),
        })?
        .map_err(|_| RiverqError::connection("pool is closed"))?;

        // Reuse idle connections, discarding any that fail validation.
        loop {
            let candidate = sub.idle.lock().pop_front();
            let Some(conn) = candidate else { break };
            if conn.validate().await {
                return Ok(PooledConn {
                    conn,
                    address: address.clone(),
                    _permit: permit,
                });
            }
            debug!(address = %address, id = conn.id(), "dropping stale idle connection");
            conn.close();
            self.metrics.record_connection_invalidated();
        }

        let conn = self.factory.create(address).await?;
        Ok(PooledConn {
            conn,
            address: address.clone(),
            _permit: permit,
        })
    }

    /// Return a healthy connection to its sub-pool
    pub fn give_back(&self, pooled: PooledConn) {
        if self.closed.load(Ordering::Acquire) || !pooled.conn.is_connected() {
            pooled.conn.close();
            return;
        }
        if let Some(sub) = self.pools.get(&pooled.address) {
            sub.idle.lock().push_back(pooled.conn.clone());
        } else {
            pooled.conn.close();
        }
        // Dropping `pooled` releases the permit after the idle push, so a
        // waiter that wins the permit will find the connection in place.
    }

    /// Discard a broken connection
    pub fn invalidate(&self, pooled: PooledConn) {
        warn!(address = %pooled.address, id = pooled.conn.id(), "invalidating connection");
        pooled.conn.close();
        self.metrics.record_connection_invalidated();
    }

    /// Drop every idle connection for `address` and forget the sub-pool.
    /// Borrowed connections stay alive until returned, at which point the
    /// missing sub-pool makes `give_back` close them.
    pub fn clear(&self, address: &Address) {
        if let Some((_, sub)) = self.pools.remove(address) {
            let drained: Vec<_> = sub.idle.lock().drain(..).collect();
            for conn in drained {
                conn.close();
            }
        }
    }

    /// Pre-create up to `count` idle connections for `address`. Failures are
    /// logged and ignored; the pool fills lazily on demand anyway.
    pub async fn prepare(&self, address: &Address, count: usize) {
        // Hold every borrow until the end; returning one early would hand the
        // same idle connection back on the next iteration.
        let mut held = Vec::with_capacity(count);
        for _ in 0..count {
            match self.borrow(address).await {
                Ok(pooled) => held.push(pooled),
                Err(e) => {
                    debug!(address = %address, error = %e, "warm-up connection failed");
                    break;
                }
            }
        }
        for pooled in held {
            self.give_back(pooled);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the pool and every idle connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.pools.iter() {
            let drained: Vec<_> = entry.value().idle.lock().drain(..).collect();
            for conn in drained {
                conn.close();
            }
        }
        self.pools.clear();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}
