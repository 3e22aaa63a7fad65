//! Configuration types for RiverQ client

use crate::error::RiverqError;
use std::sync::Arc;
use std::time::Duration;

/// Base client configuration shared by producers and consumers
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Lookup service endpoints (host:port or full base URLs, transport-defined)
    pub lookup_endpoints: Vec<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-command response timeout
    pub request_timeout: Duration,
    /// Heartbeat interval advertised to brokers, milliseconds on the wire
    pub heartbeat_interval: Duration,
    /// Client identifier sent during negotiation
    pub client_id: Option<String>,
    /// TLS settings
    pub tls: TlsOptions,
    /// Compression settings
    pub compression: CompressionOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            lookup_endpoints: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            client_id: None,
            tls: TlsOptions::default(),
            compression: CompressionOptions::default(),
        }
    }
}

impl ClientConfig {
    pub(crate) fn validate(&self) -> Result<(), RiverqError> {
        if self.lookup_endpoints.is_empty() {
            return Err(RiverqError::NoLookupEndpoints);
        }
        if self.tls.enabled && self.tls.client_config.is_none() {
            return Err(RiverqError::invalid_config(
                "TLS enabled but no rustls client configuration supplied",
            ));
        }
        if self.compression.snappy && self.compression.deflate {
            return Err(RiverqError::invalid_config(
                "snappy and deflate are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// TLS negotiation settings. The crate never loads certificate material itself;
/// callers hand in a ready `rustls::ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub enabled: bool,
    pub client_config: Option<Arc<rustls::ClientConfig>>,
    /// Server name override for certificate verification; defaults to the
    /// broker's broadcast host.
    pub server_name: Option<String>,
}

/// Compression negotiation settings
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            snappy: false,
            deflate: false,
            deflate_level: 6,
        }
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Base client configuration
    pub client: ClientConfig,
    /// Maximum publish attempts per message
    pub publish_retry: usize,
    /// Upper bound on pooled connections per broker address
    pub connections_per_broker: usize,
    /// Idle connections kept warm per broker address
    pub min_idle_per_broker: usize,
    /// Bounded wait when borrowing a pooled connection
    pub borrow_timeout: Duration,
    /// Sub-batch size for `publish_batch`
    pub batch_size: usize,
    /// Worker pool bound for concurrent sub-batch dispatch
    pub publish_workers: usize,
    /// Sleep after a routing-stale rejection, letting broker consensus settle
    pub consensus_backoff: Duration,
    /// Drop cached routing for topics unpublished for this long; None disables
    /// the cleaner.
    pub idle_topic_cleanup: Option<Duration>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            publish_retry: 6,
            connections_per_broker: 10,
            min_idle_per_broker: 2,
            borrow_timeout: Duration::from_millis(500),
            batch_size: 10,
            publish_workers: 4,
            consensus_backoff: Duration::from_millis(100),
            idle_topic_cleanup: Some(Duration::from_secs(3600)),
        }
    }
}

impl ProducerConfig {
    pub(crate) fn validate(&self) -> Result<(), RiverqError> {
        self.client.validate()?;
        if self.publish_retry == 0 {
            return Err(RiverqError::invalid_config("publish_retry must be >= 1"));
        }
        if self.connections_per_broker == 0 {
            return Err(RiverqError::invalid_config(
                "connections_per_broker must be >= 1",
            ));
        }
        if self.batch_size == 0 || self.publish_workers == 0 {
            return Err(RiverqError::invalid_config(
                "batch_size and publish_workers must be >= 1",
            ));
        }
        Ok(())
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Base client configuration
    pub client: ClientConfig,
    /// Topic to subscribe to
    pub topic: String,
    /// Channel (consumer group) name
    pub channel: String,
    /// Connections opened per broker address; also the pool bound
    pub io_parallelism: usize,
    /// Default READY credit per connection
    pub rdy: u32,
    /// Send FIN automatically after handler completion
    pub auto_finish: bool,
    /// Bounded worker pool size for handler invocations; 0 selects
    /// 4 x available parallelism.
    pub worker_pool_size: usize,
    /// Interval between reconciliation sweeps
    pub reconnect_interval: Duration,
    /// Bounded wait when borrowing a pooled connection
    pub borrow_timeout: Duration,
    /// Requeue delay used when the worker pool rejects a delivery
    pub saturated_requeue_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            topic: String::new(),
            channel: String::new(),
            io_parallelism: 2,
            rdy: 10,
            auto_finish: true,
            worker_pool_size: 0,
            reconnect_interval: Duration::from_secs(60),
            borrow_timeout: Duration::from_millis(200),
            saturated_requeue_delay: Duration::from_secs(3),
        }
    }
}

impl ConsumerConfig {
    pub(crate) fn validate(&self) -> Result<(), RiverqError> {
        self.client.validate()?;
        if self.topic.trim().is_empty() {
            return Err(RiverqError::InvalidTopic {
                topic: self.topic.clone(),
            });
        }
        if self.channel.trim().is_empty() {
            return Err(RiverqError::invalid_config("channel name is blank"));
        }
        if self.io_parallelism == 0 {
            return Err(RiverqError::invalid_config("io_parallelism must be >= 1"));
        }
        if self.rdy == 0 {
            return Err(RiverqError::invalid_config("rdy must be >= 1"));
        }
        Ok(())
    }

    pub(crate) fn effective_worker_pool_size(&self) -> usize {
        if self.worker_pool_size > 0 {
            self.worker_pool_size
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() * 4)
                .unwrap_or(16)
        }
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.lookup_endpoints = endpoints.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn compression(mut self, compression: CompressionOptions) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, client: ClientConfig) -> Self {
        self.config.client = client;
        self
    }

    pub fn lookup_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.client.lookup_endpoints = endpoints.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn publish_retry(mut self, retry: usize) -> Self {
        self.config.publish_retry = retry;
        self
    }

    pub fn connections_per_broker(mut self, n: usize) -> Self {
        self.config.connections_per_broker = n;
        self
    }

    pub fn min_idle_per_broker(mut self, n: usize) -> Self {
        self.config.min_idle_per_broker = n;
        self
    }

    pub fn borrow_timeout(mut self, timeout: Duration) -> Self {
        self.config.borrow_timeout = timeout;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn publish_workers(mut self, workers: usize) -> Self {
        self.config.publish_workers = workers;
        self
    }

    pub fn idle_topic_cleanup(mut self, interval: Option<Duration>) -> Self {
        self.config.idle_topic_cleanup = interval;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

/// Builder for ConsumerConfig
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, client: ClientConfig) -> Self {
        self.config.client = client;
        self
    }

    pub fn lookup_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.client.lookup_endpoints = endpoints.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.config.channel = channel.into();
        self
    }

    pub fn io_parallelism(mut self, n: usize) -> Self {
        self.config.io_parallelism = n;
        self
    }

    pub fn rdy(mut self, rdy: u32) -> Self {
        self.config.rdy = rdy;
        self
    }

    pub fn auto_finish(mut self, auto_finish: bool) -> Self {
        self.config.auto_finish = auto_finish;
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.config.worker_pool_size = size;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    pub fn borrow_timeout(mut self, timeout: Duration) -> Self {
        self.config.borrow_timeout = timeout;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfigBuilder::new()
            .lookup_endpoints(vec!["lookup1:4161", "lookup2:4161"])
            .connect_timeout(Duration::from_secs(2))
            .client_id("test-client")
            .build();

        assert_eq!(config.lookup_endpoints, vec!["lookup1:4161", "lookup2:4161"]);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.client_id, Some("test-client".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_lookup_endpoints() {
        let config = ClientConfig::default();
        assert!(matches!(
            config.validate(),
            Err(RiverqError::NoLookupEndpoints)
        ));
    }

    #[test]
    fn test_tls_requires_client_config() {
        let mut config = ClientConfigBuilder::new()
            .lookup_endpoints(vec!["lookup1:4161"])
            .build();
        config.tls.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(RiverqError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_consumer_config_validation() {
        let config = ConsumerConfigBuilder::new()
            .lookup_endpoints(vec!["lookup1:4161"])
            .topic("orders")
            .channel("billing")
            .build();
        assert!(config.validate().is_ok());

        let blank_channel = ConsumerConfigBuilder::new()
            .lookup_endpoints(vec!["lookup1:4161"])
            .topic("orders")
            .build();
        assert!(blank_channel.validate().is_err());
    }

    #[test]
    fn test_producer_config_builder() {
        let config = ProducerConfigBuilder::new()
            .lookup_endpoints(vec!["lookup1:4161"])
            .publish_retry(3)
            .batch_size(20)
            .build();

        assert_eq!(config.publish_retry, 3);
        assert_eq!(config.batch_size, 20);
        assert!(config.validate().is_ok());
    }
}
