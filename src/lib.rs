//! Async client engine for RiverQ partitioned pub/sub clusters.
//!
//! The crate provides two entry points over one shared machinery of
//! negotiated, pooled broker connections and lookup-driven routing:
//!
//! - [`Producer`]: publishes messages with bounded retry, partition-aware
//!   routing and batched fan-out.
//! - [`Consumer`]: subscribes a channel on every broker serving a topic,
//!   drives deliveries through a bounded handler pool with READY-based flow
//!   control, and reconciles its connections against the lookup view.
//!
//! # Publishing
//!
//! ```no_run
//! use riverq_client::{Message, Producer, ProducerConfigBuilder};
//! use std::sync::Arc;
//!
//! # async fn example(lookup: Arc<dyn riverq_client::LookupTransport>) -> riverq_client::Result<()> {
//! let config = ProducerConfigBuilder::new()
//!     .lookup_endpoints(vec!["lookup1:4161"])
//!     .publish_retry(3)
//!     .build();
//! let producer = Producer::new(config, lookup)?;
//!
//! let message = Message::builder()
//!     .topic("orders")
//!     .body("payload")
//!     .sharding_key(42)
//!     .build()?;
//! let receipt = producer.publish(message).await?;
//! println!("stored on {} partition {:?}", receipt.address, receipt.partition);
//! # Ok(())
//! # }
//! ```
//!
//! # Consuming
//!
//! ```no_run
//! use async_trait::async_trait;
//! use riverq_client::{Consumer, ConsumerConfigBuilder, InboundMessage, MessageHandler};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(
//!         &self,
//!         message: &mut InboundMessage,
//!     ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         println!("{} attempt {}", message.id, message.attempts);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(lookup: Arc<dyn riverq_client::LookupTransport>) -> riverq_client::Result<()> {
//! let config = ConsumerConfigBuilder::new()
//!     .lookup_endpoints(vec!["lookup1:4161"])
//!     .topic("orders")
//!     .channel("billing")
//!     .build();
//! let consumer = Consumer::start(config, Arc::new(Printer), lookup).await?;
//! # consumer.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod lookup;
pub mod metrics;
pub mod negotiate;
pub mod pool;
pub mod producer;
pub mod protocol;

pub use config::{
    ClientConfig, ClientConfigBuilder, CompressionOptions, ConsumerConfig, ConsumerConfigBuilder,
    ProducerConfig, ProducerConfigBuilder, TlsOptions,
};
pub use connection::Connection;
pub use consumer::{Consumer, MessageHandler};
pub use error::{BrokerCode, PublishClass, RiverqError};
pub use lookup::{
    Address, BrokerDescriptor, LookupEndpoints, LookupResponse, LookupTransport, PartitionSet,
    Router,
};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use pool::{ConnectionPool, PooledConn};
pub use producer::Producer;
pub use protocol::{
    Command, Compression, Frame, InboundMessage, Message, MessageBody, MessageBuilder, MessageId,
    MessageReceipt,
};

/// Convenient result alias for client operations
pub type Result<T> = std::result::Result<T, RiverqError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
