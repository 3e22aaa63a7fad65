//! Lookup service integration and partition-aware routing.
//!
//! The router owns a registry of lookup endpoints and a per-topic cache of
//! partition sets. Producers consult the cache and explicitly invalidate it on
//! stale-routing rejections; consumers always refresh so the reconciliation
//! sweep sees the current cluster view.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RiverqError;

/// Broker address as reported by the lookup service.
///
/// Equality and hashing cover host, port and partition only; the advertised
/// version and HA flag are descriptive and must not split pool keys.
#[derive(Debug, Clone)]
pub struct Address {
    pub host: String,
    pub port: u16,
    /// Partition this address serves, when the topic is partitioned
    pub partition: Option<u32>,
    /// Broker software version advertised by the lookup service
    pub version: String,
    /// True when the address came from the partitions map rather than the
    /// flat producers list
    pub ha: bool,
}

impl Address {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            partition: None,
            version: String::new(),
            ha: false,
        }
    }

    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self.ha = true;
        self
    }

    pub fn with_version<V: Into<String>>(mut self, version: V) -> Self {
        self.version = version.into();
        self
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.partition == other.partition
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.partition.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(p) => write!(f, "{}:{}#{}", self.host, self.port, p),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BrokerDescriptor {
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LookupMeta {
    #[serde(default)]
    pub partition_num: u32,
}

/// Lookup document for one topic. Partitioned deployments fill `partitions`
/// keyed by partition id; older deployments only fill `producers`.
#[derive(Debug, Deserialize)]
pub struct LookupResponse {
    #[serde(default)]
    pub partitions: BTreeMap<String, BrokerDescriptor>,
    #[serde(default)]
    pub producers: Vec<BrokerDescriptor>,
    #[serde(default)]
    pub meta: Option<LookupMeta>,
}

/// Transport for lookup queries. The HTTP shape of the lookup service is
/// deployment-specific; tests substitute an in-memory implementation.
#[async_trait]
pub trait LookupTransport: Send + Sync {
    async fn lookup(
        &self,
        endpoint: &str,
        topic: &str,
        writable: bool,
    ) -> Result<LookupResponse, RiverqError>;
}

/// Mutable registry of lookup endpoints, owned by the router
pub struct LookupEndpoints {
    endpoints: RwLock<Vec<String>>,
}

impl LookupEndpoints {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: RwLock::new(endpoints.into_iter().map(|s| s.into()).collect()),
        }
    }

    pub fn register<S: Into<String>>(&self, endpoint: S) {
        let endpoint = endpoint.into();
        let mut guard = self.endpoints.write();
        if !guard.contains(&endpoint) {
            guard.push(endpoint);
        }
    }

    pub fn deregister(&self, endpoint: &str) {
        self.endpoints.write().retain(|e| e != endpoint);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.endpoints.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

/// Resolved routing for one topic
#[derive(Debug)]
pub struct PartitionSet {
    partitioned: BTreeMap<u32, Address>,
    unpartitioned: Vec<Address>,
    expected_partitions: u32,
}

impl PartitionSet {
    /// Build from a lookup document. For writable lookups a partial partition
    /// map (fewer entries than `meta.partition_num`) is rejected, because
    /// publishing through it would silently skew keyed routing.
    pub fn from_response(
        response: LookupResponse,
        topic: &str,
        writable: bool,
    ) -> Result<Self, RiverqError> {
        let mut partitioned = BTreeMap::new();
        for (key, desc) in response.partitions {
            let partition: u32 = key.parse().map_err(|_| {
                RiverqError::lookup(format!("non-numeric partition id '{key}' for {topic}"))
            })?;
            partitioned.insert(
                partition,
                Address::new(desc.broadcast_address, desc.tcp_port)
                    .with_partition(partition)
                    .with_version(desc.version),
            );
        }

        let expected = response
            .meta
            .as_ref()
            .map(|m| m.partition_num)
            .unwrap_or(partitioned.len() as u32);

        if writable && (partitioned.len() as u32) < expected {
            warn!(
                topic,
                found = partitioned.len(),
                expected,
                "partial partition view from lookup"
            );
            return Err(RiverqError::lookup(format!(
                "partial partition view for {topic}: {} of {expected}",
                partitioned.len()
            )));
        }

        let unpartitioned = response
            .producers
            .into_iter()
            .map(|desc| {
                Address::new(desc.broadcast_address, desc.tcp_port).with_version(desc.version)
            })
            .collect();

        Ok(Self {
            partitioned,
            unpartitioned,
            expected_partitions: expected,
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partitioned.len()
    }

    pub fn expected_partitions(&self) -> u32 {
        self.expected_partitions
    }

    /// Address owning the partition a sharding key maps to. Selection is by
    /// position in id order; partition ids need not be contiguous.
    pub fn address_for_key(&self, key: u64) -> Option<&Address> {
        if self.partitioned.is_empty() {
            return None;
        }
        let index = (key % self.partitioned.len() as u64) as usize;
        self.partitioned.values().nth(index)
    }

    /// All candidate addresses, partitioned entries first
    pub fn candidates(&self) -> Vec<Address> {
        let mut out: Vec<Address> = self.partitioned.values().cloned().collect();
        for addr in &self.unpartitioned {
            if !out.iter().any(|a| a.host == addr.host && a.port == addr.port) {
                out.push(addr.clone());
            }
        }
        out
    }
}

/// Topic router: caches partition sets and rotates across candidates for
/// keyless publishes.
pub struct Router {
    transport: Arc<dyn LookupTransport>,
    endpoints: Arc<LookupEndpoints>,
    cache: DashMap<String, Arc<PartitionSet>>,
    offset: AtomicUsize,
}

impl Router {
    pub fn new(transport: Arc<dyn LookupTransport>, endpoints: Arc<LookupEndpoints>) -> Self {
        let start = rand::thread_rng().gen_range(0..usize::MAX / 2);
        Self {
            transport,
            endpoints,
            cache: DashMap::new(),
            offset: AtomicUsize::new(start),
        }
    }

    pub fn endpoints(&self) -> &Arc<LookupEndpoints> {
        &self.endpoints
    }

    /// Fetch a fresh partition set from the lookup endpoints, trying each in
    /// turn. Topic-not-found and an empty registry surface immediately; other
    /// failures fall through to the next endpoint.
    async fn fetch(&self, topic: &str, writable: bool) -> Result<Arc<PartitionSet>, RiverqError> {
        let endpoints = self.endpoints.snapshot();
        if endpoints.is_empty() {
            return Err(RiverqError::NoLookupEndpoints);
        }
        let mut last_err = None;
        for endpoint in &endpoints {
            match self.transport.lookup(endpoint, topic, writable).await {
                Ok(response) => match PartitionSet::from_response(response, topic, writable) {
                    Ok(set) => return Ok(Arc::new(set)),
                    Err(e) => {
                        debug!(topic, endpoint, error = %e, "unusable lookup document");
                        last_err = Some(e);
                    }
                },
                Err(e) if e.is_terminal_lookup() => return Err(e),
                Err(e) => {
                    debug!(topic, endpoint, error = %e, "lookup endpoint failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RiverqError::lookup(format!("lookup failed for {topic}"))))
    }

    /// Cached partition set for a writable topic, fetching on miss
    pub async fn partition_set(&self, topic: &str) -> Result<Arc<PartitionSet>, RiverqError> {
        if let Some(cached) = self.cache.get(topic) {
            return Ok(cached.clone());
        }
        let set = self.fetch(topic, true).await?;
        self.cache.insert(topic.to_string(), set.clone());
        Ok(set)
    }

    /// Candidate addresses for one publish attempt. A sharding key pins the
    /// message to its partition owner; keyless publishes rotate across all
    /// candidates.
    pub async fn route(
        &self,
        topic: &str,
        sharding_key: Option<u64>,
    ) -> Result<Vec<Address>, RiverqError> {
        let set = self.partition_set(topic).await?;
        if let Some(key) = sharding_key {
            return match set.address_for_key(key) {
                Some(addr) => Ok(vec![addr.clone()]),
                None => Err(RiverqError::NoDataNodes {
                    topic: topic.to_string(),
                }),
            };
        }
        let mut candidates = set.candidates();
        if candidates.is_empty() {
            return Err(RiverqError::NoDataNodes {
                topic: topic.to_string(),
            });
        }
        let shift = self.offset.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.rotate_left(shift);
        Ok(candidates)
    }

    /// Current subscribable addresses for a topic. Never served from cache;
    /// the reconciliation sweep needs the live cluster view.
    pub async fn consumer_addresses(&self, topic: &str) -> Result<Vec<Address>, RiverqError> {
        let set = self.fetch(topic, false).await?;
        let candidates = set.candidates();
        if candidates.is_empty() {
            return Err(RiverqError::NoDataNodes {
                topic: topic.to_string(),
            });
        }
        Ok(candidates)
    }

    /// Drop the cached routing for a topic
    pub fn invalidate(&self, topic: &str) {
        self.cache.remove(topic);
    }

    /// Drop cached routing for several topics at once
    pub fn remove_topics<'a, I: IntoIterator<Item = &'a str>>(&self, topics: I) {
        for topic in topics {
            self.cache.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(host: &str, port: u16) -> BrokerDescriptor {
        BrokerDescriptor {
            broadcast_address: host.to_string(),
            tcp_port: port,
            version: "1.0".to_string(),
        }
    }

    fn partitioned_response(n: u32, meta: u32) -> LookupResponse {
        LookupResponse {
            partitions: (0..n)
                .map(|i| (i.to_string(), descriptor(&format!("broker{i}"), 4150)))
                .collect(),
            producers: vec![],
            meta: Some(LookupMeta { partition_num: meta }),
        }
    }

    #[test]
    fn test_parse_lookup_document() {
        let json = r#"{
            "partitions": {
                "0": {"broadcast_address": "b0", "tcp_port": 4150, "version": "1.0"},
                "1": {"broadcast_address": "b1", "tcp_port": 4150, "version": "1.0"}
            },
            "producers": [
                {"broadcast_address": "b0", "tcp_port": 4150, "version": "1.0"}
            ],
            "meta": {"partition_num": 2}
        }"#;
        let response: LookupResponse = serde_json::from_str(json).unwrap();
        let set = PartitionSet::from_response(response, "orders", true).unwrap();
        assert_eq!(set.partition_count(), 2);
        assert_eq!(set.expected_partitions(), 2);
        // producers entry for b0 duplicates a partitioned address
        assert_eq!(set.candidates().len(), 2);
    }

    #[test]
    fn test_partial_partition_view_rejected_for_writable() {
        let set = PartitionSet::from_response(partitioned_response(1, 3), "orders", true);
        assert!(set.is_err());

        // Read path tolerates partial views
        let set = PartitionSet::from_response(partitioned_response(1, 3), "orders", false);
        assert!(set.is_ok());
    }

    #[test]
    fn test_sharding_key_is_stable() {
        let set = PartitionSet::from_response(partitioned_response(4, 4), "orders", true).unwrap();
        let a = set.address_for_key(42).unwrap().clone();
        let b = set.address_for_key(42).unwrap().clone();
        assert_eq!(a, b);
        assert_eq!(a.partition, Some(42 % 4));
    }

    #[test]
    fn test_sharding_covers_noncontiguous_partition_ids() {
        let mut partitions = BTreeMap::new();
        partitions.insert("0".to_string(), descriptor("b0", 4150));
        partitions.insert("2".to_string(), descriptor("b2", 4150));
        let response = LookupResponse {
            partitions,
            producers: vec![],
            meta: Some(LookupMeta { partition_num: 2 }),
        };
        let set = PartitionSet::from_response(response, "orders", true).unwrap();
        for key in 0..8 {
            assert!(set.address_for_key(key).is_some(), "key {key} unrouted");
        }
        assert_eq!(set.address_for_key(0).unwrap().partition, Some(0));
        assert_eq!(set.address_for_key(1).unwrap().partition, Some(2));
    }

    #[test]
    fn test_unpartitioned_fallback() {
        let response = LookupResponse {
            partitions: BTreeMap::new(),
            producers: vec![descriptor("b0", 4150), descriptor("b1", 4150)],
            meta: None,
        };
        let set = PartitionSet::from_response(response, "orders", true).unwrap();
        assert_eq!(set.partition_count(), 0);
        assert_eq!(set.candidates().len(), 2);
        assert!(set.address_for_key(1).is_none());
    }

    #[test]
    fn test_endpoints_registry() {
        let endpoints = LookupEndpoints::new(vec!["a:4161"]);
        endpoints.register("b:4161");
        endpoints.register("a:4161");
        assert_eq!(endpoints.snapshot(), vec!["a:4161", "b:4161"]);
        endpoints.deregister("a:4161");
        assert_eq!(endpoints.snapshot(), vec!["b:4161"]);
    }
}
