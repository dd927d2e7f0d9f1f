//! Backend protocol.
//!
//! Any clustered key-value cache that can express this subset works: plain
//! values with a TTL, hashes, key scans, and enough topology introspection to
//! tell a master from a replica.

pub mod memory;
pub mod redis_cluster;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BackendError;

pub use self::memory::{FaultKind, FaultOp, MemoryCluster};
pub use self::redis_cluster::RedisCluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Replica => f.write_str("replica"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub role: NodeRole,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, role: NodeRole) -> Self {
        Self {
            address: address.into(),
            role,
        }
    }

    pub fn is_replica(&self) -> bool {
        self.role == NodeRole::Replica
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.role)
    }
}

/// One page of a key scan. A `cursor` of 0 means the scan is finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Commands addressed to a single cluster node.
#[async_trait]
pub trait KvNode: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> Result<bool, BackendError>;

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), BackendError>;

    /// Empty map when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError>;

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage, BackendError>;
}

/// Connection and topology view of the cluster.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), BackendError>;

    async fn endpoints(&self) -> Result<Vec<Endpoint>, BackendError>;

    async fn node(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvNode>, BackendError>;
}

/// Minimal glob matcher for scan patterns (`*` and `?`).
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    let (mut pi, mut ci) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ci));
            pi += 1;
        } else if let Some((sp, sc)) = star {
            pi = sp + 1;
            ci = sc + 1;
            star = Some((sp, sc + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&ch| ch == '*')
}
