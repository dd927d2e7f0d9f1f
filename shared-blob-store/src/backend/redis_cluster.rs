//! Redis backend.
//!
//! Each configured endpoint gets its own `ConnectionManager`; the role of an
//! endpoint is read from `INFO replication`, so a set of plain Redis nodes
//! replicating from one master works the same as a managed deployment.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ClusterBackend, Endpoint, KvNode, NodeRole, ScanPage};
use crate::error::BackendError;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisCluster {
    urls: Vec<String>,
    connections: RwLock<HashMap<String, ConnectionManager>>,
    connected: AtomicBool,
    command_timeout: Duration,
}

impl RedisCluster {
    /// Creates an unconnected backend; the first acquisition connects it.
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            connections: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    async fn connection(&self, url: &str) -> Result<ConnectionManager, BackendError> {
        self.connections
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| BackendError::Connection(format!("no connection to {url}")))
    }
}

#[async_trait]
impl ClusterBackend for RedisCluster {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<(), BackendError> {
        let mut last_error = None;
        let mut connections = self.connections.write().await;

        for url in &self.urls {
            if connections.contains_key(url) {
                continue;
            }
            let client = redis::Client::open(url.as_str())
                .map_err(|e| BackendError::Protocol(format!("invalid redis url {url}: {e}")))?;
            match timed(self.command_timeout, url, ConnectionManager::new(client)).await {
                Ok(manager) => {
                    debug!(endpoint = %url, "connected");
                    connections.insert(url.clone(), manager);
                }
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "failed to connect");
                    last_error = Some(e);
                }
            }
        }

        if connections.is_empty() {
            self.connected.store(false, Ordering::Release);
            return Err(last_error
                .unwrap_or_else(|| BackendError::Connection("no endpoints configured".to_string())));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>, BackendError> {
        let connections: Vec<(String, ConnectionManager)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(url, conn)| (url.clone(), conn.clone()))
            .collect();

        let mut endpoints = Vec::with_capacity(connections.len());
        let mut last_error = None;
        for (url, mut conn) in connections {
            let info: Result<String, BackendError> = timed(
                self.command_timeout,
                &url,
                redis::cmd("INFO").arg("replication").query_async(&mut conn),
            )
            .await;
            match info {
                Ok(info) => endpoints.push(Endpoint::new(url, parse_role(&info))),
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "failed to read replication role");
                    last_error = Some(e);
                }
            }
        }

        if endpoints.is_empty() {
            if let Some(e) = last_error {
                if e.is_transient() {
                    self.connected.store(false, Ordering::Release);
                }
                return Err(e);
            }
        }
        // Stable order so the same master is picked while the topology holds.
        endpoints.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(endpoints)
    }

    async fn node(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvNode>, BackendError> {
        let conn = self.connection(&endpoint.address).await?;
        Ok(Arc::new(RedisNode {
            endpoint: endpoint.clone(),
            conn,
            command_timeout: self.command_timeout,
        }))
    }
}

struct RedisNode {
    endpoint: Endpoint,
    conn: ConnectionManager,
    command_timeout: Duration,
}

impl RedisNode {
    async fn run<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, BackendError> {
        let mut conn = self.conn.clone();
        timed(
            self.command_timeout,
            &self.endpoint.address,
            cmd.query_async(&mut conn),
        )
        .await
    }
}

#[async_trait]
impl KvNode for RedisNode {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.run::<()>(cmd).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<Vec<u8>> = self.run(cmd).await?;
        Ok(value.map(Bytes::from))
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self.run(cmd).await?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), BackendError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        self.run::<i64>(cmd).await.map(|_| ())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_millis(ttl));
        self.run::<i64>(cmd).await.map(|_| ())
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage, BackendError> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(count);
        let (cursor, keys): (u64, Vec<String>) = self.run(cmd).await?;
        Ok(ScanPage { cursor, keys })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

async fn timed<T, F>(timeout: Duration, endpoint: &str, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(map_redis_error),
        Err(_) => Err(BackendError::Timeout(format!(
            "{endpoint} did not answer within {timeout:?}"
        ))),
    }
}

fn map_redis_error(err: RedisError) -> BackendError {
    if err.kind() == ErrorKind::ReadOnly {
        BackendError::ReadOnly(err.to_string())
    } else if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BackendError::Connection(err.to_string())
    } else {
        BackendError::Protocol(err.to_string())
    }
}

/// Extracts the role from an `INFO replication` reply.
fn parse_role(info: &str) -> NodeRole {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("role:"))
        .map(|role| match role.trim() {
            "master" => NodeRole::Master,
            _ => NodeRole::Replica,
        })
        .unwrap_or(NodeRole::Replica)
}
