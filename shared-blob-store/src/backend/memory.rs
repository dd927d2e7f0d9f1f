//! In-process cluster for tests and local experiments.
//!
//! All endpoints share one keyspace (replication is instant), but writes sent
//! to an endpoint holding the replica role are refused exactly like a real
//! replica would. TTLs are enforced against the injected clock, and scripted
//! fault rules let tests provoke timeouts, resets, failovers and stalls.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{glob_match, ClusterBackend, Endpoint, KvNode, NodeRole, ScanPage};
use crate::clock::Clock;
use crate::error::BackendError;

const READONLY_REPLY: &str = "READONLY You can't write against a read only replica.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Set,
    Get,
    Exists,
    Delete,
    HashSet,
    HashGetAll,
    Expire,
    Scan,
}

impl FaultOp {
    fn is_write(&self) -> bool {
        matches!(
            self,
            FaultOp::Set | FaultOp::Delete | FaultOp::HashSet | FaultOp::Expire
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection reset; the caller may retry.
    Transient,
    /// Refused as if the node were a replica, without changing roles.
    ReadOnly,
    /// The receiving node is demoted and another one promoted, then the
    /// command is refused with a read-only error.
    Failover,
    /// The command never completes.
    Stall,
    /// The command is applied, then the reply is lost to a timeout.
    AppliedThenTimeout,
}

#[derive(Debug, Clone)]
struct FaultRule {
    op: FaultOp,
    key_pattern: String,
    remaining: u32,
    kind: FaultKind,
}

#[derive(Debug, Clone)]
enum Value {
    Plain(Bytes),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ClusterState {
    data: BTreeMap<String, Entry>,
    nodes: Vec<(String, NodeRole)>,
    connected: bool,
    connect_failures: u32,
    faults: Vec<FaultRule>,
    commands: Vec<(FaultOp, String)>,
    /// Scan cursor -> last key returned under it.
    scan_cursors: HashMap<u64, String>,
}

impl ClusterState {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.data
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }

    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        let expired = self
            .data
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn failover_from(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.1 = NodeRole::Replica;
        }
        if let Some((_, role)) = self
            .nodes
            .iter_mut()
            .enumerate()
            .find(|(i, _)| *i != index)
            .map(|(_, node)| node)
        {
            *role = NodeRole::Master;
        }
    }
}

enum Admission {
    Proceed,
    /// Apply the command, then report this error.
    ProceedThenFail(BackendError),
    Fail(BackendError),
    Stall,
}

/// Shared-keyspace cluster. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCluster {
    /// Single connected master.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_roles(clock, &[NodeRole::Master])
    }

    pub fn with_roles(clock: Arc<dyn Clock>, roles: &[NodeRole]) -> Self {
        let nodes = roles
            .iter()
            .enumerate()
            .map(|(i, role)| (format!("memory-{i}"), *role))
            .collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes,
                connected: true,
                ..Default::default()
            })),
            clock,
        }
    }

    pub fn set_role(&self, index: usize, role: NodeRole) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(index) {
            node.1 = role;
        }
    }

    pub fn set_all_roles(&self, role: NodeRole) {
        let mut state = self.state.lock().unwrap();
        for node in state.nodes.iter_mut() {
            node.1 = role;
        }
    }

    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    /// The next `times` calls to `connect` fail with a connection error.
    pub fn fail_next_connects(&self, times: u32) {
        self.state.lock().unwrap().connect_failures = times;
    }

    /// Scripts `kind` for the next `times` commands of type `op` whose key
    /// matches `key_pattern`.
    pub fn inject(&self, op: FaultOp, key_pattern: impl Into<String>, times: u32, kind: FaultKind) {
        self.state.lock().unwrap().faults.push(FaultRule {
            op,
            key_pattern: key_pattern.into(),
            remaining: times,
            kind,
        });
    }

    pub fn clear_faults(&self) {
        self.state.lock().unwrap().faults.clear();
    }

    /// Live keys matching `pattern`, sorted.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.purge_expired(now);
        state
            .data
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect()
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        match state.live(key, now) {
            Some(Entry {
                value: Value::Plain(bytes),
                ..
            }) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        match state.live(key, now) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Some(fields.clone()),
            _ => None,
        }
    }

    /// Remaining time to live of a key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let at = state.live(key, now)?.expires_at?;
        (at - now).to_std().ok()
    }

    /// Number of commands of type `op` issued against keys matching `pattern`.
    pub fn command_count(&self, op: FaultOp, pattern: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .commands
            .iter()
            .filter(|(o, key)| *o == op && glob_match(pattern, key))
            .count()
    }
}

#[async_trait]
impl ClusterBackend for MemoryCluster {
    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn connect(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(BackendError::Connection("connection refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>, BackendError> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(BackendError::Connection("not connected".to_string()));
        }
        Ok(state
            .nodes
            .iter()
            .map(|(address, role)| Endpoint::new(address.clone(), *role))
            .collect())
    }

    async fn node(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvNode>, BackendError> {
        let state = self.state.lock().unwrap();
        let index = state
            .nodes
            .iter()
            .position(|(address, _)| *address == endpoint.address)
            .ok_or_else(|| BackendError::Protocol(format!("unknown endpoint {endpoint}")))?;
        Ok(Arc::new(MemoryNode {
            endpoint: endpoint.clone(),
            index,
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }))
    }
}

struct MemoryNode {
    endpoint: Endpoint,
    index: usize,
    state: Arc<Mutex<ClusterState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryNode {
    fn admission(&self, op: FaultOp, key: &str) -> Admission {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Admission::Fail(BackendError::Connection("not connected".to_string()));
        }
        state.commands.push((op, key.to_string()));

        let fault = state
            .faults
            .iter_mut()
            .find(|rule| rule.op == op && rule.remaining > 0 && glob_match(&rule.key_pattern, key))
            .map(|rule| {
                rule.remaining -= 1;
                rule.kind
            });

        match fault {
            Some(FaultKind::Transient) => {
                return Admission::Fail(BackendError::Connection("connection reset by peer".to_string()))
            }
            Some(FaultKind::ReadOnly) => {
                return Admission::Fail(BackendError::ReadOnly(READONLY_REPLY.to_string()))
            }
            Some(FaultKind::Failover) => {
                debug!(endpoint = %self.endpoint.address, "injected failover");
                state.failover_from(self.index);
                return Admission::Fail(BackendError::ReadOnly(READONLY_REPLY.to_string()));
            }
            Some(FaultKind::Stall) => return Admission::Stall,
            Some(FaultKind::AppliedThenTimeout) | None => {}
        }

        let role = state.nodes.get(self.index).map(|(_, role)| *role);
        if op.is_write() && role != Some(NodeRole::Master) {
            return Admission::Fail(BackendError::ReadOnly(READONLY_REPLY.to_string()));
        }
        if fault == Some(FaultKind::AppliedThenTimeout) {
            return Admission::ProceedThenFail(BackendError::Timeout(
                "reply lost after the command was applied".to_string(),
            ));
        }
        Admission::Proceed
    }

    /// Runs `apply` unless a fault rule or the node's role refuses `op`.
    async fn admit<T>(
        &self,
        op: FaultOp,
        key: &str,
        apply: impl FnOnce() -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        match self.admission(op, key) {
            Admission::Proceed => apply(),
            Admission::ProceedThenFail(e) => {
                apply()?;
                Err(e)
            }
            Admission::Fail(e) => Err(e),
            Admission::Stall => std::future::pending().await,
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }
}

fn wrong_type(key: &str) -> BackendError {
    BackendError::Protocol(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {key}"
    ))
}

#[async_trait]
impl KvNode for MemoryNode {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError> {
        self.admit(FaultOp::Set, key, || {
            let expires_at = ttl.and_then(|ttl| self.expiry(ttl));
            let mut state = self.state.lock().unwrap();
            state.data.insert(
                key.to_string(),
                Entry {
                    value: Value::Plain(value),
                    expires_at,
                },
            );
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        self.admit(FaultOp::Get, key, || {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            match state.live(key, now) {
                None => Ok(None),
                Some(Entry {
                    value: Value::Plain(bytes),
                    ..
                }) => Ok(Some(bytes.clone())),
                Some(_) => Err(wrong_type(key)),
            }
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.admit(FaultOp::Exists, key, || {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            Ok(state.live(key, now).is_some())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        self.admit(FaultOp::Delete, key, || {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            let existed = state.live(key, now).is_some();
            state.data.remove(key);
            Ok(existed)
        })
        .await
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), BackendError> {
        self.admit(FaultOp::HashSet, key, || {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            match state.live(key, now) {
                Some(Entry {
                    value: Value::Hash(existing),
                    ..
                }) => {
                    existing.extend(fields.iter().cloned());
                }
                Some(_) => return Err(wrong_type(key)),
                None => {
                    state.data.insert(
                        key.to_string(),
                        Entry {
                            value: Value::Hash(fields.iter().cloned().collect()),
                            expires_at: None,
                        },
                    );
                }
            }
            Ok(())
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        self.admit(FaultOp::HashGetAll, key, || {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            match state.live(key, now) {
                None => Ok(HashMap::new()),
                Some(Entry {
                    value: Value::Hash(fields),
                    ..
                }) => Ok(fields.clone()),
                Some(_) => Err(wrong_type(key)),
            }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        self.admit(FaultOp::Expire, key, || {
            let expires_at = self.expiry(ttl);
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.live(key, now) {
                entry.expires_at = expires_at;
            }
            Ok(())
        })
        .await
    }

    /// Cursors name the last key of the previous page, so keys deleted or
    /// added between pages never make the scan skip a key that was present
    /// throughout, matching the guarantee of Redis `SCAN`.
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage, BackendError> {
        self.admit(FaultOp::Scan, pattern, || {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            state.purge_expired(now);

            let start = match cursor {
                0 => Bound::Unbounded,
                token => match state.scan_cursors.get(&token) {
                    Some(last) => Bound::Excluded(last.clone()),
                    None => return Err(BackendError::Protocol(format!("ERR invalid cursor {token}"))),
                },
            };
            let count = count.max(1);
            let visited: Vec<String> = state
                .data
                .range::<String, _>((start, Bound::Unbounded))
                .take(count + 1)
                .map(|(key, _)| key.clone())
                .collect();
            let more = visited.len() > count;
            let visited = &visited[..visited.len().min(count)];

            let keys = visited
                .iter()
                .filter(|key| glob_match(pattern, key))
                .cloned()
                .collect();
            let cursor = match visited.last() {
                Some(last) if more => {
                    let token = state.scan_cursors.len() as u64 + 1;
                    state.scan_cursors.insert(token, last.clone());
                    token
                }
                _ => 0,
            };
            Ok(ScanPage { cursor, keys })
        })
        .await
    }
}
