use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use crate::error::{BrokerError, Result};

/// Cluster-wide key/value/set/hash store shared by every server instance.
///
/// Every call may suspend; none of them hold locks across instances.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn set_members(&self, key: &str) -> Result<HashSet<String>>;
    /// Returns true when `member` was not already in the set.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
    /// Returns the post-increment value.
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<i64>>;
    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn increment(&self, key: &str) -> Result<i64>;
    /// Ranked-set slice in ascending score order, inclusive bounds,
    /// negative indices counting from the end.
    async fn range_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

pub struct RedisStore {
    conn: MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BrokerError::StoreUnavailable(format!("connect to {url} timed out")))??;
        tracing::info!(timeout_ms = op_timeout.as_millis() as u64, "shared store connected");
        Ok(Self { conn, op_timeout })
    }

    /// Run one store round-trip under `op_timeout`.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::StoreUnavailable(format!(
                "{op} timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_members(&self, key: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn.clone();
        self.bounded("SMEMBERS", conn.smembers(key)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .bounded("SADD", conn.sadd::<_, _, i64>(key, member))
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("SREM", conn.srem::<_, _, ()>(key, member))
            .await
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.bounded("HINCRBY", conn.hincr(key, field, delta)).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        self.bounded("HGET", conn.hget(key, field)).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("HDEL", conn.hdel::<_, _, ()>(key, field))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("DEL", conn.del::<_, ()>(key)).await
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.bounded("INCR", conn.incr(key, 1i64)).await
    }

    async fn range_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        self.bounded("ZRANGE", conn.zrange_withscores(key, start, stop))
            .await
    }
}

// ---------------------------------------------------------------------------
// In-process store (single-node mode and simulated fleets)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryData {
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, i64>>,
    counters: HashMap<String, i64>,
    ranked: HashMap<String, Vec<(String, f64)>>,
}

/// Store kept in process memory. Cloning an `Arc<MemoryStore>` across several
/// brokers simulates a fleet sharing one store.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a ranked-set member, keeping the set sorted by score.
    pub fn ranked_add(&self, key: &str, member: &str, score: f64) {
        let mut data = self.data.lock();
        let entries = data.ranked.entry(key.to_owned()).or_default();
        entries.retain(|(m, _)| m != member);
        entries.push((member.to_owned(), score));
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    }

    pub fn counter(&self, key: &str) -> i64 {
        self.data.lock().counters.get(key).copied().unwrap_or(0)
    }
}

/// Resolve inclusive Redis-style range bounds against a length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_members(&self, key: &str) -> Result<HashSet<String>> {
        Ok(self.data.lock().sets.get(key).cloned().unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .data
            .lock()
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock();
        if let Some(set) = data.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                data.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.lock();
        let value = data
            .hashes
            .entry(key.to_owned())
            .or_default()
            .entry(field.to_owned())
            .or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<i64>> {
        Ok(self
            .data
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .copied())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut data = self.data.lock();
        if let Some(hash) = data.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                data.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock();
        data.sets.remove(key);
        data.hashes.remove(key);
        data.counters.remove(key);
        data.ranked.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut data = self.data.lock();
        let value = data.counters.entry(key.to_owned()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn range_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let data = self.data.lock();
        let Some(entries) = data.ranked.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(entries.len(), start, stop) {
            Some((from, to)) => entries[from..=to].to_vec(),
            None => Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
