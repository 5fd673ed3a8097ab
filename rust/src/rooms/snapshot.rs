use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::store::SharedStore;
use crate::error::Result;

pub const SERVED_REQUESTS_KEY: &str = "served-requests";
pub const DEFAULT_SNAPSHOT_SIZE: usize = 50;

/// Ranked set holding a room's initial display data.
pub fn ranked_key(room: &str) -> String {
    format!("room:{room}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub text: String,
    pub value: f64,
}

/// Read-only view of a room's ranked (text, weight) pairs, served before any
/// live update arrives.
pub struct SnapshotReader {
    store: Arc<dyn SharedStore>,
    limit: usize,
}

impl SnapshotReader {
    pub fn new(store: Arc<dyn SharedStore>, limit: usize) -> Self {
        Self { store, limit }
    }

    pub async fn read(&self, room: &str) -> Result<Vec<SnapshotEntry>> {
        if self.limit == 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .store
            .range_with_scores(&ranked_key(room), 0, self.limit as isize - 1)
            .await?;
        if let Err(e) = self.store.increment(SERVED_REQUESTS_KEY).await {
            warn!(room, error = %e, "failed to count served snapshot");
        }
        Ok(rows
            .into_iter()
            .map(|(text, value)| SnapshotEntry { text, value })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::store::MemoryStore;

    #[tokio::test]
    async fn test_read_returns_ranked_entries_up_to_limit() {
        let store = Arc::new(MemoryStore::new());
        for (i, word) in ["tokio", "serde", "redis", "axum"].iter().enumerate() {
            store.ranked_add("room:crates", word, i as f64);
        }
        let reader = SnapshotReader::new(store.clone(), 3);
        let entries = reader.read("crates").await.unwrap();
        assert_eq!(
            entries,
            vec![
                SnapshotEntry { text: "tokio".into(), value: 0.0 },
                SnapshotEntry { text: "serde".into(), value: 1.0 },
                SnapshotEntry { text: "redis".into(), value: 2.0 },
            ]
        );
        assert_eq!(store.counter(SERVED_REQUESTS_KEY), 1);
    }

    #[tokio::test]
    async fn test_read_unknown_room_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let reader = SnapshotReader::new(store.clone(), DEFAULT_SNAPSHOT_SIZE);
        assert!(reader.read("nothing").await.unwrap().is_empty());
        assert_eq!(store.counter(SERVED_REQUESTS_KEY), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_skips_store() {
        let store = Arc::new(MemoryStore::new());
        store.ranked_add("room:a", "x", 1.0);
        let reader = SnapshotReader::new(store.clone(), 0);
        assert!(reader.read("a").await.unwrap().is_empty());
        assert_eq!(store.counter(SERVED_REQUESTS_KEY), 0);
    }
}
