use std::collections::HashSet;
use std::sync::Arc;

use super::store::SharedStore;
use crate::error::Result;

/// Store key holding the rooms a connection has joined.
pub fn connection_key(conn_id: &str) -> String {
    format!("room:{conn_id}")
}

/// Per-connection joined-room bookkeeping. Every read goes to the shared
/// store; nothing is cached locally.
#[derive(Clone)]
pub struct MembershipTracker {
    store: Arc<dyn SharedStore>,
}

impl MembershipTracker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Returns true when `room` is new for this connection.
    pub async fn record_join(&self, conn_id: &str, room: &str) -> Result<bool> {
        self.store.set_add(&connection_key(conn_id), room).await
    }

    pub async fn list_rooms(&self, conn_id: &str) -> Result<HashSet<String>> {
        self.store.set_members(&connection_key(conn_id)).await
    }

    pub async fn forget(&self, conn_id: &str, room: &str) -> Result<()> {
        self.store.set_remove(&connection_key(conn_id), room).await
    }

    pub async fn clear(&self, conn_id: &str) -> Result<()> {
        self.store.delete(&connection_key(conn_id)).await
    }
}
