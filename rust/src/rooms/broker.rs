// =============================================================================
// Room subscription broker.
//
// Cluster-wide arbitration of one upstream subscription per room:
//   - join: snapshot subscribed-rooms, record membership, bump the room's
//     reference count, subscribe upstream when the room was not yet held
//   - leave: read + clear the connection's rooms, then release every room
//     concurrently; a count at or below zero drops the entry and unsubscribes
//
// Neither path is transactional across instances. Two instances racing on
// the same room's first join may both subscribe, and two racing on the last
// leave may both unsubscribe. Both are tolerated upstream. `Arbitration::Counter`
// narrows the first-join window using the atomic increment result.
// =============================================================================

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use super::bus::ChannelBus;
use super::membership::MembershipTracker;
use super::router::FanoutRouter;
use super::store::SharedStore;
use crate::error::{BrokerError, Result};

pub const ROOM_CONNECTIONS_KEY: &str = "room-connections";
pub const SUBSCRIBED_ROOMS_KEY: &str = "subscribed-rooms";

/// Derived view of a room, computed from its reference count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomState {
    Empty,
    Active(u64),
}

impl RoomState {
    /// Counts at or below zero are empty; over-decrement from a lost
    /// increment is absorbed here.
    pub fn from_count(count: i64) -> Self {
        if count > 0 {
            Self::Active(count as u64)
        } else {
            Self::Empty
        }
    }
}

/// How a join decides that it must create the upstream subscription.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Arbitration {
    /// Subscribe when the room was absent from the subscribed-rooms snapshot
    /// read at the start of the join.
    #[default]
    Snapshot,
    /// Subscribe when the post-increment count is 1, or when the room is
    /// still absent from subscribed-rooms re-read after the increment.
    Counter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinOutcome {
    pub count: i64,
    pub subscribed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomRelease {
    /// Other members remain.
    Retained(u64),
    /// Last member left; the upstream subscription was released.
    Released,
    /// A store or bus step failed; already logged.
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaveReport {
    pub rooms: Vec<(String, RoomRelease)>,
}

impl LeaveReport {
    pub fn released(&self) -> impl Iterator<Item = &str> {
        self.rooms
            .iter()
            .filter(|(_, r)| *r == RoomRelease::Released)
            .map(|(room, _)| room.as_str())
    }

    pub fn failures(&self) -> usize {
        self.rooms
            .iter()
            .filter(|(_, r)| *r == RoomRelease::Failed)
            .count()
    }
}

pub struct RoomBroker {
    store: Arc<dyn SharedStore>,
    bus: Arc<dyn ChannelBus>,
    router: Arc<FanoutRouter>,
    membership: MembershipTracker,
    arbitration: Arbitration,
    /// Serializes join/leave per local connection so a disconnect never
    /// overtakes a join that is still writing to the store.
    conn_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl RoomBroker {
    pub fn new(
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn ChannelBus>,
        router: Arc<FanoutRouter>,
        arbitration: Arbitration,
    ) -> Self {
        Self {
            membership: MembershipTracker::new(store.clone()),
            store,
            bus,
            router,
            arbitration,
            conn_locks: DashMap::new(),
        }
    }

    pub fn router(&self) -> &Arc<FanoutRouter> {
        &self.router
    }

    pub fn membership(&self) -> &MembershipTracker {
        &self.membership
    }

    fn conn_lock(&self, conn_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.conn_locks
            .entry(conn_id.to_owned())
            .or_default()
            .clone()
    }

    pub async fn room_state(&self, room: &str) -> Result<RoomState> {
        let count = self.store.hash_get(ROOM_CONNECTIONS_KEY, room).await?;
        Ok(RoomState::from_count(count.unwrap_or(0)))
    }

    /// Join `conn_id` to `room`. A store failure aborts the join at that step,
    /// undoes the local membership and is returned; a subscribe failure is
    /// logged and leaves the room unrecorded so a later join retries it.
    ///
    /// Joining a room the connection already holds changes nothing and
    /// reports the current count.
    pub async fn join(&self, conn_id: &str, room: &str) -> Result<JoinOutcome> {
        let lock = self.conn_lock(conn_id);
        let _guard = lock.lock().await;
        if !self.router.is_connected(conn_id) {
            return Err(BrokerError::ConnectionClosed(conn_id.to_owned()));
        }

        let subscribed = self.store.set_members(SUBSCRIBED_ROOMS_KEY).await?;
        let already_local = self.router.is_member(conn_id, room);
        self.router.add_member(conn_id, room);
        let newly_joined = match self.membership.record_join(conn_id, room).await {
            Ok(added) => added,
            Err(e) => {
                if !already_local {
                    self.router.remove_member(conn_id, room);
                }
                return Err(e);
            }
        };
        if !newly_joined {
            let count = self
                .store
                .hash_get(ROOM_CONNECTIONS_KEY, room)
                .await?
                .unwrap_or(0);
            debug!(conn_id, room, count, "room already joined");
            return Ok(JoinOutcome {
                count,
                subscribed: false,
            });
        }

        let count = match self
            .store
            .hash_increment(ROOM_CONNECTIONS_KEY, room, 1)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                self.undo_join(conn_id, room).await;
                return Err(e);
            }
        };

        let needs_subscribe = match self.arbitration {
            Arbitration::Snapshot => !subscribed.contains(room),
            Arbitration::Counter => {
                count == 1
                    || (!subscribed.contains(room)
                        && !self
                            .store
                            .set_members(SUBSCRIBED_ROOMS_KEY)
                            .await?
                            .contains(room))
            }
        };
        debug!(conn_id, room, count, needs_subscribe, "room joined");

        let subscribed = needs_subscribe && self.subscribe_room(room).await;
        Ok(JoinOutcome { count, subscribed })
    }

    /// Roll back a join whose count was never bumped.
    async fn undo_join(&self, conn_id: &str, room: &str) {
        self.router.remove_member(conn_id, room);
        if let Err(e) = self.membership.forget(conn_id, room).await {
            error!(conn_id, room, error = %e, "failed to roll back joined room");
        }
    }

    async fn subscribe_room(&self, room: &str) -> bool {
        if let Err(e) = self.bus.subscribe(room).await {
            error!(room, error = %e, "upstream subscribe failed");
            return false;
        }
        if let Err(e) = self.store.set_add(SUBSCRIBED_ROOMS_KEY, room).await {
            error!(room, error = %e, "subscribed upstream but failed to record it");
            return false;
        }
        info!(room, "subscribed to room");
        true
    }

    /// Release every room `conn_id` joined. Safe to call more than once: the
    /// membership entry is cleared before any count is touched, so a repeat
    /// call finds nothing to release.
    pub async fn leave(&self, conn_id: &str) -> LeaveReport {
        let lock = self.conn_lock(conn_id);
        let report = {
            let _guard = lock.lock().await;
            self.router.unregister(conn_id);
            self.release_all(conn_id).await
        };
        self.conn_locks
            .remove_if(conn_id, |_, l| Arc::ptr_eq(l, &lock));
        report
    }

    async fn release_all(&self, conn_id: &str) -> LeaveReport {
        let rooms = match self.membership.list_rooms(conn_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                error!(conn_id, error = %e, "failed to read joined rooms on disconnect");
                return LeaveReport::default();
            }
        };
        if rooms.is_empty() {
            return LeaveReport::default();
        }
        if let Err(e) = self.membership.clear(conn_id).await {
            // Decrementing without clearing would let a repeated leave
            // decrement again.
            error!(conn_id, error = %e, "failed to clear joined rooms on disconnect");
            return LeaveReport::default();
        }

        let releases = rooms.into_iter().map(|room| async move {
            let outcome = self.release_room(&room).await;
            (room, outcome)
        });
        let report = LeaveReport {
            rooms: join_all(releases).await,
        };
        if report.failures() > 0 {
            warn!(
                conn_id,
                failed = report.failures(),
                total = report.rooms.len(),
                "disconnect cleanup incomplete"
            );
        }
        report
    }

    async fn release_room(&self, room: &str) -> RoomRelease {
        let remaining = match self
            .store
            .hash_increment(ROOM_CONNECTIONS_KEY, room, -1)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                error!(room, error = %e, "failed to decrement room count");
                return RoomRelease::Failed;
            }
        };

        if let RoomState::Active(n) = RoomState::from_count(remaining) {
            return RoomRelease::Retained(n);
        }

        if let Err(e) = self.store.hash_delete(ROOM_CONNECTIONS_KEY, room).await {
            error!(room, error = %e, "failed to drop empty room count");
            return RoomRelease::Failed;
        }
        if let Err(e) = self.bus.unsubscribe(room).await {
            error!(room, error = %e, "upstream unsubscribe failed");
            return RoomRelease::Failed;
        }
        if let Err(e) = self.store.set_remove(SUBSCRIBED_ROOMS_KEY, room).await {
            error!(room, error = %e, "unsubscribed upstream but failed to record it");
            return RoomRelease::Failed;
        }
        info!(room, "unsubscribed from room");
        RoomRelease::Released
    }

    /// Publish a payload to a room's upstream channel (producer side).
    pub async fn publish(&self, room: &str, payload: &str) -> Result<()> {
        self.bus.publish(room, payload).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
