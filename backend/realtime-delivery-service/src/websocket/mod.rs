use crate::services::presence::PresenceStore;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod connection;
pub mod fanout;
pub mod message_types;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionWriteFailed, Frame, WriteFailure};
pub use fanout::{FanoutReport, PresenceAwareFanout};

// Bound on write/re-check cycles under connect churn; the periodic refresh
// corrects anything left over
const PRESENCE_SYNC_ROUNDS: usize = 4;

/// Outcome of pushing one frame to a set of users.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Successful connection writes
    pub delivered: usize,
    /// Failed writes; those connections are no longer registered
    pub failed: Vec<ConnectionWriteFailed>,
    /// Users that had no connection on this instance
    pub skipped: usize,
}

/// Process-local map from online user to their open connections.
///
/// Entries live in a sharded map so pushes to unrelated users never contend
/// on the same lock. No shard guard is held across an `.await`: presence
/// updates run after the entry has been released.
#[derive(Clone)]
pub struct ConnectionRegistry {
    // user_id -> live connections of that user
    connections: Arc<DashMap<Uuid, Vec<ConnectionHandle>>>,
    presence: Arc<dyn PresenceStore>,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<dyn PresenceStore>) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            presence,
        }
    }

    /// Add a connection. The first connection of a user marks them online;
    /// a presence failure is logged and does not prevent registration.
    pub async fn register(&self, handle: ConnectionHandle) {
        let user_id = handle.user_id();
        let connection_id = handle.id();

        let total = {
            let mut entry = self.connections.entry(user_id).or_insert_with(Vec::new);
            entry.push(handle);
            entry.len()
        };

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            connections = total,
            "connection registered"
        );

        if total == 1 {
            self.sync_presence(user_id, true).await;
        }
    }

    /// Remove one connection. Returns `false` if it was not registered.
    ///
    /// Safe to call from every exit path of a connection, repeated calls are
    /// no-ops. The user is marked offline once their last connection is gone.
    pub async fn unregister(&self, user_id: Uuid, connection_id: ConnectionId) -> bool {
        let (removed, now_empty) = match self.connections.get_mut(&user_id) {
            Some(mut conns) => {
                let before = conns.len();
                conns.retain(|c| c.id() != connection_id);
                (before != conns.len(), conns.is_empty())
            }
            None => (false, false),
        };

        if !removed {
            return false;
        }

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            "connection unregistered"
        );

        if now_empty
            && self
                .connections
                .remove_if(&user_id, |_, conns| conns.is_empty())
                .is_some()
        {
            self.sync_presence(user_id, false).await;
        }
        true
    }

    /// Non-blocking write of `frame` to every connection of `user_id`.
    ///
    /// A failed write removes that connection and does not stop delivery to
    /// the user's other connections.
    pub async fn push(&self, user_id: Uuid, frame: &Frame) -> Vec<ConnectionWriteFailed> {
        self.push_counted(user_id, frame).await.1
    }

    /// [`push`](Self::push) for each user in `member_ids`.
    pub async fn broadcast_to_members(&self, member_ids: &[Uuid], frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for user_id in member_ids {
            let (delivered, failed) = self.push_counted(*user_id, frame).await;
            if delivered == 0 && failed.is_empty() {
                report.skipped += 1;
            }
            report.delivered += delivered;
            report.failed.extend(failed);
        }
        report
    }

    async fn push_counted(
        &self,
        user_id: Uuid,
        frame: &Frame,
    ) -> (usize, Vec<ConnectionWriteFailed>) {
        // Writes happen on a snapshot so the shard is released before any await
        let targets: Vec<ConnectionHandle> = match self.connections.get(&user_id) {
            Some(conns) => conns.value().clone(),
            None => return (0, Vec::new()),
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for handle in &targets {
            match handle.try_write(frame) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push(e),
            }
        }

        for failure in &failed {
            tracing::warn!(
                user_id = %failure.user_id,
                connection_id = %failure.connection_id,
                reason = %failure.reason,
                "dropping connection after failed write"
            );
            self.unregister(failure.user_id, failure.connection_id).await;
        }

        (delivered, failed)
    }

    /// Number of connections held for `user_id` (for debugging/metrics)
    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.connections
            .get(&user_id)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connection_count(user_id) > 0
    }

    /// Users with at least one connection on this instance.
    pub fn online_users(&self) -> Vec<Uuid> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Write presence, then re-check the registry: a connect or disconnect
    /// that raced with the write gets the last word.
    async fn sync_presence(&self, user_id: Uuid, mut online: bool) {
        for _ in 0..PRESENCE_SYNC_ROUNDS {
            let result = if online {
                self.presence.set_online(user_id).await
            } else {
                self.presence.set_offline(user_id).await
            };
            if let Err(e) = result {
                tracing::warn!(user_id = %user_id, online, error = %e, "failed to update presence");
                return;
            }

            let now_online = self.is_online(user_id);
            if now_online == online {
                return;
            }
            online = now_online;
        }
    }
}
