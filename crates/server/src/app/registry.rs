use sealgram_proto::ServerFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Outbound queue depth per connection. A device that stops draining its
/// socket loses frames from the live path; the store keeps them pending.
pub const CONNECTION_QUEUE_DEPTH: usize = 128;

struct ConnectionEntry {
    sender: mpsc::Sender<ServerFrame>,
    connection_id: u64,
}

/// Live connections keyed by `(user_id, device_id)`. A second connection for
/// the same device replaces the first; the displaced sender is dropped, which
/// closes the old session loop.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<(i64, i64), ConnectionEntry>>,
    next_connection: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns its identifier. The identifier is
    /// required for unregistration so a stale session cannot evict its
    /// replacement.
    pub async fn register(
        &self,
        user_id: i64,
        device_id: i64,
        sender: mpsc::Sender<ServerFrame>,
    ) -> u64 {
        let connection_id = self.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        let mut connections = self.connections.write().await;
        if let Some(previous) = connections.insert(
            (user_id, device_id),
            ConnectionEntry {
                sender,
                connection_id,
            },
        ) {
            debug!(
                user_id,
                device_id,
                replaced = previous.connection_id,
                "connection replaced"
            );
        }
        connection_id
    }

    /// Removes a connection if it is still the registered one for the device.
    pub async fn unregister(&self, user_id: i64, device_id: i64, connection_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&(user_id, device_id)) {
            Some(entry) if entry.connection_id == connection_id => {
                connections.remove(&(user_id, device_id));
                true
            }
            _ => false,
        }
    }

    /// Sends a frame to one device. Returns false when the device is offline
    /// or its queue is saturated; a saturated queue is treated as a miss so
    /// the caller never waits on a stalled socket.
    pub async fn send_to_device(&self, user_id: i64, device_id: i64, frame: ServerFrame) -> bool {
        let sender = {
            let connections = self.connections.read().await;
            connections
                .get(&(user_id, device_id))
                .map(|entry| entry.sender.clone())
        };
        match sender {
            Some(sender) => sender.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Fans a frame out to every connected device of a user and returns the
    /// number of accepted sends. Saturated queues count as misses, so one
    /// stalled device cannot hold up the fan-out.
    pub async fn send_to_user(&self, user_id: i64, frame: ServerFrame) -> usize {
        let senders: Vec<mpsc::Sender<ServerFrame>> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|((user, _), _)| *user == user_id)
                .map(|(_, entry)| entry.sender.clone())
                .collect()
        };
        let mut delivered = 0;
        for sender in senders {
            if sender.try_send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Lists device ids of a user with a live connection.
    pub async fn online_devices(&self, user_id: i64) -> Vec<i64> {
        let connections = self.connections.read().await;
        connections
            .keys()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, device)| *device)
            .collect()
    }

    /// Drops a device's connection unconditionally. Used when the device is
    /// revoked; the session loop observes its sender closing and exits.
    pub async fn evict(&self, user_id: i64, device_id: i64) -> bool {
        self.connections
            .write()
            .await
            .remove(&(user_id, device_id))
            .is_some()
    }

    pub async fn is_user_online(&self, user_id: i64) -> bool {
        let connections = self.connections.read().await;
        connections.keys().any(|(user, _)| *user == user_id)
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
