use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sealgram_storage::{PresenceRecord, Storage, StorageError};
use std::sync::Arc;
use tracing::warn;

/// Persistence seam for presence. The live state goes to Redis with a TTL so
/// a crashed server cannot leave a user permanently online; the last-seen
/// stamp goes to PostgreSQL.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn write_presence(
        &self,
        user_id: i64,
        state: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
    async fn publish_presence(
        &self,
        user_id: i64,
        state: &str,
        ttl_seconds: i64,
    ) -> Result<(), StorageError>;
    async fn read_live_presence(&self, user_id: i64) -> Result<Option<String>, StorageError>;
    async fn load_presence(&self, user_id: i64) -> Result<Option<PresenceRecord>, StorageError>;
}

#[async_trait]
impl PresenceStore for Storage {
    async fn write_presence(
        &self,
        user_id: i64,
        state: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Storage::write_presence(self, user_id, state, last_seen_at).await
    }

    async fn publish_presence(
        &self,
        user_id: i64,
        state: &str,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        Storage::publish_presence(self, user_id, state, ttl_seconds).await
    }

    async fn read_live_presence(&self, user_id: i64) -> Result<Option<String>, StorageError> {
        Storage::read_live_presence(self, user_id).await
    }

    async fn load_presence(&self, user_id: i64) -> Result<Option<PresenceRecord>, StorageError> {
        Storage::load_presence(self, user_id).await
    }
}

pub struct PresenceSnapshot {
    pub state: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    ttl_seconds: i64,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    /// Marks a user online. Presence failures are logged, never fatal to the
    /// connection that reported them.
    pub async fn mark_online(&self, user_id: i64) {
        if let Err(err) = self
            .store
            .publish_presence(user_id, "online", self.ttl_seconds)
            .await
        {
            warn!(user_id, "presence publish failed: {}", err);
        }
        if let Err(err) = self.store.write_presence(user_id, "online", Utc::now()).await {
            warn!(user_id, "presence persist failed: {}", err);
        }
    }

    /// Refreshes the live TTL for a user with an active connection.
    pub async fn refresh(&self, user_id: i64) {
        if let Err(err) = self
            .store
            .publish_presence(user_id, "online", self.ttl_seconds)
            .await
        {
            warn!(user_id, "presence refresh failed: {}", err);
        }
    }

    /// Marks a user offline and records the last-seen stamp.
    pub async fn mark_offline(&self, user_id: i64) {
        let now = Utc::now();
        if let Err(err) = self.store.publish_presence(user_id, "offline", 1).await {
            warn!(user_id, "presence publish failed: {}", err);
        }
        if let Err(err) = self.store.write_presence(user_id, "offline", now).await {
            warn!(user_id, "presence persist failed: {}", err);
        }
    }

    /// Resolves a user's presence, preferring the live Redis entry and
    /// falling back to the persisted last-seen row.
    pub async fn snapshot(&self, user_id: i64) -> Result<PresenceSnapshot, StorageError> {
        if let Some(state) = self.store.read_live_presence(user_id).await? {
            if state == "online" {
                return Ok(PresenceSnapshot {
                    state,
                    last_seen_at: None,
                });
            }
        }
        let persisted = self.store.load_presence(user_id).await?;
        Ok(match persisted {
            Some(record) => PresenceSnapshot {
                state: "offline".to_string(),
                last_seen_at: Some(record.last_seen_at),
            },
            None => PresenceSnapshot {
                state: "offline".to_string(),
                last_seen_at: None,
            },
        })
    }
}
