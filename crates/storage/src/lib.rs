use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::warn;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");
const LINKING_CODE_LENGTH: usize = 8;
const LINKING_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const LINKING_TTL_MIN: i64 = 60;
const LINKING_TTL_MAX: i64 = 3600;

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Serialization,
    Missing,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub user_id: i64,
    pub device_id: i64,
    pub device_name: String,
    pub bundle: Option<Value>,
    pub push_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePrekey {
    pub key_id: i64,
    pub public_key: String,
}

/// One device's share of a bundle-fetch response. The one-time prekey is
/// absent when the pool ran dry; the bundle stays usable without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBundle {
    pub device_id: i64,
    pub bundle: Value,
    pub one_time_prekey: Option<OneTimePrekey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: i64,
    pub recipient_id: i64,
    pub recipient_device_id: i64,
    pub group_id: Option<i64>,
    pub ciphertext: String,
    pub message_type: String,
    pub parent_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: i64,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub recipient_device_id: i64,
    pub group_id: Option<i64>,
    pub ciphertext: String,
    pub message_type: String,
    pub status: String,
    pub parent_id: Option<i64>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub deleted_for_all: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkingSessionRecord {
    pub linking_code: String,
    pub ephemeral_public_key: String,
    pub status: String,
    pub provisioning_payload: Option<String>,
    pub user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: i64,
    pub device_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: i64,
    pub state: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    pub message_id: i64,
    pub user_id: i64,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str = "message_id, sender_id, recipient_id, recipient_device_id, group_id, \
    ciphertext, message_type, status, parent_id, is_edited, is_deleted, deleted_for_all, \
    created_at, expires_at";

fn message_from_row(row: &tokio_postgres::Row) -> MessageRecord {
    MessageRecord {
        message_id: row.get(0),
        sender_id: row.get(1),
        recipient_id: row.get(2),
        recipient_device_id: row.get(3),
        group_id: row.get(4),
        ciphertext: row.get(5),
        message_type: row.get(6),
        status: row.get(7),
        parent_id: row.get(8),
        is_edited: row.get(9),
        is_deleted: row.get(10),
        deleted_for_all: row.get(11),
        created_at: row.get(12),
        expires_at: row.get(13),
    }
}

fn device_from_row(row: &tokio_postgres::Row) -> DeviceRecord {
    DeviceRecord {
        user_id: row.get(0),
        device_id: row.get(1),
        device_name: row.get(2),
        bundle: row.get(3),
        push_token: row.get(4),
        created_at: row.get(5),
    }
}

fn linking_from_row(row: &tokio_postgres::Row) -> LinkingSessionRecord {
    LinkingSessionRecord {
        linking_code: row.get(0),
        ephemeral_public_key: row.get(1),
        status: row.get(2),
        provisioning_payload: row.get(3),
        user_id: row.get(4),
        created_at: row.get(5),
        expires_at: row.get(6),
    }
}

/// Establishes connectivity to PostgreSQL and Redis backends.
pub async fn connect(postgres_dsn: &str, redis_url: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    let redis_client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let redis_connection = redis_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        client,
        _pg_task: task,
        redis: Arc::new(Mutex::new(redis_connection)),
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Executes lightweight probes across PostgreSQL and Redis.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut conn = self.redis.lock().await;
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Upserts a device's key bundle and appends new one-time prekeys to its
    /// pool. Re-uploads never remove unconsumed keys.
    pub async fn upsert_bundle(
        &self,
        user_id: i64,
        device_id: i64,
        device_name: Option<&str>,
        bundle: &Value,
        prekeys: &[OneTimePrekey],
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO user_device (user_id, device_id, device_name, bundle, created_at)
                VALUES ($1, $2, COALESCE($3, 'Primary Device'), $4, $5)
                ON CONFLICT (user_id, device_id) DO UPDATE
                SET bundle = excluded.bundle,
                    device_name = COALESCE($3, user_device.device_name)",
                &[&user_id, &device_id, &device_name, &bundle, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if prekeys.is_empty() {
            return Ok(());
        }
        let key_ids: Vec<i64> = prekeys.iter().map(|k| k.key_id).collect();
        let public_keys: Vec<String> = prekeys.iter().map(|k| k.public_key.clone()).collect();
        self.client
            .execute(
                "INSERT INTO one_time_prekey (user_id, device_id, key_id, public_key)
                SELECT $1, $2, t.key_id, t.public_key
                FROM UNNEST($3::BIGINT[], $4::TEXT[]) AS t(key_id, public_key)
                ON CONFLICT (user_id, device_id, key_id) DO NOTHING",
                &[&user_id, &device_id, &key_ids, &public_keys],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Fetches device metadata by identifier.
    pub async fn load_device(
        &self,
        user_id: i64,
        device_id: i64,
    ) -> Result<DeviceRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT user_id, device_id, device_name, bundle, push_token, created_at
                FROM user_device WHERE user_id = $1 AND device_id = $2",
                &[&user_id, &device_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(device_from_row(&row))
    }

    /// Lists devices registered for a user ordered by creation time.
    pub async fn list_devices(&self, user_id: i64) -> Result<Vec<DeviceRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT user_id, device_id, device_name, bundle, push_token, created_at
                FROM user_device WHERE user_id = $1 ORDER BY created_at ASC",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(device_from_row).collect())
    }

    /// Stores or clears the push token used for offline notification.
    pub async fn set_push_token(
        &self,
        user_id: i64,
        device_id: i64,
        push_token: Option<&str>,
    ) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE user_device SET push_token = $3 WHERE user_id = $1 AND device_id = $2",
                &[&user_id, &device_id, &push_token],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Reads the push token of one device, if registered.
    pub async fn load_push_token(
        &self,
        user_id: i64,
        device_id: i64,
    ) -> Result<Option<String>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT push_token FROM user_device WHERE user_id = $1 AND device_id = $2",
                &[&user_id, &device_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.and_then(|row| row.get(0)))
    }

    /// Picks one push token for a user, preferring the newest device.
    pub async fn load_push_token_for_user(
        &self,
        user_id: i64,
    ) -> Result<Option<String>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT push_token FROM user_device
                WHERE user_id = $1 AND push_token IS NOT NULL
                ORDER BY created_at DESC LIMIT 1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| row.get(0)))
    }

    /// Deletes a device and cascades its remaining one-time prekey pool.
    pub async fn revoke_device(&self, user_id: i64, device_id: i64) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute(
                "DELETE FROM user_device WHERE user_id = $1 AND device_id = $2",
                &[&user_id, &device_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Pops one one-time prekey from a device pool. The select-and-delete is
    /// a single statement so concurrent fetches never receive the same key.
    pub async fn take_one_time_prekey(
        &self,
        user_id: i64,
        device_id: i64,
    ) -> Result<Option<OneTimePrekey>, StorageError> {
        let row = self
            .client
            .query_opt(
                "DELETE FROM one_time_prekey
                WHERE otpk_id = (
                    SELECT otpk_id FROM one_time_prekey
                    WHERE user_id = $1 AND device_id = $2
                    ORDER BY key_id ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING key_id, public_key",
                &[&user_id, &device_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| OneTimePrekey {
            key_id: row.get(0),
            public_key: row.get(1),
        }))
    }

    /// Counts unconsumed one-time prekeys in a device pool.
    pub async fn count_one_time_prekeys(
        &self,
        user_id: i64,
        device_id: i64,
    ) -> Result<i64, StorageError> {
        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) FROM one_time_prekey WHERE user_id = $1 AND device_id = $2",
                &[&user_id, &device_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.get(0))
    }

    /// Assembles the bundle response for every device of a user, popping one
    /// one-time prekey per device. Fails with Missing only when no device has
    /// a stored bundle at all. A pop failure degrades that device to a bundle
    /// without a one-time prekey; keys already popped for earlier devices are
    /// still served rather than consumed for nobody.
    pub async fn fetch_bundles(&self, user_id: i64) -> Result<Vec<DeviceBundle>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT device_id, bundle FROM user_device
                WHERE user_id = $1 AND bundle IS NOT NULL
                ORDER BY device_id ASC",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if rows.is_empty() {
            return Err(StorageError::Missing);
        }
        let mut bundles = Vec::with_capacity(rows.len());
        for row in rows {
            let device_id: i64 = row.get(0);
            let bundle: Value = row.get(1);
            let one_time_prekey = match self.take_one_time_prekey(user_id, device_id).await {
                Ok(key) => key,
                Err(err) => {
                    warn!(user_id, device_id, "one-time prekey pop failed: {}", err);
                    None
                }
            };
            bundles.push(DeviceBundle {
                device_id,
                bundle,
                one_time_prekey,
            });
        }
        Ok(bundles)
    }

    /// Persists an envelope with status `pending` and returns the stored row.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord, StorageError> {
        let query = format!(
            "INSERT INTO message (sender_id, recipient_id, recipient_device_id, group_id, \
            ciphertext, message_type, parent_id, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row = self
            .client
            .query_one(
                &query,
                &[
                    &message.sender_id,
                    &message.recipient_id,
                    &message.recipient_device_id,
                    &message.group_id,
                    &message.ciphertext,
                    &message.message_type,
                    &message.parent_id,
                    &message.expires_at,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(message_from_row(&row))
    }

    /// Loads a persisted message by identifier.
    pub async fn load_message(&self, message_id: i64) -> Result<MessageRecord, StorageError> {
        let query = format!("SELECT {} FROM message WHERE message_id = $1", MESSAGE_COLUMNS);
        let row = self
            .client
            .query_opt(&query, &[&message_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(message_from_row(&row))
    }

    /// Transitions a pending message to `delivered`. Returns false when the
    /// message already advanced past `pending`.
    pub async fn mark_delivered(&self, message_id: i64) -> Result<bool, StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE message SET status = 'delivered'
                WHERE message_id = $1 AND status = 'pending'",
                &[&message_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected == 1)
    }

    /// Applies a monotonic status transition (`pending -> delivered -> read`)
    /// reported by the message's recipient. A report from anyone else, or a
    /// transition that would regress, is ignored and yields None.
    pub async fn update_message_status(
        &self,
        message_id: i64,
        recipient_id: i64,
        status: &str,
    ) -> Result<Option<MessageRecord>, StorageError> {
        if status != "delivered" && status != "read" {
            return Err(StorageError::Invalid);
        }
        let query = format!(
            "UPDATE message SET status = $3
            WHERE message_id = $1
              AND recipient_id = $2
              AND CASE $3::TEXT
                  WHEN 'delivered' THEN status = 'pending'
                  WHEN 'read' THEN status IN ('pending', 'delivered')
                  ELSE FALSE
              END
            RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row = self
            .client
            .query_opt(&query, &[&message_id, &recipient_id, &status])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| message_from_row(&row)))
    }

    /// Lists undelivered, unexpired messages for a device, including
    /// group-wide rows addressed to every device of the user.
    pub async fn pending_messages_for_device(
        &self,
        user_id: i64,
        device_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let query = format!(
            "SELECT {} FROM message
            WHERE recipient_id = $1
              AND (recipient_device_id = $2 OR recipient_device_id = 0)
              AND status = 'pending'
              AND (expires_at IS NULL OR expires_at > now())
            ORDER BY message_id ASC
            LIMIT $3",
            MESSAGE_COLUMNS
        );
        let rows = self
            .client
            .query(&query, &[&user_id, &device_id, &limit])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Replaces the ciphertext of a sender's own message and resets its
    /// status to `pending` to force redelivery.
    pub async fn edit_message(
        &self,
        message_id: i64,
        sender_id: i64,
        ciphertext: &str,
    ) -> Result<MessageRecord, StorageError> {
        let query = format!(
            "UPDATE message
            SET ciphertext = $3, is_edited = TRUE, status = 'pending'
            WHERE message_id = $1 AND sender_id = $2 AND deleted_for_all = FALSE
            RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row = self
            .client
            .query_opt(&query, &[&message_id, &sender_id, &ciphertext])
            .await
            .map_err(|_| StorageError::Postgres)?;
        row.map(|row| message_from_row(&row))
            .ok_or(StorageError::Missing)
    }

    /// Wipes the ciphertext of a sender's own message and resets its status
    /// so the tombstone propagates to recipients.
    pub async fn delete_message_for_all(
        &self,
        message_id: i64,
        sender_id: i64,
    ) -> Result<MessageRecord, StorageError> {
        let query = format!(
            "UPDATE message
            SET ciphertext = '', is_deleted = TRUE, deleted_for_all = TRUE, status = 'pending'
            WHERE message_id = $1 AND sender_id = $2
            RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row = self
            .client
            .query_opt(&query, &[&message_id, &sender_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        row.map(|row| message_from_row(&row))
            .ok_or(StorageError::Missing)
    }

    /// Removes messages whose relay expiry elapsed.
    pub async fn purge_expired_messages(&self) -> Result<u64, StorageError> {
        self.client
            .execute(
                "DELETE FROM message WHERE expires_at IS NOT NULL AND expires_at <= now()",
                &[],
            )
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Adds or updates group membership information.
    pub async fn add_group_member(
        &self,
        group_id: i64,
        user_id: i64,
        role: &str,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO group_member (group_id, user_id, role, joined_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (group_id, user_id) DO UPDATE SET role = excluded.role",
                &[&group_id, &user_id, &role, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Removes a member from the given group.
    pub async fn remove_group_member(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute(
                "DELETE FROM group_member WHERE group_id = $1 AND user_id = $2",
                &[&group_id, &user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Resolves the member list of a group ordered by join time.
    pub async fn list_group_member_ids(&self, group_id: i64) -> Result<Vec<i64>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT user_id FROM group_member WHERE group_id = $1 ORDER BY joined_at ASC",
                &[&group_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Creates a pending linking session keyed by a fresh short code.
    pub async fn create_linking_session(
        &self,
        ephemeral_public_key: &str,
        ttl_seconds: i64,
    ) -> Result<LinkingSessionRecord, StorageError> {
        let ttl = ttl_seconds.clamp(LINKING_TTL_MIN, LINKING_TTL_MAX);
        let created_at = Utc::now();
        let expires_at = created_at + Duration::seconds(ttl);
        for _ in 0..16 {
            let code = generate_linking_code();
            let inserted = self
                .client
                .execute(
                    "INSERT INTO linking_session
                    (linking_code, ephemeral_public_key, status, created_at, expires_at)
                    VALUES ($1, $2, 'pending', $3, $4)
                    ON CONFLICT (linking_code) DO NOTHING",
                    &[&code, &ephemeral_public_key, &created_at, &expires_at],
                )
                .await
                .map_err(|_| StorageError::Postgres)?;
            if inserted == 1 {
                return Ok(LinkingSessionRecord {
                    linking_code: code,
                    ephemeral_public_key: ephemeral_public_key.to_string(),
                    status: "pending".to_string(),
                    provisioning_payload: None,
                    user_id: None,
                    created_at,
                    expires_at,
                });
            }
        }
        Err(StorageError::Postgres)
    }

    /// Loads a linking session by code; expired sessions read as missing.
    pub async fn load_linking_session(
        &self,
        code: &str,
    ) -> Result<LinkingSessionRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT linking_code, ephemeral_public_key, status, provisioning_payload,
                        user_id, created_at, expires_at
                FROM linking_session
                WHERE linking_code = $1 AND expires_at > now()",
                &[&code],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(linking_from_row(&row))
    }

    /// Approves a pending linking session exactly once. A second approval on
    /// the same code fails with Invalid and leaves the payload untouched.
    pub async fn approve_linking_session(
        &self,
        code: &str,
        user_id: i64,
        provisioning_payload: &str,
    ) -> Result<LinkingSessionRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "UPDATE linking_session
                SET status = 'approved', user_id = $2, provisioning_payload = $3
                WHERE linking_code = $1 AND status = 'pending' AND expires_at > now()
                RETURNING linking_code, ephemeral_public_key, status, provisioning_payload,
                          user_id, created_at, expires_at",
                &[&code, &user_id, &provisioning_payload],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => Ok(linking_from_row(&row)),
            None => {
                let exists = self
                    .client
                    .query_opt(
                        "SELECT 1 FROM linking_session
                        WHERE linking_code = $1 AND expires_at > now()",
                        &[&code],
                    )
                    .await
                    .map_err(|_| StorageError::Postgres)?;
                if exists.is_some() {
                    Err(StorageError::Invalid)
                } else {
                    Err(StorageError::Missing)
                }
            }
        }
    }

    /// Removes linking sessions whose TTL elapsed.
    pub async fn purge_expired_linking_sessions(&self) -> Result<u64, StorageError> {
        self.client
            .execute("DELETE FROM linking_session WHERE expires_at <= now()", &[])
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Records an auth session binding a token to a user.
    pub async fn record_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO session (token, user_id, device_id, created_at, ttl_seconds)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (token) DO NOTHING",
                &[
                    &session.token,
                    &session.user_id,
                    &session.device_id,
                    &session.created_at,
                    &session.ttl_seconds,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Loads a persisted auth session by token.
    pub async fn load_session(&self, token: &str) -> Result<SessionRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT token, user_id, device_id, created_at, ttl_seconds
                FROM session WHERE token = $1",
                &[&token],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(SessionRecord {
            token: row.get(0),
            user_id: row.get(1),
            device_id: row.get(2),
            created_at: row.get(3),
            ttl_seconds: row.get(4),
        })
    }

    /// Persists a presence transition with its last-seen stamp.
    pub async fn write_presence(
        &self,
        user_id: i64,
        state: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO user_presence (user_id, state, last_seen_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id) DO UPDATE
                SET state = excluded.state, last_seen_at = excluded.last_seen_at",
                &[&user_id, &state, &last_seen_at],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Reads the persisted presence row for a user.
    pub async fn load_presence(&self, user_id: i64) -> Result<Option<PresenceRecord>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT user_id, state, last_seen_at FROM user_presence WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| PresenceRecord {
            user_id: row.get(0),
            state: row.get(1),
            last_seen_at: row.get(2),
        }))
    }

    /// Publishes ephemeral presence into Redis with a bounded TTL.
    pub async fn publish_presence(
        &self,
        user_id: i64,
        state: &str,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds.max(1));
        let payload = serde_json::json!({
            "state": state,
            "expires_at": expires_at.to_rfc3339(),
        })
        .to_string();
        redis::cmd("SETEX")
            .arg(format!("presence:{}", user_id))
            .arg(ttl_seconds.max(1) as usize)
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Reads live presence state from Redis, if still fresh.
    pub async fn read_live_presence(&self, user_id: i64) -> Result<Option<String>, StorageError> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(format!("presence:{}", user_id))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        match value {
            Some(json) => {
                let parsed: Value =
                    serde_json::from_str(&json).map_err(|_| StorageError::Serialization)?;
                Ok(parsed
                    .get("state")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Records a per-message reaction; repeated reactions are idempotent.
    pub async fn add_reaction(
        &self,
        message_id: i64,
        user_id: i64,
        emoji: &str,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO message_reaction (message_id, user_id, emoji, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
                &[&message_id, &user_id, &emoji, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Removes one user's reaction from a message.
    pub async fn remove_reaction(
        &self,
        message_id: i64,
        user_id: i64,
        emoji: &str,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "DELETE FROM message_reaction
                WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
                &[&message_id, &user_id, &emoji],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Lists reactions recorded for a message.
    pub async fn list_reactions(
        &self,
        message_id: i64,
    ) -> Result<Vec<ReactionRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT message_id, user_id, emoji, created_at
                FROM message_reaction WHERE message_id = $1 ORDER BY created_at ASC",
                &[&message_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| ReactionRecord {
                message_id: row.get(0),
                user_id: row.get(1),
                emoji: row.get(2),
                created_at: row.get(3),
            })
            .collect())
    }

    /// Stars a message for a user.
    pub async fn star_message(&self, message_id: i64, user_id: i64) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO starred_message (message_id, user_id, starred_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (message_id, user_id) DO NOTHING",
                &[&message_id, &user_id, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Removes a star mark.
    pub async fn unstar_message(&self, message_id: i64, user_id: i64) -> Result<(), StorageError> {
        self.client
            .execute(
                "DELETE FROM starred_message WHERE message_id = $1 AND user_id = $2",
                &[&message_id, &user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Lists identifiers of messages a user starred.
    pub async fn list_starred(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT message_id FROM starred_message
                WHERE user_id = $1 ORDER BY starred_at ASC",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

fn generate_linking_code() -> String {
    let mut seed = [0u8; LINKING_CODE_LENGTH];
    OsRng.fill_bytes(&mut seed);
    seed.iter()
        .map(|byte| LINKING_ALPHABET[(*byte as usize) % LINKING_ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("CREATE TABLE"));
        assert!(INIT_SQL.contains("user_device"));
        assert!(INIT_SQL.contains("one_time_prekey"));
        assert!(INIT_SQL.contains("message"));
        assert!(INIT_SQL.contains("group_member"));
        assert!(INIT_SQL.contains("linking_session"));
        assert!(INIT_SQL.contains("user_presence"));
    }

    #[test]
    fn otpk_pool_cascades_with_device() {
        assert!(INIT_SQL.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn linking_code_format() {
        let code = generate_linking_code();
        assert_eq!(code.len(), LINKING_CODE_LENGTH);
        assert!(code.bytes().all(|b| LINKING_ALPHABET.contains(&b)));
        assert_ne!(code, generate_linking_code());
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("SEALGRAM_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: SEALGRAM_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let redis_url = match std::env::var("SEALGRAM_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: SEALGRAM_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let storage = Arc::new(connect(&pg, &redis_url).await?);
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let user_id = suffix % 1_000_000_000;
        let peer_id = user_id + 1;

        // Bundle upload creates the device and seeds the pool additively.
        let bundle = serde_json::json!({
            "identity_key": "ik",
            "signed_prekey": "spk",
            "signature": "sig",
        });
        let pool: Vec<OneTimePrekey> = (1..=4)
            .map(|key_id| OneTimePrekey {
                key_id,
                public_key: format!("otpk-{}", key_id),
            })
            .collect();
        storage
            .upsert_bundle(user_id, 1, Some("laptop"), &bundle, &pool)
            .await?;
        storage.upsert_bundle(user_id, 1, None, &bundle, &pool).await?;
        assert_eq!(storage.count_one_time_prekeys(user_id, 1).await?, 4);

        // Concurrent pops never hand out the same key id.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                storage.take_one_time_prekey(user_id, 1).await
            }));
        }
        let mut issued = Vec::new();
        for handle in handles {
            if let Some(key) = handle.await?? {
                issued.push(key.key_id);
            }
        }
        issued.sort_unstable();
        assert_eq!(issued, vec![1, 2, 3, 4]);
        assert!(storage.take_one_time_prekey(user_id, 1).await?.is_none());

        // Empty pool degrades the fetch response instead of failing it.
        let bundles = storage.fetch_bundles(user_id).await?;
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].one_time_prekey.is_none());
        assert!(matches!(
            storage.fetch_bundles(peer_id).await,
            Err(StorageError::Missing)
        ));

        // Message lifecycle: pending, delivered, read, monotonic.
        let stored = storage
            .insert_message(&NewMessage {
                sender_id: peer_id,
                recipient_id: user_id,
                recipient_device_id: 1,
                group_id: None,
                ciphertext: "ct".to_string(),
                message_type: "message".to_string(),
                parent_id: None,
                expires_at: None,
            })
            .await?;
        assert_eq!(stored.status, "pending");
        assert!(storage.mark_delivered(stored.message_id).await?);
        assert!(!storage.mark_delivered(stored.message_id).await?);
        // Only the recipient may report a transition.
        assert!(
            storage
                .update_message_status(stored.message_id, peer_id, "read")
                .await?
                .is_none()
        );
        let read = storage
            .update_message_status(stored.message_id, user_id, "read")
            .await?
            .expect("read transition");
        assert_eq!(read.status, "read");
        assert!(
            storage
                .update_message_status(stored.message_id, user_id, "delivered")
                .await?
                .is_none()
        );

        // Edit resets status regardless of how far it advanced.
        let edited = storage
            .edit_message(stored.message_id, peer_id, "ct2")
            .await?;
        assert_eq!(edited.status, "pending");
        assert!(edited.is_edited);
        let deleted = storage
            .delete_message_for_all(stored.message_id, peer_id)
            .await?;
        assert!(deleted.ciphertext.is_empty());
        assert!(deleted.is_deleted && deleted.deleted_for_all);
        assert_eq!(deleted.status, "pending");

        let pending = storage
            .pending_messages_for_device(user_id, 1, 10)
            .await?;
        assert!(pending.iter().any(|m| m.message_id == stored.message_id));

        // Linking approval is exactly-once.
        let link = storage.create_linking_session("epk", 300).await?;
        assert_eq!(link.linking_code.len(), 8);
        let approved = storage
            .approve_linking_session(&link.linking_code, user_id, "payload")
            .await?;
        assert_eq!(approved.status, "approved");
        assert!(matches!(
            storage
                .approve_linking_session(&link.linking_code, peer_id, "other")
                .await,
            Err(StorageError::Invalid)
        ));
        let loaded = storage.load_linking_session(&link.linking_code).await?;
        assert_eq!(loaded.provisioning_payload.as_deref(), Some("payload"));

        // Presence persists and round-trips through Redis.
        storage.write_presence(user_id, "online", Utc::now()).await?;
        storage.publish_presence(user_id, "online", 30).await?;
        assert_eq!(
            storage.read_live_presence(user_id).await?.as_deref(),
            Some("online")
        );

        // Group roster mutations are idempotent and ordered by join time.
        let group_id = user_id + 40;
        storage.add_group_member(group_id, user_id, "admin").await?;
        storage.add_group_member(group_id, peer_id, "member").await?;
        storage.add_group_member(group_id, peer_id, "member").await?;
        assert_eq!(
            storage.list_group_member_ids(group_id).await?,
            vec![user_id, peer_id]
        );
        storage.remove_group_member(group_id, peer_id).await?;
        assert_eq!(
            storage.list_group_member_ids(group_id).await?,
            vec![user_id]
        );

        // Sessions round-trip and unknown tokens miss.
        let session = SessionRecord {
            token: format!("it-session-{}", user_id),
            user_id,
            device_id: Some(1),
            created_at: Utc::now(),
            ttl_seconds: 3600,
        };
        storage.record_session(&session).await?;
        let loaded = storage.load_session(&session.token).await?;
        assert_eq!(loaded.user_id, user_id);
        assert_eq!(loaded.device_id, Some(1));
        assert!(matches!(
            storage.load_session("no-such-token").await,
            Err(StorageError::Missing)
        ));

        // Revocation cascades the remaining pool.
        storage
            .upsert_bundle(
                user_id,
                2,
                None,
                &bundle,
                &[OneTimePrekey {
                    key_id: 1,
                    public_key: "x".to_string(),
                }],
            )
            .await?;
        storage.revoke_device(user_id, 2).await?;
        assert_eq!(storage.count_one_time_prekeys(user_id, 2).await?, 0);
        assert!(matches!(
            storage.revoke_device(user_id, 2).await,
            Err(StorageError::Missing)
        ));
        Ok(())
    }
}
