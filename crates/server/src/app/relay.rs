use super::push::{NotificationDispatcher, PushNotification};
use super::registry::ConnectionRegistry;
use crate::metrics::Metrics;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sealgram_proto::{
    DeleteFrame, DeliverFrame, EditFrame, GROUP_WIDE_DEVICE, MAX_CIPHERTEXT_LEN, MessageFrame,
    ReceiptFrame, ServerFrame, StatusFrame, TypingFrame, TypingNotice,
};
use sealgram_storage::{MessageRecord, NewMessage, Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum RelayError {
    Invalid(&'static str),
    Storage,
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(reason) => write!(f, "invalid relay request: {}", reason),
            Self::Storage => write!(f, "relay storage failure"),
        }
    }
}

impl Error for RelayError {}

impl From<StorageError> for RelayError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Missing => Self::Invalid("not found"),
            StorageError::Invalid => Self::Invalid("conflict"),
            _ => Self::Storage,
        }
    }
}

/// Persistence seam for the relay path.
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn store_message(&self, message: &NewMessage) -> Result<MessageRecord, StorageError>;
    async fn mark_delivered(&self, message_id: i64) -> Result<bool, StorageError>;
    async fn pending_messages(
        &self,
        user_id: i64,
        device_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError>;
    async fn advance_status(
        &self,
        message_id: i64,
        recipient_id: i64,
        status: &str,
    ) -> Result<Option<MessageRecord>, StorageError>;
    async fn edit_message(
        &self,
        message_id: i64,
        sender_id: i64,
        ciphertext: &str,
    ) -> Result<MessageRecord, StorageError>;
    async fn delete_for_all(
        &self,
        message_id: i64,
        sender_id: i64,
    ) -> Result<MessageRecord, StorageError>;
    async fn push_token_for_device(
        &self,
        user_id: i64,
        device_id: i64,
    ) -> Result<Option<String>, StorageError>;
    async fn push_token_for_user(&self, user_id: i64) -> Result<Option<String>, StorageError>;
}

#[async_trait]
impl RelayStore for Storage {
    async fn store_message(&self, message: &NewMessage) -> Result<MessageRecord, StorageError> {
        self.insert_message(message).await
    }

    async fn mark_delivered(&self, message_id: i64) -> Result<bool, StorageError> {
        Storage::mark_delivered(self, message_id).await
    }

    async fn pending_messages(
        &self,
        user_id: i64,
        device_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.pending_messages_for_device(user_id, device_id, limit)
            .await
    }

    async fn advance_status(
        &self,
        message_id: i64,
        recipient_id: i64,
        status: &str,
    ) -> Result<Option<MessageRecord>, StorageError> {
        self.update_message_status(message_id, recipient_id, status)
            .await
    }

    async fn edit_message(
        &self,
        message_id: i64,
        sender_id: i64,
        ciphertext: &str,
    ) -> Result<MessageRecord, StorageError> {
        Storage::edit_message(self, message_id, sender_id, ciphertext).await
    }

    async fn delete_for_all(
        &self,
        message_id: i64,
        sender_id: i64,
    ) -> Result<MessageRecord, StorageError> {
        self.delete_message_for_all(message_id, sender_id).await
    }

    async fn push_token_for_device(
        &self,
        user_id: i64,
        device_id: i64,
    ) -> Result<Option<String>, StorageError> {
        self.load_push_token(user_id, device_id).await
    }

    async fn push_token_for_user(&self, user_id: i64) -> Result<Option<String>, StorageError> {
        self.load_push_token_for_user(user_id).await
    }
}

/// Membership seam for group fan-out.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn member_ids(&self, group_id: i64) -> Result<Vec<i64>, StorageError>;
}

#[async_trait]
impl GroupDirectory for Storage {
    async fn member_ids(&self, group_id: i64) -> Result<Vec<i64>, StorageError> {
        self.list_group_member_ids(group_id).await
    }
}

/// Store-and-forward core. Every envelope lands in the store first; live
/// delivery and push wake-ups happen after the row is durable.
pub struct MessageRelay {
    store: Arc<dyn RelayStore>,
    groups: Arc<dyn GroupDirectory>,
    registry: Arc<ConnectionRegistry>,
    push: Arc<NotificationDispatcher>,
    metrics: Arc<Metrics>,
    relay_ttl_seconds: i64,
}

impl MessageRelay {
    pub fn new(
        store: Arc<dyn RelayStore>,
        groups: Arc<dyn GroupDirectory>,
        registry: Arc<ConnectionRegistry>,
        push: Arc<NotificationDispatcher>,
        metrics: Arc<Metrics>,
        relay_ttl_seconds: i64,
    ) -> Self {
        Self {
            store,
            groups,
            registry,
            push,
            metrics,
            relay_ttl_seconds,
        }
    }

    /// Relays one envelope and returns the stored message ids, in the order
    /// the rows were written.
    pub async fn relay_message(
        &self,
        sender_id: i64,
        frame: &MessageFrame,
    ) -> Result<Vec<i64>, RelayError> {
        match (frame.recipient_group_id, frame.recipient_id) {
            (Some(group_id), _) => self.relay_group(sender_id, group_id, frame).await,
            (None, Some(recipient_id)) => self.relay_direct(sender_id, recipient_id, frame).await,
            (None, None) => Err(RelayError::Invalid("missing recipient")),
        }
    }

    async fn relay_direct(
        &self,
        sender_id: i64,
        recipient_id: i64,
        frame: &MessageFrame,
    ) -> Result<Vec<i64>, RelayError> {
        let pairs = frame
            .device_ciphers()
            .map_err(|_| RelayError::Invalid("invalid ciphers"))?;
        for (_, ciphertext) in pairs.iter() {
            if ciphertext.len() > MAX_CIPHERTEXT_LEN {
                return Err(RelayError::Invalid("ciphertext too large"));
            }
        }
        let expires_at = self.expiry(frame.expiration_duration);
        let mut stored_ids = Vec::with_capacity(pairs.len());
        for (device_id, ciphertext) in pairs {
            let record = self
                .store
                .store_message(&NewMessage {
                    sender_id,
                    recipient_id,
                    recipient_device_id: device_id,
                    group_id: None,
                    ciphertext,
                    message_type: frame.message_type.clone(),
                    parent_id: frame.parent_id,
                    expires_at,
                })
                .await?;
            self.metrics.mark_relay_stored();
            stored_ids.push(record.message_id);
            let delivered = self
                .registry
                .send_to_device(
                    recipient_id,
                    device_id,
                    ServerFrame::Deliver(deliver_frame(&record)),
                )
                .await;
            if delivered {
                self.settle_delivery(record.message_id).await;
            } else {
                self.notify_offline_device(recipient_id, device_id, &record)
                    .await;
            }
        }
        Ok(stored_ids)
    }

    async fn relay_group(
        &self,
        sender_id: i64,
        group_id: i64,
        frame: &MessageFrame,
    ) -> Result<Vec<i64>, RelayError> {
        let ciphertext = frame
            .ciphertext
            .as_deref()
            .ok_or(RelayError::Invalid("missing ciphertext"))?;
        if ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(RelayError::Invalid("ciphertext too large"));
        }
        let members = self.groups.member_ids(group_id).await?;
        if !members.contains(&sender_id) {
            return Err(RelayError::Invalid("not a group member"));
        }
        let expires_at = self.expiry(frame.expiration_duration);
        let mut stored_ids = Vec::new();
        for member in members {
            if member == sender_id {
                continue;
            }
            let record = self
                .store
                .store_message(&NewMessage {
                    sender_id,
                    recipient_id: member,
                    recipient_device_id: GROUP_WIDE_DEVICE,
                    group_id: Some(group_id),
                    ciphertext: ciphertext.to_string(),
                    message_type: frame.message_type.clone(),
                    parent_id: frame.parent_id,
                    expires_at,
                })
                .await?;
            self.metrics.mark_relay_stored();
            stored_ids.push(record.message_id);
            let delivered = self
                .registry
                .send_to_user(member, ServerFrame::Deliver(deliver_frame(&record)))
                .await;
            if delivered > 0 {
                self.settle_delivery(record.message_id).await;
            } else {
                self.notify_offline(member, &record).await;
            }
        }
        Ok(stored_ids)
    }

    /// Replaces a message's ciphertext and pushes the new revision to any
    /// online recipient device. Offline recipients pick it up as a pending
    /// row; edits never trigger a push wake-up.
    pub async fn relay_edit(
        &self,
        sender_id: i64,
        frame: &EditFrame,
    ) -> Result<MessageRecord, RelayError> {
        if frame.ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(RelayError::Invalid("ciphertext too large"));
        }
        let record = self
            .store
            .edit_message(frame.message_id, sender_id, &frame.ciphertext)
            .await?;
        self.redeliver(&record).await;
        Ok(record)
    }

    /// Applies delete-for-everyone and propagates the tombstone. A local-only
    /// delete carries no relay-side state change and returns None.
    pub async fn relay_delete(
        &self,
        sender_id: i64,
        frame: &DeleteFrame,
    ) -> Result<Option<MessageRecord>, RelayError> {
        if !frame.for_everyone {
            debug!(
                message_id = frame.message_id,
                "local delete acknowledged without relay mutation"
            );
            return Ok(None);
        }
        let record = self
            .store
            .delete_for_all(frame.message_id, sender_id)
            .await?;
        self.redeliver(&record).await;
        Ok(Some(record))
    }

    /// Records a delivery or read receipt and forwards it to the sender's
    /// online devices. The status row only moves when the reporter is the
    /// message's recipient; reports from anyone else, like regressions,
    /// are ignored and forward nothing.
    pub async fn relay_status(
        &self,
        reporter_id: i64,
        frame: &StatusFrame,
    ) -> Result<(), RelayError> {
        let Some(record) = self
            .store
            .advance_status(frame.message_id, reporter_id, &frame.status)
            .await?
        else {
            return Ok(());
        };
        if record.sender_id == reporter_id {
            return Ok(());
        }
        let receipt = ServerFrame::Receipt(ReceiptFrame {
            message_id: record.message_id,
            status: record.status.clone(),
        });
        self.registry.send_to_user(record.sender_id, receipt).await;
        Ok(())
    }

    /// Claims the pending backlog for one device and returns the frames to
    /// write, oldest first. Each row is claimed through `mark_delivered`
    /// before it is handed out, so a row another path already queued (or a
    /// concurrent drain already took) is skipped instead of sent twice.
    pub async fn drain_backlog(
        &self,
        user_id: i64,
        device_id: i64,
        limit: i64,
    ) -> Result<Vec<DeliverFrame>, RelayError> {
        let records = self
            .store
            .pending_messages(user_id, device_id, limit)
            .await?;
        let mut frames = Vec::with_capacity(records.len());
        for record in records {
            if self.store.mark_delivered(record.message_id).await? {
                self.metrics.mark_relay_delivered();
                frames.push(deliver_frame(&record));
            }
        }
        Ok(frames)
    }

    /// Forwards a typing notice to online peers. Typing state is ephemeral
    /// and is never persisted or pushed.
    pub async fn relay_typing(
        &self,
        sender_id: i64,
        frame: &TypingFrame,
    ) -> Result<(), RelayError> {
        match (frame.recipient_group_id, frame.recipient_id) {
            (Some(group_id), _) => {
                let members = self.groups.member_ids(group_id).await?;
                if !members.contains(&sender_id) {
                    return Err(RelayError::Invalid("not a group member"));
                }
                let notice = ServerFrame::Typing(TypingNotice {
                    sender_id,
                    group_id: Some(group_id),
                });
                for member in members {
                    if member != sender_id {
                        self.registry.send_to_user(member, notice.clone()).await;
                    }
                }
                Ok(())
            }
            (None, Some(recipient_id)) => {
                let notice = ServerFrame::Typing(TypingNotice {
                    sender_id,
                    group_id: None,
                });
                self.registry.send_to_user(recipient_id, notice).await;
                Ok(())
            }
            (None, None) => Err(RelayError::Invalid("missing recipient")),
        }
    }

    async fn redeliver(&self, record: &MessageRecord) {
        let delivered = self
            .registry
            .send_to_user(
                record.recipient_id,
                ServerFrame::Deliver(deliver_frame(record)),
            )
            .await;
        if delivered > 0 {
            self.settle_delivery(record.message_id).await;
        }
    }

    async fn settle_delivery(&self, message_id: i64) {
        match self.store.mark_delivered(message_id).await {
            Ok(true) => self.metrics.mark_relay_delivered(),
            Ok(false) => {}
            Err(err) => warn!(message_id, "delivery settlement failed: {}", err),
        }
    }

    /// One wake-up for a missed device on the direct path, using that
    /// device's own token.
    async fn notify_offline_device(&self, recipient_id: i64, device_id: i64, record: &MessageRecord) {
        let token = match self.store.push_token_for_device(recipient_id, device_id).await {
            Ok(Some(token)) => token,
            Ok(None) => return,
            Err(err) => {
                warn!(recipient_id, device_id, "push token lookup failed: {}", err);
                return;
            }
        };
        self.enqueue_push(recipient_id, token, record);
    }

    /// One wake-up per fully offline group member, to their newest token.
    async fn notify_offline(&self, recipient_id: i64, record: &MessageRecord) {
        let token = match self.store.push_token_for_user(recipient_id).await {
            Ok(Some(token)) => token,
            Ok(None) => return,
            Err(err) => {
                warn!(recipient_id, "push token lookup failed: {}", err);
                return;
            }
        };
        self.enqueue_push(recipient_id, token, record);
    }

    fn enqueue_push(&self, recipient_id: i64, token: String, record: &MessageRecord) {
        self.push.enqueue(PushNotification::new(
            recipient_id,
            token,
            record.message_id,
            record.sender_id,
            record.message_type.clone(),
        ));
    }

    fn expiry(&self, duration_seconds: Option<i64>) -> Option<chrono::DateTime<Utc>> {
        let seconds = duration_seconds?;
        let clamped = seconds.clamp(1, self.relay_ttl_seconds);
        Some(Utc::now() + Duration::seconds(clamped))
    }
}

pub fn deliver_frame(record: &MessageRecord) -> DeliverFrame {
    DeliverFrame {
        message_id: record.message_id,
        sender_id: record.sender_id,
        group_id: record.group_id,
        ciphertext: record.ciphertext.clone(),
        message_type: record.message_type.clone(),
        timestamp: record.created_at.to_rfc3339(),
        expires_at: record.expires_at.map(|ts| ts.to_rfc3339()),
        parent_id: record.parent_id,
        is_edited: record.is_edited,
        is_deleted: record.is_deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::push::{PushError, PushGateway};
    use crate::app::registry::CONNECTION_QUEUE_DEPTH;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeStore {
        messages: Mutex<HashMap<i64, MessageRecord>>,
        next_id: Mutex<i64>,
        device_tokens: Mutex<HashMap<(i64, i64), String>>,
        user_tokens: Mutex<HashMap<i64, String>>,
    }

    impl FakeStore {
        fn status_of(&self, message_id: i64) -> String {
            self.messages.lock().unwrap()[&message_id].status.clone()
        }
    }

    #[async_trait]
    impl RelayStore for FakeStore {
        async fn store_message(&self, message: &NewMessage) -> Result<MessageRecord, StorageError> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let record = MessageRecord {
                message_id: *next,
                sender_id: message.sender_id,
                recipient_id: message.recipient_id,
                recipient_device_id: message.recipient_device_id,
                group_id: message.group_id,
                ciphertext: message.ciphertext.clone(),
                message_type: message.message_type.clone(),
                status: "pending".to_string(),
                parent_id: message.parent_id,
                is_edited: false,
                is_deleted: false,
                deleted_for_all: false,
                created_at: Utc::now(),
                expires_at: message.expires_at,
            };
            self.messages
                .lock()
                .unwrap()
                .insert(record.message_id, record.clone());
            Ok(record)
        }

        async fn mark_delivered(&self, message_id: i64) -> Result<bool, StorageError> {
            let mut messages = self.messages.lock().unwrap();
            let record = messages.get_mut(&message_id).ok_or(StorageError::Missing)?;
            if record.status == "pending" {
                record.status = "delivered".to_string();
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn pending_messages(
            &self,
            user_id: i64,
            device_id: i64,
            limit: i64,
        ) -> Result<Vec<MessageRecord>, StorageError> {
            let messages = self.messages.lock().unwrap();
            let mut records: Vec<MessageRecord> = messages
                .values()
                .filter(|record| {
                    record.recipient_id == user_id
                        && (record.recipient_device_id == device_id
                            || record.recipient_device_id == GROUP_WIDE_DEVICE)
                        && record.status == "pending"
                })
                .cloned()
                .collect();
            records.sort_by_key(|record| record.message_id);
            records.truncate(limit as usize);
            Ok(records)
        }

        async fn advance_status(
            &self,
            message_id: i64,
            recipient_id: i64,
            status: &str,
        ) -> Result<Option<MessageRecord>, StorageError> {
            let mut messages = self.messages.lock().unwrap();
            let record = messages.get_mut(&message_id).ok_or(StorageError::Missing)?;
            if record.recipient_id != recipient_id {
                return Ok(None);
            }
            let allowed = matches!(
                (record.status.as_str(), status),
                ("pending", "delivered") | ("pending", "read") | ("delivered", "read")
            );
            if !allowed {
                return Ok(None);
            }
            record.status = status.to_string();
            Ok(Some(record.clone()))
        }

        async fn edit_message(
            &self,
            message_id: i64,
            sender_id: i64,
            ciphertext: &str,
        ) -> Result<MessageRecord, StorageError> {
            let mut messages = self.messages.lock().unwrap();
            let record = messages.get_mut(&message_id).ok_or(StorageError::Missing)?;
            if record.sender_id != sender_id {
                return Err(StorageError::Missing);
            }
            record.ciphertext = ciphertext.to_string();
            record.is_edited = true;
            record.status = "pending".to_string();
            Ok(record.clone())
        }

        async fn delete_for_all(
            &self,
            message_id: i64,
            sender_id: i64,
        ) -> Result<MessageRecord, StorageError> {
            let mut messages = self.messages.lock().unwrap();
            let record = messages.get_mut(&message_id).ok_or(StorageError::Missing)?;
            if record.sender_id != sender_id {
                return Err(StorageError::Missing);
            }
            record.ciphertext = String::new();
            record.is_deleted = true;
            record.deleted_for_all = true;
            record.status = "pending".to_string();
            Ok(record.clone())
        }

        async fn push_token_for_device(
            &self,
            user_id: i64,
            device_id: i64,
        ) -> Result<Option<String>, StorageError> {
            Ok(self
                .device_tokens
                .lock()
                .unwrap()
                .get(&(user_id, device_id))
                .cloned())
        }

        async fn push_token_for_user(&self, user_id: i64) -> Result<Option<String>, StorageError> {
            Ok(self.user_tokens.lock().unwrap().get(&user_id).cloned())
        }
    }

    struct FakeDirectory {
        members: HashMap<i64, Vec<i64>>,
    }

    #[async_trait]
    impl GroupDirectory for FakeDirectory {
        async fn member_ids(&self, group_id: i64) -> Result<Vec<i64>, StorageError> {
            Ok(self.members.get(&group_id).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct RecordingGateway {
        delivered: Mutex<Vec<PushNotification>>,
    }

    #[async_trait]
    impl PushGateway for RecordingGateway {
        async fn deliver(&self, notification: &PushNotification) -> Result<(), PushError> {
            self.delivered.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Harness {
        store: Arc<FakeStore>,
        registry: Arc<ConnectionRegistry>,
        gateway: Arc<RecordingGateway>,
        push: Arc<NotificationDispatcher>,
        relay: MessageRelay,
    }

    fn harness(groups: HashMap<i64, Vec<i64>>) -> Harness {
        let store = Arc::new(FakeStore::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let gateway = Arc::new(RecordingGateway::default());
        let metrics = Arc::new(Metrics::new());
        let push = Arc::new(NotificationDispatcher::spawn(
            Arc::clone(&gateway) as Arc<dyn PushGateway>,
            Arc::clone(&metrics),
        ));
        let relay = MessageRelay::new(
            Arc::clone(&store) as Arc<dyn RelayStore>,
            Arc::new(FakeDirectory { members: groups }) as Arc<dyn GroupDirectory>,
            Arc::clone(&registry),
            Arc::clone(&push),
            metrics,
            86400,
        );
        Harness {
            store,
            registry,
            gateway,
            push,
            relay,
        }
    }

    fn direct_frame(recipient_id: i64, ciphers: &[(i64, &str)]) -> MessageFrame {
        MessageFrame {
            recipient_id: Some(recipient_id),
            recipient_group_id: None,
            ciphers: Some(
                ciphers
                    .iter()
                    .map(|(device, ct)| (device.to_string(), ct.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ciphertext: None,
            message_type: "message".to_string(),
            expiration_duration: None,
            parent_id: None,
        }
    }

    fn group_frame(group_id: i64, ciphertext: &str) -> MessageFrame {
        MessageFrame {
            recipient_id: None,
            recipient_group_id: Some(group_id),
            ciphers: None,
            ciphertext: Some(ciphertext.to_string()),
            message_type: "message".to_string(),
            expiration_duration: None,
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn direct_relay_delivers_live_and_pushes_missed_device() {
        let h = harness(HashMap::new());
        h.store
            .device_tokens
            .lock()
            .unwrap()
            .insert((7, 2), "tok-2".to_string());
        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        h.registry.register(7, 1, tx).await;

        let ids = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "ct-one"), (2, "ct-two")]))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(h.store.status_of(ids[0]), "delivered");
        assert_eq!(h.store.status_of(ids[1]), "pending");

        match rx.recv().await.unwrap() {
            ServerFrame::Deliver(frame) => {
                assert_eq!(frame.sender_id, 2);
                assert_eq!(frame.ciphertext, "ct-one");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        // Device 1 was live; only the missed device is woken up.
        h.push.shutdown().await;
        let pushed = h.gateway.delivered.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].message_id, ids[1]);
        assert_eq!(pushed[0].push_token, "tok-2");
    }

    #[tokio::test]
    async fn each_offline_device_gets_its_own_push() {
        let h = harness(HashMap::new());
        {
            let mut tokens = h.store.device_tokens.lock().unwrap();
            tokens.insert((7, 1), "tok-1".to_string());
            tokens.insert((7, 2), "tok-2".to_string());
        }
        let ids = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "a"), (2, "b"), (3, "c")]))
            .await
            .unwrap();
        h.push.shutdown().await;
        let pushed = h.gateway.delivered.lock().unwrap();
        // Device 3 never registered a token, so two wake-ups.
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0].message_id, ids[0]);
        assert_eq!(pushed[0].push_token, "tok-1");
        assert_eq!(pushed[1].message_id, ids[1]);
        assert_eq!(pushed[1].push_token, "tok-2");
    }

    #[tokio::test]
    async fn oversized_ciphertext_is_rejected() {
        let h = harness(HashMap::new());
        let big = "x".repeat(MAX_CIPHERTEXT_LEN + 1);
        let err = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, big.as_str())]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Invalid("ciphertext too large")));
        h.push.shutdown().await;
    }

    #[tokio::test]
    async fn group_relay_fans_out_per_member() {
        let h = harness(HashMap::from([(40, vec![2, 7, 9])]));
        h.store
            .user_tokens
            .lock()
            .unwrap()
            .insert(9, "tok-9".to_string());
        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        h.registry.register(7, 3, tx).await;

        let ids = h
            .relay
            .relay_message(2, &group_frame(40, "group-ct"))
            .await
            .unwrap();
        // One row per member excluding the sender.
        assert_eq!(ids.len(), 2);
        let messages = h.store.messages.lock().unwrap();
        assert!(
            messages
                .values()
                .all(|m| m.recipient_device_id == GROUP_WIDE_DEVICE && m.group_id == Some(40))
        );
        drop(messages);
        match rx.recv().await.unwrap() {
            ServerFrame::Deliver(frame) => assert_eq!(frame.group_id, Some(40)),
            other => panic!("unexpected frame: {:?}", other),
        }
        h.push.shutdown().await;
        let pushed = h.gateway.delivered.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].user_id, 9);
    }

    #[tokio::test]
    async fn non_member_cannot_post_to_group() {
        let h = harness(HashMap::from([(40, vec![7, 9])]));
        let err = h
            .relay
            .relay_message(2, &group_frame(40, "ct"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Invalid("not a group member")));
        h.push.shutdown().await;
    }

    #[tokio::test]
    async fn status_receipt_reaches_sender() {
        let h = harness(HashMap::new());
        let ids = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "ct")]))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        h.registry.register(2, 1, tx).await;

        h.relay
            .relay_status(
                7,
                &StatusFrame {
                    message_id: ids[0],
                    status: "read".to_string(),
                },
            )
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ServerFrame::Receipt(receipt) => {
                assert_eq!(receipt.message_id, ids[0]);
                assert_eq!(receipt.status, "read");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // A regressing report is ignored and forwards nothing.
        h.relay
            .relay_status(
                7,
                &StatusFrame {
                    message_id: ids[0],
                    status: "delivered".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        h.push.shutdown().await;
    }

    #[tokio::test]
    async fn receipt_from_non_recipient_is_ignored() {
        let h = harness(HashMap::new());
        let ids = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "ct")]))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        h.registry.register(2, 1, tx).await;

        // A third party reporting on someone else's conversation must not
        // move the row or forge a receipt to the sender.
        h.relay
            .relay_status(
                99,
                &StatusFrame {
                    message_id: ids[0],
                    status: "read".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.store.status_of(ids[0]), "pending");
        assert!(rx.try_recv().is_err());

        // The sender's own report does not move the row either.
        h.relay
            .relay_status(
                2,
                &StatusFrame {
                    message_id: ids[0],
                    status: "read".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.store.status_of(ids[0]), "pending");
        assert!(rx.try_recv().is_err());
        h.push.shutdown().await;
    }

    #[tokio::test]
    async fn backlog_drain_claims_each_row_once() {
        let h = harness(HashMap::new());
        let first = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "first")]))
            .await
            .unwrap();
        let second = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "second")]))
            .await
            .unwrap();
        // Another path already claimed the first row.
        assert!(h.store.mark_delivered(first[0]).await.unwrap());

        let frames = h.relay.drain_backlog(7, 1, 100).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_id, second[0]);
        assert_eq!(h.store.status_of(second[0]), "delivered");

        // Nothing is handed out a second time.
        assert!(h.relay.drain_backlog(7, 1, 100).await.unwrap().is_empty());
        h.push.shutdown().await;
    }

    #[tokio::test]
    async fn edit_redelivers_without_push() {
        let h = harness(HashMap::new());
        h.store
            .device_tokens
            .lock()
            .unwrap()
            .insert((7, 1), "tok".to_string());
        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        h.registry.register(7, 1, tx).await;
        let ids = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "original")]))
            .await
            .unwrap();
        let _ = rx.recv().await;

        let record = h
            .relay
            .relay_edit(
                2,
                &EditFrame {
                    message_id: ids[0],
                    ciphertext: "revised".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(record.is_edited);
        match rx.recv().await.unwrap() {
            ServerFrame::Deliver(frame) => {
                assert_eq!(frame.ciphertext, "revised");
                assert!(frame.is_edited);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        h.push.shutdown().await;
        assert!(h.gateway.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_for_everyone_propagates_tombstone() {
        let h = harness(HashMap::new());
        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        h.registry.register(7, 1, tx).await;
        let ids = h
            .relay
            .relay_message(2, &direct_frame(7, &[(1, "ct")]))
            .await
            .unwrap();
        let _ = rx.recv().await;

        // Local delete is a no-op on the relay.
        let none = h
            .relay
            .relay_delete(
                2,
                &DeleteFrame {
                    message_id: ids[0],
                    for_everyone: false,
                },
            )
            .await
            .unwrap();
        assert!(none.is_none());

        let record = h
            .relay
            .relay_delete(
                2,
                &DeleteFrame {
                    message_id: ids[0],
                    for_everyone: true,
                },
            )
            .await
            .unwrap()
            .expect("tombstone");
        assert!(record.deleted_for_all);
        assert!(record.ciphertext.is_empty());
        match rx.recv().await.unwrap() {
            ServerFrame::Deliver(frame) => {
                assert!(frame.is_deleted);
                assert!(frame.ciphertext.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Only the author can delete for everyone.
        let err = h
            .relay
            .relay_delete(
                7,
                &DeleteFrame {
                    message_id: ids[0],
                    for_everyone: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Invalid("not found")));
        h.push.shutdown().await;
    }

    #[tokio::test]
    async fn typing_notice_is_ephemeral() {
        let h = harness(HashMap::new());
        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        h.registry.register(7, 1, tx).await;
        h.relay
            .relay_typing(
                2,
                &TypingFrame {
                    recipient_id: Some(7),
                    recipient_group_id: None,
                },
            )
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ServerFrame::Typing(notice) => assert_eq!(notice.sender_id, 2),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(h.store.messages.lock().unwrap().is_empty());
        h.push.shutdown().await;
    }
}
