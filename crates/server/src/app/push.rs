use crate::metrics::Metrics;
use crate::util::generate_id;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const QUEUE_DEPTH: usize = 256;
const DELIVERY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug)]
pub enum PushError {
    Transport,
    Rejected(u16),
}

impl Display for PushError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "push transport failure"),
            Self::Rejected(status) => write!(f, "push rejected with status {}", status),
        }
    }
}

impl Error for PushError {}

/// Wake-up payload for an offline recipient. Carries routing metadata only;
/// message content never leaves the relay through this path.
#[derive(Debug, Clone, Serialize)]
pub struct PushNotification {
    pub notification_id: String,
    pub user_id: i64,
    pub push_token: String,
    pub message_id: i64,
    pub sender_id: i64,
    pub message_type: String,
}

impl PushNotification {
    pub fn new(
        user_id: i64,
        push_token: String,
        message_id: i64,
        sender_id: i64,
        message_type: String,
    ) -> Self {
        Self {
            notification_id: generate_id(&format!("push:{}:{}", user_id, message_id)),
            user_id,
            push_token,
            message_id,
            sender_id,
            message_type,
        }
    }
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn deliver(&self, notification: &PushNotification) -> Result<(), PushError>;
}

/// Posts notifications to an external push relay over HTTPS.
pub struct WebhookPushGateway {
    client: Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl WebhookPushGateway {
    pub fn new(endpoint: String, auth_token: Option<String>) -> Result<Self, PushError> {
        let client = Client::builder()
            .user_agent("sealgram-push/1.0")
            .timeout(StdDuration::from_secs(DELIVERY_TIMEOUT_SECS))
            .build()
            .map_err(|_| PushError::Transport)?;
        Ok(Self {
            client,
            endpoint,
            auth_token,
        })
    }
}

#[async_trait]
impl PushGateway for WebhookPushGateway {
    async fn deliver(&self, notification: &PushNotification) -> Result<(), PushError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(notification);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|_| PushError::Transport)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PushError::Rejected(response.status().as_u16()))
        }
    }
}

/// Discards notifications. Used when no push endpoint is configured.
pub struct NullPushGateway;

#[async_trait]
impl PushGateway for NullPushGateway {
    async fn deliver(&self, notification: &PushNotification) -> Result<(), PushError> {
        debug!(
            user_id = notification.user_id,
            message_id = notification.message_id,
            "push gateway disabled, notification dropped"
        );
        Ok(())
    }
}

enum PushJob {
    Notify(PushNotification),
    Shutdown,
}

/// Background worker that drains queued notifications into the gateway.
/// Delivery is best-effort: a failed push is counted and logged, the message
/// itself stays pending in the store either way.
pub struct NotificationDispatcher {
    queue: mpsc::Sender<PushJob>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn spawn(gateway: Arc<dyn PushGateway>, metrics: Arc<Metrics>) -> Self {
        let (queue, mut rx) = mpsc::channel::<PushJob>(QUEUE_DEPTH);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let notification = match job {
                    PushJob::Notify(notification) => notification,
                    PushJob::Shutdown => break,
                };
                match gateway.deliver(&notification).await {
                    Ok(()) => {
                        metrics.mark_push_dispatched();
                        debug!(
                            user_id = notification.user_id,
                            message_id = notification.message_id,
                            "push notification dispatched"
                        );
                    }
                    Err(err) => {
                        metrics.mark_push_failed();
                        warn!(
                            user_id = notification.user_id,
                            message_id = notification.message_id,
                            error = %err,
                            "push notification failed"
                        );
                    }
                }
            }
            debug!("push dispatcher stopped");
        });
        Self {
            queue,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a notification without blocking the relay path. A saturated
    /// queue drops the notification; pending delivery still covers the
    /// message on reconnect.
    pub fn enqueue(&self, notification: PushNotification) {
        if let Err(err) = self.queue.try_send(PushJob::Notify(notification)) {
            warn!(error = %err, "push queue saturated, notification dropped");
        }
    }

    /// Drains the queue and stops the worker. Idempotent.
    pub async fn shutdown(&self) {
        if self.queue.send(PushJob::Shutdown).await.is_err() {
            return;
        }
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("push dispatcher join failed: {}", err);
            }
        }
    }
}
