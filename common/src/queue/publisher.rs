// Notification publisher for NATS JetStream

use crate::errors::QueueError;
use crate::models::{Action, Notification};
use crate::queue::nats::NatsClient;
use crate::router::MessageTransport;
use async_nats::jetstream::context::PublishAckFuture;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Wire format consumed by the chat delivery service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub chat_id: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub trigger_id: String,
    pub epoch: u64,
    pub subscriber_id: String,
    pub published_at: DateTime<Utc>,
}

impl From<&Notification> for NotificationMessage {
    fn from(notification: &Notification) -> Self {
        Self {
            chat_id: notification.chat_id,
            message: notification.message.clone(),
            action: notification.action.clone(),
            trigger_id: notification.trigger_id.clone(),
            epoch: notification.epoch,
            subscriber_id: notification.subscriber_id.clone(),
            published_at: Utc::now(),
        }
    }
}

/// Publishes notifications to `<subject_prefix>.<chat_id>`
pub struct NatsNotificationPublisher {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsNotificationPublisher {
    pub fn new(client: NatsClient) -> Self {
        let publish_timeout = Duration::from_secs(client.config().publish_timeout_seconds);
        Self {
            client,
            publish_timeout,
        }
    }

    fn subject(&self, chat_id: i64) -> String {
        format!("{}.{}", self.client.config().subject_prefix, chat_id)
    }
}

#[async_trait]
impl MessageTransport for NatsNotificationPublisher {
    #[instrument(skip(self, notification), fields(
        trigger_id = %notification.trigger_id,
        epoch = notification.epoch,
        chat_id = notification.chat_id
    ))]
    async fn deliver(&self, notification: &Notification) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(&NotificationMessage::from(notification)).map_err(|e| {
            QueueError::SerializationFailed(format!("Failed to serialize notification: {}", e))
        })?;

        let subject = self.subject(notification.chat_id);

        // Duplicate deliveries inside the stream window are dropped by JetStream
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", notification.idempotency_key().as_str());
        headers.insert("Trigger-Id", notification.trigger_id.as_str());

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish notification: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(ack)) => {
                debug!(subject = %subject, duplicate = ack.duplicate, "Notification published");
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}
