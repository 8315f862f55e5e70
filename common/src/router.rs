// Fan-in of trigger notifications to the messaging transport

use crate::errors::QueueError;
use crate::models::Notification;
use crate::telemetry;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Notifications buffered between triggers and the transport
const ROUTER_CAPACITY: usize = 1024;

/// External delivery of notifications to chats
///
/// Delivery retries and rate limits belong to the implementation.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), QueueError>;
}

/// Sending half handed to every trigger
#[derive(Debug, Clone)]
pub struct NotificationEmitter {
    tx: mpsc::Sender<Notification>,
}

impl NotificationEmitter {
    /// Emitter paired with a raw receiver, for consumers other than the router
    pub fn channel() -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(ROUTER_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, notification: Notification) -> Result<(), QueueError> {
        let trigger_id = notification.trigger_id.clone();
        self.tx
            .send(notification)
            .await
            .map_err(|_| QueueError::Closed)?;
        telemetry::record_notification_emitted(&trigger_id);
        Ok(())
    }
}

/// Forwards every emitted notification to one transport
pub struct NotificationRouter {
    rx: mpsc::Receiver<Notification>,
    transport: Arc<dyn MessageTransport>,
}

impl NotificationRouter {
    pub fn new(transport: Arc<dyn MessageTransport>) -> (Self, NotificationEmitter) {
        let (emitter, rx) = NotificationEmitter::channel();
        (Self { rx, transport }, emitter)
    }

    /// Forward until all emitters are dropped or shutdown is requested
    ///
    /// Notifications already buffered when shutdown is requested are still
    /// forwarded.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Notification router started");
        let mut forwarded: u64 = 0;

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(notification) => {
                        self.forward(&notification).await;
                        forwarded += 1;
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    self.rx.close();
                    while let Some(notification) = self.rx.recv().await {
                        self.forward(&notification).await;
                        forwarded += 1;
                    }
                    break;
                }
            }
        }

        info!(forwarded, "Notification router stopped");
    }

    async fn forward(&self, notification: &Notification) {
        match self.transport.deliver(notification).await {
            Ok(()) => telemetry::record_notification_delivered(),
            Err(e) => {
                telemetry::record_notification_failed();
                warn!(
                    trigger_id = %notification.trigger_id,
                    chat_id = notification.chat_id,
                    error = %e,
                    "Transport rejected notification"
                );
            }
        }
    }
}

/// Transport that only logs, for dry runs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl MessageTransport for LogTransport {
    async fn deliver(&self, notification: &Notification) -> Result<(), QueueError> {
        info!(
            trigger_id = %notification.trigger_id,
            epoch = notification.epoch,
            chat_id = notification.chat_id,
            action = notification.action.as_ref().map(|a| a.url.as_str()),
            message = %notification.message,
            "Notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Transport that keeps every delivered notification in memory
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        delivered: Mutex<Vec<Notification>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn delivered(&self) -> Vec<Notification> {
            self.delivered.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn deliver(&self, notification: &Notification) -> Result<(), QueueError> {
            self.delivered.lock().await.push(notification.clone());
            Ok(())
        }
    }

    fn notification(chat_id: i64) -> Notification {
        Notification {
            trigger_id: "extra-flip".to_string(),
            epoch: 42,
            subscriber_id: format!("u{}", chat_id),
            chat_id,
            message: "hello".to_string(),
            action: None,
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl MessageTransport for FailingTransport {
        async fn deliver(&self, _notification: &Notification) -> Result<(), QueueError> {
            Err(QueueError::PublishFailed("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_router_forwards_in_order() {
        let transport = Arc::new(RecordingTransport::new());
        let (router, emitter) = NotificationRouter::new(transport.clone());
        let handle = tokio::spawn(router.run(CancellationToken::new()));

        for chat_id in 1..=3 {
            emitter.emit(notification(chat_id)).await.unwrap();
        }
        drop(emitter);
        handle.await.unwrap();

        let chats: Vec<i64> = transport.delivered().await.iter().map(|n| n.chat_id).collect();
        assert_eq!(chats, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_router_drains_on_shutdown() {
        let transport = Arc::new(RecordingTransport::new());
        let (router, emitter) = NotificationRouter::new(transport.clone());

        emitter.emit(notification(1)).await.unwrap();
        emitter.emit(notification(2)).await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        router.run(shutdown).await;

        assert_eq!(transport.delivered().await.len(), 2);
        assert!(matches!(
            emitter.emit(notification(3)).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_does_not_stop_router() {
        let (router, emitter) = NotificationRouter::new(Arc::new(FailingTransport));
        let handle = tokio::spawn(router.run(CancellationToken::new()));

        emitter.emit(notification(1)).await.unwrap();
        emitter.emit(notification(2)).await.unwrap();
        drop(emitter);

        assert!(handle.await.is_ok());
    }
}
