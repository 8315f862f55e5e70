// NATS JetStream client for the notification stream

use crate::config::NatsConfig;
use crate::errors::QueueError;
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use std::time::Duration;
use tracing::{info, instrument};

/// Messages older than this are dropped from the stream
const STREAM_MAX_AGE: Duration = Duration::from_secs(86_400);

/// Window in which JetStream drops messages with a repeated `Nats-Msg-Id`
const DUPLICATE_WINDOW: Duration = Duration::from_secs(3_600);

/// NATS JetStream client
pub struct NatsClient {
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to the NATS server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: NatsConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server");

        Ok(Self {
            jetstream: async_nats::jetstream::new(client),
            config,
        })
    }

    /// Create the notification stream if it does not exist yet
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![self.subject_filter()],
            retention: RetentionPolicy::Limits,
            max_age: STREAM_MAX_AGE,
            duplicate_window: DUPLICATE_WINDOW,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(
            stream_name = %self.config.stream_name,
            subjects = %self.subject_filter(),
            "Notification stream initialized"
        );

        Ok(stream)
    }

    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    fn subject_filter(&self) -> String {
        format!("{}.>", self.config.subject_prefix)
    }
}
