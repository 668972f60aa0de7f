//! SQS queue integration for notification fan-out
//!
//! Provides:
//! - SQS client wrapper
//! - Notification message serialization

use crate::collaborators::notify::EventKind;
use crate::errors::{AppError, Result};
use aws_sdk_sqs::Client as SqsClient;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// SQS queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue URL
    pub url: String,
    /// Delivery delay applied to every message (seconds)
    pub delay_seconds: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            delay_seconds: 0,
        }
    }
}

/// SQS Queue client wrapper
pub struct Queue {
    client: SqsClient,
    config: QueueConfig,
}

impl Queue {
    /// Create a new queue client from the ambient AWS configuration
    pub async fn new(config: QueueConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(AppError::Configuration {
                message: "SQS queue URL is empty".to_string(),
            });
        }

        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = SqsClient::new(&aws_config);

        Ok(Self { client, config })
    }

    /// Send a message to the queue
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<String> {
        let body = encode_message(message)?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.config.url)
            .message_body(&body);

        if self.config.delay_seconds > 0 {
            request = request.delay_seconds(self.config.delay_seconds);
        }

        let result = request.send().await.map_err(|e| AppError::QueueError {
            message: format!("Failed to send message: {}", e),
        })?;

        let message_id = result.message_id.unwrap_or_default();
        debug!(message_id = %message_id, "Message sent to queue");

        Ok(message_id)
    }
}

fn encode_message<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(|e| AppError::QueueError {
        message: format!("Failed to serialize message: {}", e),
    })
}

/// Notification handed to the notification service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Consumers deduplicate on this id
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub kind: EventKind,
    pub data: serde_json::Value,
}
