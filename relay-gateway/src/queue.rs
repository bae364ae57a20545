//! Message-queue hand-off for mentions and direct messages.
//!
//! Conversational events are not answered inline: the router records them
//! as queued messages and hands them to the worker service. The eventual
//! reply travels back through a separate out-of-band channel, correlated by
//! the message id; from this gateway's perspective the hand-off is the end
//! of the request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A mention or DM captured for asynchronous processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Correlation id for the out-of-band reply
    pub id: String,
    /// Tenant the message came from, when the event carried one
    pub tenant_id: Option<String>,
    /// Channel to reply into
    pub channel: String,
    /// User who wrote the message
    pub user: String,
    /// Raw message text
    pub text: String,
    /// When the gateway accepted the event
    pub received_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(
        tenant_id: Option<String>,
        channel: impl Into<String>,
        user: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            channel: channel.into(),
            user: user.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Error handing a message to the queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Transport(String),

    #[error("queue rejected message: {status} - {message}")]
    Rejected { status: u16, message: String },
}

/// Queue capability consumed by the router.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message for asynchronous processing. Success means the
    /// hand-off happened; no reply is produced here.
    async fn enqueue(&self, message: QueuedMessage) -> Result<(), QueueError>;
}

/// HTTP client for the worker service's queue endpoint.
#[derive(Clone)]
pub struct HttpMessageQueue {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMessageQueue {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessageQueue for HttpMessageQueue {
    async fn enqueue(&self, message: QueuedMessage) -> Result<(), QueueError> {
        let url = format!("{}/api/v1/queue/messages", self.endpoint);

        let response = self
            .client
            .post(&url)
            .json(&message)
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(QueueError::Rejected {
                status,
                message: body,
            });
        }

        Ok(())
    }
}
