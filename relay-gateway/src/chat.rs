//! Chat-platform client.
//!
//! The gateway talks to the chat platform's Web API to post and update
//! approval notifications. Tokens are per-tenant and supplied per call by
//! the credential resolver; this client holds no credentials of its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approval::{Approval, ApprovalStatus};

/// Action id carried by the approve button on a notification card.
pub const ACTION_APPROVE: &str = "approve";
/// Action id carried by the reject button on a notification card.
pub const ACTION_REJECT: &str = "reject";

/// Identifies a posted message so it can be edited later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// Channel the message was posted to
    pub channel: String,
    /// Platform message timestamp (the message id)
    pub ts: String,
}

/// A channel visible to the bot.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

/// Error talking to the chat platform.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The platform answered with `ok: false`
    #[error("chat API error: {0}")]
    Api(String),

    /// Transport-level failure
    #[error("chat request failed: {0}")]
    Transport(String),
}

/// Client capability consumed by the router and the sweeper.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post a message, returning a reference for later edits.
    async fn post_message(
        &self,
        token: &str,
        channel: &str,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<MessageRef, ChatError>;

    /// Replace the content of a previously posted message.
    async fn update_message(
        &self,
        token: &str,
        message: &MessageRef,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<(), ChatError>;

    /// Post a message visible only to one user.
    async fn post_ephemeral(
        &self,
        token: &str,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), ChatError>;

    /// List channels the bot can post to.
    async fn list_channels(&self, token: &str) -> Result<Vec<ChannelInfo>, ChatError>;
}

/// Web API implementation of [`ChatClient`].
pub struct ApiChatClient {
    api_base: String,
    client: reqwest::Client,
}

impl ApiChatClient {
    /// Create a client against the given Web API base URL.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// POST a JSON body to a Web API method and unwrap the `ok` envelope.
    async fn call(
        &self,
        token: &str,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ChatError> {
        let url = format!("{}/{}", self.api_base, method);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        if !data.get("ok").and_then(|o| o.as_bool()).unwrap_or(false) {
            let error = data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            return Err(ChatError::Api(error.to_string()));
        }

        Ok(data)
    }
}

#[async_trait]
impl ChatClient for ApiChatClient {
    async fn post_message(
        &self,
        token: &str,
        channel: &str,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<MessageRef, ChatError> {
        let mut body = serde_json::json!({ "channel": channel, "text": text });
        if let Some(blocks) = blocks {
            body["blocks"] = blocks;
        }

        let data = self.call(token, "chat.postMessage", body).await?;

        let ts = data
            .get("ts")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ChatError::Api("response missing message timestamp".into()))?;

        Ok(MessageRef {
            channel: channel.to_string(),
            ts: ts.to_string(),
        })
    }

    async fn update_message(
        &self,
        token: &str,
        message: &MessageRef,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<(), ChatError> {
        let mut body = serde_json::json!({
            "channel": message.channel,
            "ts": message.ts,
            "text": text,
        });
        if let Some(blocks) = blocks {
            body["blocks"] = blocks;
        }

        self.call(token, "chat.update", body).await?;
        Ok(())
    }

    async fn post_ephemeral(
        &self,
        token: &str,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), ChatError> {
        let body = serde_json::json!({ "channel": channel, "user": user, "text": text });
        self.call(token, "chat.postEphemeral", body).await?;
        Ok(())
    }

    async fn list_channels(&self, token: &str) -> Result<Vec<ChannelInfo>, ChatError> {
        let data = self
            .call(token, "conversations.list", serde_json::json!({}))
            .await?;

        let channels = data
            .get("channels")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));

        serde_json::from_value(channels).map_err(|e| ChatError::Transport(e.to_string()))
    }
}

/// Single-line summary of an approval for notification text.
pub fn approval_text(approval: &Approval) -> String {
    match &approval.status {
        ApprovalStatus::Pending => format!(
            "Approval needed [{}]: {}",
            approval.kind.name(),
            approval.title
        ),
        ApprovalStatus::Approved { by, .. } => {
            format!("Approved by {}: {}", by, approval.title)
        }
        ApprovalStatus::Rejected { by, reason, .. } => match reason {
            Some(reason) => format!("Rejected by {} ({}): {}", by, reason, approval.title),
            None => format!("Rejected by {}: {}", by, approval.title),
        },
        ApprovalStatus::Expired { .. } => {
            format!("Expired without a decision: {}", approval.title)
        }
    }
}

/// Block-kit payload for an approval notification.
///
/// Pending approvals carry approve/reject buttons whose value is the
/// approval id; terminal records render as plain text.
pub fn approval_blocks(approval: &Approval) -> serde_json::Value {
    let mut text = approval_text(approval);
    if let Some(desc) = &approval.description {
        text.push('\n');
        text.push_str(desc);
    }

    let section = serde_json::json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": text },
    });

    if !matches!(approval.status, ApprovalStatus::Pending) {
        return serde_json::json!([section]);
    }

    serde_json::json!([
        section,
        {
            "type": "actions",
            "elements": [
                {
                    "type": "button",
                    "text": { "type": "plain_text", "text": "Approve" },
                    "style": "primary",
                    "action_id": ACTION_APPROVE,
                    "value": approval.id,
                },
                {
                    "type": "button",
                    "text": { "type": "plain_text", "text": "Reject" },
                    "style": "danger",
                    "action_id": ACTION_REJECT,
                    "value": approval.id,
                },
            ],
        }
    ])
}
