//! Inbound event routing.
//!
//! A verified webhook payload is classified into a closed event set and
//! dispatched: button clicks drive the approval state machine, slash
//! commands create approvals, mentions and DMs are handed to the message
//! queue. The HTTP acknowledgment has already been sent by the time
//! dispatch runs; failures here are logged and reported to the user through
//! ephemeral messages, never through the webhook response.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::approval::{
    ApprovalEngine, ApprovalKind, CreateApproval, Decision, DecisionError,
};
use crate::chat::{approval_blocks, approval_text, ChatClient, ACTION_APPROVE, ACTION_REJECT};
use crate::credentials::CredentialResolver;
use crate::executor::ExecutorRegistry;
use crate::queue::{MessageQueue, QueuedMessage};
use crate::ratelimit::RateLimiter;

/// A button click on an approval notification.
#[derive(Debug, Clone)]
pub struct BlockAction {
    pub action_id: String,
    pub approval_id: String,
    pub user: String,
    pub channel: String,
    pub tenant_id: Option<String>,
    pub enterprise_id: Option<String>,
}

/// A slash command invocation.
#[derive(Debug, Clone)]
pub struct SlashCommand {
    pub command: String,
    pub text: String,
    pub user: String,
    pub channel: String,
    pub tenant_id: Option<String>,
    pub enterprise_id: Option<String>,
}

/// An at-mention or direct message.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub tenant_id: Option<String>,
    pub channel: String,
    pub user: String,
    pub text: String,
}

/// Everything a verified webhook payload can classify into.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// Platform endpoint handshake; answered inline, bypasses dispatch.
    UrlVerification { challenge: String },
    BlockAction(BlockAction),
    SlashCommand(SlashCommand),
    Mention(ConversationMessage),
    DirectMessage(ConversationMessage),
}

impl InboundEvent {
    /// Classify a payload. `None` means an event shape this gateway does
    /// not handle.
    pub fn classify(payload: &Value) -> Option<Self> {
        let event_type = payload.get("type").and_then(|t| t.as_str());

        match event_type {
            Some("url_verification") => {
                let challenge = payload.get("challenge")?.as_str()?.to_string();
                Some(InboundEvent::UrlVerification { challenge })
            }
            Some("block_actions") => {
                let action = payload.get("actions")?.as_array()?.first()?;
                Some(InboundEvent::BlockAction(BlockAction {
                    action_id: action.get("action_id")?.as_str()?.to_string(),
                    approval_id: action.get("value")?.as_str()?.to_string(),
                    user: str_at(payload, &["user", "id"])?.to_string(),
                    channel: str_at(payload, &["channel", "id"])
                        .or_else(|| str_at(payload, &["container", "channel_id"]))?
                        .to_string(),
                    tenant_id: str_at(payload, &["team", "id"])
                        .or_else(|| str_at(payload, &["team_id"]))
                        .map(String::from),
                    enterprise_id: str_at(payload, &["enterprise", "id"]).map(String::from),
                }))
            }
            Some("event_callback") => {
                let event = payload.get("event")?;
                let tenant_id = tenant_of(payload);
                let message = ConversationMessage {
                    tenant_id,
                    channel: str_at(event, &["channel"])?.to_string(),
                    user: str_at(event, &["user"])?.to_string(),
                    text: str_at(event, &["text"]).unwrap_or_default().to_string(),
                };

                match event.get("type").and_then(|t| t.as_str()) {
                    Some("app_mention") => Some(InboundEvent::Mention(message)),
                    Some("message")
                        if event.get("channel_type").and_then(|c| c.as_str()) == Some("im") =>
                    {
                        Some(InboundEvent::DirectMessage(message))
                    }
                    _ => None,
                }
            }
            _ if payload.get("command").is_some() => {
                Some(InboundEvent::SlashCommand(SlashCommand {
                    command: str_at(payload, &["command"])?.to_string(),
                    text: str_at(payload, &["text"]).unwrap_or_default().to_string(),
                    user: str_at(payload, &["user_id"])?.to_string(),
                    channel: str_at(payload, &["channel_id"])?.to_string(),
                    tenant_id: str_at(payload, &["team_id"]).map(String::from),
                    enterprise_id: str_at(payload, &["enterprise_id"]).map(String::from),
                }))
            }
            _ => None,
        }
    }

    /// Tenant carried by the event, when it has one.
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            InboundEvent::UrlVerification { .. } => None,
            InboundEvent::BlockAction(a) => a.tenant_id.as_deref(),
            InboundEvent::SlashCommand(c) => c.tenant_id.as_deref(),
            InboundEvent::Mention(m) | InboundEvent::DirectMessage(m) => m.tenant_id.as_deref(),
        }
    }
}

/// Tenant context of an event callback: top-level `team_id`, else the
/// nested `event.team`, else none.
fn tenant_of(payload: &Value) -> Option<String> {
    str_at(payload, &["team_id"])
        .or_else(|| str_at(payload, &["event", "team"]))
        .map(String::from)
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str()
}

/// What dispatch did with an event. Surfaced for logging and tests; the
/// webhook caller never sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ignored(&'static str),
    RateLimited,
    Created { approval_id: String },
    Decided { approval_id: String, status: &'static str },
    AlreadyDecided { approval_id: String },
    NotFound { approval_id: String },
    Queued { message_id: String },
    QueueFailed,
    Failed(&'static str),
}

/// Dispatches classified events to the engine, executors, and queue.
pub struct MessageRouter {
    engine: Arc<ApprovalEngine>,
    resolver: Arc<CredentialResolver>,
    chat: Arc<dyn ChatClient>,
    executors: Arc<ExecutorRegistry>,
    queue: Arc<dyn MessageQueue>,
    limiter: Arc<RateLimiter>,
}

impl MessageRouter {
    pub fn new(
        engine: Arc<ApprovalEngine>,
        resolver: Arc<CredentialResolver>,
        chat: Arc<dyn ChatClient>,
        executors: Arc<ExecutorRegistry>,
        queue: Arc<dyn MessageQueue>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            engine,
            resolver,
            chat,
            executors,
            queue,
            limiter,
        }
    }

    /// Handle one classified event to completion.
    pub async fn dispatch(&self, event: InboundEvent) -> DispatchOutcome {
        if let Some(tenant_id) = event.tenant_id() {
            if !self.limiter.check(tenant_id) {
                warn!(tenant_id = %tenant_id, "Tenant over event rate ceiling, dropping event");
                return DispatchOutcome::RateLimited;
            }
        }

        match event {
            // Answered at the ingress; nothing to do here.
            InboundEvent::UrlVerification { .. } => {
                DispatchOutcome::Ignored("url_verification is answered at the ingress")
            }
            InboundEvent::BlockAction(action) => self.handle_block_action(action).await,
            InboundEvent::SlashCommand(command) => self.handle_slash_command(command).await,
            InboundEvent::Mention(message) | InboundEvent::DirectMessage(message) => {
                self.handle_conversation(message).await
            }
        }
    }

    async fn handle_block_action(&self, action: BlockAction) -> DispatchOutcome {
        let Some(tenant_id) = action.tenant_id.clone() else {
            warn!(approval_id = %action.approval_id, "Block action without tenant context");
            return DispatchOutcome::Ignored("block action without tenant context");
        };

        let approval = match self.engine.get(&action.approval_id).await {
            Ok(Some(approval)) => approval,
            Ok(None) => {
                self.notify_user(
                    &tenant_id,
                    action.enterprise_id.as_deref(),
                    &action.channel,
                    &action.user,
                    "That approval no longer exists.",
                )
                .await;
                return DispatchOutcome::NotFound {
                    approval_id: action.approval_id,
                };
            }
            Err(e) => {
                error!(error = %e, approval_id = %action.approval_id, "Failed to read approval");
                self.notify_user(
                    &tenant_id,
                    action.enterprise_id.as_deref(),
                    &action.channel,
                    &action.user,
                    "Something went wrong handling that click. Please try again.",
                )
                .await;
                return DispatchOutcome::Failed("approval read failed");
            }
        };

        if approval.status.is_terminal() {
            self.notify_user(
                &tenant_id,
                action.enterprise_id.as_deref(),
                &action.channel,
                &action.user,
                &already_decided_notice(approval.status.name(), approval.status.decided_by()),
            )
            .await;
            return DispatchOutcome::AlreadyDecided {
                approval_id: approval.id,
            };
        }

        let decision_result = match action.action_id.as_str() {
            ACTION_REJECT => {
                self.engine
                    .decide(&approval.id, Decision::Reject, &action.user, None, None)
                    .await
            }
            ACTION_APPROVE => {
                // Run the gated action first; its outcome picks the branch.
                match self.executors.execute(&approval, &action.user).await {
                    Ok(outcome) if outcome.success => {
                        self.engine
                            .decide(
                                &approval.id,
                                Decision::Approve,
                                &action.user,
                                None,
                                outcome.outcome_ref,
                            )
                            .await
                    }
                    Ok(outcome) => {
                        self.engine
                            .decide(
                                &approval.id,
                                Decision::Reject,
                                &action.user,
                                Some(outcome.summary),
                                outcome.outcome_ref,
                            )
                            .await
                    }
                    Err(e) => {
                        // Raw executor errors stay in the logs; the channel
                        // only sees a summary.
                        error!(error = %e, approval_id = %approval.id, "Executor failed");
                        self.engine
                            .decide(
                                &approval.id,
                                Decision::Reject,
                                &action.user,
                                Some("action execution failed".into()),
                                None,
                            )
                            .await
                    }
                }
            }
            other => {
                warn!(action_id = %other, "Unknown block action id");
                return DispatchOutcome::Ignored("unknown action id");
            }
        };

        match decision_result {
            Ok(updated) => {
                let status = updated.status.name();
                self.refresh_message(&updated, action.enterprise_id.as_deref())
                    .await;
                info!(
                    approval_id = %updated.id,
                    status = status,
                    actor = %action.user,
                    "Approval decided via block action"
                );
                DispatchOutcome::Decided {
                    approval_id: updated.id,
                    status,
                }
            }
            Err(DecisionError::AlreadyDecided { status, decided_by }) => {
                // Lost the race against a concurrent decision.
                self.notify_user(
                    &tenant_id,
                    action.enterprise_id.as_deref(),
                    &action.channel,
                    &action.user,
                    &already_decided_notice(status, decided_by.as_deref()),
                )
                .await;
                DispatchOutcome::AlreadyDecided {
                    approval_id: approval.id,
                }
            }
            Err(DecisionError::NotFound(id)) => DispatchOutcome::NotFound { approval_id: id },
            Err(DecisionError::Store(e)) => {
                error!(error = %e, approval_id = %approval.id, "Decision failed at the store");
                self.notify_user(
                    &tenant_id,
                    action.enterprise_id.as_deref(),
                    &action.channel,
                    &action.user,
                    "Something went wrong recording that decision. Please try again.",
                )
                .await;
                DispatchOutcome::Failed("store decide failed")
            }
        }
    }

    async fn handle_slash_command(&self, command: SlashCommand) -> DispatchOutcome {
        let Some(tenant_id) = command.tenant_id.clone() else {
            warn!(command = %command.command, "Slash command without tenant context");
            return DispatchOutcome::Ignored("slash command without tenant context");
        };

        let Some((kind, title)) = parse_command_text(&command.text) else {
            self.notify_user(
                &tenant_id,
                command.enterprise_id.as_deref(),
                &command.channel,
                &command.user,
                &usage_hint(),
            )
            .await;
            return DispatchOutcome::Ignored("unparseable slash command");
        };

        let created = self
            .engine
            .create(CreateApproval {
                kind,
                tenant_id: tenant_id.clone(),
                title,
                description: None,
                payload: Value::Null,
                priority: 0,
                channel_ref: command.channel.clone(),
                expires_at: None,
            })
            .await;

        let approval = match created {
            Ok(approval) => approval,
            Err(e) => {
                error!(error = %e, tenant_id = %tenant_id, "Failed to create approval");
                self.notify_user(
                    &tenant_id,
                    command.enterprise_id.as_deref(),
                    &command.channel,
                    &command.user,
                    "Couldn't create the approval. Please try again.",
                )
                .await;
                return DispatchOutcome::Failed("approval create failed");
            }
        };

        // Post the notification card. The record already exists; a posting
        // failure only costs the card, not the approval.
        match self
            .resolver
            .resolve(&tenant_id, command.enterprise_id.as_deref())
            .await
        {
            Ok(credential) => {
                match self
                    .chat
                    .post_message(
                        &credential.bot_token,
                        &command.channel,
                        &approval_text(&approval),
                        Some(approval_blocks(&approval)),
                    )
                    .await
                {
                    Ok(message) => {
                        if let Err(e) = self.engine.set_message_ref(&approval.id, &message).await {
                            warn!(error = %e, approval_id = %approval.id, "Failed to record message ref");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, approval_id = %approval.id, "Failed to post approval card");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, tenant_id = %tenant_id, "No credential to post approval card");
            }
        }

        DispatchOutcome::Created {
            approval_id: approval.id,
        }
    }

    async fn handle_conversation(&self, message: ConversationMessage) -> DispatchOutcome {
        let queued = QueuedMessage::new(
            message.tenant_id.clone(),
            message.channel.clone(),
            message.user.clone(),
            message.text,
        );
        let message_id = queued.id.clone();

        match self.queue.enqueue(queued).await {
            Ok(()) => {
                // No immediate response: the reply arrives out-of-band.
                info!(message_id = %message_id, "Conversation message queued");
                DispatchOutcome::Queued { message_id }
            }
            Err(e) => {
                error!(error = %e, "Failed to queue conversation message");
                if let Some(tenant_id) = message.tenant_id.as_deref() {
                    self.notify_user(
                        tenant_id,
                        None,
                        &message.channel,
                        &message.user,
                        "I couldn't take that message right now. Please try again shortly.",
                    )
                    .await;
                }
                DispatchOutcome::QueueFailed
            }
        }
    }

    /// Update the posted notification to reflect an approval's current
    /// state. Best effort.
    async fn refresh_message(&self, approval: &crate::approval::Approval, enterprise_id: Option<&str>) {
        let Some(message) = &approval.message_ref else {
            return;
        };

        match self.resolver.resolve(&approval.tenant_id, enterprise_id).await {
            Ok(credential) => {
                if let Err(e) = self
                    .chat
                    .update_message(
                        &credential.bot_token,
                        message,
                        &approval_text(approval),
                        Some(approval_blocks(approval)),
                    )
                    .await
                {
                    warn!(error = %e, approval_id = %approval.id, "Failed to update approval card");
                }
            }
            Err(e) => {
                warn!(error = %e, tenant_id = %approval.tenant_id, "No credential to update approval card");
            }
        }
    }

    /// Ephemeral note to the acting user. Best effort; failures only log.
    async fn notify_user(
        &self,
        tenant_id: &str,
        enterprise_id: Option<&str>,
        channel: &str,
        user: &str,
        text: &str,
    ) {
        match self.resolver.resolve(tenant_id, enterprise_id).await {
            Ok(credential) => {
                if let Err(e) = self
                    .chat
                    .post_ephemeral(&credential.bot_token, channel, user, text)
                    .await
                {
                    warn!(error = %e, "Failed to post ephemeral notice");
                }
            }
            Err(e) => {
                warn!(error = %e, tenant_id = %tenant_id, "No credential for ephemeral notice");
            }
        }
    }
}

fn already_decided_notice(status: &str, decided_by: Option<&str>) -> String {
    match decided_by {
        Some(by) => format!("This request was already {} by {}.", status, by),
        None => format!("This request is already {}.", status),
    }
}

fn usage_hint() -> String {
    let kinds: Vec<&str> = ApprovalKind::ALL.iter().map(|k| k.name()).collect();
    format!("Usage: /approvals <{}> <title>", kinds.join("|"))
}

/// Parse `<kind> <title...>` from a slash command's text.
fn parse_command_text(text: &str) -> Option<(ApprovalKind, String)> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let kind = ApprovalKind::parse(parts.next()?)?;
    let title = parts.next()?.trim();
    if title.is_empty() {
        return None;
    }
    Some((kind, title.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::store::{Installation, MemoryStore};
    use crate::approval::ApprovalStatus;
    use crate::chat::{ChannelInfo, ChatError, MessageRef};
    use crate::queue::QueueError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChat {
        posts: Mutex<Vec<(String, String)>>,
        updates: Mutex<Vec<(MessageRef, String)>>,
        ephemerals: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl ChatClient for RecordingChat {
        async fn post_message(
            &self,
            _token: &str,
            channel: &str,
            text: &str,
            _blocks: Option<Value>,
        ) -> Result<MessageRef, ChatError> {
            self.posts
                .lock()
                .unwrap()
                .push((channel.to_string(), text.to_string()));
            Ok(MessageRef {
                channel: channel.to_string(),
                ts: "1700.0001".into(),
            })
        }

        async fn update_message(
            &self,
            _token: &str,
            message: &MessageRef,
            text: &str,
            _blocks: Option<Value>,
        ) -> Result<(), ChatError> {
            self.updates
                .lock()
                .unwrap()
                .push((message.clone(), text.to_string()));
            Ok(())
        }

        async fn post_ephemeral(
            &self,
            _token: &str,
            channel: &str,
            user: &str,
            text: &str,
        ) -> Result<(), ChatError> {
            self.ephemerals.lock().unwrap().push((
                channel.to_string(),
                user.to_string(),
                text.to_string(),
            ));
            Ok(())
        }

        async fn list_channels(&self, _token: &str) -> Result<Vec<ChannelInfo>, ChatError> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        sent: Mutex<Vec<QueuedMessage>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl MessageQueue for RecordingQueue {
        async fn enqueue(&self, message: QueuedMessage) -> Result<(), QueueError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(QueueError::Transport("queue offline".into()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct Fixture {
        router: MessageRouter,
        engine: Arc<ApprovalEngine>,
        chat: Arc<RecordingChat>,
        queue: Arc<RecordingQueue>,
    }

    fn fixture() -> Fixture {
        fixture_with_ceiling(1000)
    }

    fn fixture_with_ceiling(ceiling: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.put_installation(Installation {
            tenant_id: "T1".into(),
            bot_token: "xoxb-t1".into(),
            bot_id: "B1".into(),
            bot_user_id: "U-bot".into(),
            tenant_name: None,
        });

        let engine = Arc::new(ApprovalEngine::new(store.clone()));
        let resolver = Arc::new(CredentialResolver::new(store, None, 300));
        let chat = Arc::new(RecordingChat::default());
        let queue = Arc::new(RecordingQueue::default());
        let limiter = Arc::new(RateLimiter::new(ceiling, 60));

        let router = MessageRouter::new(
            engine.clone(),
            resolver,
            chat.clone(),
            Arc::new(ExecutorRegistry::with_defaults()),
            queue.clone(),
            limiter,
        );

        Fixture {
            router,
            engine,
            chat,
            queue,
        }
    }

    async fn pending_approval(fx: &Fixture) -> crate::approval::Approval {
        let approval = fx
            .engine
            .create(CreateApproval {
                kind: ApprovalKind::Pr,
                tenant_id: "T1".into(),
                title: "Merge the fix".into(),
                description: None,
                payload: Value::Null,
                priority: 0,
                channel_ref: "C1".into(),
                expires_at: None,
            })
            .await
            .unwrap();

        fx.engine
            .set_message_ref(
                &approval.id,
                &MessageRef {
                    channel: "C1".into(),
                    ts: "1700.0042".into(),
                },
            )
            .await
            .unwrap();

        fx.engine.get(&approval.id).await.unwrap().unwrap()
    }

    fn block_action(approval_id: &str, action_id: &str, user: &str) -> InboundEvent {
        InboundEvent::BlockAction(BlockAction {
            action_id: action_id.into(),
            approval_id: approval_id.into(),
            user: user.into(),
            channel: "C1".into(),
            tenant_id: Some("T1".into()),
            enterprise_id: None,
        })
    }

    // ===== classification =====

    #[test]
    fn classify_url_verification() {
        let payload = serde_json::json!({
            "type": "url_verification",
            "challenge": "abc123",
        });
        match InboundEvent::classify(&payload) {
            Some(InboundEvent::UrlVerification { challenge }) => assert_eq!(challenge, "abc123"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_block_action() {
        let payload = serde_json::json!({
            "type": "block_actions",
            "user": { "id": "U123" },
            "team": { "id": "T1" },
            "channel": { "id": "C1" },
            "actions": [{ "action_id": "approve", "value": "ap-9" }],
        });
        match InboundEvent::classify(&payload) {
            Some(InboundEvent::BlockAction(action)) => {
                assert_eq!(action.action_id, "approve");
                assert_eq!(action.approval_id, "ap-9");
                assert_eq!(action.user, "U123");
                assert_eq!(action.tenant_id.as_deref(), Some("T1"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_mention_with_nested_team_fallback() {
        let payload = serde_json::json!({
            "type": "event_callback",
            "event": {
                "type": "app_mention",
                "team": "T-nested",
                "channel": "C1",
                "user": "U1",
                "text": "<@bot> status please",
            },
        });
        match InboundEvent::classify(&payload) {
            Some(InboundEvent::Mention(m)) => {
                assert_eq!(m.tenant_id.as_deref(), Some("T-nested"));
                assert_eq!(m.channel, "C1");
            }
            other => panic!("unexpected classification: {other:?}"),
        }

        // Top-level team_id wins over the nested field.
        let payload = serde_json::json!({
            "type": "event_callback",
            "team_id": "T-top",
            "event": {
                "type": "app_mention",
                "team": "T-nested",
                "channel": "C1",
                "user": "U1",
                "text": "hi",
            },
        });
        match InboundEvent::classify(&payload) {
            Some(InboundEvent::Mention(m)) => assert_eq!(m.tenant_id.as_deref(), Some("T-top")),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_direct_message_requires_im_channel() {
        let dm = serde_json::json!({
            "type": "event_callback",
            "team_id": "T1",
            "event": {
                "type": "message",
                "channel_type": "im",
                "channel": "D1",
                "user": "U1",
                "text": "hello",
            },
        });
        assert!(matches!(
            InboundEvent::classify(&dm),
            Some(InboundEvent::DirectMessage(_))
        ));

        // A channel message is not a DM and is not handled.
        let channel_msg = serde_json::json!({
            "type": "event_callback",
            "team_id": "T1",
            "event": {
                "type": "message",
                "channel_type": "channel",
                "channel": "C1",
                "user": "U1",
                "text": "hello",
            },
        });
        assert!(InboundEvent::classify(&channel_msg).is_none());
    }

    #[test]
    fn classify_slash_command() {
        let payload = serde_json::json!({
            "command": "/approvals",
            "text": "pr Merge the fix",
            "user_id": "U1",
            "channel_id": "C1",
            "team_id": "T1",
        });
        match InboundEvent::classify(&payload) {
            Some(InboundEvent::SlashCommand(c)) => {
                assert_eq!(c.command, "/approvals");
                assert_eq!(c.text, "pr Merge the fix");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_unknown_payload() {
        assert!(InboundEvent::classify(&serde_json::json!({ "type": "app_rate_limited" })).is_none());
        assert!(InboundEvent::classify(&serde_json::json!({})).is_none());
    }

    #[test]
    fn parse_command_text_variants() {
        let (kind, title) = parse_command_text("pr Merge the fix").unwrap();
        assert_eq!(kind, ApprovalKind::Pr);
        assert_eq!(title, "Merge the fix");

        assert!(parse_command_text("").is_none());
        assert!(parse_command_text("pr").is_none());
        assert!(parse_command_text("deploy something").is_none());
    }

    // ===== dispatch =====

    #[tokio::test]
    async fn approve_click_runs_executor_and_updates_message() {
        let fx = fixture();
        let approval = pending_approval(&fx).await;

        let outcome = fx
            .router
            .dispatch(block_action(&approval.id, ACTION_APPROVE, "alice"))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Decided {
                approval_id: approval.id.clone(),
                status: "approved",
            }
        );

        let decided = fx.engine.get(&approval.id).await.unwrap().unwrap();
        assert_eq!(decided.status.decided_by(), Some("alice"));
        assert!(decided.outcome_ref.is_some());

        let updates = fx.chat.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.contains("Approved by alice"));
    }

    #[tokio::test]
    async fn reject_click_skips_the_executor() {
        let fx = fixture();
        let approval = pending_approval(&fx).await;

        let outcome = fx
            .router
            .dispatch(block_action(&approval.id, ACTION_REJECT, "bob"))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Decided {
                approval_id: approval.id.clone(),
                status: "rejected",
            }
        );

        let decided = fx.engine.get(&approval.id).await.unwrap().unwrap();
        assert_eq!(decided.status.decided_by(), Some("bob"));
        // No executor ran, so no outcome reference.
        assert!(decided.outcome_ref.is_none());
    }

    #[tokio::test]
    async fn executor_failure_takes_the_reject_branch() {
        struct Failing;

        #[async_trait]
        impl crate::executor::ActionExecutor for Failing {
            async fn execute(
                &self,
                _approval: &crate::approval::Approval,
                _actor: &str,
            ) -> anyhow::Result<crate::executor::ExecutionOutcome> {
                Ok(crate::executor::ExecutionOutcome::failure("merge conflict"))
            }
        }

        let store = Arc::new(MemoryStore::new());
        store.put_installation(Installation {
            tenant_id: "T1".into(),
            bot_token: "xoxb-t1".into(),
            bot_id: "B1".into(),
            bot_user_id: "U-bot".into(),
            tenant_name: None,
        });
        let engine = Arc::new(ApprovalEngine::new(store.clone()));
        let chat = Arc::new(RecordingChat::default());
        let mut executors = ExecutorRegistry::new();
        executors.register(ApprovalKind::Pr, Arc::new(Failing));

        let router = MessageRouter::new(
            engine.clone(),
            Arc::new(CredentialResolver::new(store, None, 300)),
            chat.clone(),
            Arc::new(executors),
            Arc::new(RecordingQueue::default()),
            Arc::new(RateLimiter::new(1000, 60)),
        );

        let approval = engine
            .create(CreateApproval {
                kind: ApprovalKind::Pr,
                tenant_id: "T1".into(),
                title: "Merge the fix".into(),
                description: None,
                payload: Value::Null,
                priority: 0,
                channel_ref: "C1".into(),
                expires_at: None,
            })
            .await
            .unwrap();

        let outcome = router
            .dispatch(block_action(&approval.id, ACTION_APPROVE, "alice"))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Decided {
                approval_id: approval.id.clone(),
                status: "rejected",
            }
        );

        let decided = engine.get(&approval.id).await.unwrap().unwrap();
        match &decided.status {
            ApprovalStatus::Rejected { by, reason, .. } => {
                assert_eq!(by, "alice");
                assert_eq!(reason.as_deref(), Some("merge conflict"));
            }
            other => panic!("expected rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn click_on_decided_approval_notifies_without_mutating() {
        let fx = fixture();
        let approval = pending_approval(&fx).await;

        fx.engine
            .decide(&approval.id, Decision::Approve, "alice", None, None)
            .await
            .unwrap();

        let outcome = fx
            .router
            .dispatch(block_action(&approval.id, ACTION_APPROVE, "bob"))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::AlreadyDecided {
                approval_id: approval.id.clone(),
            }
        );

        // The first decision stands and bob was told who beat him to it.
        let current = fx.engine.get(&approval.id).await.unwrap().unwrap();
        assert_eq!(current.status.decided_by(), Some("alice"));

        let ephemerals = fx.chat.ephemerals.lock().unwrap();
        assert_eq!(ephemerals.len(), 1);
        assert_eq!(ephemerals[0].1, "bob");
        assert!(ephemerals[0].2.contains("alice"));
        assert!(ephemerals[0].2.contains("approved"));
    }

    #[tokio::test]
    async fn click_on_unknown_approval_reports_not_found() {
        let fx = fixture();

        let outcome = fx
            .router
            .dispatch(block_action("ghost", ACTION_APPROVE, "alice"))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::NotFound {
                approval_id: "ghost".into(),
            }
        );
        assert_eq!(fx.chat.ephemerals.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slash_command_creates_and_posts_card() {
        let fx = fixture();

        let outcome = fx
            .router
            .dispatch(InboundEvent::SlashCommand(SlashCommand {
                command: "/approvals".into(),
                text: "run Nightly batch".into(),
                user: "U1".into(),
                channel: "C7".into(),
                tenant_id: Some("T1".into()),
                enterprise_id: None,
            }))
            .await;

        let DispatchOutcome::Created { approval_id } = outcome else {
            panic!("expected Created, got {outcome:?}");
        };

        let approval = fx.engine.get(&approval_id).await.unwrap().unwrap();
        assert_eq!(approval.kind, ApprovalKind::Run);
        assert_eq!(approval.title, "Nightly batch");
        assert_eq!(approval.channel_ref, "C7");
        // The posted card was recorded on the approval for later edits.
        assert!(approval.message_ref.is_some());

        assert_eq!(fx.chat.posts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_slash_command_gets_a_usage_hint() {
        let fx = fixture();

        let outcome = fx
            .router
            .dispatch(InboundEvent::SlashCommand(SlashCommand {
                command: "/approvals".into(),
                text: "frobnicate".into(),
                user: "U1".into(),
                channel: "C1".into(),
                tenant_id: Some("T1".into()),
                enterprise_id: None,
            }))
            .await;

        assert_eq!(outcome, DispatchOutcome::Ignored("unparseable slash command"));
        let ephemerals = fx.chat.ephemerals.lock().unwrap();
        assert!(ephemerals[0].2.contains("Usage:"));
    }

    #[tokio::test]
    async fn mention_is_queued_with_no_immediate_reply() {
        let fx = fixture();

        let outcome = fx
            .router
            .dispatch(InboundEvent::Mention(ConversationMessage {
                tenant_id: Some("T1".into()),
                channel: "C1".into(),
                user: "U1".into(),
                text: "<@bot> what's pending?".into(),
            }))
            .await;

        assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
        let sent = fx.queue.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tenant_id.as_deref(), Some("T1"));
        // Nothing was posted back.
        assert!(fx.chat.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_failure_produces_a_user_visible_error() {
        let fx = fixture();
        fx.queue.fail.store(true, Ordering::SeqCst);

        let outcome = fx
            .router
            .dispatch(InboundEvent::DirectMessage(ConversationMessage {
                tenant_id: Some("T1".into()),
                channel: "D1".into(),
                user: "U1".into(),
                text: "hello".into(),
            }))
            .await;

        assert_eq!(outcome, DispatchOutcome::QueueFailed);
        let ephemerals = fx.chat.ephemerals.lock().unwrap();
        assert_eq!(ephemerals.len(), 1);
        assert!(ephemerals[0].2.contains("couldn't take that message"));
    }

    #[tokio::test]
    async fn tenants_over_the_ceiling_are_dropped() {
        let fx = fixture_with_ceiling(2);

        let event = || {
            InboundEvent::Mention(ConversationMessage {
                tenant_id: Some("T1".into()),
                channel: "C1".into(),
                user: "U1".into(),
                text: "ping".into(),
            })
        };

        assert!(matches!(
            fx.router.dispatch(event()).await,
            DispatchOutcome::Queued { .. }
        ));
        assert!(matches!(
            fx.router.dispatch(event()).await,
            DispatchOutcome::Queued { .. }
        ));
        assert_eq!(fx.router.dispatch(event()).await, DispatchOutcome::RateLimited);
    }
}
