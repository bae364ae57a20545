//! Background expiration sweep.
//!
//! A periodic task asks the engine to expire due approvals and refreshes
//! the posted notification for each newly expired record. Overlap between
//! a slow sweep and the next tick is prevented by a single-flight guard;
//! even without it, the store's terminal-transition check makes a repeated
//! sweep harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::approval::{Approval, ApprovalEngine};
use crate::chat::{approval_blocks, approval_text, ChatClient};
use crate::credentials::CredentialResolver;

pub struct ExpirationSweeper {
    engine: Arc<ApprovalEngine>,
    resolver: Arc<CredentialResolver>,
    chat: Arc<dyn ChatClient>,
    running: Mutex<()>,
}

impl ExpirationSweeper {
    pub fn new(
        engine: Arc<ApprovalEngine>,
        resolver: Arc<CredentialResolver>,
        chat: Arc<dyn ChatClient>,
    ) -> Self {
        Self {
            engine,
            resolver,
            chat,
            running: Mutex::new(()),
        }
    }

    /// Drive the sweep forever at the given interval.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once(Utc::now()).await {
                error!(error = %e, "Expiration sweep failed");
            }
        }
    }

    /// Run one sweep at `now`, returning the newly expired records.
    ///
    /// Re-entrant safe: a sweep that finds another still in flight skips
    /// its turn instead of double-processing.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Approval>> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous expiration sweep still running, skipping tick");
            return Ok(Vec::new());
        };

        let expired = self.engine.expire_due(now).await?;

        for approval in &expired {
            info!(
                approval_id = %approval.id,
                tenant_id = %approval.tenant_id,
                "Approval expired"
            );
            self.refresh_message(approval).await;
        }

        Ok(expired)
    }

    /// Update the posted notification for an expired record. Best effort;
    /// an unreachable chat platform must not abort the sweep.
    async fn refresh_message(&self, approval: &Approval) {
        let Some(message) = &approval.message_ref else {
            return;
        };

        match self.resolver.resolve(&approval.tenant_id, None).await {
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
                    warn!(error = %e, approval_id = %approval.id, "Failed to update expired card");
                }
            }
            Err(e) => {
                warn!(error = %e, tenant_id = %approval.tenant_id, "No credential to update expired card");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::store::{Installation, MemoryStore};
    use crate::approval::{ApprovalKind, CreateApproval};
    use crate::chat::{ChannelInfo, ChatError, MessageRef};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingChat {
        updates: StdMutex<Vec<(MessageRef, String)>>,
    }

    #[async_trait]
    impl ChatClient for RecordingChat {
        async fn post_message(
            &self,
            _token: &str,
            channel: &str,
            _text: &str,
            _blocks: Option<serde_json::Value>,
        ) -> Result<MessageRef, ChatError> {
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
            _blocks: Option<serde_json::Value>,
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
            _channel: &str,
            _user: &str,
            _text: &str,
        ) -> Result<(), ChatError> {
            Ok(())
        }

        async fn list_channels(&self, _token: &str) -> Result<Vec<ChannelInfo>, ChatError> {
            Ok(vec![])
        }
    }

    struct Fixture {
        sweeper: ExpirationSweeper,
        engine: Arc<ApprovalEngine>,
        chat: Arc<RecordingChat>,
    }

    fn fixture() -> Fixture {
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

        Fixture {
            sweeper: ExpirationSweeper::new(engine.clone(), resolver, chat.clone()),
            engine,
            chat,
        }
    }

    async fn soon_to_expire(fx: &Fixture, with_message: bool) -> String {
        let approval = fx
            .engine
            .create(CreateApproval {
                kind: ApprovalKind::Content,
                tenant_id: "T1".into(),
                title: "Publish the post".into(),
                description: None,
                payload: serde_json::Value::Null,
                priority: 0,
                channel_ref: "C1".into(),
                expires_at: Some(Utc::now() + chrono::Duration::seconds(1)),
            })
            .await
            .unwrap();

        if with_message {
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
        }

        approval.id
    }

    #[tokio::test]
    async fn sweep_expires_and_updates_posted_cards() {
        let fx = fixture();
        let id = soon_to_expire(&fx, true).await;

        let later = Utc::now() + chrono::Duration::seconds(2);
        let expired = fx.sweeper.sweep_once(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);

        let updates = fx.chat.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.contains("Expired"));
    }

    #[tokio::test]
    async fn repeated_sweeps_do_not_double_report() {
        let fx = fixture();
        soon_to_expire(&fx, true).await;

        let later = Utc::now() + chrono::Duration::seconds(2);
        assert_eq!(fx.sweeper.sweep_once(later).await.unwrap().len(), 1);
        assert!(fx.sweeper.sweep_once(later).await.unwrap().is_empty());

        // Only the first sweep touched the card.
        assert_eq!(fx.chat.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn records_without_a_posted_card_still_expire() {
        let fx = fixture();
        let id = soon_to_expire(&fx, false).await;

        let later = Utc::now() + chrono::Duration::seconds(2);
        let expired = fx.sweeper.sweep_once(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
        assert!(fx.chat.updates.lock().unwrap().is_empty());
    }
}
