//! The approval engine.
//!
//! Owns the approval state machine: creation, single-decision enforcement,
//! and the time-based expiration sweep. The remote store is the system of
//! record; the engine's in-process cache only accelerates reads and is
//! never consulted for a decision's validity.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{ApprovalStore, StoreError};
use super::{Approval, ApprovalStatus, CreateApproval, CreateError, Decision, DecisionError};
use crate::chat::MessageRef;

pub struct ApprovalEngine {
    store: Arc<dyn ApprovalStore>,
    cache: RwLock<HashMap<String, Approval>>,
}

impl ApprovalEngine {
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new pending approval, persist it, and cache it for fast
    /// read-back.
    pub async fn create(&self, request: CreateApproval) -> Result<Approval, CreateError> {
        let now = Utc::now();

        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(CreateError::ExpiresInPast);
            }
        }

        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            kind: request.kind,
            tenant_id: request.tenant_id,
            title: request.title,
            description: request.description,
            payload: request.payload,
            priority: request.priority,
            status: ApprovalStatus::Pending,
            channel_ref: request.channel_ref,
            message_ref: None,
            created_at: now,
            expires_at: request.expires_at,
            outcome_ref: None,
        };

        self.store.create(&approval).await?;
        self.cache
            .write()
            .await
            .insert(approval.id.clone(), approval.clone());

        tracing::info!(
            approval_id = %approval.id,
            kind = approval.kind.name(),
            tenant_id = %approval.tenant_id,
            "Approval created"
        );

        Ok(approval)
    }

    /// Read a record: cache first, store second.
    ///
    /// The cached copy reflects this engine's own writes but may be stale
    /// relative to external writers; `decide` always revalidates against the
    /// store.
    pub async fn get(&self, id: &str) -> Result<Option<Approval>, StoreError> {
        if let Some(approval) = self.cache.read().await.get(id) {
            return Ok(Some(approval.clone()));
        }

        let fetched = self.store.get(id).await?;
        if let Some(approval) = &fetched {
            self.cache
                .write()
                .await
                .insert(approval.id.clone(), approval.clone());
        }
        Ok(fetched)
    }

    /// Apply a human decision, exactly once.
    ///
    /// The pending check and the transition are a single atomic store
    /// operation; concurrent calls on the same record produce one success
    /// and `AlreadyDecided` for every other caller.
    pub async fn decide(
        &self,
        id: &str,
        decision: Decision,
        actor: &str,
        reason: Option<String>,
        outcome_ref: Option<String>,
    ) -> Result<Approval, DecisionError> {
        match self
            .store
            .decide(id, decision, actor, reason, outcome_ref)
            .await
        {
            Ok(updated) => {
                self.cache
                    .write()
                    .await
                    .insert(updated.id.clone(), updated.clone());

                tracing::info!(
                    approval_id = %id,
                    decision = decision.name(),
                    actor = %actor,
                    "Approval decided"
                );

                Ok(updated)
            }
            Err(StoreError::NotFound(_)) => Err(DecisionError::NotFound(id.to_string())),
            Err(StoreError::Conflict) => {
                // Re-read the authoritative record to name the prior decider.
                let current = self.store.get(id).await?;
                match current {
                    Some(approval) => {
                        let status = approval.status.name();
                        let decided_by = approval.status.decided_by().map(String::from);
                        self.cache
                            .write()
                            .await
                            .insert(approval.id.clone(), approval);
                        Err(DecisionError::AlreadyDecided { status, decided_by })
                    }
                    None => Err(DecisionError::NotFound(id.to_string())),
                }
            }
            Err(e) => Err(DecisionError::Store(e)),
        }
    }

    /// Expire every pending record due at `now`.
    ///
    /// Returns only newly expired records; repeating the sweep with the same
    /// clock returns nothing. Each transition is independent, so ordering is
    /// cosmetic.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError> {
        let expired = self.store.expire_due(now).await?;

        if !expired.is_empty() {
            let mut cache = self.cache.write().await;
            for approval in &expired {
                cache.insert(approval.id.clone(), approval.clone());
            }
            tracing::info!(count = expired.len(), "Approvals expired");
        }

        Ok(expired)
    }

    /// Record the posted notification message on an approval.
    pub async fn set_message_ref(
        &self,
        id: &str,
        message: &MessageRef,
    ) -> Result<(), StoreError> {
        self.store.set_message_ref(id, message).await?;
        if let Some(cached) = self.cache.write().await.get_mut(id) {
            cached.message_ref = Some(message.clone());
        }
        Ok(())
    }

    /// List pending approvals from the store.
    pub async fn list_pending(&self) -> Result<Vec<Approval>, StoreError> {
        self.store.list("pending").await
    }

    /// Current cache contents for a record, if any.
    pub async fn cached(&self, id: &str) -> Option<Approval> {
        self.cache.read().await.get(id).cloned()
    }
}
