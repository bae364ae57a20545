//! Approval and installation persistence.
//!
//! The durable store is a remote service; [`ApiApprovalStore`] is the thin
//! HTTP client consumed by the engine and the credential resolver. The store
//! is the system of record: the pending check inside `decide` and the
//! transitions inside `expire_due` happen there, atomically per record.
//!
//! [`MemoryStore`] implements the same contract in-process with the same
//! atomicity guarantees, for tests and single-node development runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Approval, ApprovalStatus, Decision};
use crate::chat::MessageRef;

/// Error type for store operations.
///
/// `Upstream` (transport failure) is deliberately distinct from `NotFound`
/// (confirmed absence); callers treat them differently and a timeout must
/// never be read as "record does not exist".
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure reaching the store
    #[error("approval store unavailable: {0}")]
    Upstream(String),

    /// The store answered with an unexpected error status
    #[error("approval store error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Failed to parse a store response
    #[error("failed to parse store response: {0}")]
    Parse(String),

    /// The record does not exist
    #[error("approval '{0}' not found")]
    NotFound(String),

    /// The record was no longer pending when a decision was attempted
    #[error("approval is no longer pending")]
    Conflict,

    /// Local invariant failure (poisoned lock)
    #[error("store internal error: {0}")]
    Internal(String),
}

/// A stored installation linking a tenant to its bot credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub tenant_id: String,
    pub bot_token: String,
    pub bot_id: String,
    pub bot_user_id: String,
    #[serde(default)]
    pub tenant_name: Option<String>,
}

/// Contract with the durable approval/installation store.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Persist a freshly created approval record.
    async fn create(&self, approval: &Approval) -> Result<(), StoreError>;

    /// Fetch a record by id; `None` means confirmed absence.
    async fn get(&self, id: &str) -> Result<Option<Approval>, StoreError>;

    /// List records with the given status name.
    async fn list(&self, status: &str) -> Result<Vec<Approval>, StoreError>;

    /// Atomically transition a pending record to approved/rejected.
    ///
    /// Returns [`StoreError::Conflict`] when the record is not pending; the
    /// check and the transition are a single operation, so concurrent calls
    /// on the same record yield exactly one success.
    async fn decide(
        &self,
        id: &str,
        decision: Decision,
        actor: &str,
        reason: Option<String>,
        outcome_ref: Option<String>,
    ) -> Result<Approval, StoreError>;

    /// Atomically expire every pending record whose `expires_at <= now`.
    ///
    /// Returns only newly expired records, in ascending `expires_at` order.
    /// Already-terminal records are never touched, which makes repeated
    /// sweeps idempotent.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError>;

    /// Record the posted notification message for later edits.
    async fn set_message_ref(&self, id: &str, message: &MessageRef) -> Result<(), StoreError>;

    /// Look up the installation for a tenant; `None` means confirmed absence.
    async fn installation(&self, tenant_id: &str) -> Result<Option<Installation>, StoreError>;
}

/// Body sent to the remote decide endpoint.
#[derive(Debug, Serialize)]
struct DecideBody<'a> {
    action: Decision,
    actor: &'a str,
    reason: Option<String>,
    outcome_ref: Option<String>,
}

/// Body sent to the remote expire endpoint.
#[derive(Debug, Serialize)]
struct ExpireBody {
    now: DateTime<Utc>,
}

/// HTTP client for the remote approval store.
#[derive(Clone)]
pub struct ApiApprovalStore {
    endpoint: String,
    client: reqwest::Client,
}

impl ApiApprovalStore {
    /// Create a client against the given store endpoint with a bounded
    /// request timeout.
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { endpoint, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.endpoint, path)
    }

    async fn parse_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }

    async fn error_for(response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        StoreError::Server { status, message }
    }
}

#[async_trait]
impl ApprovalStore for ApiApprovalStore {
    async fn create(&self, approval: &Approval) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.url("approvals"))
            .json(approval)
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Approval>, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("approvals/{}", id)))
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Ok(Some(Self::parse_json(response).await?))
    }

    async fn list(&self, status: &str) -> Result<Vec<Approval>, StoreError> {
        let response = self
            .client
            .get(self.url("approvals"))
            .query(&[("status", status)])
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Self::parse_json(response).await
    }

    async fn decide(
        &self,
        id: &str,
        decision: Decision,
        actor: &str,
        reason: Option<String>,
        outcome_ref: Option<String>,
    ) -> Result<Approval, StoreError> {
        let body = DecideBody {
            action: decision,
            actor,
            reason,
            outcome_ref,
        };

        let response = self
            .client
            .post(self.url(&format!("approvals/{}/decide", id)))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;

        match response.status().as_u16() {
            404 => Err(StoreError::NotFound(id.to_string())),
            409 => Err(StoreError::Conflict),
            _ if !response.status().is_success() => Err(Self::error_for(response).await),
            _ => Self::parse_json(response).await,
        }
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError> {
        let response = self
            .client
            .post(self.url("approvals/expire"))
            .json(&ExpireBody { now })
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Self::parse_json(response).await
    }

    async fn set_message_ref(&self, id: &str, message: &MessageRef) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.url(&format!("approvals/{}/message", id)))
            .json(message)
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;

        match response.status().as_u16() {
            404 => Err(StoreError::NotFound(id.to_string())),
            _ if !response.status().is_success() => Err(Self::error_for(response).await),
            _ => Ok(()),
        }
    }

    async fn installation(&self, tenant_id: &str) -> Result<Option<Installation>, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("installations/{}", tenant_id)))
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Ok(Some(Self::parse_json(response).await?))
    }
}

/// In-process store with the same atomic semantics as the remote service.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Approval>>,
    installations: Mutex<HashMap<String, Installation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an installation for a tenant.
    pub fn put_installation(&self, installation: Installation) {
        if let Ok(mut map) = self.installations.lock() {
            map.insert(installation.tenant_id.clone(), installation);
        }
    }

    fn lock_records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Approval>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Internal("record lock poisoned".into()))
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn create(&self, approval: &Approval) -> Result<(), StoreError> {
        let mut records = self.lock_records()?;
        records.insert(approval.id.clone(), approval.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Approval>, StoreError> {
        let records = self.lock_records()?;
        Ok(records.get(id).cloned())
    }

    async fn list(&self, status: &str) -> Result<Vec<Approval>, StoreError> {
        let records = self.lock_records()?;
        let mut matching: Vec<Approval> = records
            .values()
            .filter(|a| a.status.name() == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn decide(
        &self,
        id: &str,
        decision: Decision,
        actor: &str,
        reason: Option<String>,
        outcome_ref: Option<String>,
    ) -> Result<Approval, StoreError> {
        let mut records = self.lock_records()?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        // Check-and-transition under the same lock: exactly one concurrent
        // decide can observe Pending.
        if record.status.is_terminal() {
            return Err(StoreError::Conflict);
        }

        let now = Utc::now();
        record.status = match decision {
            Decision::Approve => ApprovalStatus::Approved {
                by: actor.to_string(),
                at: now,
            },
            Decision::Reject => ApprovalStatus::Rejected {
                by: actor.to_string(),
                reason,
                at: now,
            },
        };
        if outcome_ref.is_some() {
            record.outcome_ref = outcome_ref;
        }

        Ok(record.clone())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError> {
        let mut records = self.lock_records()?;

        let mut due: Vec<String> = records
            .values()
            .filter(|a| {
                matches!(a.status, ApprovalStatus::Pending)
                    && a.expires_at.is_some_and(|at| at <= now)
            })
            .map(|a| a.id.clone())
            .collect();

        due.sort_by_key(|id| records.get(id).and_then(|a| a.expires_at));

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            if let Some(record) = records.get_mut(&id) {
                record.status = ApprovalStatus::Expired { at: now };
                expired.push(record.clone());
            }
        }

        Ok(expired)
    }

    async fn set_message_ref(&self, id: &str, message: &MessageRef) -> Result<(), StoreError> {
        let mut records = self.lock_records()?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.message_ref = Some(message.clone());
        Ok(())
    }

    async fn installation(&self, tenant_id: &str) -> Result<Option<Installation>, StoreError> {
        let installations = self
            .installations
            .lock()
            .map_err(|_| StoreError::Internal("installation lock poisoned".into()))?;
        Ok(installations.get(tenant_id).cloned())
    }
}
