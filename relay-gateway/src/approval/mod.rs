//! Approval state machine for the Relay gateway.
//!
//! An approval is a pending human decision gating an external action
//! (merging a PR, publishing content, running a workload). Records move
//! through exactly one terminal transition:
//!
//! ```text
//! Pending → Approved | Rejected | Expired
//! ```
//!
//! Terminal records persist for audit; they are never deleted and never
//! transition again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::MessageRef;

pub mod engine;
pub mod store;

pub use engine::ApprovalEngine;
pub use store::{ApprovalStore, Installation, MemoryStore, StoreError};

/// Kind of action gated by an approval.
///
/// Closed set: adding a kind is a compile-time exhaustiveness change, not a
/// runtime string lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Create an issue in a tracker
    Issue,
    /// Merge a pull request
    Pr,
    /// Publish a piece of content
    Content,
    /// Launch a workload
    Run,
    /// Sign off on a brief
    Brief,
}

impl ApprovalKind {
    /// Returns the kind name as a string for display and logging.
    pub fn name(self) -> &'static str {
        match self {
            ApprovalKind::Issue => "issue",
            ApprovalKind::Pr => "pr",
            ApprovalKind::Content => "content",
            ApprovalKind::Run => "run",
            ApprovalKind::Brief => "brief",
        }
    }

    /// Parse a kind from its string name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issue" => Some(ApprovalKind::Issue),
            "pr" => Some(ApprovalKind::Pr),
            "content" => Some(ApprovalKind::Content),
            "run" => Some(ApprovalKind::Run),
            "brief" => Some(ApprovalKind::Brief),
            _ => None,
        }
    }

    /// All known kinds, for usage hints.
    pub const ALL: &'static [ApprovalKind] = &[
        ApprovalKind::Issue,
        ApprovalKind::Pr,
        ApprovalKind::Content,
        ApprovalKind::Run,
        ApprovalKind::Brief,
    ];
}

/// Status of an approval record.
///
/// Decider fields exist exactly on the human-decision variants, so the
/// "decided-by set iff approved or rejected" invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision
    Pending,
    /// Approved by a human actor
    Approved {
        by: String,
        at: DateTime<Utc>,
    },
    /// Rejected by a human actor (or by a failed execution)
    Rejected {
        by: String,
        #[serde(default)]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    /// Expired by the sweep with no actor
    Expired {
        at: DateTime<Utc>,
    },
}

impl ApprovalStatus {
    /// Returns true if the status is terminal (no further transition possible).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    /// Returns the status name as a string for display and logging.
    pub fn name(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved { .. } => "approved",
            ApprovalStatus::Rejected { .. } => "rejected",
            ApprovalStatus::Expired { .. } => "expired",
        }
    }

    /// The actor who decided, when the status is a human decision.
    pub fn decided_by(&self) -> Option<&str> {
        match self {
            ApprovalStatus::Approved { by, .. } | ApprovalStatus::Rejected { by, .. } => {
                Some(by.as_str())
            }
            _ => None,
        }
    }

    /// When the terminal transition happened, if any.
    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ApprovalStatus::Pending => None,
            ApprovalStatus::Approved { at, .. }
            | ApprovalStatus::Rejected { at, .. }
            | ApprovalStatus::Expired { at } => Some(*at),
        }
    }
}

/// A human decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn name(self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

/// An approval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    /// Unique identifier
    pub id: String,
    /// Kind of gated action
    pub kind: ApprovalKind,
    /// Workspace the approval belongs to
    pub tenant_id: String,
    /// Human-readable title
    pub title: String,
    /// Detailed description
    #[serde(default)]
    pub description: Option<String>,
    /// Kind-specific data, opaque to the gateway
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Lower is more urgent
    #[serde(default)]
    pub priority: i64,
    /// Current status
    pub status: ApprovalStatus,
    /// Channel where the notification was (or will be) posted
    pub channel_ref: String,
    /// Posted notification message, for later edits
    #[serde(default)]
    pub message_ref: Option<MessageRef>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the record expires if still pending
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Reference to the executed action's outcome (PR URL, run id, ...)
    #[serde(default)]
    pub outcome_ref: Option<String>,
}

/// Parameters for creating a new approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApproval {
    pub kind: ApprovalKind,
    pub tenant_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    pub channel_ref: String,
    /// When the record expires if still pending. Must be in the future.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Error creating an approval.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("expiry must be in the future")]
    ExpiresInPast,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error deciding an approval.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("approval '{0}' not found")]
    NotFound(String),

    #[error("approval already {status}")]
    AlreadyDecided {
        status: &'static str,
        decided_by: Option<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
