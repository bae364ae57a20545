//! Action executors.
//!
//! When an approval is approved, the gated action actually runs: create the
//! issue, merge the PR, publish the content, launch the run. The executors
//! themselves are external collaborators; the gateway only needs their
//! success/failure and an optional outcome reference.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::approval::{Approval, ApprovalKind};

/// Result of executing an approved action.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Whether the action succeeded.
    pub success: bool,
    /// Reference to what the action produced (PR URL, run id, ...).
    pub outcome_ref: Option<String>,
    /// Short human-readable summary, safe to show in channel.
    pub summary: String,
}

impl ExecutionOutcome {
    pub fn success(summary: impl Into<String>, outcome_ref: Option<String>) -> Self {
        Self {
            success: true,
            outcome_ref,
            summary: summary.into(),
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome_ref: None,
            summary: summary.into(),
        }
    }
}

/// Executes the external action gated by an approval kind.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Run the action for an approved record.
    ///
    /// `actor` is the human who approved, for attribution downstream.
    async fn execute(&self, approval: &Approval, actor: &str) -> Result<ExecutionOutcome>;
}

/// Maps approval kinds to their executors.
pub struct ExecutorRegistry {
    handlers: HashMap<ApprovalKind, Arc<dyn ActionExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register an executor for a kind, replacing any prior one.
    pub fn register(&mut self, kind: ApprovalKind, handler: Arc<dyn ActionExecutor>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: ApprovalKind) -> Option<Arc<dyn ActionExecutor>> {
        self.handlers.get(&kind).cloned()
    }

    /// Execute the action for an approval via its kind's executor.
    pub async fn execute(&self, approval: &Approval, actor: &str) -> Result<ExecutionOutcome> {
        match self.get(approval.kind) {
            Some(handler) => handler.execute(approval, actor).await,
            None => Ok(ExecutionOutcome::failure(format!(
                "no executor registered for kind '{}'",
                approval.kind.name()
            ))),
        }
    }

    /// Registry with a log-only executor for every kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in ApprovalKind::ALL {
            registry.register(*kind, Arc::new(LogOnlyExecutor { kind: *kind }));
        }
        registry
    }
}

/// Placeholder executor that records the action instead of performing it.
///
/// Deployments register real executors per kind; this keeps every kind
/// dispatchable out of the box.
struct LogOnlyExecutor {
    kind: ApprovalKind,
}

#[async_trait]
impl ActionExecutor for LogOnlyExecutor {
    async fn execute(&self, approval: &Approval, actor: &str) -> Result<ExecutionOutcome> {
        info!(
            approval_id = %approval.id,
            kind = self.kind.name(),
            actor = %actor,
            "Executing approved action"
        );

        Ok(ExecutionOutcome::success(
            format!("{} action recorded", self.kind.name()),
            Some(format!("{}-{}", self.kind.name(), uuid::Uuid::new_v4())),
        ))
    }
}
