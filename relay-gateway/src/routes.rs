//! HTTP surface of the gateway.
//!
//! Two groups of routes:
//!
//! - Webhook ingress (`/webhook/*`): raw-body capture, signature
//!   verification before any parsing, then either an inline challenge echo
//!   or an immediate ack with dispatch handed to a background task. The
//!   chat platform's retry contract means processing failures are never
//!   surfaced here.
//! - Management API (`/api/v1/approvals/*`): create, list, read, and decide
//!   approvals directly, for internal services and operators.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::approval::{
    Approval, ApprovalEngine, ApprovalKind, CreateApproval, CreateError, Decision, DecisionError,
};
use crate::router::{InboundEvent, MessageRouter};
use crate::verify::SignatureVerifier;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<SignatureVerifier>,
    pub router: Arc<MessageRouter>,
    pub engine: Arc<ApprovalEngine>,
}

/// Webhook ingress routes.
pub fn webhook_routes(state: AppState) -> Router {
    Router::new()
        .route("/webhook/events", post(handle_webhook))
        .route("/webhook/interactions", post(handle_webhook))
        .with_state(state)
}

/// Management API routes.
pub fn approval_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/approvals", post(create_approval))
        .route("/api/v1/approvals/pending", get(list_pending))
        .route("/api/v1/approvals/:id", get(get_approval))
        .route("/api/v1/approvals/:id/decide", post(decide_approval))
        .with_state(state)
}

/// Liveness probe.
pub fn health_routes() -> Router {
    Router::new().route("/healthz", get(|| async { Json(serde_json::json!({ "status": "ok" })) }))
}

/// Handle a signed webhook delivery.
///
/// Verification runs over the raw bytes before any parsing. Recognized
/// events are acknowledged immediately and dispatched in the background;
/// the handshake challenge is the one event answered inline.
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let now = Utc::now().timestamp();
    if let Err(e) = state.verifier.verify(&body, &headers, now) {
        warn!(error = %e, "Rejected webhook delivery");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "ok": false })),
        )
            .into_response();
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Webhook body is not valid JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "ok": false })),
            )
                .into_response();
        }
    };

    match InboundEvent::classify(&payload) {
        Some(InboundEvent::UrlVerification { challenge }) => {
            Json(serde_json::json!({ "challenge": challenge })).into_response()
        }
        Some(event) => {
            let router = state.router.clone();
            tokio::spawn(async move {
                let outcome = router.dispatch(event).await;
                debug!(?outcome, "Webhook event dispatched");
            });
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        None => {
            debug!("Unhandled webhook event shape");
            Json(serde_json::json!({ "ok": true })).into_response()
        }
    }
}

/// Request body for creating an approval.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateApprovalRequest {
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
    /// Time-to-live in seconds (how long until the request expires)
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Request body for the decide endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct DecideRequest {
    pub action: Decision,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub outcome_ref: Option<String>,
}

/// Response envelope for approval endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApprovalResponse {
    fn success(approval: Approval) -> Self {
        Self {
            success: true,
            approval: Some(approval),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            approval: None,
            error: Some(message.into()),
        }
    }
}

/// Response for the pending list endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListPendingResponse {
    pub approvals: Vec<Approval>,
    pub total: usize,
}

type ApiResult = Result<(StatusCode, Json<ApprovalResponse>), (StatusCode, Json<ApprovalResponse>)>;

/// Create a new approval.
///
/// POST /api/v1/approvals
async fn create_approval(
    State(state): State<AppState>,
    Json(request): Json<CreateApprovalRequest>,
) -> ApiResult {
    if request.title.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApprovalResponse::error("Title is required")),
        ));
    }
    if request.tenant_id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApprovalResponse::error("Tenant is required")),
        ));
    }
    if request.channel_ref.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApprovalResponse::error("Channel is required")),
        ));
    }

    let expires_at = request
        .ttl_seconds
        .map(|ttl| Utc::now() + Duration::seconds(ttl as i64));

    let created = state
        .engine
        .create(CreateApproval {
            kind: request.kind,
            tenant_id: request.tenant_id,
            title: request.title,
            description: request.description,
            payload: request.payload,
            priority: request.priority,
            channel_ref: request.channel_ref,
            expires_at,
        })
        .await;

    match created {
        Ok(approval) => Ok((StatusCode::CREATED, Json(ApprovalResponse::success(approval)))),
        Err(CreateError::ExpiresInPast) => Err((
            StatusCode::BAD_REQUEST,
            Json(ApprovalResponse::error("Expiry must be in the future")),
        )),
        Err(CreateError::Store(e)) => {
            tracing::error!(error = %e, "Failed to create approval");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApprovalResponse::error("Failed to create approval")),
            ))
        }
    }
}

/// List pending approvals.
///
/// GET /api/v1/approvals/pending
async fn list_pending(
    State(state): State<AppState>,
) -> Result<Json<ListPendingResponse>, (StatusCode, Json<ApprovalResponse>)> {
    match state.engine.list_pending().await {
        Ok(approvals) => {
            let total = approvals.len();
            Ok(Json(ListPendingResponse { approvals, total }))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to list pending approvals");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApprovalResponse::error("Failed to list pending approvals")),
            ))
        }
    }
}

/// Get an approval by id.
///
/// GET /api/v1/approvals/:id
async fn get_approval(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.engine.get(&id).await {
        Ok(Some(approval)) => Ok((StatusCode::OK, Json(ApprovalResponse::success(approval)))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ApprovalResponse::error(format!(
                "Approval '{}' not found",
                id
            ))),
        )),
        Err(e) => {
            tracing::error!(error = %e, "Failed to get approval");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApprovalResponse::error("Failed to get approval")),
            ))
        }
    }
}

/// Decide an approval.
///
/// POST /api/v1/approvals/:id/decide
async fn decide_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DecideRequest>,
) -> ApiResult {
    if request.actor.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApprovalResponse::error("Actor is required")),
        ));
    }

    match state
        .engine
        .decide(
            &id,
            request.action,
            &request.actor,
            request.reason,
            request.outcome_ref,
        )
        .await
    {
        Ok(approval) => Ok((StatusCode::OK, Json(ApprovalResponse::success(approval)))),
        Err(DecisionError::NotFound(id)) => Err((
            StatusCode::NOT_FOUND,
            Json(ApprovalResponse::error(format!(
                "Approval '{}' not found",
                id
            ))),
        )),
        Err(DecisionError::AlreadyDecided { status, decided_by }) => {
            let message = match decided_by {
                Some(by) => format!("Approval already {} by {}", status, by),
                None => format!("Approval already {}", status),
            };
            Err((StatusCode::CONFLICT, Json(ApprovalResponse::error(message))))
        }
        Err(DecisionError::Store(e)) => {
            tracing::error!(error = %e, "Failed to decide approval");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApprovalResponse::error("Failed to decide approval")),
            ))
        }
    }
}
