//! Relay gateway - multi-tenant webhook-driven approval routing.
//!
//! This crate receives signed event notifications from a chat platform,
//! authenticates each inbound request, resolves per-tenant credentials,
//! and drives approval records through a single-decision state machine:
//!
//! ```text
//! Webhook → SignatureVerifier → MessageRouter → ApprovalEngine → Store
//!                                     ↓
//!                           CredentialResolver (TTL cache)
//! ```
//!
//! A background task sweeps expired approvals on a fixed interval.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod approval;
pub mod chat;
pub mod credentials;
pub mod executor;
pub mod queue;
pub mod ratelimit;
pub mod router;
pub mod routes;
pub mod sweep;
pub mod verify;

pub use approval::{Approval, ApprovalEngine, ApprovalKind, ApprovalStatus, Decision};
pub use credentials::{CredentialResolver, ResolutionError, TenantCredential};
pub use router::{DispatchOutcome, InboundEvent, MessageRouter};
pub use routes::AppState;
pub use verify::{SignatureVerifier, VerificationError};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use relay_common::config::RelayConfig;

/// Build the gateway router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::webhook_routes(state.clone())
        .merge(routes::approval_routes(state))
        .merge(routes::health_routes())
        .layer(cors)
}

/// Assemble the gateway components from configuration.
pub fn build_state(config: &RelayConfig) -> AppState {
    let store = Arc::new(approval::store::ApiApprovalStore::new(
        &config.store.endpoint,
        Duration::from_secs(config.store.timeout_secs),
    ));

    let engine = Arc::new(ApprovalEngine::new(store.clone()));
    let resolver = Arc::new(CredentialResolver::new(
        store,
        config.fallback_credential.clone(),
        config.limits.credential_ttl_secs,
    ));
    let chat: Arc<dyn chat::ChatClient> = Arc::new(chat::ApiChatClient::new(&config.chat.api_base));
    let queue: Arc<dyn queue::MessageQueue> =
        Arc::new(queue::HttpMessageQueue::new(&config.queue.endpoint));

    let router = Arc::new(MessageRouter::new(
        engine.clone(),
        resolver.clone(),
        chat.clone(),
        Arc::new(executor::ExecutorRegistry::with_defaults()),
        queue,
        Arc::new(ratelimit::RateLimiter::new(
            config.limits.events_per_minute,
            60,
        )),
    ));

    // The sweeper shares the engine and the read-side collaborators.
    let sweeper = Arc::new(sweep::ExpirationSweeper::new(
        engine.clone(),
        resolver,
        chat,
    ));
    tokio::spawn(sweeper.run(Duration::from_secs(config.limits.sweep_interval_secs)));

    AppState {
        verifier: Arc::new(SignatureVerifier::new(
            config.chat.signing_secret.clone(),
            config.limits.replay_window_secs,
        )),
        router,
        engine,
    }
}

/// Start the gateway server.
pub async fn start_server(config: &RelayConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let router = build_router(build_state(config));

    tracing::info!("Starting Relay gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
