//! # meridian-api
//!
//! HTTP layer for Meridian. Operator routes live under `/api/v1` and are
//! authenticated with bearer JWTs; the server-to-server endpoints live at
//! their fixed `/_meridian` paths and are authenticated by request
//! signatures.

pub mod auth;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::broadcast;

use meridian_bridge::BridgeManager;
use meridian_common::inbound_event::InboundEvent;
use meridian_db::PeerStore;
use meridian_federation::{
    DeliveryEngine, FederationClient, InboundGate, KeyAuditor, PeerRegistry, ServerKeyPair, TrustStateMachine,
};

/// Shared application state available to all route handlers.
pub struct AppState {
    /// Public server name used in federation (e.g. "meridian.example.com").
    pub server_name: String,
    /// `postgres` or `memory`, reported by the health check.
    pub storage_mode: &'static str,
    pub jwt_secret: String,
    /// Active Ed25519 signing key for all outbound federation requests.
    pub key_pair: Arc<ServerKeyPair>,
    pub client: Arc<FederationClient>,
    pub peers: Arc<dyn PeerStore>,
    pub registry: Arc<PeerRegistry>,
    pub trust: Arc<TrustStateMachine>,
    pub auditor: Arc<KeyAuditor>,
    pub gate: Arc<InboundGate>,
    pub engine: Arc<DeliveryEngine>,
    pub bridges: Arc<BridgeManager>,
    /// Accepted federated and bridged messages for the local pipeline.
    pub events: broadcast::Sender<InboundEvent>,
    pub started_at: Instant,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .merge(routes::health::router())
        .merge(routes::peers::router())
        .merge(routes::receipts::router())
        .merge(routes::key_audits::router())
        .merge(routes::bridges::router());

    Router::new()
        .nest("/api/v1", api_routes)
        // Server-to-server endpoints live outside /api/v1
        .merge(routes::federation::federation_router())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::compression::CompressionLayer::new())
        .with_state(Arc::new(state))
}
