//! Operator routes for federation peers: listing, approval, controls and
//! outbound handshakes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use meridian_common::{
    error::MeridianResult,
    models::{PeerControlRequest, PeerRelationship, PeerStatus, PreauthorizeRequest},
    permissions::Permissions,
    validation::validate_request,
};
use meridian_federation::{ControlOutcome, PeerView};

use crate::{auth::Operator, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/federation/peers", get(list_peers))
        .route("/federation/peers/preauthorize", post(preauthorize))
        .route("/federation/peers/initiate", post(initiate))
        .route("/federation/peers/{id}", get(get_peer))
        .route("/federation/peers/{id}/approve", post(approve))
        .route("/federation/peers/{id}/reject", post(reject))
        .route("/federation/peers/{id}/control", put(set_control).delete(clear_control))
}

#[derive(Debug, Deserialize)]
pub struct PeerQuery {
    pub status: Option<PeerStatus>,
}

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub domain: String,
}

/// GET /api/v1/federation/peers?status=
async fn list_peers(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Query(query): Query<PeerQuery>,
) -> MeridianResult<Json<Vec<PeerView>>> {
    operator.require_any(Permissions::VIEW_FEDERATION | Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.registry.list(query.status).await?))
}

/// GET /api/v1/federation/peers/{id}
async fn get_peer(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<PeerView>> {
    operator.require_any(Permissions::VIEW_FEDERATION | Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.registry.get(id).await?))
}

/// POST /api/v1/federation/peers/{id}/approve
async fn approve(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<PeerRelationship>> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.trust.approve(id).await?))
}

/// POST /api/v1/federation/peers/{id}/reject
async fn reject(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<PeerRelationship>> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.trust.reject(id).await?))
}

/// PUT /api/v1/federation/peers/{id}/control
async fn set_control(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Json(body): Json<PeerControlRequest>,
) -> MeridianResult<Json<ControlOutcome>> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    validate_request(&body)?;
    let outcome = state
        .trust
        .set_control(id, body.action, body.reason, Some(operator.user_id))
        .await?;
    Ok(Json(outcome))
}

/// DELETE /api/v1/federation/peers/{id}/control
async fn clear_control(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<StatusCode> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    state.registry.get(id).await?;
    state.trust.clear_control(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/federation/peers/preauthorize
async fn preauthorize(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Json(body): Json<PreauthorizeRequest>,
) -> MeridianResult<(StatusCode, Json<ControlOutcome>)> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    validate_request(&body)?;
    let outcome = state
        .registry
        .preauthorize(&body.domain, Some(operator.user_id), body.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// POST /api/v1/federation/peers/initiate
///
/// Handshake with a remote server from our side.
async fn initiate(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Json(body): Json<InitiateRequest>,
) -> MeridianResult<Json<Value>> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    let outcome = state.registry.initiate(&state.client, &body.domain).await?;
    Ok(Json(json!({
        "instance": outcome.instance,
        "relationship": outcome.relationship,
        "capabilities": outcome.capabilities,
        "key_flagged": outcome.key_flagged,
    })))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use meridian_common::permissions::Permissions;

    use crate::test_support::{app, call, token};

    #[tokio::test]
    async fn operator_routes_require_a_token_and_the_permission() {
        let app = app().await;
        let (status, _) = call(&app.router, Method::GET, "/api/v1/federation/peers", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            call(&app.router, Method::GET, "/api/v1/federation/peers", Some("not-a-jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let viewer = token(Permissions::VIEW_FEDERATION);
        let (status, body) = call(&app.router, Method::GET, "/api/v1/federation/peers", Some(&viewer), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) = call(
            &app.router,
            Method::POST,
            "/api/v1/federation/peers/preauthorize",
            Some(&viewer),
            Some(json!({ "domain": "peer.example" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "MISSING_PERMISSION");
    }

    #[tokio::test]
    async fn preauthorized_peer_can_be_blocked_and_cleared() {
        let app = app().await;
        let admin = token(Permissions::MANAGE_FEDERATION);

        let (status, body) = call(
            &app.router,
            Method::POST,
            "/api/v1/federation/peers/preauthorize",
            Some(&admin),
            Some(json!({ "domain": "Peer.Example", "reason": "partner" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["control"]["action"], "allow");
        let peer = body["control"]["remote_instance_id"].as_str().unwrap().to_owned();

        let (status, body) = call(
            &app.router,
            Method::PUT,
            &format!("/api/v1/federation/peers/{peer}/control"),
            Some(&admin),
            Some(json!({ "action": "block", "reason": "spam" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["control"]["action"], "block");
        // No contact yet, so there is no relationship to force.
        assert!(body["relationship"].is_null());

        let (status, _) = call(
            &app.router,
            Method::DELETE,
            &format!("/api/v1/federation/peers/{peer}/control"),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) =
            call(&app.router, Method::GET, &format!("/api/v1/federation/peers/{peer}"), Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instance"]["domain"], "peer.example");
        assert!(body["control"].is_null());
        assert!(body["relationship"].is_null());
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let app = app().await;
        let admin = token(Permissions::MANAGE_FEDERATION);
        let (status, _) = call(
            &app.router,
            Method::POST,
            &format!("/api/v1/federation/peers/{}/approve", uuid::Uuid::new_v4()),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
