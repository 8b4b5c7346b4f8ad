//! Key audit review: peers whose signing key changed after it was pinned.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use meridian_common::{error::MeridianResult, models::KeyAuditEntry, permissions::Permissions};

use crate::{auth::Operator, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/federation/key-audits", get(list_entries))
        .route("/federation/key-audits/{id}", get(get_entry))
        .route("/federation/key-audits/{id}/acknowledge", post(acknowledge))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub instance_id: Option<Uuid>,
    /// Only entries no administrator has acknowledged.
    #[serde(default)]
    pub open: bool,
}

async fn list_entries(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Query(query): Query<AuditQuery>,
) -> MeridianResult<Json<Vec<KeyAuditEntry>>> {
    operator.require_any(Permissions::VIEW_FEDERATION | Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.auditor.list(query.instance_id, query.open).await?))
}

async fn get_entry(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<KeyAuditEntry>> {
    operator.require_any(Permissions::VIEW_FEDERATION | Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.auditor.get(id).await?))
}

/// POST /api/v1/federation/key-audits/{id}/acknowledge
///
/// Pins the new key. The acknowledging operator is recorded on the entry.
async fn acknowledge(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<KeyAuditEntry>> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.auditor.acknowledge(id, operator.user_id).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use meridian_common::permissions::Permissions;
    use meridian_federation::ServerKeyPair;

    use crate::test_support::{app, call, handshake, token};

    #[tokio::test]
    async fn changed_key_is_blocked_until_acknowledged_once() {
        let app = app().await;
        let old = ServerKeyPair::generate();
        let new = ServerKeyPair::generate();

        let (status, _) = handshake(&app.router, "peer.example", &old).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = handshake(&app.router, "peer.example", &new).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "FORBIDDEN");

        let admin = token(Permissions::MANAGE_FEDERATION);
        let (status, entries) =
            call(&app.router, Method::GET, "/api/v1/federation/key-audits?open=true", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entries.as_array().unwrap().len(), 1);
        assert_eq!(entries[0]["new_fingerprint"], new.fingerprint());
        let id = entries[0]["id"].as_str().unwrap().to_owned();

        let uri = format!("/api/v1/federation/key-audits/{id}/acknowledge");
        let (status, body) = call(&app.router, Method::POST, &uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["acknowledged_at"].is_string());

        let (status, _) = call(&app.router, Method::POST, &uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = handshake(&app.router, "peer.example", &new).await;
        assert_eq!(status, StatusCode::OK);

        let (_, open) =
            call(&app.router, Method::GET, "/api/v1/federation/key-audits?open=true", Some(&admin), None).await;
        assert_eq!(open.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn viewers_cannot_acknowledge() {
        let app = app().await;
        let viewer = token(Permissions::VIEW_FEDERATION);
        let uri = format!("/api/v1/federation/key-audits/{}/acknowledge", uuid::Uuid::new_v4());
        let (status, _) = call(&app.router, Method::POST, &uri, Some(&viewer), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
