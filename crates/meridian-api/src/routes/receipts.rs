//! Delivery receipts: enqueue federated messages and manage their delivery.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use meridian_bridge::BridgeTarget;
use meridian_common::{
    error::{MeridianError, MeridianResult},
    models::{DeliveryReceipt, ReceiptFilter},
    permissions::Permissions,
    validation::normalize_domain,
};
use meridian_federation::{FederatedMessage, FederationError};

use crate::{auth::Operator, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/federation/receipts", get(list_receipts).post(enqueue))
        .route("/federation/receipts/{id}", get(get_receipt))
        .route("/federation/receipts/{id}/retry", post(retry))
        .route("/federation/receipts/{id}/abandon", post(abandon))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub message_id: String,
    /// Peer domain.
    pub target: String,
    pub channel_id: Option<String>,
    pub sender: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct AbandonRequest {
    pub reason: String,
}

async fn list_receipts(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Query(filter): Query<ReceiptFilter>,
) -> MeridianResult<Json<Vec<DeliveryReceipt>>> {
    operator.require_any(Permissions::VIEW_FEDERATION | Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.engine.list(&filter).await?))
}

async fn get_receipt(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<DeliveryReceipt>> {
    operator.require_any(Permissions::VIEW_FEDERATION | Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.engine.get(id).await?))
}

/// POST /api/v1/federation/receipts
///
/// Track a user-content message for delivery to one peer. Enqueueing the
/// same `(message_id, target)` again returns the existing receipt.
async fn enqueue(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Json(body): Json<EnqueueRequest>,
) -> MeridianResult<(StatusCode, Json<DeliveryReceipt>)> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    if BridgeTarget::matches(&body.target) {
        return Err(MeridianError::Validation {
            message: "bridge targets are relayed through /channels/{id}/bridge-relay".into(),
        });
    }
    let target = normalize_domain(&body.target)?;
    let message = FederatedMessage::user_content(&body.message_id, body.channel_id, body.sender, body.content);
    let payload = serde_json::to_value(&message).map_err(FederationError::from)?;

    let receipt = state.engine.enqueue(&body.message_id, &target, payload).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn retry(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<DeliveryReceipt>> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.engine.retry(id).await?))
}

async fn abandon(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Json(body): Json<AbandonRequest>,
) -> MeridianResult<Json<DeliveryReceipt>> {
    operator.require(Permissions::MANAGE_FEDERATION)?;
    Ok(Json(state.engine.abandon(id, &body.reason).await?))
}
