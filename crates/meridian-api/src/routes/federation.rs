//! Server-to-server federation routes.
//!
//! These endpoints are called by remote Meridian servers, not by operators.
//! Apart from the key document and the well-known delegation, every request
//! carries an `Authorization: MeridianFederation …` header signed with the
//! origin's Ed25519 key.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET    | `/_meridian/key/v2/server` | This server's public key document |
//! | GET    | `/.well-known/meridian/server` | Delegation response |
//! | POST   | `/_meridian/federation/v1/handshake` | First contact and capability negotiation |
//! | PUT    | `/_meridian/federation/v1/send/{txnId}` | Receive a transaction |

use axum::{
    extract::{OriginalUri, Path, State},
    http::{header, HeaderMap},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_common::{
    error::{MeridianError, MeridianResult},
    inbound_event::{InboundEvent, FEDERATED_MESSAGE},
    models::{MessageKind, PROTOCOL_VERSION},
    validation::normalize_domain,
};
use meridian_federation::{
    client::{HANDSHAKE_PATH, KEY_PATH, SEND_PATH},
    discovery::WELL_KNOWN_PATH,
    keys::ServerKeyDocument,
    registry::PeerContact,
    types::{TransactionResponse, WellKnownServer},
    FederationError, FederationTransaction, HandshakeRequest, HandshakeResponse,
};

use crate::AppState;

/// Federation routes, mounted outside `/api/v1`.
pub fn federation_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(KEY_PATH, get(server_key_document))
        .route(WELL_KNOWN_PATH, get(well_known_server))
        .route(HANDSHAKE_PATH, post(handshake))
        .route(&format!("{SEND_PATH}/{{txn_id}}"), put(receive_transaction))
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn request_target(uri: &OriginalUri) -> &str {
    uri.0.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// `GET /_meridian/key/v2/server`
async fn server_key_document(State(state): State<Arc<AppState>>) -> Json<ServerKeyDocument> {
    Json(state.key_pair.to_key_document(&state.server_name))
}

/// `GET /.well-known/meridian/server`
async fn well_known_server(State(state): State<Arc<AppState>>) -> Json<WellKnownServer> {
    Json(WellKnownServer { server: state.server_name.clone() })
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `POST /_meridian/federation/v1/handshake`
///
/// The request is signed with the key it carries. The reply tells the
/// initiator which status it now has here.
async fn handshake(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> MeridianResult<Json<HandshakeResponse>> {
    let request: HandshakeRequest = serde_json::from_value(body.clone())
        .map_err(|e| MeridianError::Validation { message: format!("malformed handshake: {e}") })?;

    state
        .gate
        .authenticate_handshake(authorization(&headers), "POST", request_target(&uri), &body, &request)?;

    let outcome = state.registry.record_contact(PeerContact::from(&request)).await?;
    debug!(peer = %outcome.instance.domain, status = %outcome.relationship.status, "Handshake accepted");

    Ok(Json(HandshakeResponse {
        server_name: state.server_name.clone(),
        public_key: state.key_pair.public_key_base64(),
        protocol_version: PROTOCOL_VERSION.to_owned(),
        capabilities: outcome.capabilities,
        status: outcome.relationship.status,
    }))
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// `PUT /_meridian/federation/v1/send/{txnId}`
///
/// Each message passes the admission gate on its own. The transaction id is
/// recorded once something was accepted, so a replay of an accepted
/// transaction is acknowledged as a duplicate without being processed again.
async fn receive_transaction(
    State(state): State<Arc<AppState>>,
    Path(txn_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> MeridianResult<Json<TransactionResponse>> {
    let verified = state
        .gate
        .authenticate(authorization(&headers), "PUT", request_target(&uri), Some(&body))
        .await?;

    let txn: FederationTransaction = serde_json::from_value(body)
        .map_err(|e| MeridianError::Validation { message: format!("malformed transaction: {e}") })?;

    let claimed = normalize_domain(&txn.origin)?;
    if claimed != verified.origin {
        return Err(FederationError::OriginMismatch { claimed, actual: verified.origin }.into());
    }
    if normalize_domain(&txn.destination)? != state.server_name {
        return Err(MeridianError::Validation {
            message: format!("transaction is addressed to '{}'", txn.destination),
        });
    }

    let mut response = TransactionResponse::default();
    let mut accepted = Vec::with_capacity(txn.messages.len());
    for message in txn.messages {
        match state.gate.admit(&verified, message.kind).await {
            Ok(admission) => accepted.push((message, admission)),
            Err(FederationError::Store(e)) => return Err(e.into()),
            Err(e) => {
                debug!(peer = %verified.origin, message_id = %message.message_id, error = %e, "Message rejected");
                response.rejected += 1;
            }
        }
    }

    if accepted.is_empty() {
        warn!(peer = %verified.origin, txn = %txn_id, rejected = response.rejected, "Transaction rejected");
        return Ok(Json(response));
    }

    if !state.peers.record_inbound_transaction(&verified.origin, &txn_id).await? {
        debug!(peer = %verified.origin, txn = %txn_id, "Duplicate transaction");
        return Ok(Json(TransactionResponse { duplicate: true, ..Default::default() }));
    }

    for (message, admission) in accepted {
        response.accepted += 1;
        if message.kind != MessageKind::UserContent {
            continue;
        }
        let event = InboundEvent {
            event_type: FEDERATED_MESSAGE.to_owned(),
            channel_id: message.channel_id.as_deref().and_then(|c| Uuid::parse_str(c).ok()),
            data: serde_json::to_value(&message).map_err(FederationError::from)?,
            origin: verified.origin.clone(),
            notify: admission.notify,
            key_flagged: admission.key_flagged,
        };
        // No subscribers just means nothing local is listening yet.
        let _ = state.events.send(event);
    }

    info!(
        peer = %verified.origin,
        txn = %txn_id,
        accepted = response.accepted,
        rejected = response.rejected,
        "Transaction received"
    );
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use meridian_common::inbound_event::FEDERATED_MESSAGE;
    use meridian_common::permissions::Permissions;
    use meridian_federation::{FederatedMessage, FederationTransaction, ServerKeyPair};

    use crate::test_support::{app, call, handshake, send_transaction, signed, token, LOCAL};

    #[tokio::test]
    async fn key_document_and_well_known_are_public() {
        let app = app().await;
        let (status, body) = call(&app.router, Method::GET, "/_meridian/key/v2/server", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_name"], LOCAL);

        let (status, body) = call(&app.router, Method::GET, "/.well-known/meridian/server", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["m.server"], LOCAL);
    }

    #[tokio::test]
    async fn unknown_peer_lands_pending_until_approved() {
        let app = app().await;
        let kp = ServerKeyPair::generate();

        let (status, body) = handshake(&app.router, "peer.example", &kp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["server_name"], LOCAL);

        let admin = token(Permissions::MANAGE_FEDERATION);
        let (_, peers) =
            call(&app.router, Method::GET, "/api/v1/federation/peers?status=pending", Some(&admin), None).await;
        let id = peers[0]["instance"]["id"].as_str().unwrap().to_owned();

        let (status, body) =
            call(&app.router, Method::POST, &format!("/api/v1/federation/peers/{id}/approve"), Some(&admin), None)
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        let (status, body) =
            call(&app.router, Method::POST, &format!("/api/v1/federation/peers/{id}/approve"), Some(&admin), None)
                .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "CONFLICT");
    }

    #[tokio::test]
    async fn handshake_signed_by_another_key_is_refused() {
        let app = app().await;
        let claimed = ServerKeyPair::generate();
        let signer = ServerKeyPair::generate();

        let body = json!({
            "server_name": "peer.example",
            "public_key": claimed.public_key_base64(),
            "protocol_version": "1.0",
        });
        let (status, _) = signed(
            &app.router,
            Method::POST,
            "/_meridian/federation/v1/handshake",
            "peer.example",
            &signer,
            body,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepted_transactions_are_published_once() {
        let mut app = app().await;
        let kp = ServerKeyPair::generate();
        let admin = token(Permissions::MANAGE_FEDERATION);
        call(
            &app.router,
            Method::POST,
            "/api/v1/federation/peers/preauthorize",
            Some(&admin),
            Some(json!({ "domain": "peer.example" })),
        )
        .await;
        let (_, body) = handshake(&app.router, "peer.example", &kp).await;
        assert_eq!(body["status"], "active");

        let mut txn = FederationTransaction::new("peer.example", LOCAL);
        txn.messages.push(FederatedMessage::user_content(
            "m1",
            None,
            Some("@a:peer.example".into()),
            json!({ "body": "hi" }),
        ));

        let (status, body) = send_transaction(&app.router, "txn1", &kp, &txn).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["duplicate"], false);

        let event = app.events.try_recv().unwrap();
        assert_eq!(event.event_type, FEDERATED_MESSAGE);
        assert_eq!(event.origin, "peer.example");
        assert!(event.notify);
        assert_eq!(event.data["message_id"], "m1");

        let (status, body) = send_transaction(&app.router, "txn1", &kp, &txn).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["duplicate"], true);
        assert!(app.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn pending_peer_content_is_rejected_and_not_recorded() {
        let mut app = app().await;
        let kp = ServerKeyPair::generate();
        handshake(&app.router, "peer.example", &kp).await;

        let mut txn = FederationTransaction::new("peer.example", LOCAL);
        txn.messages.push(FederatedMessage::user_content("m1", None, None, json!({"body": "hi"})));

        let (status, body) = send_transaction(&app.router, "txn1", &kp, &txn).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 0);
        assert_eq!(body["rejected"], 1);
        assert!(app.events.try_recv().is_err());

        // A replay after approval is processed, not treated as a duplicate.
        let admin = token(Permissions::MANAGE_FEDERATION);
        let (_, peers) = call(&app.router, Method::GET, "/api/v1/federation/peers", Some(&admin), None).await;
        let id = peers[0]["instance"]["id"].as_str().unwrap().to_owned();
        call(&app.router, Method::POST, &format!("/api/v1/federation/peers/{id}/approve"), Some(&admin), None).await;

        let (_, body) = send_transaction(&app.router, "txn1", &kp, &txn).await;
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["duplicate"], false);
    }

    #[tokio::test]
    async fn unsigned_transactions_are_unauthorized() {
        let app = app().await;
        let txn = FederationTransaction::new("peer.example", LOCAL);
        let (status, _) = call(
            &app.router,
            Method::PUT,
            "/_meridian/federation/v1/send/t1",
            None,
            Some(serde_json::to_value(&txn).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
