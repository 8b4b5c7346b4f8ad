//! Bridge connections, channel mappings and relays.
//!
//! Everything here needs `MANAGE_BRIDGES` except the inbound webhook, which
//! the remote platform calls and which the bridge's connector authenticates.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use meridian_bridge::{OutboundReport, RelayAuthor, RelayReport};
use meridian_common::{
    error::{MeridianError, MeridianResult},
    models::{BridgeConnection, ChannelMapping, CreateBridgeRequest, CreateChannelMappingRequest},
    permissions::Permissions,
};

use crate::{auth::Operator, AppState};

/// Telegram echoes the webhook secret in this header.
const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/guilds/{guild_id}/bridges", get(list_bridges).post(create_bridge))
        .route("/bridges/{id}", get(get_bridge).delete(delete_bridge))
        .route("/bridges/{id}/connect", post(connect))
        .route("/bridges/{id}/disconnect", post(disconnect))
        .route("/bridges/{id}/mappings", get(list_mappings).post(create_mapping))
        .route("/bridges/{id}/mappings/{mapping_id}", delete(delete_mapping))
        .route("/bridges/{id}/inbound", post(inbound))
        .route("/channels/{channel_id}/bridge-relay", post(relay_outbound))
}

#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    pub message_id: String,
    pub body: String,
    /// Author of a local message.
    pub display_name: Option<String>,
    /// Set when the author is a virtual user relayed in from a bridge.
    pub virtual_user_id: Option<Uuid>,
}

// ─── Connections ─────────────────────────────────────────────────────────────

async fn list_bridges(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(guild_id): Path<Uuid>,
) -> MeridianResult<Json<Vec<BridgeConnection>>> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    Ok(Json(state.bridges.list(guild_id).await?))
}

async fn create_bridge(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(guild_id): Path<Uuid>,
    Json(body): Json<CreateBridgeRequest>,
) -> MeridianResult<(StatusCode, Json<BridgeConnection>)> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    let conn = state.bridges.create(guild_id, body, Some(operator.user_id)).await?;
    Ok((StatusCode::CREATED, Json(conn)))
}

async fn get_bridge(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<BridgeConnection>> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    Ok(Json(state.bridges.get(id).await?))
}

async fn delete_bridge(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<StatusCode> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    state.bridges.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn connect(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<BridgeConnection>> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    Ok(Json(state.bridges.connect(id).await?))
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<BridgeConnection>> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    Ok(Json(state.bridges.disconnect(id).await?))
}

// ─── Mappings ────────────────────────────────────────────────────────────────

async fn list_mappings(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> MeridianResult<Json<Vec<ChannelMapping>>> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    Ok(Json(state.bridges.mappings(id).await?))
}

async fn create_mapping(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateChannelMappingRequest>,
) -> MeridianResult<(StatusCode, Json<ChannelMapping>)> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    let mapping = state.bridges.map_channel(id, body).await?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn delete_mapping(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path((id, mapping_id)): Path<(Uuid, Uuid)>,
) -> MeridianResult<StatusCode> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    state.bridges.unmap(id, mapping_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Relays ──────────────────────────────────────────────────────────────────

/// POST /api/v1/bridges/{id}/inbound
///
/// Webhook for the remote platform. The secret arrives as a bearer token,
/// in Telegram's secret header, or inside the payload, depending on the
/// platform.
async fn inbound(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> MeridianResult<Json<RelayReport>> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get(TELEGRAM_SECRET_HEADER).and_then(|v| v.to_str().ok()));

    Ok(Json(state.bridges.relay_inbound(id, token, &payload).await?))
}

/// POST /api/v1/channels/{channel_id}/bridge-relay
///
/// Relay a local message to every bridge its channel is mapped to.
async fn relay_outbound(
    State(state): State<Arc<AppState>>,
    operator: Operator,
    Path(channel_id): Path<Uuid>,
    Json(body): Json<RelayRequest>,
) -> MeridianResult<Json<OutboundReport>> {
    operator.require(Permissions::MANAGE_BRIDGES)?;
    let author = match (body.virtual_user_id, body.display_name) {
        (Some(virtual_user_id), _) => RelayAuthor::Virtual { virtual_user_id },
        (None, Some(display_name)) => RelayAuthor::Local { display_name },
        (None, None) => {
            return Err(MeridianError::Validation {
                message: "either display_name or virtual_user_id is required".into(),
            });
        }
    };
    let report = state
        .bridges
        .relay_outbound(channel_id, &body.message_id, author, &body.body)
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};
    use uuid::Uuid;

    use meridian_common::inbound_event::BRIDGED_MESSAGE;
    use meridian_common::permissions::Permissions;

    use crate::test_support::{app, call, token};

    /// Answers every Slack Web API method with `{"ok": true}`.
    async fn fake_slack() -> String {
        let api = Router::new()
            .route("/auth.test", post(|| async { Json(json!({ "ok": true })) }))
            .route("/chat.postMessage", post(|| async { Json(json!({ "ok": true })) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, api).await.unwrap() });
        format!("http://{addr}")
    }

    async fn create(router: &Router, admin: &str, guild: Uuid, body: Value) -> (StatusCode, Value) {
        call(router, Method::POST, &format!("/api/v1/guilds/{guild}/bridges"), Some(admin), Some(body)).await
    }

    #[tokio::test]
    async fn slack_bridge_relays_both_ways() {
        let mut app = app().await;
        let admin = token(Permissions::MANAGE_BRIDGES);
        let guild = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let api_base = fake_slack().await;

        let (status, bridge) = create(
            &app.router,
            &admin,
            guild,
            json!({
                "bridge_type": "slack",
                "display_name": "Team Slack",
                "remote_id": "T123",
                "config": { "bot_token": "xoxb-1", "verification_token": "vt", "api_base": api_base },
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(bridge["status"], "disconnected");
        let id = bridge["id"].as_str().unwrap().to_owned();

        let (status, body) =
            call(&app.router, Method::POST, &format!("/api/v1/bridges/{id}/connect"), Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "connected");

        let mapping = json!({ "local_channel_id": channel, "remote_channel_id": "C1" });
        let (status, _) = call(
            &app.router,
            Method::POST,
            &format!("/api/v1/bridges/{id}/mappings"),
            Some(&admin),
            Some(mapping.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) =
            call(&app.router, Method::POST, &format!("/api/v1/bridges/{id}/mappings"), Some(&admin), Some(mapping))
                .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Inbound: the webhook carries the verification token in the payload.
        let event = json!({ "token": "vt", "type": "event_callback", "event": {
            "type": "message", "channel": "C1", "user": "U1", "text": "hello", "ts": "1700000000.000100" } });
        let (status, report) =
            call(&app.router, Method::POST, &format!("/api/v1/bridges/{id}/inbound"), None, Some(event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["relayed"], 1);

        let published = app.events.try_recv().unwrap();
        assert_eq!(published.event_type, BRIDGED_MESSAGE);
        assert_eq!(published.origin, format!("bridge:{id}"));
        assert_eq!(published.channel_id, Some(channel));

        let forged = json!({ "token": "wrong", "type": "event_callback", "event": {
            "type": "message", "channel": "C1", "user": "U1", "text": "hi", "ts": "1" } });
        let (status, _) =
            call(&app.router, Method::POST, &format!("/api/v1/bridges/{id}/inbound"), None, Some(forged)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Outbound: one receipt per outbound mapping.
        let (status, report) = call(
            &app.router,
            Method::POST,
            &format!("/api/v1/channels/{channel}/bridge-relay"),
            Some(&admin),
            Some(json!({ "message_id": "m1", "display_name": "alice", "body": "hi slack" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["receipts"].as_array().unwrap().len(), 1);
        assert_eq!(report["receipts"][0]["target_instance"], format!("bridge:{id}:C1"));

        let (status, _) =
            call(&app.router, Method::DELETE, &format!("/api/v1/bridges/{id}"), Some(&admin), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, list) =
            call(&app.router, Method::GET, &format!("/api/v1/guilds/{guild}/bridges"), Some(&admin), None).await;
        assert_eq!(list, json!([]));
    }

    #[tokio::test]
    async fn unsupported_bridge_type_records_the_connect_error() {
        let app = app().await;
        let admin = token(Permissions::MANAGE_BRIDGES);
        let (_, bridge) = create(
            &app.router,
            &admin,
            Uuid::new_v4(),
            json!({ "bridge_type": "xmpp", "display_name": "Jabber", "remote_id": "room@conf.example" }),
        )
        .await;
        let id = bridge["id"].as_str().unwrap().to_owned();

        let (status, _) =
            call(&app.router, Method::POST, &format!("/api/v1/bridges/{id}/connect"), Some(&admin), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app.router, Method::GET, &format!("/api/v1/bridges/{id}"), Some(&admin), None).await;
        assert_eq!(body["status"], "error");
        assert!(body["last_error"].as_str().unwrap().contains("xmpp"));
    }

    #[tokio::test]
    async fn bridge_routes_need_manage_bridges() {
        let app = app().await;
        let fed_admin = token(Permissions::MANAGE_FEDERATION);
        let (status, _) = call(
            &app.router,
            Method::GET,
            &format!("/api/v1/guilds/{}/bridges", Uuid::new_v4()),
            Some(&fed_admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
