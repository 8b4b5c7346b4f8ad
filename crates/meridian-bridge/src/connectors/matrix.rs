//! Matrix Application Service (AS) connector.
//!
//! The bridge is registered as an AS on a Matrix homeserver. It translates
//! between:
//!
//! - **Meridian → Matrix**: relayed messages are sent into the Matrix room as
//!   the bridge bot via the client-server API.
//! - **Matrix → Meridian**: the homeserver pushes transactions
//!   (`PUT /_matrix/app/v1/transactions/{txnId}` in AS terms) to the bridge's
//!   inbound webhook, authenticated with the `hs_token`.
//!
//! The `registration.yaml` given to the homeserver is managed outside Meridian.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use meridian_common::models::{BridgeConnection, BridgeType};

use crate::connector::{ensure_success, parse_config, BridgeConnector, OutboundMessage, RemoteEvent};
use crate::error::BridgeError;

// ─── Types ───────────────────────────────────────────────────────────────────

/// A homeserver transaction pushed to the AS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixTransaction {
    pub events: Vec<MatrixEvent>,
}

/// A stripped Matrix client event as received from the homeserver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    pub origin_server_ts: i64,
    pub content: Value,
    #[serde(default)]
    pub unsigned: Value,
    pub event_id: Option<String>,
}

/// Body for sending a message to a Matrix room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixMessageContent {
    pub msgtype: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// `config` of a Matrix bridge connection.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixConfig {
    /// Homeserver base URL (e.g. `https://matrix.org`).
    pub homeserver_url: String,
    /// Sent to the homeserver on every AS request.
    pub as_token: String,
    /// Sent by the homeserver to us; authenticates inbound transactions.
    pub hs_token: String,
    /// `@bot:server.tld`, the ghost user that relays Meridian messages.
    pub bot_mxid: String,
}

// ─── Connector ───────────────────────────────────────────────────────────────

pub struct MatrixConnector {
    http: reqwest::Client,
}

impl MatrixConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn convert_message(ev: &MatrixEvent, bot_mxid: &str) -> Option<RemoteEvent> {
        let body = ev.content.get("body")?.as_str()?.to_owned();
        let msgtype = ev.content.get("msgtype").and_then(Value::as_str).unwrap_or("m.text");
        if msgtype != "m.text" && msgtype != "m.notice" {
            return None;
        }
        Some(RemoteEvent {
            remote_channel_id: ev.room_id.clone(),
            remote_user_id: ev.sender.clone(),
            display_name: localpart(&ev.sender).to_owned(),
            avatar_url: None,
            body,
            remote_message_id: ev.event_id.clone(),
            timestamp_ms: ev.origin_server_ts,
            from_bridge: ev.sender == bot_mxid,
        })
    }
}

#[async_trait]
impl BridgeConnector for MatrixConnector {
    fn bridge_type(&self) -> BridgeType {
        BridgeType::Matrix
    }

    fn validate_config(&self, config: &Value) -> Result<(), BridgeError> {
        let cfg: MatrixConfig = parse_config(config)?;
        url::Url::parse(&cfg.homeserver_url)
            .map_err(|e| BridgeError::InvalidConfig(format!("homeserver_url: {e}")))?;
        if !cfg.bot_mxid.starts_with('@') || !cfg.bot_mxid.contains(':') {
            return Err(BridgeError::InvalidConfig("bot_mxid must look like @user:server".into()));
        }
        Ok(())
    }

    async fn connect(&self, conn: &BridgeConnection) -> Result<(), BridgeError> {
        let cfg: MatrixConfig = parse_config(&conn.config)?;
        let url = format!("{}/_matrix/client/v3/account/whoami", cfg.homeserver_url.trim_end_matches('/'));
        let resp = self.http.get(&url).bearer_auth(&cfg.as_token).send().await?;
        ensure_success(resp).await?;
        info!(bridge = %conn.id, homeserver = %cfg.homeserver_url, "Matrix AS token accepted");
        Ok(())
    }

    fn authenticate_inbound(&self, conn: &BridgeConnection, token: Option<&str>, _payload: &Value) -> Result<(), BridgeError> {
        let cfg: MatrixConfig = parse_config(&conn.config)?;
        match token {
            Some(t) if t == cfg.hs_token => Ok(()),
            _ => Err(BridgeError::Unauthenticated),
        }
    }

    fn translate_inbound(&self, conn: &BridgeConnection, payload: &Value) -> Result<Vec<RemoteEvent>, BridgeError> {
        let cfg: MatrixConfig = parse_config(&conn.config)?;
        let txn: MatrixTransaction =
            serde_json::from_value(payload.clone()).map_err(|e| BridgeError::Validation(e.to_string()))?;

        let mut out = Vec::new();
        for ev in &txn.events {
            match ev.event_type.as_str() {
                "m.room.message" => out.extend(Self::convert_message(ev, &cfg.bot_mxid)),
                other => debug!(event_type = other, room = %ev.room_id, "Ignoring Matrix event"),
            }
        }
        Ok(out)
    }

    async fn send(&self, conn: &BridgeConnection, room_id: &str, message: &OutboundMessage) -> Result<(), BridgeError> {
        let cfg: MatrixConfig = parse_config(&conn.config)?;
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let url = format!(
            "{}/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            cfg.homeserver_url.trim_end_matches('/'),
            urlencoded(room_id),
            txn_id
        );

        let content = MatrixMessageContent {
            msgtype: "m.text".to_owned(),
            body: message.attributed(),
            formatted_body: Some(format!(
                "<b>{}</b>: {}",
                html_escape(&message.sender_display_name),
                html_escape(&message.body)
            )),
            format: Some("org.matrix.custom.html".to_owned()),
        };

        let resp = self.http.put(&url).bearer_auth(&cfg.as_token).json(&content).send().await?;
        ensure_success(resp).await?;
        debug!(bridge = %conn.id, room = room_id, "Relayed message to Matrix");
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// `@alice:example.org` → `alice`
fn localpart(mxid: &str) -> &str {
    let trimmed = mxid.strip_prefix('@').unwrap_or(mxid);
    trimmed.split(':').next().unwrap_or(trimmed)
}

fn urlencoded(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::test_connection;
    use serde_json::json;

    fn conn() -> BridgeConnection {
        test_connection(
            BridgeType::Matrix,
            json!({
                "homeserver_url": "https://hs.example",
                "as_token": "as",
                "hs_token": "hs",
                "bot_mxid": "@meridian:hs.example",
            }),
        )
    }

    #[test]
    fn messages_translate_and_own_echoes_are_marked() {
        let c = MatrixConnector::new(reqwest::Client::new());
        let payload = json!({ "events": [
            { "type": "m.room.message", "room_id": "!r:hs.example", "sender": "@alice:hs.example",
              "origin_server_ts": 1, "content": { "msgtype": "m.text", "body": "hello" }, "event_id": "$1" },
            { "type": "m.room.message", "room_id": "!r:hs.example", "sender": "@meridian:hs.example",
              "origin_server_ts": 2, "content": { "msgtype": "m.text", "body": "echo" }, "event_id": "$2" },
            { "type": "m.room.message", "room_id": "!r:hs.example", "sender": "@alice:hs.example",
              "origin_server_ts": 3, "content": { "msgtype": "m.image", "body": "pic.png" }, "event_id": "$3" },
            { "type": "m.room.member", "room_id": "!r:hs.example", "sender": "@bob:hs.example",
              "origin_server_ts": 4, "content": {}, "event_id": "$4" },
        ]});
        let events = c.translate_inbound(&conn(), &payload).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].display_name, "alice");
        assert!(!events[0].from_bridge);
        assert!(events[1].from_bridge);
    }

    #[test]
    fn inbound_requires_hs_token() {
        let c = MatrixConnector::new(reqwest::Client::new());
        assert!(c.authenticate_inbound(&conn(), Some("hs"), &Value::Null).is_ok());
        assert!(c.authenticate_inbound(&conn(), Some("as"), &Value::Null).is_err());
        assert!(c.authenticate_inbound(&conn(), None, &Value::Null).is_err());
    }

    #[test]
    fn config_validation() {
        let c = MatrixConnector::new(reqwest::Client::new());
        assert!(c.validate_config(&conn().config).is_ok());
        assert!(c.validate_config(&json!({ "homeserver_url": "https://hs.example" })).is_err());
    }
}
