//! Slack connector: Web API for outbound, Events API callbacks for inbound.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use meridian_common::models::{BridgeConnection, BridgeType};

use crate::connector::{ensure_success, parse_config, BridgeConnector, OutboundMessage, RemoteEvent};
use crate::error::BridgeError;

const DEFAULT_API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    /// `xoxb-…` bot token.
    pub bot_token: String,
    /// Legacy verification token carried in every event callback.
    #[serde(default)]
    pub verification_token: Option<String>,
    /// The bot's own user id, for echo detection.
    #[serde(default)]
    pub bot_user_id: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

impl SlackConfig {
    fn method_url(&self, method: &str) -> String {
        let base = self.api_base.as_deref().unwrap_or(DEFAULT_API_BASE).trim_end_matches('/');
        format!("{base}/{method}")
    }
}

#[derive(Debug, Deserialize)]
struct EventCallback {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event: Option<MessageEvent>,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct SlackConnector {
    http: reqwest::Client,
}

impl SlackConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn call(&self, cfg: &SlackConfig, method: &str, body: Value) -> Result<(), BridgeError> {
        let resp = self.http.post(cfg.method_url(method)).bearer_auth(&cfg.bot_token).json(&body).send().await?;
        let resp: ApiResponse = ensure_success(resp).await?.json().await?;
        if !resp.ok {
            return Err(BridgeError::Protocol(resp.error.unwrap_or_else(|| format!("{method} failed"))));
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeConnector for SlackConnector {
    fn bridge_type(&self) -> BridgeType {
        BridgeType::Slack
    }

    fn validate_config(&self, config: &Value) -> Result<(), BridgeError> {
        let cfg: SlackConfig = parse_config(config)?;
        if cfg.bot_token.trim().is_empty() {
            return Err(BridgeError::InvalidConfig("bot_token is required".into()));
        }
        Ok(())
    }

    async fn connect(&self, conn: &BridgeConnection) -> Result<(), BridgeError> {
        let cfg: SlackConfig = parse_config(&conn.config)?;
        self.call(&cfg, "auth.test", json!({})).await?;
        info!(bridge = %conn.id, "Slack bot token accepted");
        Ok(())
    }

    fn authenticate_inbound(&self, conn: &BridgeConnection, _token: Option<&str>, payload: &Value) -> Result<(), BridgeError> {
        let cfg: SlackConfig = parse_config(&conn.config)?;
        let Some(expected) = cfg.verification_token else {
            return Ok(());
        };
        match payload.get("token").and_then(Value::as_str) {
            Some(given) if given == expected => Ok(()),
            _ => Err(BridgeError::Unauthenticated),
        }
    }

    fn translate_inbound(&self, conn: &BridgeConnection, payload: &Value) -> Result<Vec<RemoteEvent>, BridgeError> {
        let cfg: SlackConfig = parse_config(&conn.config)?;
        let callback: EventCallback =
            serde_json::from_value(payload.clone()).map_err(|e| BridgeError::Validation(e.to_string()))?;

        if callback.kind != "event_callback" {
            debug!(bridge = %conn.id, kind = %callback.kind, "Ignoring Slack callback");
            return Ok(Vec::new());
        }
        let Some(ev) = callback.event.filter(|e| e.kind == "message") else {
            return Ok(Vec::new());
        };
        // Edits, deletes and joins carry subtypes we do not relay.
        if ev.subtype.as_deref().is_some_and(|s| s != "bot_message") {
            return Ok(Vec::new());
        }
        let (Some(channel), Some(text)) = (ev.channel, ev.text) else {
            return Ok(Vec::new());
        };

        let user = ev.user.clone().or_else(|| ev.bot_id.clone()).unwrap_or_else(|| "unknown".into());
        let from_bridge = ev.bot_id.is_some()
            || ev.subtype.as_deref() == Some("bot_message")
            || (cfg.bot_user_id.is_some() && ev.user == cfg.bot_user_id);
        let timestamp_ms = ev
            .ts
            .as_deref()
            .and_then(|ts| ts.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as i64)
            .unwrap_or_default();

        Ok(vec![RemoteEvent {
            remote_channel_id: channel,
            display_name: ev.username.unwrap_or_else(|| user.clone()),
            remote_user_id: user,
            avatar_url: None,
            body: text,
            remote_message_id: ev.ts,
            timestamp_ms,
            from_bridge,
        }])
    }

    async fn send(&self, conn: &BridgeConnection, channel: &str, message: &OutboundMessage) -> Result<(), BridgeError> {
        let cfg: SlackConfig = parse_config(&conn.config)?;
        self.call(
            &cfg,
            "chat.postMessage",
            json!({ "channel": channel, "text": message.body, "username": message.sender_display_name }),
        )
        .await?;
        debug!(bridge = %conn.id, channel, "Relayed message to Slack");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::test_connection;

    fn conn() -> BridgeConnection {
        test_connection(BridgeType::Slack, json!({ "bot_token": "xoxb-1", "verification_token": "vt", "bot_user_id": "UBOT" }))
    }

    #[test]
    fn message_events_translate() {
        let c = SlackConnector::new(reqwest::Client::new());
        let payload = json!({ "token": "vt", "type": "event_callback", "event": {
            "type": "message", "channel": "C1", "user": "U1", "text": "hello", "ts": "1700000000.000100" } });
        let events = c.translate_inbound(&conn(), &payload).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].remote_channel_id, "C1");
        assert_eq!(events[0].timestamp_ms, 1_700_000_000_000);
        assert!(!events[0].from_bridge);
    }

    #[test]
    fn bot_posts_and_edits_are_not_relayed_as_user_messages() {
        let c = SlackConnector::new(reqwest::Client::new());
        let bot = json!({ "type": "event_callback", "event": {
            "type": "message", "subtype": "bot_message", "bot_id": "B1", "channel": "C1", "text": "echo", "ts": "1.0" } });
        assert!(c.translate_inbound(&conn(), &bot).unwrap()[0].from_bridge);

        let edit = json!({ "type": "event_callback", "event": {
            "type": "message", "subtype": "message_changed", "channel": "C1", "ts": "1.0" } });
        assert!(c.translate_inbound(&conn(), &edit).unwrap().is_empty());

        let challenge = json!({ "type": "url_verification", "challenge": "abc" });
        assert!(c.translate_inbound(&conn(), &challenge).unwrap().is_empty());
    }

    #[test]
    fn verification_token_is_checked() {
        let c = SlackConnector::new(reqwest::Client::new());
        assert!(c.authenticate_inbound(&conn(), None, &json!({ "token": "vt" })).is_ok());
        assert!(c.authenticate_inbound(&conn(), None, &json!({ "token": "nope" })).is_err());
    }
}
