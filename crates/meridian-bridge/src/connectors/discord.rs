//! Discord connector over an incoming webhook.
//!
//! Outbound posts go to the webhook with the local author as `username`.
//! Inbound messages are forwarded to the bridge webhook by a gateway relay
//! as `MESSAGE_CREATE` dispatches (or bare message objects).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use meridian_common::models::{BridgeConnection, BridgeType};

use crate::connector::{ensure_success, parse_config, BridgeConnector, OutboundMessage, RemoteEvent};
use crate::error::BridgeError;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    /// `https://discord.com/api/webhooks/<id>/<token>`
    pub webhook_url: String,
    /// Shared secret the gateway relay presents as a bearer token.
    #[serde(default)]
    pub inbound_secret: Option<String>,
}

impl DiscordConfig {
    /// The webhook id segment, which Discord stamps on messages it posted.
    fn webhook_id(&self) -> Option<String> {
        let url = url::Url::parse(&self.webhook_url).ok()?;
        let mut segments = url.path_segments()?;
        segments.by_ref().find(|s| *s == "webhooks")?;
        segments.next().map(str::to_owned)
    }
}

#[derive(Debug, Deserialize)]
struct Dispatch {
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    channel_id: String,
    author: Author,
    #[serde(default)]
    content: String,
    #[serde(default)]
    webhook_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Author {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

pub struct DiscordConnector {
    http: reqwest::Client,
}

impl DiscordConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BridgeConnector for DiscordConnector {
    fn bridge_type(&self) -> BridgeType {
        BridgeType::Discord
    }

    fn validate_config(&self, config: &Value) -> Result<(), BridgeError> {
        let cfg: DiscordConfig = parse_config(config)?;
        url::Url::parse(&cfg.webhook_url).map_err(|e| BridgeError::InvalidConfig(format!("webhook_url: {e}")))?;
        if cfg.webhook_id().is_none() {
            return Err(BridgeError::InvalidConfig("webhook_url is not a Discord webhook".into()));
        }
        Ok(())
    }

    async fn connect(&self, conn: &BridgeConnection) -> Result<(), BridgeError> {
        let cfg: DiscordConfig = parse_config(&conn.config)?;
        ensure_success(self.http.get(&cfg.webhook_url).send().await?).await?;
        info!(bridge = %conn.id, "Discord webhook reachable");
        Ok(())
    }

    fn authenticate_inbound(&self, conn: &BridgeConnection, token: Option<&str>, _payload: &Value) -> Result<(), BridgeError> {
        let cfg: DiscordConfig = parse_config(&conn.config)?;
        match (&cfg.inbound_secret, token) {
            (None, _) => Ok(()),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(BridgeError::Unauthenticated),
        }
    }

    fn translate_inbound(&self, conn: &BridgeConnection, payload: &Value) -> Result<Vec<RemoteEvent>, BridgeError> {
        let cfg: DiscordConfig = parse_config(&conn.config)?;
        let dispatch: Dispatch =
            serde_json::from_value(payload.clone()).map_err(|e| BridgeError::Validation(e.to_string()))?;

        let raw = match (dispatch.t.as_deref(), dispatch.d) {
            (Some("MESSAGE_CREATE"), Some(d)) => d,
            (Some(other), _) => {
                debug!(bridge = %conn.id, event = other, "Ignoring Discord dispatch");
                return Ok(Vec::new());
            }
            (None, _) => payload.clone(),
        };
        let msg: DiscordMessage = serde_json::from_value(raw).map_err(|e| BridgeError::Validation(e.to_string()))?;
        if msg.content.is_empty() {
            return Ok(Vec::new());
        }

        let from_bridge = msg.webhook_id.is_some() && msg.webhook_id == cfg.webhook_id();
        let timestamp_ms = msg
            .timestamp
            .as_deref()
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.timestamp_millis())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let avatar_url = msg
            .author
            .avatar
            .as_ref()
            .map(|hash| format!("https://cdn.discordapp.com/avatars/{}/{hash}.png", msg.author.id));

        Ok(vec![RemoteEvent {
            remote_channel_id: msg.channel_id,
            display_name: msg.author.global_name.unwrap_or(msg.author.username),
            remote_user_id: msg.author.id,
            avatar_url,
            body: msg.content,
            remote_message_id: Some(msg.id),
            timestamp_ms,
            from_bridge,
        }])
    }

    /// The webhook is bound to one channel, so `channel_id` is only logged.
    async fn send(&self, conn: &BridgeConnection, channel_id: &str, message: &OutboundMessage) -> Result<(), BridgeError> {
        let cfg: DiscordConfig = parse_config(&conn.config)?;
        let resp = self
            .http
            .post(&cfg.webhook_url)
            .query(&[("wait", "true")])
            .json(&json!({ "content": message.body, "username": message.sender_display_name }))
            .send()
            .await?;
        ensure_success(resp).await?;
        debug!(bridge = %conn.id, channel = channel_id, "Relayed message to Discord");
        Ok(())
    }
}
