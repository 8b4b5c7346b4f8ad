//! Telegram Bot API connector.
//!
//! Outbound text goes through `sendMessage`. Inbound updates arrive on the
//! bridge webhook (registered with `setWebhook`), optionally authenticated
//! with Telegram's `secret_token`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use meridian_common::models::{BridgeConnection, BridgeType};

use crate::connector::{ensure_success, parse_config, BridgeConnector, OutboundMessage, RemoteEvent};
use crate::error::BridgeError;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// `<bot id>:<secret>` as issued by BotFather.
    pub bot_token: String,
    /// Expected in `X-Telegram-Bot-Api-Secret-Token` on inbound updates.
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

impl TelegramConfig {
    fn method_url(&self, method: &str) -> String {
        let base = self.api_base.as_deref().unwrap_or(DEFAULT_API_BASE).trim_end_matches('/');
        format!("{base}/bot{}/{method}", self.bot_token)
    }

    /// The numeric id before the colon is the bot's own user id.
    fn bot_user_id(&self) -> Option<i64> {
        self.bot_token.split(':').next()?.parse().ok()
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Update {
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    channel_post: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    from: Option<User>,
    #[serde(default)]
    text: Option<String>,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

// ─── Connector ───────────────────────────────────────────────────────────────

pub struct TelegramConnector {
    http: reqwest::Client,
}

impl TelegramConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn call(&self, cfg: &TelegramConfig, method: &str, body: Option<Value>) -> Result<(), BridgeError> {
        let url = cfg.method_url(method);
        let req = match body {
            Some(body) => self.http.post(&url).json(&body),
            None => self.http.get(&url),
        };
        let resp: ApiResponse = ensure_success(req.send().await?).await?.json().await?;
        if !resp.ok {
            return Err(BridgeError::Protocol(resp.description.unwrap_or_else(|| format!("{method} failed"))));
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeConnector for TelegramConnector {
    fn bridge_type(&self) -> BridgeType {
        BridgeType::Telegram
    }

    fn validate_config(&self, config: &Value) -> Result<(), BridgeError> {
        let cfg: TelegramConfig = parse_config(config)?;
        if cfg.bot_user_id().is_none() {
            return Err(BridgeError::InvalidConfig("bot_token must look like <id>:<secret>".into()));
        }
        Ok(())
    }

    async fn connect(&self, conn: &BridgeConnection) -> Result<(), BridgeError> {
        let cfg: TelegramConfig = parse_config(&conn.config)?;
        self.call(&cfg, "getMe", None).await?;
        info!(bridge = %conn.id, "Telegram bot token accepted");
        Ok(())
    }

    fn authenticate_inbound(&self, conn: &BridgeConnection, token: Option<&str>, _payload: &Value) -> Result<(), BridgeError> {
        let cfg: TelegramConfig = parse_config(&conn.config)?;
        match (&cfg.secret_token, token) {
            (None, _) => Ok(()),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(BridgeError::Unauthenticated),
        }
    }

    fn translate_inbound(&self, conn: &BridgeConnection, payload: &Value) -> Result<Vec<RemoteEvent>, BridgeError> {
        let cfg: TelegramConfig = parse_config(&conn.config)?;
        let update: Update =
            serde_json::from_value(payload.clone()).map_err(|e| BridgeError::Validation(e.to_string()))?;

        let Some(msg) = update.message.or(update.channel_post) else {
            debug!(bridge = %conn.id, "Ignoring Telegram update without a message");
            return Ok(Vec::new());
        };
        let Some(text) = msg.text else {
            return Ok(Vec::new());
        };

        let (user_id, display_name) = match &msg.from {
            Some(u) => (
                u.id.to_string(),
                u.username.clone().unwrap_or_else(|| match &u.last_name {
                    Some(last) => format!("{} {last}", u.first_name),
                    None => u.first_name.clone(),
                }),
            ),
            None => (msg.chat.id.to_string(), msg.chat.title.clone().unwrap_or_else(|| "channel".into())),
        };
        let from_bridge = msg.from.as_ref().is_some_and(|u| Some(u.id) == cfg.bot_user_id());

        Ok(vec![RemoteEvent {
            remote_channel_id: msg.chat.id.to_string(),
            remote_user_id: user_id,
            display_name,
            avatar_url: None,
            body: text,
            remote_message_id: Some(msg.message_id.to_string()),
            timestamp_ms: msg.date * 1000,
            from_bridge,
        }])
    }

    async fn send(&self, conn: &BridgeConnection, chat_id: &str, message: &OutboundMessage) -> Result<(), BridgeError> {
        let cfg: TelegramConfig = parse_config(&conn.config)?;
        self.call(&cfg, "sendMessage", Some(json!({ "chat_id": chat_id, "text": message.attributed() })))
            .await?;
        debug!(bridge = %conn.id, chat = chat_id, "Relayed message to Telegram");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::test_connection;

    fn conn(secret: Option<&str>) -> BridgeConnection {
        test_connection(BridgeType::Telegram, json!({ "bot_token": "4242:abc", "secret_token": secret }))
    }

    #[test]
    fn updates_translate_and_bot_echo_is_marked() {
        let c = TelegramConnector::new(reqwest::Client::new());
        let from_user = json!({ "update_id": 1, "message": {
            "message_id": 10, "date": 1700000000, "text": "hi",
            "chat": { "id": -100 }, "from": { "id": 7, "first_name": "Ana", "username": "ana" } } });
        let events = c.translate_inbound(&conn(None), &from_user).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].remote_channel_id, "-100");
        assert_eq!(events[0].display_name, "ana");
        assert_eq!(events[0].timestamp_ms, 1_700_000_000_000);
        assert!(!events[0].from_bridge);

        let from_bot = json!({ "update_id": 2, "message": {
            "message_id": 11, "date": 1700000001, "text": "ana: hi",
            "chat": { "id": -100 }, "from": { "id": 4242, "first_name": "Meridian" } } });
        assert!(c.translate_inbound(&conn(None), &from_bot).unwrap()[0].from_bridge);

        let sticker = json!({ "update_id": 3, "message": { "message_id": 12, "date": 1, "chat": { "id": 1 } } });
        assert!(c.translate_inbound(&conn(None), &sticker).unwrap().is_empty());
    }

    #[test]
    fn secret_token_is_checked_when_configured() {
        let c = TelegramConnector::new(reqwest::Client::new());
        assert!(c.authenticate_inbound(&conn(None), None, &Value::Null).is_ok());
        assert!(c.authenticate_inbound(&conn(Some("s3")), Some("s3"), &Value::Null).is_ok());
        assert!(c.authenticate_inbound(&conn(Some("s3")), None, &Value::Null).is_err());
    }

    #[test]
    fn token_shape_is_validated() {
        let c = TelegramConnector::new(reqwest::Client::new());
        assert!(c.validate_config(&json!({ "bot_token": "4242:abc" })).is_ok());
        assert!(c.validate_config(&json!({ "bot_token": "nope" })).is_err());
    }
}
