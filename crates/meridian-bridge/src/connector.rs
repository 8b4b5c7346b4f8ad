//! The connector seam: one implementation per external protocol.
//!
//! A connector is stateless with respect to storage. It validates a
//! connection's config, probes the remote on connect, turns native inbound
//! payloads into [`RemoteEvent`]s and sends outbound text. The
//! [`crate::manager::BridgeManager`] owns status, mappings and relay rules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use meridian_common::models::{BridgeConnection, BridgeType};

use crate::connectors::{DiscordConnector, IrcConnector, MatrixConnector, SlackConnector, TelegramConnector};
use crate::error::BridgeError;

/// A message observed on the remote side, normalised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub remote_channel_id: String,
    pub remote_user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub body: String,
    #[serde(default)]
    pub remote_message_id: Option<String>,
    pub timestamp_ms: i64,
    /// Emitted by this bridge's own identity; never relayed inbound.
    #[serde(default)]
    pub from_bridge: bool,
}

/// Text to post on the remote side on behalf of a local author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub sender_display_name: String,
    pub body: String,
}

impl OutboundMessage {
    /// `Name: body`, for protocols without per-message sender names.
    pub fn attributed(&self) -> String {
        format!("{}: {}", self.sender_display_name, self.body)
    }
}

/// What a connector with a persistent session pushes on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Events(Vec<RemoteEvent>),
    /// The session ended without being asked to.
    Closed { reason: String },
}

/// Session traffic, tagged with the bridge it belongs to.
pub type InboundSink = mpsc::Sender<(Uuid, SessionEvent)>;

#[async_trait]
pub trait BridgeConnector: Send + Sync {
    fn bridge_type(&self) -> BridgeType;

    /// Reject configs missing required fields before anything is stored.
    fn validate_config(&self, config: &Value) -> Result<(), BridgeError>;

    /// Probe the remote with the connection's credentials.
    async fn connect(&self, conn: &BridgeConnection) -> Result<(), BridgeError>;

    async fn disconnect(&self, _conn: &BridgeConnection) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Check the credential an inbound webhook presented.
    fn authenticate_inbound(
        &self,
        _conn: &BridgeConnection,
        _token: Option<&str>,
        _payload: &Value,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Translate one native inbound payload. Unsupported event kinds are
    /// skipped, not errors.
    fn translate_inbound(&self, conn: &BridgeConnection, payload: &Value) -> Result<Vec<RemoteEvent>, BridgeError>;

    async fn send(
        &self,
        conn: &BridgeConnection,
        remote_channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), BridgeError>;
}

/// Parse a connection's JSON config into a connector's typed config.
pub fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T, BridgeError> {
    serde_json::from_value(config.clone()).map_err(|e| BridgeError::InvalidConfig(e.to_string()))
}

/// Shared HTTP client for the HTTP-based connectors.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("Meridian-Bridge/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build bridge http client")
}

/// Fail with `Remote` unless the response is a success; keeps the body for
/// the connection's `last_error`.
pub async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BridgeError::Remote { status: status.as_u16(), body: truncate(&body, 300) })
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_owned(),
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Connectors by bridge type. A type with no entry cannot connect.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<BridgeType, Arc<dyn BridgeConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in connector. IRC pushes its inbound lines into `sink`.
    pub fn with_defaults(timeout: Duration, sink: InboundSink) -> Self {
        let http = http_client(timeout);
        let mut registry = Self::new();
        registry.register(Arc::new(MatrixConnector::new(http.clone())));
        registry.register(Arc::new(TelegramConnector::new(http.clone())));
        registry.register(Arc::new(SlackConnector::new(http.clone())));
        registry.register(Arc::new(DiscordConnector::new(http)));
        registry.register(Arc::new(IrcConnector::new(timeout, sink)));
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn BridgeConnector>) {
        self.connectors.insert(connector.bridge_type(), connector);
    }

    pub fn get(&self, bridge_type: BridgeType) -> Option<Arc<dyn BridgeConnector>> {
        self.connectors.get(&bridge_type).cloned()
    }

    /// Look up a connector, failing with `Unsupported` if none exists.
    pub fn require(&self, bridge_type: BridgeType) -> Result<Arc<dyn BridgeConnector>, BridgeError> {
        self.get(bridge_type).ok_or(BridgeError::Unsupported(bridge_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_everything_but_xmpp() {
        let (tx, _rx) = mpsc::channel(1);
        let registry = ConnectorRegistry::with_defaults(Duration::from_secs(5), tx);
        for t in [BridgeType::Matrix, BridgeType::Telegram, BridgeType::Slack, BridgeType::Irc, BridgeType::Discord] {
            assert!(registry.get(t).is_some(), "{t} connector missing");
        }
        assert!(matches!(registry.require(BridgeType::Xmpp), Err(BridgeError::Unsupported(BridgeType::Xmpp))));
    }

    #[test]
    fn attribution_and_truncation() {
        let m = OutboundMessage { sender_display_name: "ana".into(), body: "hi".into() };
        assert_eq!(m.attributed(), "ana: hi");
        assert_eq!(truncate("abcdef", 3), "abc…");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
