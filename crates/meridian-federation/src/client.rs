//! Server-to-server HTTP client.
//!
//! [`FederationClient`] handles all outbound communication to remote Meridian
//! servers. Every request except the key fetch is signed with this server's
//! key pair before being sent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use meridian_common::models::DeliveryReceipt;

use crate::{
    delivery::DeliveryTransport,
    discovery::DiscoveryCache,
    error::{DeliveryError, FederationError},
    gate::KeyResolver,
    keys::{ServerKeyDocument, ServerKeyPair},
    signatures::sign_request,
    types::{
        FederatedMessage, FederationTransaction, HandshakeRequest, HandshakeResponse,
        TransactionResponse,
    },
};

pub const HANDSHAKE_PATH: &str = "/_meridian/federation/v1/handshake";
pub const SEND_PATH: &str = "/_meridian/federation/v1/send";
pub const KEY_PATH: &str = "/_meridian/key/v2/server";

// ─── Client ──────────────────────────────────────────────────────────────────

/// Async HTTP client for outbound server-to-server federation requests.
pub struct FederationClient {
    server_name: String,
    key_pair: Arc<ServerKeyPair>,
    http: Client,
    discovery: DiscoveryCache,
}

impl FederationClient {
    pub fn new(server_name: impl Into<String>, key_pair: Arc<ServerKeyPair>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("Meridian-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build reqwest client");

        Self { server_name: server_name.into(), key_pair, http, discovery: DiscoveryCache::default() }
    }

    /// Replace the default discovery resolver (24 h cache, no overrides).
    pub fn with_discovery(mut self, discovery: DiscoveryCache) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn key_pair(&self) -> &ServerKeyPair {
        &self.key_pair
    }

    /// The handshake body this server sends when introducing itself.
    pub fn handshake_request(&self, capabilities: Vec<String>) -> HandshakeRequest {
        HandshakeRequest {
            server_name: self.server_name.clone(),
            public_key: self.key_pair.public_key_base64(),
            software_name: Some(concat!("meridian/", env!("CARGO_PKG_VERSION")).to_owned()),
            protocol_version: meridian_common::models::PROTOCOL_VERSION.to_owned(),
            capabilities,
        }
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    /// `POST /_meridian/federation/v1/handshake`
    pub async fn handshake(
        &self,
        destination: &str,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, FederationError> {
        let body = serde_json::to_value(request)?;
        let base_url = self.discovery.resolve(destination).await?;
        let resp = self.signed_send(reqwest::Method::POST, destination, &base_url, HANDSHAKE_PATH, &body).await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FederationError::RemoteHttp(destination.to_owned(), format!("handshake returned HTTP {status}")));
        }
        resp.json()
            .await
            .map_err(|e| FederationError::RemoteProtocol(destination.to_owned(), e.to_string()))
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    /// `PUT /_meridian/federation/v1/send/{txnId}`
    ///
    /// Failures are classified for the retry policy. A connection-level
    /// failure also drops the cached discovery result for the destination.
    pub async fn send_transaction(
        &self,
        destination: &str,
        txn_id: &str,
        txn: &FederationTransaction,
    ) -> Result<TransactionResponse, DeliveryError> {
        let uri = format!("{SEND_PATH}/{}", urlencoded(txn_id));
        let body = serde_json::to_value(txn).map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        let base_url = self
            .discovery
            .resolve(destination)
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let resp = match self.signed_send(reqwest::Method::PUT, destination, &base_url, &uri, &body).await {
            Ok(resp) => resp,
            Err(e) => {
                self.discovery.invalidate(destination).await;
                return Err(e.into());
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::from_status(status.as_u16(), destination));
        }
        resp.json::<TransactionResponse>()
            .await
            .map_err(|e| DeliveryError::Permanent(format!("{destination} sent a malformed acknowledgement: {e}")))
    }

    // ── Server keys ──────────────────────────────────────────────────────────

    /// `GET /_meridian/key/v2/server`. Unauthenticated.
    pub async fn fetch_server_keys(&self, destination: &str) -> Result<ServerKeyDocument, FederationError> {
        let base_url = self.discovery.resolve(destination).await?;
        let url = format!("{base_url}{KEY_PATH}");
        debug!(%url, "Fetching server keys");
        self.get_json(destination, &url).await
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(&self, destination: &str, url: &str) -> Result<T, FederationError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FederationError::RemoteHttp(destination.to_owned(), e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| FederationError::RemoteProtocol(destination.to_owned(), e.to_string()))
    }

    async fn signed_send(
        &self,
        method: reqwest::Method,
        destination: &str,
        base_url: &str,
        uri: &str,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let auth = sign_request(&self.key_pair, &self.server_name, destination, method.as_str(), uri, Some(body));
        let url = format!("{base_url}{uri}");
        debug!(%method, %url, "Federation request");
        self.http
            .request(method, &url)
            .header(reqwest::header::AUTHORIZATION, auth.to_header())
            .json(body)
            .send()
            .await
    }
}

// ─── Delivery transport ──────────────────────────────────────────────────────

#[async_trait]
impl DeliveryTransport for FederationClient {
    /// One receipt is one single-message transaction. The receipt id is the
    /// transaction id, so a retried send is recognised as a replay.
    async fn deliver(&self, receipt: &DeliveryReceipt) -> Result<(), DeliveryError> {
        let message: FederatedMessage = serde_json::from_value(receipt.payload.clone())
            .map_err(|e| DeliveryError::Permanent(format!("stored payload is not a federated message: {e}")))?;

        let mut txn = FederationTransaction::new(&self.server_name, &receipt.target_instance);
        txn.messages.push(message);

        let ack = self.send_transaction(&receipt.target_instance, &receipt.id.simple().to_string(), &txn).await?;
        if ack.rejected > 0 && ack.accepted == 0 && !ack.duplicate {
            return Err(DeliveryError::Permanent(format!("{} rejected the message", receipt.target_instance)));
        }
        Ok(())
    }
}

// ─── Key resolution ──────────────────────────────────────────────────────────

#[async_trait]
impl KeyResolver for FederationClient {
    async fn resolve_key(&self, server_name: &str, key_id: &str) -> Result<String, FederationError> {
        let doc = self.fetch_server_keys(server_name).await?;
        if doc.server_name != server_name {
            return Err(FederationError::OriginMismatch {
                claimed: server_name.to_owned(),
                actual: doc.server_name,
            });
        }
        doc.verify_keys
            .get(key_id)
            .map(|k| k.key.clone())
            .ok_or_else(|| FederationError::KeyNotFound(key_id.to_owned()))
    }
}

fn urlencoded(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
