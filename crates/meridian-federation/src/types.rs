//! Federation wire types: handshake, transaction envelopes, key entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use meridian_common::models::{MessageKind, PeerStatus};

// ─── Keys ────────────────────────────────────────────────────────────────────

/// A single public verify key entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyKey {
    /// Base64url-encoded Ed25519 public key bytes.
    pub key: String,
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Body of `POST /_meridian/federation/v1/handshake`.
///
/// The request is signed with the key it carries, so the receiver can
/// verify possession before pinning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub server_name: String,
    /// Base64url Ed25519 public key.
    pub public_key: String,
    #[serde(default)]
    pub software_name: Option<String>,
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Reply to a handshake: the receiver's view of the new relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub server_name: String,
    pub public_key: String,
    pub protocol_version: String,
    /// Negotiated set: the default floor plus what the initiator advertised.
    pub capabilities: Vec<String>,
    /// Status the initiator now has on the receiving side.
    pub status: PeerStatus,
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// One federated message inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedMessage {
    /// Origin-assigned ID, stable across retries.
    pub message_id: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    pub origin_server_ts: i64,
}

impl FederatedMessage {
    /// A user-content message stamped with the current time.
    pub fn user_content(
        message_id: impl Into<String>,
        channel_id: Option<String>,
        sender: Option<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            kind: MessageKind::UserContent,
            channel_id,
            sender,
            content,
            origin_server_ts: Utc::now().timestamp_millis(),
        }
    }
}

/// The envelope sent via `PUT /_meridian/federation/v1/send/{txnId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationTransaction {
    pub origin: String,
    pub destination: String,
    /// Unix millisecond timestamp on the origin server.
    pub origin_server_ts: i64,
    #[serde(default)]
    pub messages: Vec<FederatedMessage>,
}

impl FederationTransaction {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            origin_server_ts: Utc::now().timestamp_millis(),
            messages: Vec::new(),
        }
    }
}

/// Receiver's acknowledgement of a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionResponse {
    /// Messages admitted and handed to the local pipeline.
    pub accepted: usize,
    /// Messages refused by the admission gate.
    pub rejected: usize,
    /// `true` if this `(origin, txn_id)` was already processed.
    #[serde(default)]
    pub duplicate: bool,
}

// ─── Well-known response ──────────────────────────────────────────────────────

/// Response shape for `/.well-known/meridian/server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnownServer {
    /// The delegated server name (may differ from the queried hostname).
    #[serde(rename = "m.server")]
    pub server: String,
}
