//! Federation records: instances, peer relationships, administrator controls,
//! delivery receipts and the key audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::text_enum;

/// Protocol version this build speaks. Peers must share the major component.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Capabilities every peer is assumed to support, whatever it advertises.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "messages",
    "presence",
    "profiles",
    "channels",
    "guilds",
    "reactions",
    "attachments",
    "embeds",
    "typing",
];

// ─── Instance ────────────────────────────────────────────────────────────────

/// A federation participant, local or remote.
///
/// The fingerprint is pinned on first verified contact and only changes
/// through an acknowledged [`KeyAuditEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    /// Canonical server name (e.g. `chat.example.org`). Unique.
    pub domain: String,
    /// `SHA256:<hex>` of the pinned Ed25519 public key; `None` until first contact.
    pub public_key_fingerprint: Option<String>,
    /// Base64url public key matching `public_key_fingerprint`.
    pub public_key: Option<String>,
    pub software_name: Option<String>,
    pub protocol_version: Option<String>,
    pub capabilities: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when an instance is discovered.
#[derive(Debug, Clone, Default)]
pub struct NewInstance {
    pub domain: String,
    pub software_name: Option<String>,
    pub protocol_version: Option<String>,
    pub capabilities: Vec<String>,
}

// ─── Peer relationship ───────────────────────────────────────────────────────

/// Automatic trust status of a remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Pending,
    Active,
    Blocked,
}

text_enum!(PeerStatus, "peer status", {
    Pending => "pending",
    Active => "active",
    Blocked => "blocked",
});

impl PeerStatus {
    /// The policy gate for user content: only `active` peers federate.
    pub fn can_federate(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether a message of `kind` may be exchanged with a peer in this status.
    pub fn permits(&self, kind: MessageKind) -> bool {
        match self {
            Self::Active => true,
            Self::Pending => kind.is_protocol(),
            Self::Blocked => false,
        }
    }
}

/// One row per (local instance, remote instance) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRelationship {
    pub id: Uuid,
    pub local_instance_id: Uuid,
    pub remote_instance_id: Uuid,
    pub status: PeerStatus,
    pub established_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub handshake_completed_at: Option<DateTime<Utc>>,
}

/// Classes of federation traffic, used by the trust policy gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Handshake,
    Capabilities,
    UserContent,
}

impl MessageKind {
    /// Handshake and capability exchange are allowed before approval.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Handshake | Self::Capabilities)
    }
}

// ─── Peer control ────────────────────────────────────────────────────────────

/// Administrator override applied to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Forces the relationship to `active`.
    Allow,
    /// Forces the relationship to `blocked`.
    Block,
    /// Suppresses notification fan-out; delivery eligibility is unchanged.
    Mute,
}

text_enum!(ControlAction, "control action", {
    Allow => "allow",
    Block => "block",
    Mute => "mute",
});

impl ControlAction {
    /// Status this action forces onto the relationship, if any.
    pub fn forced_status(&self) -> Option<PeerStatus> {
        match self {
            Self::Allow => Some(PeerStatus::Active),
            Self::Block => Some(PeerStatus::Blocked),
            Self::Mute => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerControl {
    pub id: Uuid,
    pub local_instance_id: Uuid,
    pub remote_instance_id: Uuid,
    pub action: ControlAction,
    pub reason: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Peer control command: `{action, reason?}`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PeerControlRequest {
    pub action: ControlAction,
    #[validate(length(max = 500, message = "Reason must be at most 500 characters"))]
    pub reason: Option<String>,
}

/// Pre-authorise a domain before it has ever handshaken.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PreauthorizeRequest {
    #[validate(length(min = 1, max = 253, message = "Domain must be 1-253 characters"))]
    pub domain: String,
    #[validate(length(max = 500, message = "Reason must be at most 500 characters"))]
    pub reason: Option<String>,
}

// ─── Delivery receipts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
}

text_enum!(DeliveryStatus, "delivery status", {
    Pending => "pending",
    Retrying => "retrying",
    Delivered => "delivered",
    Failed => "failed",
});

impl DeliveryStatus {
    /// States from which a network attempt may be recorded.
    pub fn is_attemptable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    /// States from which `retry` is legal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// Tracked delivery of one message to one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub id: Uuid,
    pub message_id: String,
    pub source_instance: String,
    pub target_instance: String,
    pub status: DeliveryStatus,
    /// Logical tries so far. Never decreases.
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Set when the last failure must not be retried automatically.
    pub permanent_failure: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Message body kept for re-sends; not part of the operator record.
    #[serde(skip_serializing, default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub message_id: String,
    pub source_instance: String,
    pub target_instance: String,
    pub payload: serde_json::Value,
}

/// Narrow field changes applied by a conditional receipt update.
#[derive(Debug, Clone)]
pub struct ReceiptUpdate {
    pub status: DeliveryStatus,
    pub increment_attempts: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the stored message.
    pub error_message: Option<Option<String>>,
    pub permanent_failure: Option<bool>,
    /// `Some(None)` clears the scheduled time.
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
}

impl ReceiptUpdate {
    /// An update that only moves the status.
    pub fn to(status: DeliveryStatus) -> Self {
        Self {
            status,
            increment_attempts: false,
            last_attempt_at: None,
            delivered_at: None,
            error_message: None,
            permanent_failure: None,
            next_attempt_at: None,
        }
    }
}

/// Typed filter for operator receipt listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiptFilter {
    pub status: Option<DeliveryStatus>,
    pub target: Option<String>,
    pub message_id: Option<String>,
    /// Only receipts created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Keyset cursor with `before`: also admit receipts created exactly at
    /// `before` whose id sorts below this one.
    pub before_id: Option<Uuid>,
    pub limit: Option<u32>,
}

impl ReceiptFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;

    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, r: &DeliveryReceipt) -> bool {
        self.status.is_none_or(|s| r.status == s)
            && self.target.as_deref().is_none_or(|t| r.target_instance == t)
            && self.message_id.as_deref().is_none_or(|m| r.message_id == m)
            && self.before.is_none_or(|b| {
                r.created_at < b || self.before_id.is_some_and(|id| r.created_at == b && r.id < id)
            })
    }

    /// The filter for the page after `last`, in newest-first order.
    pub fn after_page(&self, last: &DeliveryReceipt) -> Self {
        Self { before: Some(last.created_at), before_id: Some(last.id), ..self.clone() }
    }
}

// ─── Key audit ───────────────────────────────────────────────────────────────

/// A detected change of a peer's signing key, pending administrator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAuditEntry {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub old_fingerprint: String,
    pub new_fingerprint: String,
    /// Public key behind `new_fingerprint`, pinned on acknowledgement.
    pub new_public_key: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub acknowledged_by: Option<Uuid>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl KeyAuditEntry {
    pub fn is_open(&self) -> bool {
        self.acknowledged_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewKeyAuditEntry {
    pub instance_id: Uuid,
    pub old_fingerprint: String,
    pub new_fingerprint: String,
    pub new_public_key: Option<String>,
}

/// What to do with traffic from a peer whose key changed and is unacknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyChangePolicy {
    /// Refuse user content until an administrator acknowledges the change.
    #[default]
    Block,
    /// Accept, but mark every admitted message as flagged.
    Flag,
}

text_enum!(KeyChangePolicy, "key change policy", {
    Block => "block",
    Flag => "flag",
});
