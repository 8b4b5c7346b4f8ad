//! Bridge records: per-guild connections to external chat networks, the
//! channel mappings under them, and virtual users projecting remote identities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::text_enum;

/// External protocol a bridge connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeType {
    Matrix,
    Discord,
    Telegram,
    Slack,
    Irc,
    Xmpp,
}

text_enum!(BridgeType, "bridge type", {
    Matrix => "matrix",
    Discord => "discord",
    Telegram => "telegram",
    Slack => "slack",
    Irc => "irc",
    Xmpp => "xmpp",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Disconnected,
    Connected,
    Error,
}

text_enum!(BridgeStatus, "bridge status", {
    Disconnected => "disconnected",
    Connected => "connected",
    Error => "error",
});

/// One per (guild, bridge type, remote id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConnection {
    pub id: Uuid,
    pub guild_id: Uuid,
    pub bridge_type: BridgeType,
    /// Identifier of the remote workspace / homeserver / network.
    pub remote_id: String,
    pub display_name: String,
    pub status: BridgeStatus,
    /// Protocol-specific settings. Holds credentials, so it is write-only.
    #[serde(skip_serializing, default)]
    pub config: serde_json::Value,
    pub last_error: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBridgeConnection {
    pub guild_id: Uuid,
    pub bridge_type: BridgeType,
    pub remote_id: String,
    pub display_name: String,
    pub config: serde_json::Value,
    pub created_by: Option<Uuid>,
}

/// Bridge config: `{bridgeType, displayName, config}` plus the remote id.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBridgeRequest {
    pub bridge_type: BridgeType,
    #[validate(length(min = 1, max = 100, message = "Display name must be 1-100 characters"))]
    pub display_name: String,
    #[validate(length(min = 1, max = 255, message = "Remote id must be 1-255 characters"))]
    pub remote_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

// ─── Channel mappings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingDirection {
    #[default]
    Bidirectional,
    /// Remote → local only.
    Inbound,
    /// Local → remote only.
    Outbound,
}

text_enum!(MappingDirection, "mapping direction", {
    Bidirectional => "bidirectional",
    Inbound => "inbound",
    Outbound => "outbound",
});

impl MappingDirection {
    pub fn relays_inbound(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::Inbound)
    }

    pub fn relays_outbound(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::Outbound)
    }
}

/// Links a local channel to a remote channel under one bridge connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub id: Uuid,
    pub bridge_id: Uuid,
    pub local_channel_id: Uuid,
    pub remote_channel_id: String,
    pub direction: MappingDirection,
    pub inbound_count: i64,
    pub outbound_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateChannelMappingRequest {
    pub local_channel_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "Remote channel id must be 1-255 characters"))]
    pub remote_channel_id: String,
    #[serde(default)]
    pub direction: MappingDirection,
}

// ─── Virtual users ───────────────────────────────────────────────────────────

/// Read-only local projection of a remote identity, keyed by
/// `(bridge_id, remote_user_id)`. Never authenticates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualUser {
    pub id: Uuid,
    pub bridge_id: Uuid,
    pub remote_user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVirtualUser {
    pub bridge_id: Uuid,
    pub remote_user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}
