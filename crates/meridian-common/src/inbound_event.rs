//! Inbound event type shared between the API, federation and bridge crates.
//!
//! Accepted federated transactions and bridge relays are published as these
//! on a broadcast channel; the message pipeline consumes them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FEDERATED_MESSAGE: &str = "FEDERATED_MESSAGE";
pub const BRIDGED_MESSAGE: &str = "BRIDGED_MESSAGE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// `FEDERATED_MESSAGE` or `BRIDGED_MESSAGE`
    pub event_type: String,
    pub data: serde_json::Value,
    /// Peer domain, or `bridge:<id>` for bridge relays.
    pub origin: String,
    pub channel_id: Option<Uuid>,
    /// `false` when the origin is muted: deliver, but raise no notifications.
    pub notify: bool,
    /// Signed by a changed key that no administrator has acknowledged yet.
    #[serde(default)]
    pub key_flagged: bool,
}
