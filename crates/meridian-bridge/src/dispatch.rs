//! Bridge relays as delivery-engine targets.
//!
//! Outbound bridge traffic is tracked with the same receipts as federated
//! traffic. A receipt whose target is `bridge:<bridgeId>:<remoteChannelId>`
//! is admitted while the connection is `connected` and delivered through
//! the connection's connector. [`TargetRouter`] puts both kinds of target
//! behind the engine's single policy and transport.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use meridian_common::models::{BridgeStatus, DeliveryReceipt};
use meridian_db::{BridgeStore, RelayDirection};
use meridian_federation::{DeliveryError, DeliveryTransport, FederationError, TargetPolicy};

use crate::connector::{ConnectorRegistry, OutboundMessage};

const PREFIX: &str = "bridge:";

/// `bridge:<bridgeId>:<remoteChannelId>`. The remote id may itself contain
/// colons (Matrix room ids do).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTarget {
    pub bridge_id: Uuid,
    pub remote_channel_id: String,
}

impl BridgeTarget {
    pub fn new(bridge_id: Uuid, remote_channel_id: impl Into<String>) -> Self {
        Self { bridge_id, remote_channel_id: remote_channel_id.into() }
    }

    pub fn matches(target: &str) -> bool {
        target.starts_with(PREFIX)
    }
}

impl fmt::Display for BridgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}:{}", self.bridge_id, self.remote_channel_id)
    }
}

impl FromStr for BridgeTarget {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FederationError::Validation(format!("'{s}' is not a bridge target"));
        let rest = s.strip_prefix(PREFIX).ok_or_else(invalid)?;
        let (id, remote) = rest.split_once(':').ok_or_else(invalid)?;
        if remote.is_empty() {
            return Err(invalid());
        }
        let bridge_id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Self { bridge_id, remote_channel_id: remote.to_owned() })
    }
}

/// What a bridge receipt carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgePayload {
    pub mapping_id: Uuid,
    pub sender_display_name: String,
    pub body: String,
}

// ─── Bridge side ─────────────────────────────────────────────────────────────

pub struct BridgeDelivery {
    store: Arc<dyn BridgeStore>,
    connectors: Arc<ConnectorRegistry>,
}

impl BridgeDelivery {
    pub fn new(store: Arc<dyn BridgeStore>, connectors: Arc<ConnectorRegistry>) -> Self {
        Self { store, connectors }
    }

    /// A bridge target is federatable while its connection is `connected`.
    pub async fn admit(&self, target: &str) -> Result<(), FederationError> {
        let parsed: BridgeTarget = target.parse()?;
        let conn = self
            .store
            .get_connection(parsed.bridge_id)
            .await?
            .ok_or_else(|| FederationError::PeerNotFound(target.to_owned()))?;
        if conn.status != BridgeStatus::Connected {
            return Err(FederationError::PeerNotFederatable(target.to_owned()));
        }
        Ok(())
    }

    pub async fn deliver(&self, receipt: &DeliveryReceipt) -> Result<(), DeliveryError> {
        let target: BridgeTarget = receipt
            .target_instance
            .parse()
            .map_err(|e: FederationError| DeliveryError::Permanent(e.to_string()))?;
        let payload: BridgePayload = serde_json::from_value(receipt.payload.clone())
            .map_err(|e| DeliveryError::Permanent(format!("stored payload is not a bridge relay: {e}")))?;

        let conn = self
            .store
            .get_connection(target.bridge_id)
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?
            .ok_or_else(|| DeliveryError::Permanent(format!("bridge {} no longer exists", target.bridge_id)))?;
        let connector = self.connectors.require(conn.bridge_type).map_err(|e| e.into_delivery_error())?;

        let message = OutboundMessage { sender_display_name: payload.sender_display_name, body: payload.body };
        connector
            .send(&conn, &target.remote_channel_id, &message)
            .await
            .map_err(|e| e.into_delivery_error())?;

        if let Err(e) = self.store.increment_mapping_counter(payload.mapping_id, RelayDirection::Outbound).await {
            warn!(mapping = %payload.mapping_id, error = %e, "Failed to count outbound relay");
        }
        debug!(receipt = %receipt.id, bridge = %conn.id, remote = %target.remote_channel_id, "Bridge relay delivered");
        Ok(())
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Sends `bridge:` targets to the bridge side and everything else to the
/// federation policy and transport.
pub struct TargetRouter {
    peer_policy: Arc<dyn TargetPolicy>,
    peer_transport: Arc<dyn DeliveryTransport>,
    bridges: Arc<BridgeDelivery>,
}

impl TargetRouter {
    pub fn new(
        peer_policy: Arc<dyn TargetPolicy>,
        peer_transport: Arc<dyn DeliveryTransport>,
        bridges: Arc<BridgeDelivery>,
    ) -> Self {
        Self { peer_policy, peer_transport, bridges }
    }
}

#[async_trait]
impl TargetPolicy for TargetRouter {
    async fn check(&self, target: &str) -> Result<(), FederationError> {
        if BridgeTarget::matches(target) {
            self.bridges.admit(target).await
        } else {
            self.peer_policy.check(target).await
        }
    }
}

#[async_trait]
impl DeliveryTransport for TargetRouter {
    async fn deliver(&self, receipt: &DeliveryReceipt) -> Result<(), DeliveryError> {
        if BridgeTarget::matches(&receipt.target_instance) {
            self.bridges.deliver(receipt).await
        } else {
            self.peer_transport.deliver(receipt).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_round_trip_with_colons_in_the_remote_id() {
        let id = Uuid::new_v4();
        let t = BridgeTarget::new(id, "!room:hs.example");
        let s = t.to_string();
        assert_eq!(s, format!("bridge:{id}:!room:hs.example"));
        assert_eq!(s.parse::<BridgeTarget>().unwrap(), t);
        assert!(BridgeTarget::matches(&s));
        assert!(!BridgeTarget::matches("peer.example"));
    }

    #[test]
    fn malformed_targets_are_rejected() {
        assert!("bridge:not-a-uuid:#x".parse::<BridgeTarget>().is_err());
        assert!(format!("bridge:{}", Uuid::new_v4()).parse::<BridgeTarget>().is_err());
        assert!(format!("bridge:{}:", Uuid::new_v4()).parse::<BridgeTarget>().is_err());
        assert!("peer.example".parse::<BridgeTarget>().is_err());
    }
}
