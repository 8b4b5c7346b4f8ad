//! Bridge lifecycle, channel mappings and relay rules.
//!
//! Connectors only speak their protocol; the manager decides what moves:
//!
//! - **Inbound** (remote → local): events the bridge itself emitted are
//!   dropped, the rest go to every mapping of the remote channel that
//!   relays inbound, authored by the sender's virtual user, and are
//!   published as [`BRIDGED_MESSAGE`] events.
//! - **Outbound** (local → remote): one delivery receipt per mapping of the
//!   local channel that relays outbound. A message authored by a virtual
//!   user is never sent back to the bridge it came from.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_common::inbound_event::{InboundEvent, BRIDGED_MESSAGE};
use meridian_common::models::{
    BridgeConnection, BridgeStatus, ChannelMapping, CreateBridgeRequest, CreateChannelMappingRequest,
    DeliveryReceipt, NewBridgeConnection, NewVirtualUser,
};
use meridian_common::validation::validate_request;
use meridian_db::{BridgeStore, RelayDirection, StoreError};
use meridian_federation::{DeliveryEngine, FederationError};

use crate::connector::{ConnectorRegistry, RemoteEvent, SessionEvent};
use crate::dispatch::{BridgePayload, BridgeTarget};
use crate::error::BridgeError;

/// Who wrote a local message that is being relayed out.
#[derive(Debug, Clone)]
pub enum RelayAuthor {
    Local { display_name: String },
    /// A remote identity relayed in earlier through some bridge.
    Virtual { virtual_user_id: Uuid },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub relayed: usize,
    /// Echoes of this bridge's own messages.
    pub skipped_loop: usize,
    /// Events from remote channels with no inbound mapping.
    pub unmapped: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct OutboundReport {
    pub receipts: Vec<DeliveryReceipt>,
    /// Mappings on the bridge the author came from.
    pub skipped_origin: usize,
    /// Mappings whose bridge is not connected.
    pub refused: usize,
}

pub struct BridgeManager {
    store: Arc<dyn BridgeStore>,
    connectors: Arc<ConnectorRegistry>,
    engine: Arc<DeliveryEngine>,
    events: broadcast::Sender<InboundEvent>,
    connect_timeout: Duration,
}

impl BridgeManager {
    pub fn new(
        store: Arc<dyn BridgeStore>,
        connectors: Arc<ConnectorRegistry>,
        engine: Arc<DeliveryEngine>,
        events: broadcast::Sender<InboundEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self { store, connectors, engine, events, connect_timeout }
    }

    // ── Connections ──────────────────────────────────────────────────────────

    /// Create a `disconnected` connection. The config is checked by the
    /// type's connector when there is one.
    pub async fn create(
        &self,
        guild_id: Uuid,
        req: CreateBridgeRequest,
        created_by: Option<Uuid>,
    ) -> Result<BridgeConnection, BridgeError> {
        validate_request(&req)?;
        if let Some(connector) = self.connectors.get(req.bridge_type) {
            connector.validate_config(&req.config)?;
        }

        let bridge_type = req.bridge_type;
        let conn = self
            .store
            .create_connection(NewBridgeConnection {
                guild_id,
                bridge_type,
                remote_id: req.remote_id,
                display_name: req.display_name,
                config: req.config,
                created_by,
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => BridgeError::DuplicateConnection(bridge_type),
                other => other.into(),
            })?;

        info!(bridge = %conn.id, guild = %guild_id, kind = %bridge_type, "Bridge connection created");
        Ok(conn)
    }

    pub async fn get(&self, id: Uuid) -> Result<BridgeConnection, BridgeError> {
        self.store.get_connection(id).await?.ok_or(BridgeError::NotFound(id))
    }

    pub async fn list(&self, guild_id: Uuid) -> Result<Vec<BridgeConnection>, BridgeError> {
        Ok(self.store.list_connections(guild_id).await?)
    }

    /// Disconnect if needed, then remove the connection with its mappings
    /// and virtual users.
    pub async fn delete(&self, id: Uuid) -> Result<(), BridgeError> {
        let conn = self.get(id).await?;
        if conn.status == BridgeStatus::Connected {
            self.close_session(&conn).await;
        }
        if !self.store.delete_connection(id).await? {
            return Err(BridgeError::NotFound(id));
        }
        info!(bridge = %id, "Bridge connection deleted");
        Ok(())
    }

    /// `disconnected | error → connected`, or `→ error` with `last_error`.
    pub async fn connect(&self, id: Uuid) -> Result<BridgeConnection, BridgeError> {
        let conn = self.get(id).await?;

        let result = match self.connectors.require(conn.bridge_type) {
            Ok(connector) => match tokio::time::timeout(self.connect_timeout, connector.connect(&conn)).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Timeout),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let updated = self.set_status(id, BridgeStatus::Connected, None).await?;
                info!(bridge = %id, kind = %conn.bridge_type, "Bridge connected");
                Ok(updated)
            }
            Err(e) => {
                warn!(bridge = %id, kind = %conn.bridge_type, error = %e, "Bridge connect failed");
                self.set_status(id, BridgeStatus::Error, Some(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// `→ disconnected`. Connector teardown errors are logged, not returned.
    pub async fn disconnect(&self, id: Uuid) -> Result<BridgeConnection, BridgeError> {
        let conn = self.get(id).await?;
        self.close_session(&conn).await;
        let updated = self.set_status(id, BridgeStatus::Disconnected, None).await?;
        info!(bridge = %id, "Bridge disconnected");
        Ok(updated)
    }

    /// Re-open every connection the store still lists as `connected`, as
    /// after a restart. Each one ends up `connected` again or `error` with
    /// the reason. Returns how many came back.
    pub async fn resume_sessions(&self) -> Result<usize, BridgeError> {
        let stale = self.store.connections_with_status(BridgeStatus::Connected).await?;
        let mut resumed = 0;
        for conn in stale {
            match self.connect(conn.id).await {
                Ok(_) => resumed += 1,
                Err(BridgeError::NotFound(_)) => {}
                Err(e) => debug!(bridge = %conn.id, error = %e, "Bridge not resumed"),
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed bridge sessions");
        }
        Ok(resumed)
    }

    /// A live session dropped on its own: `connected → error`.
    async fn session_closed(&self, id: Uuid, reason: String) -> Result<(), BridgeError> {
        let conn = self.get(id).await?;
        if conn.status != BridgeStatus::Connected {
            return Ok(());
        }
        warn!(bridge = %id, kind = %conn.bridge_type, %reason, "Bridge session lost");
        self.set_status(id, BridgeStatus::Error, Some(reason)).await?;
        Ok(())
    }

    async fn close_session(&self, conn: &BridgeConnection) {
        if let Some(connector) = self.connectors.get(conn.bridge_type) {
            if let Err(e) = connector.disconnect(conn).await {
                warn!(bridge = %conn.id, error = %e, "Connector teardown failed");
            }
        }
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: BridgeStatus,
        last_error: Option<String>,
    ) -> Result<BridgeConnection, BridgeError> {
        self.store
            .set_connection_status(id, status, last_error)
            .await?
            .ok_or(BridgeError::NotFound(id))
    }

    // ── Mappings ─────────────────────────────────────────────────────────────

    pub async fn map_channel(
        &self,
        bridge_id: Uuid,
        req: CreateChannelMappingRequest,
    ) -> Result<ChannelMapping, BridgeError> {
        validate_request(&req)?;
        self.get(bridge_id).await?;

        let mapping = self
            .store
            .create_mapping(bridge_id, req.local_channel_id, &req.remote_channel_id, req.direction)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => BridgeError::DuplicateMapping,
                other => other.into(),
            })?;

        info!(
            bridge = %bridge_id,
            mapping = %mapping.id,
            local = %mapping.local_channel_id,
            remote = %mapping.remote_channel_id,
            direction = %mapping.direction,
            "Channel mapped"
        );
        Ok(mapping)
    }

    pub async fn unmap(&self, bridge_id: Uuid, mapping_id: Uuid) -> Result<(), BridgeError> {
        let mapping = self
            .store
            .get_mapping(mapping_id)
            .await?
            .filter(|m| m.bridge_id == bridge_id)
            .ok_or(BridgeError::MappingNotFound(mapping_id))?;
        self.store.delete_mapping(mapping.id).await?;
        info!(bridge = %bridge_id, mapping = %mapping_id, "Channel unmapped");
        Ok(())
    }

    pub async fn mappings(&self, bridge_id: Uuid) -> Result<Vec<ChannelMapping>, BridgeError> {
        self.get(bridge_id).await?;
        Ok(self.store.list_mappings(bridge_id).await?)
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// A native payload posted to the bridge's webhook.
    pub async fn relay_inbound(
        &self,
        bridge_id: Uuid,
        token: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<RelayReport, BridgeError> {
        let conn = self.get(bridge_id).await?;
        if conn.status != BridgeStatus::Connected {
            return Err(BridgeError::NotConnected(bridge_id));
        }
        let connector = self.connectors.require(conn.bridge_type)?;
        connector.authenticate_inbound(&conn, token, payload)?;
        let events = connector.translate_inbound(&conn, payload)?;
        self.relay_events(&conn, events).await
    }

    pub async fn relay_events(
        &self,
        conn: &BridgeConnection,
        events: Vec<RemoteEvent>,
    ) -> Result<RelayReport, BridgeError> {
        let mut report = RelayReport::default();

        for event in events {
            if event.from_bridge {
                debug!(bridge = %conn.id, remote = %event.remote_channel_id, "Dropping echo of our own message");
                report.skipped_loop += 1;
                continue;
            }

            let mappings: Vec<ChannelMapping> = self
                .store
                .mappings_for_remote_channel(conn.id, &event.remote_channel_id)
                .await?
                .into_iter()
                .filter(|m| m.direction.relays_inbound())
                .collect();
            if mappings.is_empty() {
                debug!(bridge = %conn.id, remote = %event.remote_channel_id, "No inbound mapping for remote channel");
                report.unmapped += 1;
                continue;
            }

            let author = self
                .store
                .upsert_virtual_user(NewVirtualUser {
                    bridge_id: conn.id,
                    remote_user_id: event.remote_user_id.clone(),
                    display_name: event.display_name.clone(),
                    avatar_url: event.avatar_url.clone(),
                })
                .await?;

            for mapping in mappings {
                self.store.increment_mapping_counter(mapping.id, RelayDirection::Inbound).await?;
                let published = self.events.send(InboundEvent {
                    event_type: BRIDGED_MESSAGE.to_owned(),
                    data: json!({
                        "bridge_id": conn.id,
                        "mapping_id": mapping.id,
                        "virtual_user_id": author.id,
                        "display_name": author.display_name,
                        "avatar_url": author.avatar_url,
                        "body": event.body,
                        "remote_message_id": event.remote_message_id,
                        "timestamp_ms": event.timestamp_ms,
                    }),
                    origin: format!("bridge:{}", conn.id),
                    channel_id: Some(mapping.local_channel_id),
                    notify: true,
                    key_flagged: false,
                });
                if published.is_err() {
                    debug!(bridge = %conn.id, "No subscribers for bridged message");
                }
                report.relayed += 1;
            }
        }

        if report.relayed > 0 {
            debug!(bridge = %conn.id, relayed = report.relayed, "Relayed inbound bridge messages");
        }
        Ok(report)
    }

    /// Feed events that session-based connectors push on their own, and mark
    /// bridges whose session ended as `error`.
    pub fn spawn_inbound_pump(self: Arc<Self>, mut rx: mpsc::Receiver<(Uuid, SessionEvent)>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((bridge_id, pushed)) = rx.recv().await {
                let events = match pushed {
                    SessionEvent::Events(events) => events,
                    SessionEvent::Closed { reason } => {
                        if let Err(e) = self.session_closed(bridge_id, reason).await {
                            warn!(bridge = %bridge_id, error = %e, "Failed to record lost bridge session");
                        }
                        continue;
                    }
                };
                let conn = match self.get(bridge_id).await {
                    Ok(conn) if conn.status == BridgeStatus::Connected => conn,
                    Ok(_) => {
                        debug!(bridge = %bridge_id, "Dropping events for a bridge that is not connected");
                        continue;
                    }
                    Err(e) => {
                        warn!(bridge = %bridge_id, error = %e, "Dropping pushed bridge events");
                        continue;
                    }
                };
                if let Err(e) = self.relay_events(&conn, events).await {
                    warn!(bridge = %bridge_id, error = %e, "Failed to relay pushed bridge events");
                }
            }
        })
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Enqueue a local message for every outbound mapping of its channel.
    pub async fn relay_outbound(
        &self,
        local_channel_id: Uuid,
        message_id: &str,
        author: RelayAuthor,
        body: &str,
    ) -> Result<OutboundReport, BridgeError> {
        let (sender_display_name, origin_bridge) = match author {
            RelayAuthor::Local { display_name } => (display_name, None),
            RelayAuthor::Virtual { virtual_user_id } => {
                let user = self
                    .store
                    .get_virtual_user(virtual_user_id)
                    .await?
                    .ok_or_else(|| BridgeError::Validation(format!("unknown virtual user {virtual_user_id}")))?;
                (user.display_name, Some(user.bridge_id))
            }
        };

        let mut report = OutboundReport::default();
        let mappings = self.store.mappings_for_local_channel(local_channel_id).await?;
        for mapping in mappings.into_iter().filter(|m| m.direction.relays_outbound()) {
            if Some(mapping.bridge_id) == origin_bridge {
                report.skipped_origin += 1;
                continue;
            }

            let target = BridgeTarget::new(mapping.bridge_id, mapping.remote_channel_id.clone()).to_string();
            let payload = BridgePayload {
                mapping_id: mapping.id,
                sender_display_name: sender_display_name.clone(),
                body: body.to_owned(),
            };
            let payload = serde_json::to_value(&payload).map_err(|e| BridgeError::Validation(e.to_string()))?;

            match self.engine.enqueue(message_id, &target, payload).await {
                Ok(receipt) => report.receipts.push(receipt),
                Err(FederationError::PeerNotFederatable(_)) => {
                    debug!(bridge = %mapping.bridge_id, mapping = %mapping.id, "Bridge not connected; not relaying");
                    report.refused += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }
}
