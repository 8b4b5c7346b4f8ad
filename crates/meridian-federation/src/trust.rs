//! Trust state machine.
//!
//! Each peer relationship is `pending` on first contact and leaves that state
//! exactly once, by `approve` (to `active`) or `reject` (to `blocked`).
//! Administrator controls sit beside the automatic status: `allow` and
//! `block` force it, `mute` leaves it alone and only silences notifications.
//!
//! Every status write is conditional in the store, so an approval racing a
//! block resolves to one ordering and never to a lost update.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_common::models::{
    ControlAction, MessageKind, PeerControl, PeerRelationship, PeerStatus,
};
use meridian_db::PeerStore;

use crate::delivery::TargetPolicy;
use crate::error::FederationError;

/// Result of an administrator control command.
#[derive(Debug, Clone, Serialize)]
pub struct ControlOutcome {
    pub control: PeerControl,
    /// The relationship after the command, if the peer has made contact.
    pub relationship: Option<PeerRelationship>,
}

pub struct TrustStateMachine {
    peers: Arc<dyn PeerStore>,
    local_instance_id: Uuid,
}

impl TrustStateMachine {
    pub fn new(peers: Arc<dyn PeerStore>, local_instance_id: Uuid) -> Self {
        Self { peers, local_instance_id }
    }

    pub fn local_instance_id(&self) -> Uuid {
        self.local_instance_id
    }

    // ── Strict transitions ───────────────────────────────────────────────────

    /// `pending → active`. Fails with `NotPending` from any other status.
    pub async fn approve(&self, remote: Uuid) -> Result<PeerRelationship, FederationError> {
        let rel = self.leave_pending(remote, PeerStatus::Active).await?;
        info!(peer = %remote, "Peer approved");
        Ok(rel)
    }

    /// `pending → blocked`. Fails with `NotPending` from any other status.
    pub async fn reject(&self, remote: Uuid) -> Result<PeerRelationship, FederationError> {
        let rel = self.leave_pending(remote, PeerStatus::Blocked).await?;
        info!(peer = %remote, "Peer rejected");
        Ok(rel)
    }

    async fn leave_pending(&self, remote: Uuid, to: PeerStatus) -> Result<PeerRelationship, FederationError> {
        let moved = self
            .peers
            .transition_relationship(
                self.local_instance_id,
                remote,
                Some(PeerStatus::Pending),
                to,
                to == PeerStatus::Active,
            )
            .await?;
        if let Some(rel) = moved {
            return Ok(rel);
        }

        match self.peers.get_relationship(self.local_instance_id, remote).await? {
            None => Err(FederationError::PeerNotFound(remote.to_string())),
            Some(rel) => Err(FederationError::NotPending { peer: remote.to_string(), status: rel.status }),
        }
    }

    // ── Administrator controls ───────────────────────────────────────────────

    /// Record `action` for the peer and apply any status it forces.
    ///
    /// Reapplying the same control is a successful no-op. A peer that has not
    /// made contact yet gets the forced status on its first handshake.
    pub async fn set_control(
        &self,
        remote: Uuid,
        action: ControlAction,
        reason: Option<String>,
        admin: Option<Uuid>,
    ) -> Result<ControlOutcome, FederationError> {
        if self.peers.get_instance(remote).await?.is_none() {
            return Err(FederationError::PeerNotFound(remote.to_string()));
        }

        let control = self
            .peers
            .upsert_control(self.local_instance_id, remote, action, reason, admin)
            .await?;

        let relationship = match action.forced_status() {
            Some(forced) => {
                self.peers
                    .transition_relationship(
                        self.local_instance_id,
                        remote,
                        None,
                        forced,
                        forced == PeerStatus::Active,
                    )
                    .await?
            }
            None => self.peers.get_relationship(self.local_instance_id, remote).await?,
        };

        match action {
            ControlAction::Block => warn!(peer = %remote, reason = ?control.reason, "Peer blocked by administrator"),
            _ => info!(peer = %remote, %action, reason = ?control.reason, "Peer control applied"),
        }
        Ok(ControlOutcome { control, relationship })
    }

    /// Remove the control record. The status it forced stays as it is.
    pub async fn clear_control(&self, remote: Uuid) -> Result<bool, FederationError> {
        let removed = self.peers.delete_control(self.local_instance_id, remote).await?;
        if removed {
            info!(peer = %remote, "Peer control cleared");
        }
        Ok(removed)
    }

    pub async fn control_of(&self, remote: Uuid) -> Result<Option<PeerControl>, FederationError> {
        Ok(self.peers.get_control(self.local_instance_id, remote).await?)
    }

    // ── Policy gate ──────────────────────────────────────────────────────────

    /// Status a brand-new relationship starts in.
    pub async fn initial_status(&self, remote: Uuid) -> Result<PeerStatus, FederationError> {
        Ok(self
            .control_of(remote)
            .await?
            .and_then(|c| c.action.forced_status())
            .unwrap_or(PeerStatus::Pending))
    }

    pub async fn status_of(&self, remote: Uuid) -> Result<Option<PeerStatus>, FederationError> {
        Ok(self
            .peers
            .get_relationship(self.local_instance_id, remote)
            .await?
            .map(|r| r.status))
    }

    pub async fn can_federate(&self, remote: Uuid) -> Result<bool, FederationError> {
        Ok(self.status_of(remote).await?.is_some_and(|s| s.can_federate()))
    }

    pub async fn is_muted(&self, remote: Uuid) -> Result<bool, FederationError> {
        Ok(self.control_of(remote).await?.is_some_and(|c| c.action == ControlAction::Mute))
    }

    /// Whether a message of `kind` may be exchanged with the peer right now.
    pub async fn check(&self, remote: Uuid, kind: MessageKind) -> Result<PeerRelationship, FederationError> {
        let rel = self
            .peers
            .get_relationship(self.local_instance_id, remote)
            .await?
            .ok_or_else(|| FederationError::PeerNotFound(remote.to_string()))?;
        if !rel.status.permits(kind) {
            debug!(peer = %remote, status = %rel.status, ?kind, "Trust policy refused message");
            return Err(FederationError::PeerNotFederatable(remote.to_string()));
        }
        Ok(rel)
    }
}

// ─── Delivery admission ──────────────────────────────────────────────────────

/// Admits delivery targets named by domain: only `active` peers receive
/// user content.
pub struct TrustPolicy {
    peers: Arc<dyn PeerStore>,
    trust: Arc<TrustStateMachine>,
}

impl TrustPolicy {
    pub fn new(peers: Arc<dyn PeerStore>, trust: Arc<TrustStateMachine>) -> Self {
        Self { peers, trust }
    }
}

#[async_trait]
impl TargetPolicy for TrustPolicy {
    async fn check(&self, target: &str) -> Result<(), FederationError> {
        let instance = self
            .peers
            .find_instance(target)
            .await?
            .ok_or_else(|| FederationError::PeerNotFound(target.to_owned()))?;
        self.trust
            .check(instance.id, MessageKind::UserContent)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                FederationError::PeerNotFound(_) | FederationError::PeerNotFederatable(_) => {
                    FederationError::PeerNotFederatable(target.to_owned())
                }
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::models::NewInstance;
    use meridian_db::memory::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, TrustStateMachine, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let local = store.upsert_instance(NewInstance { domain: "local.example".into(), ..Default::default() }).await.unwrap();
        let remote = store.upsert_instance(NewInstance { domain: "p1.example".into(), ..Default::default() }).await.unwrap();
        let trust = TrustStateMachine::new(store.clone(), local.id);
        (store, trust, remote.id)
    }

    #[tokio::test]
    async fn approve_only_from_pending() {
        let (store, trust, p1) = setup().await;
        store.ensure_relationship(trust.local_instance_id(), p1, PeerStatus::Pending).await.unwrap();

        let rel = trust.approve(p1).await.unwrap();
        assert_eq!(rel.status, PeerStatus::Active);
        assert!(rel.handshake_completed_at.is_some());

        let err = trust.approve(p1).await.unwrap_err();
        assert!(matches!(err, FederationError::NotPending { status: PeerStatus::Active, .. }));
        let err = trust.reject(p1).await.unwrap_err();
        assert!(matches!(err, FederationError::NotPending { .. }));
        assert_eq!(trust.status_of(p1).await.unwrap(), Some(PeerStatus::Active));
    }

    #[tokio::test]
    async fn approve_unknown_relationship_is_not_found() {
        let (_store, trust, p1) = setup().await;
        assert!(matches!(trust.approve(p1).await.unwrap_err(), FederationError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn admin_block_cannot_be_silently_reapproved() {
        let (store, trust, p1) = setup().await;
        store.ensure_relationship(trust.local_instance_id(), p1, PeerStatus::Pending).await.unwrap();

        let out = trust.set_control(p1, ControlAction::Block, Some("spam".into()), None).await.unwrap();
        assert_eq!(out.relationship.unwrap().status, PeerStatus::Blocked);
        assert!(matches!(trust.approve(p1).await.unwrap_err(), FederationError::NotPending { .. }));

        let out = trust.set_control(p1, ControlAction::Allow, None, None).await.unwrap();
        assert_eq!(out.relationship.unwrap().status, PeerStatus::Active);
        // Reapplying is a no-op success.
        let again = trust.set_control(p1, ControlAction::Allow, None, None).await.unwrap();
        assert_eq!(again.relationship.unwrap().status, PeerStatus::Active);
    }

    #[tokio::test]
    async fn mute_leaves_status_alone() {
        let (store, trust, p1) = setup().await;
        store.ensure_relationship(trust.local_instance_id(), p1, PeerStatus::Pending).await.unwrap();
        trust.approve(p1).await.unwrap();

        trust.set_control(p1, ControlAction::Mute, None, None).await.unwrap();
        assert!(trust.is_muted(p1).await.unwrap());
        assert!(trust.can_federate(p1).await.unwrap());
        assert!(trust.clear_control(p1).await.unwrap());
        assert!(!trust.is_muted(p1).await.unwrap());
    }

    #[tokio::test]
    async fn pending_peers_exchange_protocol_messages_only() {
        let (store, trust, p1) = setup().await;
        store.ensure_relationship(trust.local_instance_id(), p1, PeerStatus::Pending).await.unwrap();
        assert!(trust.check(p1, MessageKind::Handshake).await.is_ok());
        assert!(matches!(
            trust.check(p1, MessageKind::UserContent).await.unwrap_err(),
            FederationError::PeerNotFederatable(_)
        ));
    }

    #[tokio::test]
    async fn controls_decide_initial_status() {
        let (_store, trust, p1) = setup().await;
        assert_eq!(trust.initial_status(p1).await.unwrap(), PeerStatus::Pending);
        let out = trust.set_control(p1, ControlAction::Allow, None, None).await.unwrap();
        assert!(out.relationship.is_none());
        assert_eq!(trust.initial_status(p1).await.unwrap(), PeerStatus::Active);
    }

    #[tokio::test]
    async fn policy_admits_active_domains_only() {
        let (store, trust, p1) = setup().await;
        let trust = Arc::new(trust);
        let policy = TrustPolicy::new(store.clone(), trust.clone());

        assert!(policy.check("unknown.example").await.is_err());
        store.ensure_relationship(trust.local_instance_id(), p1, PeerStatus::Pending).await.unwrap();
        assert!(matches!(policy.check("p1.example").await.unwrap_err(), FederationError::PeerNotFederatable(_)));
        trust.approve(p1).await.unwrap();
        policy.check("p1.example").await.unwrap();
    }
}
