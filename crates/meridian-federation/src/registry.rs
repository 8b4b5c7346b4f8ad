//! Peer registry: known remote instances, first contact and capability
//! negotiation.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use meridian_common::models::{
    ControlAction, Instance, NewInstance, PeerControl, PeerRelationship, PeerStatus,
    DEFAULT_CAPABILITIES, PROTOCOL_VERSION,
};
use meridian_common::validation::normalize_domain;
use meridian_db::PeerStore;

use crate::client::FederationClient;
use crate::error::FederationError;
use crate::keys::{fingerprint_of, ServerKeyPair};
use crate::key_audit::{KeyAuditor, KeyCheck};
use crate::trust::{ControlOutcome, TrustStateMachine};
use crate::types::{HandshakeRequest, HandshakeResponse};

/// What a peer told us about itself, from either side of a handshake.
#[derive(Debug, Clone)]
pub struct PeerContact {
    pub domain: String,
    pub public_key: String,
    pub software_name: Option<String>,
    pub protocol_version: String,
    pub capabilities: Vec<String>,
}

impl From<&HandshakeRequest> for PeerContact {
    fn from(req: &HandshakeRequest) -> Self {
        Self {
            domain: req.server_name.clone(),
            public_key: req.public_key.clone(),
            software_name: req.software_name.clone(),
            protocol_version: req.protocol_version.clone(),
            capabilities: req.capabilities.clone(),
        }
    }
}

/// Result of recording a contact.
#[derive(Debug, Clone)]
pub struct ContactOutcome {
    pub instance: Instance,
    pub relationship: PeerRelationship,
    pub capabilities: Vec<String>,
    /// The peer presented a changed key and the policy admits it flagged.
    pub key_flagged: bool,
}

/// Operator view of one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub instance: Instance,
    pub relationship: Option<PeerRelationship>,
    pub control: Option<PeerControl>,
}

pub struct PeerRegistry {
    peers: Arc<dyn PeerStore>,
    trust: Arc<TrustStateMachine>,
    auditor: Arc<KeyAuditor>,
}

impl PeerRegistry {
    pub fn new(peers: Arc<dyn PeerStore>, trust: Arc<TrustStateMachine>, auditor: Arc<KeyAuditor>) -> Self {
        Self { peers, trust, auditor }
    }

    /// Upsert this server's own instance record with its current key.
    pub async fn register_local(
        peers: &dyn PeerStore,
        server_name: &str,
        key_pair: &ServerKeyPair,
    ) -> Result<Instance, FederationError> {
        let domain = normalize_domain(server_name)?;
        let instance = peers
            .upsert_instance(NewInstance {
                domain,
                software_name: Some(concat!("meridian/", env!("CARGO_PKG_VERSION")).to_owned()),
                protocol_version: Some(PROTOCOL_VERSION.to_owned()),
                capabilities: negotiate(&[]),
            })
            .await?;

        let fingerprint = key_pair.fingerprint();
        if instance.public_key_fingerprint.as_deref() != Some(fingerprint.as_str()) {
            peers
                .replace_pinned_key(instance.id, &fingerprint, Some(&key_pair.public_key_base64()))
                .await?;
        }
        peers
            .get_instance(instance.id)
            .await?
            .ok_or_else(|| FederationError::PeerNotFound(instance.domain.clone()))
    }

    // ── First contact ────────────────────────────────────────────────────────

    /// Record a verified contact: inbound handshake or a reply to ours.
    ///
    /// Concurrent first contacts from one peer converge on a single
    /// relationship. A blocked peer is refused before its key is looked at.
    /// Descriptive fields are only refreshed when the contact is signed by
    /// the pinned key; a changed key leaves the record as it was.
    pub async fn record_contact(&self, contact: PeerContact) -> Result<ContactOutcome, FederationError> {
        let domain = normalize_domain(&contact.domain)?;
        check_protocol(&contact.protocol_version)?;
        let fingerprint = fingerprint_of(&contact.public_key)?;
        let capabilities = negotiate(&contact.capabilities);

        let instance = self
            .peers
            .upsert_instance(NewInstance { domain: domain.clone(), ..Default::default() })
            .await?;

        let local = self.trust.local_instance_id();
        let initial = self.trust.initial_status(instance.id).await?;
        let relationship = self.peers.ensure_relationship(local, instance.id, initial).await?;
        if relationship.status == PeerStatus::Blocked {
            warn!(peer = %domain, "Dropping handshake from blocked peer");
            return Err(FederationError::PeerNotFederatable(domain));
        }

        let check = self.auditor.check(&instance, &fingerprint, &contact.public_key).await?;
        let key_flagged = self.auditor.enforce(&domain, &check)?;
        self.peers.touch_relationship(local, instance.id).await?;

        let instance = match check {
            KeyCheck::Pinned | KeyCheck::Match => {
                if matches!(check, KeyCheck::Pinned) {
                    info!(peer = %domain, status = %relationship.status, "New federation peer");
                }
                self.peers
                    .upsert_instance(NewInstance {
                        domain: domain.clone(),
                        software_name: contact.software_name.clone(),
                        protocol_version: Some(contact.protocol_version.clone()),
                        capabilities: capabilities.clone(),
                    })
                    .await?
            }
            KeyCheck::Changed { .. } => self.peers.get_instance(instance.id).await?.unwrap_or(instance),
        };
        Ok(ContactOutcome { instance, relationship, capabilities, key_flagged })
    }

    /// Handshake with `domain` from our side and record the reply.
    pub async fn initiate(&self, client: &FederationClient, domain: &str) -> Result<ContactOutcome, FederationError> {
        let domain = normalize_domain(domain)?;
        let request = client.handshake_request(negotiate(&[]));
        let response: HandshakeResponse = client.handshake(&domain, &request).await?;

        if normalize_domain(&response.server_name)? != domain {
            return Err(FederationError::OriginMismatch { claimed: domain, actual: response.server_name });
        }

        self.record_contact(PeerContact {
            domain,
            public_key: response.public_key,
            software_name: None,
            protocol_version: response.protocol_version,
            capabilities: response.capabilities,
        })
        .await
    }

    /// Create the instance ahead of contact and attach an `allow` control,
    /// so its first handshake lands in `active`.
    pub async fn preauthorize(
        &self,
        domain: &str,
        admin: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<ControlOutcome, FederationError> {
        let domain = normalize_domain(domain)?;
        let instance = self
            .peers
            .upsert_instance(NewInstance { domain: domain.clone(), ..Default::default() })
            .await?;
        info!(peer = %domain, "Peer pre-authorised");
        self.trust.set_control(instance.id, ControlAction::Allow, reason, admin).await
    }

    // ── Views ────────────────────────────────────────────────────────────────

    pub async fn lookup(&self, domain: &str) -> Result<Option<PeerView>, FederationError> {
        let domain = normalize_domain(domain)?;
        match self.peers.find_instance(&domain).await? {
            Some(instance) => Ok(Some(self.view(instance).await?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, instance_id: Uuid) -> Result<PeerView, FederationError> {
        let instance = self
            .peers
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| FederationError::PeerNotFound(instance_id.to_string()))?;
        self.view(instance).await
    }

    /// Peers with a relationship to this server, newest first.
    pub async fn list(&self, status: Option<PeerStatus>) -> Result<Vec<PeerView>, FederationError> {
        let local = self.trust.local_instance_id();
        let relationships = self.peers.list_relationships(local, status).await?;
        let mut views = Vec::with_capacity(relationships.len());
        for rel in relationships {
            let Some(instance) = self.peers.get_instance(rel.remote_instance_id).await? else {
                continue;
            };
            let control = self.peers.get_control(local, instance.id).await?;
            views.push(PeerView { instance, relationship: Some(rel), control });
        }
        Ok(views)
    }

    async fn view(&self, instance: Instance) -> Result<PeerView, FederationError> {
        let local = self.trust.local_instance_id();
        let relationship = self.peers.get_relationship(local, instance.id).await?;
        let control = self.peers.get_control(local, instance.id).await?;
        Ok(PeerView { instance, relationship, control })
    }
}

/// Effective capability set: the default floor plus whatever was advertised.
pub fn negotiate(advertised: &[String]) -> Vec<String> {
    DEFAULT_CAPABILITIES
        .iter()
        .map(|c| (*c).to_owned())
        .chain(advertised.iter().map(|c| c.trim().to_owned()).filter(|c| !c.is_empty()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Peers must share our protocol major version.
pub fn check_protocol(version: &str) -> Result<(), FederationError> {
    fn major(v: &str) -> Option<u32> {
        v.trim().split('.').next()?.parse().ok()
    }
    match (major(version), major(PROTOCOL_VERSION)) {
        (Some(theirs), Some(ours)) if theirs == ours => Ok(()),
        _ => Err(FederationError::UnsupportedProtocol(version.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::models::KeyChangePolicy;
    use meridian_db::memory::MemoryStore;
    use meridian_db::KeyAuditStore;

    async fn setup() -> (Arc<MemoryStore>, PeerRegistry, Arc<TrustStateMachine>) {
        let store = Arc::new(MemoryStore::new());
        let local = PeerRegistry::register_local(store.as_ref(), "local.example", &ServerKeyPair::generate())
            .await
            .unwrap();
        let trust = Arc::new(TrustStateMachine::new(store.clone(), local.id));
        let auditor = Arc::new(KeyAuditor::new(store.clone(), store.clone(), KeyChangePolicy::Block));
        (store.clone(), PeerRegistry::new(store, trust.clone(), auditor), trust)
    }

    fn contact(domain: &str, kp: &ServerKeyPair) -> PeerContact {
        PeerContact {
            domain: domain.into(),
            public_key: kp.public_key_base64(),
            software_name: Some("meridian/test".into()),
            protocol_version: "1.2".into(),
            capabilities: vec!["threads".into(), "messages".into()],
        }
    }

    #[test]
    fn negotiation_is_floor_union_advertised() {
        let caps = negotiate(&["threads".into(), "typing".into()]);
        assert!(caps.contains(&"threads".to_owned()));
        assert_eq!(caps.len(), DEFAULT_CAPABILITIES.len() + 1);
    }

    #[test]
    fn protocol_major_must_match() {
        assert!(check_protocol("1.0").is_ok());
        assert!(check_protocol("1.7").is_ok());
        assert!(matches!(check_protocol("2.0"), Err(FederationError::UnsupportedProtocol(_))));
        assert!(check_protocol("garbage").is_err());
    }

    #[tokio::test]
    async fn first_contact_is_pending_with_pinned_key() {
        let (_store, registry, _trust) = setup().await;
        let kp = ServerKeyPair::generate();
        let out = registry.record_contact(contact("P1.Example", &kp)).await.unwrap();

        assert_eq!(out.instance.domain, "p1.example");
        assert_eq!(out.relationship.status, PeerStatus::Pending);
        assert_eq!(out.instance.public_key_fingerprint, Some(kp.fingerprint()));
        assert!(out.capabilities.contains(&"threads".to_owned()));
        assert!(!out.key_flagged);
    }

    #[tokio::test]
    async fn concurrent_first_contact_converges() {
        let (store, registry, trust) = setup().await;
        let registry = Arc::new(registry);
        let kp = Arc::new(ServerKeyPair::generate());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let kp = kp.clone();
            tasks.push(tokio::spawn(async move { registry.record_contact(contact("p1.example", &kp)).await }));
        }
        let mut ids = BTreeSet::new();
        for t in tasks {
            ids.insert(t.await.unwrap().unwrap().relationship.id);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list_relationships(trust.local_instance_id(), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preauthorized_peer_lands_active() {
        let (_store, registry, _trust) = setup().await;
        registry.preauthorize("p1.example", None, Some("partner".into())).await.unwrap();
        let out = registry.record_contact(contact("p1.example", &ServerKeyPair::generate())).await.unwrap();
        assert_eq!(out.relationship.status, PeerStatus::Active);
    }

    #[tokio::test]
    async fn blocked_peer_handshake_is_refused() {
        let (_store, registry, trust) = setup().await;
        let kp = ServerKeyPair::generate();
        let out = registry.record_contact(contact("p1.example", &kp)).await.unwrap();
        trust.reject(out.instance.id).await.unwrap();
        assert!(matches!(
            registry.record_contact(contact("p1.example", &kp)).await.unwrap_err(),
            FederationError::PeerNotFederatable(_)
        ));
    }

    #[tokio::test]
    async fn changed_key_on_handshake_is_held() {
        let (_store, registry, _trust) = setup().await;
        registry.record_contact(contact("p1.example", &ServerKeyPair::generate())).await.unwrap();
        let err = registry.record_contact(contact("p1.example", &ServerKeyPair::generate())).await.unwrap_err();
        assert!(matches!(err, FederationError::KeyChangePending(_)));
    }

    #[tokio::test]
    async fn rejected_key_change_leaves_peer_record_untouched() {
        let (store, registry, _trust) = setup().await;
        let real = ServerKeyPair::generate();
        let out = registry.record_contact(contact("p1.example", &real)).await.unwrap();

        let spoofed = PeerContact {
            software_name: Some("evil/1.0".into()),
            capabilities: vec!["evil".into()],
            ..contact("p1.example", &ServerKeyPair::generate())
        };
        assert!(matches!(
            registry.record_contact(spoofed).await.unwrap_err(),
            FederationError::KeyChangePending(_)
        ));

        let stored = store.get_instance(out.instance.id).await.unwrap().unwrap();
        assert_eq!(stored.software_name.as_deref(), Some("meridian/test"));
        assert!(stored.capabilities.contains(&"threads".to_owned()));
        assert!(!stored.capabilities.contains(&"evil".to_owned()));
        assert_eq!(stored.public_key_fingerprint, Some(real.fingerprint()));
    }

    #[tokio::test]
    async fn blocked_peer_handshake_touches_neither_key_nor_audit_log() {
        let (store, registry, trust) = setup().await;
        let kp = ServerKeyPair::generate();
        let out = registry.record_contact(contact("p1.example", &kp)).await.unwrap();
        trust.reject(out.instance.id).await.unwrap();

        let spoofed = PeerContact {
            software_name: Some("evil/1.0".into()),
            ..contact("p1.example", &ServerKeyPair::generate())
        };
        assert!(matches!(
            registry.record_contact(spoofed).await.unwrap_err(),
            FederationError::PeerNotFederatable(_)
        ));
        assert!(store.list_entries(Some(out.instance.id), false).await.unwrap().is_empty());
        let stored = store.get_instance(out.instance.id).await.unwrap().unwrap();
        assert_eq!(stored.software_name.as_deref(), Some("meridian/test"));

        // A pre-blocked domain that never made contact gets no key pinned.
        let blocked = registry.preauthorize("p2.example", None, None).await.unwrap();
        trust.set_control(blocked.control.remote_instance_id, ControlAction::Block, None, None).await.unwrap();
        assert!(registry.record_contact(contact("p2.example", &kp)).await.is_err());
        let p2 = store.find_instance("p2.example").await.unwrap().unwrap();
        assert!(p2.public_key_fingerprint.is_none());
    }

    #[tokio::test]
    async fn list_and_lookup_views() {
        let (_store, registry, _trust) = setup().await;
        registry.record_contact(contact("p1.example", &ServerKeyPair::generate())).await.unwrap();
        registry.record_contact(contact("p2.example", &ServerKeyPair::generate())).await.unwrap();

        assert_eq!(registry.list(None).await.unwrap().len(), 2);
        assert_eq!(registry.list(Some(PeerStatus::Active)).await.unwrap().len(), 0);
        let view = registry.lookup("p2.example").await.unwrap().unwrap();
        assert!(view.relationship.is_some());
        assert!(registry.lookup("nobody.example").await.unwrap().is_none());
    }
}
