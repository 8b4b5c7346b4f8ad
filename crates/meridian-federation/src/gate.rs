//! Inbound admission: signature verification, trust policy, key audit and
//! mute, in that order, for every federated request. Traffic the trust
//! policy drops never reaches the key auditor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use meridian_common::models::MessageKind;
use meridian_common::validation::normalize_domain;
use meridian_db::PeerStore;

use crate::error::FederationError;
use crate::key_audit::KeyAuditor;
use crate::keys::{fingerprint_of, key_id_of};
use crate::signatures::{verify_request, FedAuth};
use crate::trust::TrustStateMachine;
use crate::types::HandshakeRequest;

/// Looks up a remote server's public key by key id.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Base64url public key for `key_id` as published by `server_name`.
    async fn resolve_key(&self, server_name: &str, key_id: &str) -> Result<String, FederationError>;
}

/// A request whose signature checked out.
#[derive(Debug, Clone)]
pub struct VerifiedOrigin {
    pub origin: String,
    pub key_id: String,
    pub public_key: String,
    pub fingerprint: String,
}

/// Outcome of admitting a verified message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub instance_id: Uuid,
    /// `false` for muted peers: accept, but do not fan out notifications.
    pub notify: bool,
    /// Signed by a changed, unacknowledged key under the `flag` policy.
    pub key_flagged: bool,
}

pub struct InboundGate {
    server_name: String,
    peers: Arc<dyn PeerStore>,
    trust: Arc<TrustStateMachine>,
    auditor: Arc<KeyAuditor>,
    resolver: Arc<dyn KeyResolver>,
}

impl InboundGate {
    pub fn new(
        server_name: impl Into<String>,
        peers: Arc<dyn PeerStore>,
        trust: Arc<TrustStateMachine>,
        auditor: Arc<KeyAuditor>,
        resolver: Arc<dyn KeyResolver>,
    ) -> Self {
        Self { server_name: server_name.into(), peers, trust, auditor, resolver }
    }

    /// Verify the `Authorization` header of a signed request.
    ///
    /// The pinned key is used when the header names it; any other key id is
    /// fetched from the origin so the auditor gets to see the change.
    pub async fn authenticate(
        &self,
        header: Option<&str>,
        method: &str,
        uri: &str,
        body: Option<&Value>,
    ) -> Result<VerifiedOrigin, FederationError> {
        let auth = FedAuth::parse(header.ok_or(FederationError::MissingAuthHeader)?)?;
        let origin = normalize_domain(&auth.origin)?;

        let pinned = self
            .peers
            .find_instance(&origin)
            .await?
            .and_then(|i| i.public_key)
            .filter(|pk| key_id_of(pk).is_ok_and(|id| id == auth.key_id));

        let public_key = match pinned {
            Some(pk) => pk,
            None => {
                debug!(peer = %origin, key_id = %auth.key_id, "Resolving unpinned key");
                self.resolver.resolve_key(&origin, &auth.key_id).await?
            }
        };

        self.verify(&auth, origin, public_key, method, uri, body)
    }

    /// Verify a handshake, which is signed by the key it carries.
    pub fn authenticate_handshake(
        &self,
        header: Option<&str>,
        method: &str,
        uri: &str,
        body: &Value,
        request: &HandshakeRequest,
    ) -> Result<VerifiedOrigin, FederationError> {
        let auth = FedAuth::parse(header.ok_or(FederationError::MissingAuthHeader)?)?;
        let origin = normalize_domain(&auth.origin)?;
        let claimed = normalize_domain(&request.server_name)?;
        if origin != claimed {
            return Err(FederationError::OriginMismatch { claimed, actual: origin });
        }
        if key_id_of(&request.public_key)? != auth.key_id {
            return Err(FederationError::InvalidSignature);
        }
        self.verify(&auth, origin, request.public_key.clone(), method, uri, Some(body))
    }

    fn verify(
        &self,
        auth: &FedAuth,
        origin: String,
        public_key: String,
        method: &str,
        uri: &str,
        body: Option<&Value>,
    ) -> Result<VerifiedOrigin, FederationError> {
        verify_request(auth, &self.server_name, method, uri, body, &public_key).inspect_err(|_| {
            warn!(peer = %origin, key_id = %auth.key_id, %uri, "Rejected federation request with bad signature");
        })?;
        Ok(VerifiedOrigin {
            fingerprint: fingerprint_of(&public_key)?,
            origin,
            key_id: auth.key_id.clone(),
            public_key,
        })
    }

    /// Decide whether a verified message of `kind` is accepted.
    pub async fn admit(&self, verified: &VerifiedOrigin, kind: MessageKind) -> Result<Admission, FederationError> {
        let instance = self
            .peers
            .find_instance(&verified.origin)
            .await?
            .ok_or_else(|| {
                warn!(peer = %verified.origin, "Dropping message from unknown peer");
                FederationError::PeerNotFound(verified.origin.clone())
            })?;

        if let Err(e) = self.trust.check(instance.id, kind).await {
            warn!(peer = %instance.domain, ?kind, "Dropping message from non-federatable peer");
            return Err(e);
        }

        let check = self.auditor.check(&instance, &verified.fingerprint, &verified.public_key).await?;
        let key_flagged = self.auditor.enforce(&instance.domain, &check)?;
        self.peers.touch_relationship(self.trust.local_instance_id(), instance.id).await?;

        let notify = !self.trust.is_muted(instance.id).await?;
        Ok(Admission { instance_id: instance.id, notify, key_flagged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ServerKeyPair;
    use crate::signatures::sign_request;
    use meridian_common::models::{ControlAction, KeyChangePolicy, NewInstance, PeerStatus};
    use meridian_db::memory::MemoryStore;
    use meridian_db::KeyAuditStore;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// Serves keys registered up front.
    #[derive(Default)]
    struct StaticKeys(RwLock<HashMap<(String, String), String>>);

    #[async_trait]
    impl KeyResolver for StaticKeys {
        async fn resolve_key(&self, server_name: &str, key_id: &str) -> Result<String, FederationError> {
            self.0
                .read()
                .await
                .get(&(server_name.to_owned(), key_id.to_owned()))
                .cloned()
                .ok_or_else(|| FederationError::KeyNotFound(key_id.to_owned()))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        trust: Arc<TrustStateMachine>,
        keys: Arc<StaticKeys>,
        gate: InboundGate,
    }

    async fn fixture(policy: KeyChangePolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let local = store.upsert_instance(NewInstance { domain: "local.example".into(), ..Default::default() }).await.unwrap();
        let trust = Arc::new(TrustStateMachine::new(store.clone(), local.id));
        let auditor = Arc::new(KeyAuditor::new(store.clone(), store.clone(), policy));
        let keys = Arc::new(StaticKeys::default());
        let gate = InboundGate::new("local.example", store.clone(), trust.clone(), auditor, keys.clone());
        Fixture { store, trust, keys, gate }
    }

    async fn publish(keys: &StaticKeys, origin: &str, kp: &ServerKeyPair) {
        keys.0.write().await.insert((origin.to_owned(), kp.key_id.clone()), kp.public_key_base64());
    }

    async fn known_peer(f: &Fixture, domain: &str, status: PeerStatus) -> Uuid {
        let p = f.store.upsert_instance(NewInstance { domain: domain.into(), ..Default::default() }).await.unwrap();
        f.store.ensure_relationship(f.trust.local_instance_id(), p.id, status).await.unwrap();
        p.id
    }

    #[tokio::test]
    async fn signed_request_is_verified_and_admitted() {
        let f = fixture(KeyChangePolicy::Block).await;
        let kp = ServerKeyPair::generate();
        publish(&f.keys, "p1.example", &kp).await;
        known_peer(&f, "p1.example", PeerStatus::Active).await;

        let body = json!({ "messages": [] });
        let auth = sign_request(&kp, "p1.example", "local.example", "PUT", "/x", Some(&body));
        let verified = f.gate.authenticate(Some(auth.to_header().as_str()), "PUT", "/x", Some(&body)).await.unwrap();
        assert_eq!(verified.fingerprint, kp.fingerprint());

        let admission = f.gate.admit(&verified, MessageKind::UserContent).await.unwrap();
        assert!(admission.notify);
        assert!(!admission.key_flagged);
    }

    #[tokio::test]
    async fn bad_signature_and_missing_header_are_rejected() {
        let f = fixture(KeyChangePolicy::Block).await;
        let kp = ServerKeyPair::generate();
        publish(&f.keys, "p1.example", &kp).await;

        let auth = sign_request(&kp, "p1.example", "other.example", "PUT", "/x", None);
        assert!(matches!(
            f.gate.authenticate(Some(auth.to_header().as_str()), "PUT", "/x", None).await.unwrap_err(),
            FederationError::InvalidSignature
        ));
        assert!(matches!(
            f.gate.authenticate(None, "PUT", "/x", None).await.unwrap_err(),
            FederationError::MissingAuthHeader
        ));
    }

    #[tokio::test]
    async fn pending_and_unknown_peers_get_no_user_content() {
        let f = fixture(KeyChangePolicy::Block).await;
        let kp = ServerKeyPair::generate();
        let verified = VerifiedOrigin {
            origin: "p1.example".into(),
            key_id: kp.key_id.clone(),
            public_key: kp.public_key_base64(),
            fingerprint: kp.fingerprint(),
        };
        assert!(matches!(
            f.gate.admit(&verified, MessageKind::UserContent).await.unwrap_err(),
            FederationError::PeerNotFound(_)
        ));

        known_peer(&f, "p1.example", PeerStatus::Pending).await;
        assert!(f.gate.admit(&verified, MessageKind::Capabilities).await.is_ok());
        assert!(matches!(
            f.gate.admit(&verified, MessageKind::UserContent).await.unwrap_err(),
            FederationError::PeerNotFederatable(_)
        ));
    }

    #[tokio::test]
    async fn muted_peer_is_admitted_without_notification() {
        let f = fixture(KeyChangePolicy::Block).await;
        let kp = ServerKeyPair::generate();
        let id = known_peer(&f, "p1.example", PeerStatus::Active).await;
        f.trust.set_control(id, ControlAction::Mute, None, None).await.unwrap();

        let verified = VerifiedOrigin {
            origin: "p1.example".into(),
            key_id: kp.key_id.clone(),
            public_key: kp.public_key_base64(),
            fingerprint: kp.fingerprint(),
        };
        let admission = f.gate.admit(&verified, MessageKind::UserContent).await.unwrap();
        assert!(!admission.notify);
    }

    #[tokio::test]
    async fn changed_key_is_flagged_under_flag_policy() {
        let f = fixture(KeyChangePolicy::Flag).await;
        known_peer(&f, "p1.example", PeerStatus::Active).await;

        for (kp, flagged) in [(ServerKeyPair::generate(), false), (ServerKeyPair::generate(), true)] {
            let verified = VerifiedOrigin {
                origin: "p1.example".into(),
                key_id: kp.key_id.clone(),
                public_key: kp.public_key_base64(),
                fingerprint: kp.fingerprint(),
            };
            let admission = f.gate.admit(&verified, MessageKind::UserContent).await.unwrap();
            assert_eq!(admission.key_flagged, flagged);
        }
    }

    #[tokio::test]
    async fn dropped_traffic_is_not_audited() {
        let f = fixture(KeyChangePolicy::Block).await;
        let pinned = ServerKeyPair::generate();
        let id = known_peer(&f, "p1.example", PeerStatus::Active).await;
        f.store.pin_key_if_unset(id, &pinned.fingerprint(), &pinned.public_key_base64()).await.unwrap();
        f.trust.set_control(id, ControlAction::Block, None, None).await.unwrap();

        let kp = ServerKeyPair::generate();
        let verified = VerifiedOrigin {
            origin: "p1.example".into(),
            key_id: kp.key_id.clone(),
            public_key: kp.public_key_base64(),
            fingerprint: kp.fingerprint(),
        };
        assert!(matches!(
            f.gate.admit(&verified, MessageKind::UserContent).await.unwrap_err(),
            FederationError::PeerNotFederatable(_)
        ));
        assert!(f.store.list_entries(Some(id), false).await.unwrap().is_empty());

        // Pre-authorised but never contacted: nothing gets pinned either.
        let fresh = f.store.upsert_instance(NewInstance { domain: "p2.example".into(), ..Default::default() }).await.unwrap();
        f.trust.set_control(fresh.id, ControlAction::Allow, None, None).await.unwrap();
        let verified = VerifiedOrigin { origin: "p2.example".into(), ..verified };
        assert!(f.gate.admit(&verified, MessageKind::UserContent).await.is_err());
        let p2 = f.store.get_instance(fresh.id).await.unwrap().unwrap();
        assert!(p2.public_key_fingerprint.is_none());
    }

    #[tokio::test]
    async fn handshake_must_be_signed_by_carried_key() {
        let f = fixture(KeyChangePolicy::Block).await;
        let kp = ServerKeyPair::generate();
        let req = HandshakeRequest {
            server_name: "p1.example".into(),
            public_key: kp.public_key_base64(),
            software_name: None,
            protocol_version: "1.0".into(),
            capabilities: vec![],
        };
        let body = serde_json::to_value(&req).unwrap();
        let auth = sign_request(&kp, "p1.example", "local.example", "POST", "/h", Some(&body));
        f.gate.authenticate_handshake(Some(auth.to_header().as_str()), "POST", "/h", &body, &req).unwrap();

        let imposter = ServerKeyPair::generate();
        let auth = sign_request(&imposter, "p1.example", "local.example", "POST", "/h", Some(&body));
        assert!(f.gate.authenticate_handshake(Some(auth.to_header().as_str()), "POST", "/h", &body, &req).is_err());
    }
}
