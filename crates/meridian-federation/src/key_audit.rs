//! Key-change auditor.
//!
//! Trust on first use: the first verified message from an instance pins its
//! signing key fingerprint. Any later message signed by a different key opens
//! one audit entry per `(instance, new fingerprint)` and leaves the pin where
//! it was. Only an administrator acknowledgement moves the pin.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use meridian_common::models::{Instance, KeyAuditEntry, KeyChangePolicy, NewKeyAuditEntry};
use meridian_db::{KeyAuditStore, PeerStore};

use crate::error::FederationError;

/// What the auditor concluded about an observed key.
#[derive(Debug, Clone)]
pub enum KeyCheck {
    /// First contact; the key is now pinned.
    Pinned,
    Match,
    /// The observed key differs from the pin. `created` is false when an
    /// open entry for this fingerprint already existed.
    Changed { entry: KeyAuditEntry, created: bool },
}

pub struct KeyAuditor {
    peers: Arc<dyn PeerStore>,
    audits: Arc<dyn KeyAuditStore>,
    policy: KeyChangePolicy,
}

impl KeyAuditor {
    pub fn new(peers: Arc<dyn PeerStore>, audits: Arc<dyn KeyAuditStore>, policy: KeyChangePolicy) -> Self {
        Self { peers, audits, policy }
    }

    pub fn policy(&self) -> KeyChangePolicy {
        self.policy
    }

    /// Compare an observed, already verified key against the pin.
    pub async fn check(
        &self,
        instance: &Instance,
        fingerprint: &str,
        public_key: &str,
    ) -> Result<KeyCheck, FederationError> {
        let pinned = match &instance.public_key_fingerprint {
            Some(pinned) => pinned.clone(),
            None => {
                if self.peers.pin_key_if_unset(instance.id, fingerprint, public_key).await? {
                    info!(peer = %instance.domain, %fingerprint, "Pinned peer signing key");
                    return Ok(KeyCheck::Pinned);
                }
                // Someone else pinned first; compare against what they pinned.
                self.peers
                    .get_instance(instance.id)
                    .await?
                    .and_then(|i| i.public_key_fingerprint)
                    .ok_or_else(|| FederationError::PeerNotFound(instance.domain.clone()))?
            }
        };

        if pinned == fingerprint {
            return Ok(KeyCheck::Match);
        }

        let (entry, created) = self
            .audits
            .open_entry(NewKeyAuditEntry {
                instance_id: instance.id,
                old_fingerprint: pinned,
                new_fingerprint: fingerprint.to_owned(),
                new_public_key: Some(public_key.to_owned()),
            })
            .await?;

        if created {
            warn!(
                peer = %instance.domain,
                audit = %entry.id,
                old = %entry.old_fingerprint,
                new = %entry.new_fingerprint,
                "Peer signing key changed; audit entry opened"
            );
        }
        Ok(KeyCheck::Changed { entry, created })
    }

    /// Apply the configured policy. Returns whether admitted traffic must be
    /// flagged.
    pub fn enforce(&self, domain: &str, check: &KeyCheck) -> Result<bool, FederationError> {
        match (check, self.policy) {
            (KeyCheck::Changed { .. }, KeyChangePolicy::Block) => {
                warn!(peer = %domain, "Refusing traffic signed by an unacknowledged key");
                Err(FederationError::KeyChangePending(domain.to_owned()))
            }
            (KeyCheck::Changed { .. }, KeyChangePolicy::Flag) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Trust the new key. A second acknowledgement fails with
    /// `AlreadyAcknowledged`.
    pub async fn acknowledge(&self, entry_id: Uuid, admin: Uuid) -> Result<KeyAuditEntry, FederationError> {
        let entry = self.get(entry_id).await?;
        if !entry.is_open() {
            return Err(FederationError::AlreadyAcknowledged(entry_id));
        }

        let acked = self
            .audits
            .acknowledge_entry(entry_id, admin, Utc::now())
            .await?
            .ok_or(FederationError::AlreadyAcknowledged(entry_id))?;

        self.peers
            .replace_pinned_key(acked.instance_id, &acked.new_fingerprint, acked.new_public_key.as_deref())
            .await?;

        warn!(
            audit = %acked.id,
            instance = %acked.instance_id,
            %admin,
            new = %acked.new_fingerprint,
            "Key change acknowledged; new fingerprint pinned"
        );
        Ok(acked)
    }

    pub async fn get(&self, entry_id: Uuid) -> Result<KeyAuditEntry, FederationError> {
        self.audits
            .get_entry(entry_id)
            .await?
            .ok_or(FederationError::AuditEntryNotFound(entry_id))
    }

    pub async fn list(&self, instance_id: Option<Uuid>, open_only: bool) -> Result<Vec<KeyAuditEntry>, FederationError> {
        Ok(self.audits.list_entries(instance_id, open_only).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::models::NewInstance;
    use meridian_db::memory::MemoryStore;

    async fn setup(policy: KeyChangePolicy) -> (Arc<MemoryStore>, KeyAuditor, Instance) {
        let store = Arc::new(MemoryStore::new());
        let p2 = store.upsert_instance(NewInstance { domain: "p2.example".into(), ..Default::default() }).await.unwrap();
        let auditor = KeyAuditor::new(store.clone(), store.clone(), policy);
        (store, auditor, p2)
    }

    async fn reload(store: &MemoryStore, id: Uuid) -> Instance {
        store.get_instance(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn first_key_is_pinned_then_matches() {
        let (store, auditor, p2) = setup(KeyChangePolicy::Block).await;
        assert!(matches!(auditor.check(&p2, "SHA256:aa", "ka").await.unwrap(), KeyCheck::Pinned));
        let p2 = reload(&store, p2.id).await;
        assert!(matches!(auditor.check(&p2, "SHA256:aa", "ka").await.unwrap(), KeyCheck::Match));
    }

    #[tokio::test]
    async fn repeated_mismatch_opens_one_entry() {
        let (store, auditor, p2) = setup(KeyChangePolicy::Block).await;
        auditor.check(&p2, "SHA256:aa", "ka").await.unwrap();
        let p2 = reload(&store, p2.id).await;

        let KeyCheck::Changed { entry, created } = auditor.check(&p2, "SHA256:bb", "kb").await.unwrap() else {
            panic!("expected a key change");
        };
        assert!(created);
        let KeyCheck::Changed { entry: again, created } = auditor.check(&p2, "SHA256:bb", "kb").await.unwrap() else {
            panic!("expected a key change");
        };
        assert!(!created);
        assert_eq!(entry.id, again.id);
        assert_eq!(auditor.list(Some(p2.id), true).await.unwrap().len(), 1);
        assert_eq!(reload(&store, p2.id).await.public_key_fingerprint.as_deref(), Some("SHA256:aa"));
    }

    #[tokio::test]
    async fn acknowledgement_moves_the_pin_once() {
        let (store, auditor, p2) = setup(KeyChangePolicy::Block).await;
        auditor.check(&p2, "SHA256:aa", "ka").await.unwrap();
        let p2 = reload(&store, p2.id).await;
        let KeyCheck::Changed { entry, .. } = auditor.check(&p2, "SHA256:bb", "kb").await.unwrap() else {
            panic!("expected a key change");
        };

        let admin = Uuid::now_v7();
        let acked = auditor.acknowledge(entry.id, admin).await.unwrap();
        assert_eq!(acked.acknowledged_by, Some(admin));
        let p2 = reload(&store, p2.id).await;
        assert_eq!(p2.public_key_fingerprint.as_deref(), Some("SHA256:bb"));
        assert_eq!(p2.public_key.as_deref(), Some("kb"));

        assert!(matches!(
            auditor.acknowledge(entry.id, admin).await.unwrap_err(),
            FederationError::AlreadyAcknowledged(_)
        ));
        assert!(matches!(auditor.check(&p2, "SHA256:bb", "kb").await.unwrap(), KeyCheck::Match));
    }

    #[tokio::test]
    async fn policy_blocks_or_flags() {
        let (store, blocking, p2) = setup(KeyChangePolicy::Block).await;
        blocking.check(&p2, "SHA256:aa", "ka").await.unwrap();
        let p2 = reload(&store, p2.id).await;
        let changed = blocking.check(&p2, "SHA256:bb", "kb").await.unwrap();
        assert!(matches!(blocking.enforce("p2.example", &changed), Err(FederationError::KeyChangePending(_))));

        let flagging = KeyAuditor::new(store.clone(), store.clone(), KeyChangePolicy::Flag);
        assert!(flagging.enforce("p2.example", &changed).unwrap());
        assert!(!flagging.enforce("p2.example", &KeyCheck::Match).unwrap());
    }

    #[tokio::test]
    async fn unknown_entry_is_not_found() {
        let (_store, auditor, _p2) = setup(KeyChangePolicy::Block).await;
        assert!(matches!(
            auditor.acknowledge(Uuid::now_v7(), Uuid::now_v7()).await.unwrap_err(),
            FederationError::AuditEntryNotFound(_)
        ));
    }
}
