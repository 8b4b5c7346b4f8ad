//! Store-backed server signing key management.
//!
//! On startup, [`KeyManager::load_or_generate`] asks the signing key store for
//! the newest active, unexpired key. If there is none (first run, or every key
//! expired) it generates a fresh Ed25519 pair, persists it and returns it.
//!
//! # Key rotation
//! Keys are valid for [`KEY_TTL_DAYS`]. To rotate, deactivate the old row and
//! restart; the manager generates a new one.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use meridian_db::{SigningKeyStore, StoredSigningKey};

use crate::{
    error::FederationError,
    keys::{ServerKeyPair, KEY_TTL_DAYS},
};

pub struct KeyManager {
    store: Arc<dyn SigningKeyStore>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn SigningKeyStore>) -> Self {
        Self { store }
    }

    /// Return the active signing key, provisioning one if necessary.
    ///
    /// A configured hex seed takes precedence over the store; it is how a
    /// server without a database keeps a stable identity across restarts.
    pub async fn load_or_generate(
        &self,
        configured_seed: Option<&str>,
    ) -> Result<Arc<ServerKeyPair>, FederationError> {
        if let Some(seed) = configured_seed {
            let kp = ServerKeyPair::from_hex_seed(seed)?;
            info!(key_id = %kp.key_id, "Federation: using configured signing key");
            return Ok(Arc::new(kp));
        }

        let now = Utc::now();
        if let Some(stored) = self.store.active_signing_key(now).await? {
            let kp = ServerKeyPair::from_seed(&stored.seed)?;
            info!(key_id = %stored.key_id, expires_at = %stored.expires_at, "Federation: loaded active signing key");
            return Ok(Arc::new(kp));
        }

        warn!("No active federation signing key, generating a new Ed25519 key pair");
        let kp = ServerKeyPair::generate();
        let stored = StoredSigningKey {
            key_id: kp.key_id.clone(),
            seed: kp.seed_bytes().to_vec(),
            expires_at: now + Duration::days(KEY_TTL_DAYS),
        };
        self.store.insert_signing_key(&stored, &kp.public_key_base64()).await?;

        info!(key_id = %kp.key_id, "Federation: generated and persisted new signing key");
        Ok(Arc::new(kp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_db::memory::MemoryStore;

    #[tokio::test]
    async fn generated_key_is_reused() {
        let manager = KeyManager::new(Arc::new(MemoryStore::new()));
        let first = manager.load_or_generate(None).await.unwrap();
        let second = manager.load_or_generate(None).await.unwrap();
        assert_eq!(first.key_id, second.key_id);
    }

    #[tokio::test]
    async fn configured_seed_wins() {
        let seed = hex::encode([7u8; 32]);
        let manager = KeyManager::new(Arc::new(MemoryStore::new()));
        let kp = manager.load_or_generate(Some(&seed)).await.unwrap();
        assert_eq!(kp.seed_bytes(), [7u8; 32]);
    }
}
