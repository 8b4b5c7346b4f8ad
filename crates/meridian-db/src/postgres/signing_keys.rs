//! This server's signing keys.
//!
//! Seeds are stored raw. Restrict access to the table to the server role.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::PgStore;
use crate::store::{SigningKeyStore, StoreResult, StoredSigningKey};

#[async_trait]
impl SigningKeyStore for PgStore {
    async fn active_signing_key(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<StoredSigningKey>> {
        let row = sqlx::query(
            r#"
            SELECT key_id, seed_bytes, expires_at FROM federation_signing_keys
            WHERE is_active AND expires_at > $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredSigningKey {
            key_id: row.try_get("key_id")?,
            seed: row.try_get("seed_bytes")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    async fn insert_signing_key(
        &self,
        key: &StoredSigningKey,
        public_key_b64: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO federation_signing_keys (key_id, seed_bytes, public_key_b64, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key_id) DO NOTHING
            "#,
        )
        .bind(&key.key_id)
        .bind(&key.seed)
        .bind(public_key_b64)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
