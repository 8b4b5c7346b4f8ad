//! Key change audit log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meridian_common::models::{KeyAuditEntry, NewKeyAuditEntry};
use meridian_common::ids::generate_id;

use super::PgStore;
use crate::store::{KeyAuditStore, StoreError, StoreResult};

fn entry_from_row(row: &PgRow) -> Result<KeyAuditEntry, sqlx::Error> {
    Ok(KeyAuditEntry {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        old_fingerprint: row.try_get("old_fingerprint")?,
        new_fingerprint: row.try_get("new_fingerprint")?,
        new_public_key: row.try_get("new_public_key")?,
        detected_at: row.try_get("detected_at")?,
        acknowledged_by: row.try_get("acknowledged_by")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
    })
}

#[async_trait]
impl KeyAuditStore for PgStore {
    async fn open_entry(&self, new: NewKeyAuditEntry) -> StoreResult<(KeyAuditEntry, bool)> {
        // Relies on the partial unique index over open entries.
        let inserted = sqlx::query(
            r#"
            INSERT INTO federation_key_audit
                (id, instance_id, old_fingerprint, new_fingerprint, new_public_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_id, new_fingerprint) WHERE acknowledged_at IS NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(generate_id())
        .bind(new.instance_id)
        .bind(&new.old_fingerprint)
        .bind(&new.new_fingerprint)
        .bind(&new.new_public_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((entry_from_row(&row)?, true));
        }

        let row = sqlx::query(
            r#"
            SELECT * FROM federation_key_audit
            WHERE instance_id = $1 AND new_fingerprint = $2 AND acknowledged_at IS NULL
            "#,
        )
        .bind(new.instance_id)
        .bind(&new.new_fingerprint)
        .fetch_optional(&self.pool)
        .await?
        // Acknowledged between our insert and select; the caller may retry.
        .ok_or(StoreError::NotFound("Key audit entry"))?;
        Ok((entry_from_row(&row)?, false))
    }

    async fn get_entry(&self, id: Uuid) -> StoreResult<Option<KeyAuditEntry>> {
        let row = sqlx::query("SELECT * FROM federation_key_audit WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(entry_from_row).transpose()?)
    }

    async fn acknowledge_entry(
        &self,
        id: Uuid,
        by: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<KeyAuditEntry>> {
        let row = sqlx::query(
            r#"
            UPDATE federation_key_audit
            SET acknowledged_by = $2, acknowledged_at = $3
            WHERE id = $1 AND acknowledged_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(by)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(entry_from_row).transpose()?)
    }

    async fn list_entries(
        &self,
        instance_id: Option<Uuid>,
        open_only: bool,
    ) -> StoreResult<Vec<KeyAuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM federation_key_audit
            WHERE ($1::uuid IS NULL OR instance_id = $1)
              AND (NOT $2 OR acknowledged_at IS NULL)
            ORDER BY detected_at DESC, id DESC
            "#,
        )
        .bind(instance_id)
        .bind(open_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect::<Result<_, _>>()?)
    }
}
