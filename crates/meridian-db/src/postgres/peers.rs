//! Instances, peer relationships, peer controls and the inbound txn log.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meridian_common::models::{
    ControlAction, Instance, NewInstance, PeerControl, PeerRelationship, PeerStatus,
};
use meridian_common::ids::generate_id;

use super::{text_column, PgStore};
use crate::store::{PeerStore, StoreError, StoreResult};

fn instance_from_row(row: &PgRow) -> Result<Instance, sqlx::Error> {
    Ok(Instance {
        id: row.try_get("id")?,
        domain: row.try_get("domain")?,
        public_key_fingerprint: row.try_get("public_key_fingerprint")?,
        public_key: row.try_get("public_key")?,
        software_name: row.try_get("software_name")?,
        protocol_version: row.try_get("protocol_version")?,
        capabilities: row.try_get("capabilities")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn relationship_from_row(row: &PgRow) -> Result<PeerRelationship, sqlx::Error> {
    Ok(PeerRelationship {
        id: row.try_get("id")?,
        local_instance_id: row.try_get("local_instance_id")?,
        remote_instance_id: row.try_get("remote_instance_id")?,
        status: text_column(row, "status")?,
        established_at: row.try_get("established_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
        handshake_completed_at: row.try_get("handshake_completed_at")?,
    })
}

fn control_from_row(row: &PgRow) -> Result<PeerControl, sqlx::Error> {
    Ok(PeerControl {
        id: row.try_get("id")?,
        local_instance_id: row.try_get("local_instance_id")?,
        remote_instance_id: row.try_get("remote_instance_id")?,
        action: text_column(row, "action")?,
        reason: row.try_get("reason")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PeerStore for PgStore {
    async fn upsert_instance(&self, new: NewInstance) -> StoreResult<Instance> {
        let row = sqlx::query(
            r#"
            INSERT INTO federation_instances
                (id, domain, software_name, protocol_version, capabilities)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (domain) DO UPDATE SET
                software_name    = COALESCE(EXCLUDED.software_name, federation_instances.software_name),
                protocol_version = COALESCE(EXCLUDED.protocol_version, federation_instances.protocol_version),
                capabilities     = CASE WHEN cardinality(EXCLUDED.capabilities) > 0
                                        THEN EXCLUDED.capabilities
                                        ELSE federation_instances.capabilities END,
                updated_at       = NOW()
            RETURNING *
            "#,
        )
        .bind(generate_id())
        .bind(&new.domain)
        .bind(&new.software_name)
        .bind(&new.protocol_version)
        .bind(&new.capabilities)
        .fetch_one(&self.pool)
        .await?;
        Ok(instance_from_row(&row)?)
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM federation_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(instance_from_row).transpose()?)
    }

    async fn find_instance(&self, domain: &str) -> StoreResult<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM federation_instances WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(instance_from_row).transpose()?)
    }

    async fn list_instances(&self) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM federation_instances ORDER BY domain ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(instance_from_row).collect::<Result<_, _>>()?)
    }

    async fn pin_key_if_unset(
        &self,
        instance_id: Uuid,
        fingerprint: &str,
        public_key: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE federation_instances
            SET public_key_fingerprint = $2, public_key = $3, updated_at = NOW()
            WHERE id = $1 AND public_key_fingerprint IS NULL
            "#,
        )
        .bind(instance_id)
        .bind(fingerprint)
        .bind(public_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_instance(instance_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound("Instance")),
        }
    }

    async fn replace_pinned_key(
        &self,
        instance_id: Uuid,
        fingerprint: &str,
        public_key: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE federation_instances
            SET public_key_fingerprint = $2, public_key = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(fingerprint)
        .bind(public_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("Instance"));
        }
        Ok(())
    }

    async fn ensure_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
        initial: PeerStatus,
    ) -> StoreResult<PeerRelationship> {
        sqlx::query(
            r#"
            INSERT INTO federation_peers (id, local_instance_id, remote_instance_id, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (local_instance_id, remote_instance_id) DO NOTHING
            "#,
        )
        .bind(generate_id())
        .bind(local)
        .bind(remote)
        .bind(initial.as_str())
        .execute(&self.pool)
        .await?;

        self.get_relationship(local, remote)
            .await?
            .ok_or(StoreError::NotFound("Peer relationship"))
    }

    async fn get_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
    ) -> StoreResult<Option<PeerRelationship>> {
        let row = sqlx::query(
            "SELECT * FROM federation_peers WHERE local_instance_id = $1 AND remote_instance_id = $2",
        )
        .bind(local)
        .bind(remote)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(relationship_from_row).transpose()?)
    }

    async fn list_relationships(
        &self,
        local: Uuid,
        status: Option<PeerStatus>,
    ) -> StoreResult<Vec<PeerRelationship>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM federation_peers
            WHERE local_instance_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY established_at DESC, id DESC
            "#,
        )
        .bind(local)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(relationship_from_row).collect::<Result<_, _>>()?)
    }

    async fn transition_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
        expected: Option<PeerStatus>,
        to: PeerStatus,
        complete_handshake: bool,
    ) -> StoreResult<Option<PeerRelationship>> {
        let row = sqlx::query(
            r#"
            UPDATE federation_peers
            SET status = $4,
                handshake_completed_at = CASE WHEN $5
                    THEN COALESCE(handshake_completed_at, NOW())
                    ELSE handshake_completed_at END
            WHERE local_instance_id = $1
              AND remote_instance_id = $2
              AND ($3::text IS NULL OR status = $3)
            RETURNING *
            "#,
        )
        .bind(local)
        .bind(remote)
        .bind(expected.map(|s| s.as_str()))
        .bind(to.as_str())
        .bind(complete_handshake)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(relationship_from_row).transpose()?)
    }

    async fn touch_relationship(&self, local: Uuid, remote: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE federation_peers SET last_synced_at = NOW()
            WHERE local_instance_id = $1 AND remote_instance_id = $2
            "#,
        )
        .bind(local)
        .bind(remote)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_control(
        &self,
        local: Uuid,
        remote: Uuid,
        action: ControlAction,
        reason: Option<String>,
        created_by: Option<Uuid>,
    ) -> StoreResult<PeerControl> {
        let row = sqlx::query(
            r#"
            INSERT INTO federation_peer_controls
                (id, local_instance_id, remote_instance_id, action, reason, created_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (local_instance_id, remote_instance_id) DO UPDATE SET
                action = EXCLUDED.action,
                reason = EXCLUDED.reason,
                created_by = EXCLUDED.created_by,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(generate_id())
        .bind(local)
        .bind(remote)
        .bind(action.as_str())
        .bind(reason)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(control_from_row(&row)?)
    }

    async fn get_control(&self, local: Uuid, remote: Uuid) -> StoreResult<Option<PeerControl>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM federation_peer_controls
            WHERE local_instance_id = $1 AND remote_instance_id = $2
            "#,
        )
        .bind(local)
        .bind(remote)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(control_from_row).transpose()?)
    }

    async fn delete_control(&self, local: Uuid, remote: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM federation_peer_controls WHERE local_instance_id = $1 AND remote_instance_id = $2",
        )
        .bind(local)
        .bind(remote)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_inbound_transaction(&self, origin: &str, txn_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO federation_txn_log (txn_id, origin_server)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(txn_id)
        .bind(origin)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
