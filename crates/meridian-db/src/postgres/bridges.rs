//! Bridge connections, channel mappings and virtual users.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meridian_common::models::{
    BridgeConnection, BridgeStatus, ChannelMapping, MappingDirection, NewBridgeConnection,
    NewVirtualUser, VirtualUser,
};
use meridian_common::ids::generate_id;

use super::{conflict_or, text_column, PgStore};
use crate::store::{BridgeStore, RelayDirection, StoreResult};

fn connection_from_row(row: &PgRow) -> Result<BridgeConnection, sqlx::Error> {
    Ok(BridgeConnection {
        id: row.try_get("id")?,
        guild_id: row.try_get("guild_id")?,
        bridge_type: text_column(row, "bridge_type")?,
        remote_id: row.try_get("remote_id")?,
        display_name: row.try_get("display_name")?,
        status: text_column(row, "status")?,
        config: row.try_get("config")?,
        last_error: row.try_get("last_error")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn mapping_from_row(row: &PgRow) -> Result<ChannelMapping, sqlx::Error> {
    Ok(ChannelMapping {
        id: row.try_get("id")?,
        bridge_id: row.try_get("bridge_id")?,
        local_channel_id: row.try_get("local_channel_id")?,
        remote_channel_id: row.try_get("remote_channel_id")?,
        direction: text_column(row, "direction")?,
        inbound_count: row.try_get("inbound_count")?,
        outbound_count: row.try_get("outbound_count")?,
        created_at: row.try_get("created_at")?,
    })
}

fn virtual_user_from_row(row: &PgRow) -> Result<VirtualUser, sqlx::Error> {
    Ok(VirtualUser {
        id: row.try_get("id")?,
        bridge_id: row.try_get("bridge_id")?,
        remote_user_id: row.try_get("remote_user_id")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl BridgeStore for PgStore {
    async fn create_connection(&self, new: NewBridgeConnection) -> StoreResult<BridgeConnection> {
        let row = sqlx::query(
            r#"
            INSERT INTO bridge_connections
                (id, guild_id, bridge_type, remote_id, display_name, config, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(generate_id())
        .bind(new.guild_id)
        .bind(new.bridge_type.as_str())
        .bind(&new.remote_id)
        .bind(&new.display_name)
        .bind(&new.config)
        .bind(new.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_or(e, "Bridge connection"))?;
        Ok(connection_from_row(&row)?)
    }

    async fn get_connection(&self, id: Uuid) -> StoreResult<Option<BridgeConnection>> {
        let row = sqlx::query("SELECT * FROM bridge_connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(connection_from_row).transpose()?)
    }

    async fn list_connections(&self, guild_id: Uuid) -> StoreResult<Vec<BridgeConnection>> {
        let rows = sqlx::query(
            "SELECT * FROM bridge_connections WHERE guild_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(connection_from_row).collect::<Result<_, _>>()?)
    }

    async fn connections_with_status(&self, status: BridgeStatus) -> StoreResult<Vec<BridgeConnection>> {
        let rows = sqlx::query(
            "SELECT * FROM bridge_connections WHERE status = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(connection_from_row).collect::<Result<_, _>>()?)
    }

    async fn set_connection_status(
        &self,
        id: Uuid,
        status: BridgeStatus,
        last_error: Option<String>,
    ) -> StoreResult<Option<BridgeConnection>> {
        let row = sqlx::query(
            r#"
            UPDATE bridge_connections
            SET status = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(connection_from_row).transpose()?)
    }

    async fn delete_connection(&self, id: Uuid) -> StoreResult<bool> {
        // Mappings and virtual users go with it via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM bridge_connections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_mapping(
        &self,
        bridge_id: Uuid,
        local_channel_id: Uuid,
        remote_channel_id: &str,
        direction: MappingDirection,
    ) -> StoreResult<ChannelMapping> {
        let row = sqlx::query(
            r#"
            INSERT INTO bridge_channel_mappings
                (id, bridge_id, local_channel_id, remote_channel_id, direction)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(generate_id())
        .bind(bridge_id)
        .bind(local_channel_id)
        .bind(remote_channel_id)
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_or(e, "Channel mapping"))?;
        Ok(mapping_from_row(&row)?)
    }

    async fn get_mapping(&self, id: Uuid) -> StoreResult<Option<ChannelMapping>> {
        let row = sqlx::query("SELECT * FROM bridge_channel_mappings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(mapping_from_row).transpose()?)
    }

    async fn delete_mapping(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM bridge_channel_mappings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_mappings(&self, bridge_id: Uuid) -> StoreResult<Vec<ChannelMapping>> {
        let rows = sqlx::query(
            "SELECT * FROM bridge_channel_mappings WHERE bridge_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(bridge_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(mapping_from_row).collect::<Result<_, _>>()?)
    }

    async fn mappings_for_local_channel(
        &self,
        local_channel_id: Uuid,
    ) -> StoreResult<Vec<ChannelMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bridge_channel_mappings
            WHERE local_channel_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(local_channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(mapping_from_row).collect::<Result<_, _>>()?)
    }

    async fn mappings_for_remote_channel(
        &self,
        bridge_id: Uuid,
        remote_channel_id: &str,
    ) -> StoreResult<Vec<ChannelMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bridge_channel_mappings
            WHERE bridge_id = $1 AND remote_channel_id = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(bridge_id)
        .bind(remote_channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(mapping_from_row).collect::<Result<_, _>>()?)
    }

    async fn increment_mapping_counter(
        &self,
        id: Uuid,
        direction: RelayDirection,
    ) -> StoreResult<()> {
        let sql = match direction {
            RelayDirection::Inbound => {
                "UPDATE bridge_channel_mappings SET inbound_count = inbound_count + 1 WHERE id = $1"
            }
            RelayDirection::Outbound => {
                "UPDATE bridge_channel_mappings SET outbound_count = outbound_count + 1 WHERE id = $1"
            }
        };
        sqlx::query(sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_virtual_user(&self, new: NewVirtualUser) -> StoreResult<VirtualUser> {
        let row = sqlx::query(
            r#"
            INSERT INTO bridge_virtual_users
                (id, bridge_id, remote_user_id, display_name, avatar_url)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (bridge_id, remote_user_id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                avatar_url = EXCLUDED.avatar_url,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(generate_id())
        .bind(new.bridge_id)
        .bind(&new.remote_user_id)
        .bind(&new.display_name)
        .bind(&new.avatar_url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_or(e, "Bridge connection"))?;
        Ok(virtual_user_from_row(&row)?)
    }

    async fn get_virtual_user(&self, id: Uuid) -> StoreResult<Option<VirtualUser>> {
        let row = sqlx::query("SELECT * FROM bridge_virtual_users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(virtual_user_from_row).transpose()?)
    }
}
