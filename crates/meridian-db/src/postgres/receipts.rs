//! Delivery receipts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use meridian_common::models::{
    DeliveryReceipt, DeliveryStatus, NewReceipt, ReceiptFilter, ReceiptUpdate,
};
use meridian_common::ids::generate_id;

use super::{text_column, PgStore};
use crate::store::{ReceiptStore, StoreError, StoreResult};

fn receipt_from_row(row: &PgRow) -> Result<DeliveryReceipt, sqlx::Error> {
    Ok(DeliveryReceipt {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        source_instance: row.try_get("source_instance")?,
        target_instance: row.try_get("target_instance")?,
        status: text_column(row, "status")?,
        attempts: row.try_get("attempts")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        delivered_at: row.try_get("delivered_at")?,
        error_message: row.try_get("error_message")?,
        permanent_failure: row.try_get("permanent_failure")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        created_at: row.try_get("created_at")?,
        payload: row.try_get("payload")?,
    })
}

#[async_trait]
impl ReceiptStore for PgStore {
    async fn insert_receipt(&self, new: NewReceipt) -> StoreResult<(DeliveryReceipt, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO federation_delivery_receipts
                (id, message_id, source_instance, target_instance, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (message_id, target_instance) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(generate_id())
        .bind(&new.message_id)
        .bind(&new.source_instance)
        .bind(&new.target_instance)
        .bind(&new.payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((receipt_from_row(&row)?, true));
        }

        let row = sqlx::query(
            "SELECT * FROM federation_delivery_receipts WHERE message_id = $1 AND target_instance = $2",
        )
        .bind(&new.message_id)
        .bind(&new.target_instance)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("Delivery receipt"))?;
        Ok((receipt_from_row(&row)?, false))
    }

    async fn get_receipt(&self, id: Uuid) -> StoreResult<Option<DeliveryReceipt>> {
        let row = sqlx::query("SELECT * FROM federation_delivery_receipts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(receipt_from_row).transpose()?)
    }

    async fn update_receipt_if(
        &self,
        id: Uuid,
        expected: DeliveryStatus,
        update: &ReceiptUpdate,
    ) -> StoreResult<Option<DeliveryReceipt>> {
        let row = sqlx::query(
            r#"
            UPDATE federation_delivery_receipts SET
                status            = $3,
                attempts          = attempts + CASE WHEN $4 THEN 1 ELSE 0 END,
                last_attempt_at   = COALESCE($5, last_attempt_at),
                delivered_at      = COALESCE($6, delivered_at),
                error_message     = CASE WHEN $7 THEN $8 ELSE error_message END,
                permanent_failure = COALESCE($9, permanent_failure),
                next_attempt_at   = CASE WHEN $10 THEN $11 ELSE next_attempt_at END
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(update.status.as_str())
        .bind(update.increment_attempts)
        .bind(update.last_attempt_at)
        .bind(update.delivered_at)
        .bind(update.error_message.is_some())
        .bind(update.error_message.clone().flatten())
        .bind(update.permanent_failure)
        .bind(update.next_attempt_at.is_some())
        .bind(update.next_attempt_at.flatten())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(receipt_from_row).transpose()?)
    }

    async fn list_receipts(&self, filter: &ReceiptFilter) -> StoreResult<Vec<DeliveryReceipt>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM federation_delivery_receipts WHERE TRUE");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(target) = &filter.target {
            qb.push(" AND target_instance = ").push_bind(target.clone());
        }
        if let Some(message_id) = &filter.message_id {
            qb.push(" AND message_id = ").push_bind(message_id.clone());
        }
        match (filter.before, filter.before_id) {
            (Some(before), Some(before_id)) => {
                qb.push(" AND (created_at, id) < (").push_bind(before).push(", ").push_bind(before_id).push(")");
            }
            (Some(before), None) => {
                qb.push(" AND created_at < ").push_bind(before);
            }
            (None, _) => {}
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(filter.effective_limit()));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(receipt_from_row).collect::<Result<_, _>>()?)
    }

    async fn due_receipts(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: u32,
    ) -> StoreResult<Vec<DeliveryReceipt>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM federation_delivery_receipts
            WHERE status = 'failed'
              AND NOT permanent_failure
              AND attempts < $2
              AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(max_attempts)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(receipt_from_row).collect::<Result<_, _>>()?)
    }

    async fn stranded_receipts(
        &self,
        now: DateTime<Utc>,
        unleased_before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<DeliveryReceipt>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM federation_delivery_receipts
            WHERE status IN ('pending', 'retrying')
              AND (next_attempt_at <= $1
                   OR (next_attempt_at IS NULL AND created_at <= $2))
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(unleased_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(receipt_from_row).collect::<Result<_, _>>()?)
    }
}
