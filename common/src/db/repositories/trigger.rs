// Trigger record repository

use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::TriggerRecord;
use crate::store::IdempotencyStore;
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

/// Idempotency markers stored in `trigger_records`
#[derive(Clone)]
pub struct TriggerRepository {
    pool: DbPool,
}

impl TriggerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for TriggerRepository {
    #[instrument(skip(self))]
    async fn is_done(&self, trigger_id: &str, epoch: u64) -> Result<bool, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM trigger_records WHERE trigger_id = $1 AND epoch = $2
            ) AS done
            "#,
        )
        .bind(trigger_id)
        .bind(epoch as i64)
        .fetch_one(self.pool.pool())
        .await?;

        Ok(row.try_get("done")?)
    }

    /// Conditional create; the primary key makes the check and the write atomic
    #[instrument(skip(self, payload))]
    async fn persist(
        &self,
        trigger_id: &str,
        epoch: u64,
        payload: Option<serde_json::Value>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trigger_records (trigger_id, epoch, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (trigger_id, epoch) DO NOTHING
            "#,
        )
        .bind(trigger_id)
        .bind(epoch as i64)
        .bind(payload)
        .execute(self.pool.pool())
        .await?;

        let created = result.rows_affected() == 1;
        tracing::debug!(trigger_id, epoch, created, "Trigger record persisted");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn get(&self, trigger_id: &str, epoch: u64) -> Result<Option<TriggerRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT trigger_id, epoch, payload
            FROM trigger_records
            WHERE trigger_id = $1 AND epoch = $2
            "#,
        )
        .bind(trigger_id)
        .bind(epoch as i64)
        .fetch_optional(self.pool.pool())
        .await?;

        match row {
            Some(row) => {
                let epoch: i64 = row.try_get("epoch")?;
                Ok(Some(TriggerRecord {
                    trigger_id: row.try_get("trigger_id")?,
                    epoch: epoch as u64,
                    payload: row.try_get("payload")?,
                }))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, payload))]
    async fn store_payload(
        &self,
        trigger_id: &str,
        epoch: u64,
        payload: serde_json::Value,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO trigger_records (trigger_id, epoch, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (trigger_id, epoch)
            DO UPDATE SET payload = EXCLUDED.payload, updated_at = NOW()
            "#,
        )
        .bind(trigger_id)
        .bind(epoch as i64)
        .bind(payload)
        .execute(self.pool.pool())
        .await?;

        Ok(())
    }
}
