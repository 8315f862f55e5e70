// Oracle voting watch repository

use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::OracleVotingWatch;
use crate::store::OracleWatchStore;
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

#[derive(Clone)]
pub struct OracleWatchRepository {
    pool: DbPool,
}

impl OracleWatchRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OracleWatchStore for OracleWatchRepository {
    #[instrument(skip(self))]
    async fn upsert(&self, watch: &OracleVotingWatch) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO oracle_voting_watches (contract_address, due_block_height)
            VALUES ($1, $2)
            ON CONFLICT (contract_address)
            DO UPDATE SET due_block_height = EXCLUDED.due_block_height, updated_at = NOW()
            "#,
        )
        .bind(&watch.contract_address)
        .bind(watch.due_block_height as i64)
        .execute(self.pool.pool())
        .await?;

        tracing::debug!(
            contract = %watch.contract_address,
            due_block_height = watch.due_block_height,
            "Oracle voting watch stored"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_at(&self, height: u64) -> Result<Vec<OracleVotingWatch>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT contract_address, due_block_height
            FROM oracle_voting_watches
            WHERE due_block_height = $1
            ORDER BY contract_address
            "#,
        )
        .bind(height as i64)
        .fetch_all(self.pool.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> Result<OracleVotingWatch, StorageError> {
                let due: i64 = row.try_get("due_block_height")?;
                Ok(OracleVotingWatch {
                    contract_address: row.try_get("contract_address")?,
                    due_block_height: due as u64,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn prune_before(&self, height: u64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM oracle_voting_watches WHERE due_block_height < $1")
            .bind(height as i64)
            .execute(self.pool.pool())
            .await?;

        Ok(result.rows_affected())
    }
}
