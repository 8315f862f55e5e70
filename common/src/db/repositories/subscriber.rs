// Subscriber repository

use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::Subscriber;
use crate::store::UserDirectory;
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

/// Read side of the `users` table maintained by the login flow
#[derive(Clone)]
pub struct SubscriberRepository {
    pool: DbPool,
}

impl SubscriberRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for SubscriberRepository {
    /// Users that linked a coinbase address
    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Subscriber>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_id, coinbase_address
            FROM users
            WHERE coinbase_address IS NOT NULL AND coinbase_address <> ''
            ORDER BY created_at
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;

        let subscribers = rows
            .into_iter()
            .map(|row| -> Result<Subscriber, StorageError> {
                Ok(Subscriber::new(
                    row.try_get::<String, _>("id")?,
                    row.try_get::<i64, _>("chat_id")?,
                    row.try_get::<String, _>("coinbase_address")?,
                ))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        tracing::info!(count = subscribers.len(), "Subscribers loaded");
        Ok(subscribers)
    }
}
