//! Share record persistence

use sqlx::SqlitePool;

use crate::share::{Share, ShareError};

/// Repository for share records
#[derive(Clone)]
pub struct ShareRepository {
    pool: SqlitePool,
}

impl ShareRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the record for `share.token`
    pub async fn upsert(&self, share: &Share) -> Result<(), ShareError> {
        let record = serde_json::to_string(share)?;

        sqlx::query(
            r#"
            INSERT INTO shares (token, state, created_at, expires_at, record, updated_at)
            VALUES (?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(token) DO UPDATE SET
                state = excluded.state,
                expires_at = excluded.expires_at,
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&share.token)
        .bind(share.state.as_str())
        .bind(share.created_at.to_rfc3339())
        .bind(share.expires_at.to_rfc3339())
        .bind(&record)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, token: &str) -> Result<(), ShareError> {
        sqlx::query("DELETE FROM shares WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Load every stored share
    pub async fn load_all(&self) -> Result<Vec<Share>, ShareError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT token, record FROM shares ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;

        let mut shares = Vec::with_capacity(rows.len());
        for (token, record) in rows {
            match serde_json::from_str::<Share>(&record) {
                Ok(share) => shares.push(share),
                Err(e) => {
                    tracing::error!(token = %token, error = %e, "Skipping unreadable share record");
                }
            }
        }

        Ok(shares)
    }

    pub async fn count(&self) -> Result<i64, ShareError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM shares")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
