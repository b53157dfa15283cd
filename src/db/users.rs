use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{FromRow, Row};

use crate::error::QueueError;

pub const STATUS_ALLOWED: &str = "allowed";
pub const STATUS_DENIED: &str = "denied";

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub user_id: i64,
    pub chat_id: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for UserRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            chat_id: row.try_get("chat_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a user if not already present; an existing row is left
    /// untouched so a denied user cannot re-allow themselves via /start.
    pub async fn ensure(&self, user_id: i64, chat_id: i64, status: &str) -> Result<bool, QueueError> {
        let affected = sqlx::query(
            r#"
            INSERT INTO users (user_id, chat_id, status, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(chat_id)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<UserRow>, QueueError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// All users eligible for digest refreshes, bounded.
    pub async fn list_allowed(&self, limit: i64) -> Result<Vec<UserRow>, QueueError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE status = ?1 ORDER BY user_id ASC LIMIT ?2",
        )
        .bind(STATUS_ALLOWED)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn ensure_is_idempotent_and_keeps_existing_status() {
        let repo = UserRepository::new(test_pool().await);

        assert!(repo.ensure(1, 1, STATUS_ALLOWED).await.unwrap());
        assert!(!repo.ensure(1, 1, STATUS_DENIED).await.unwrap());

        let row = repo.get(1).await.unwrap().unwrap();
        assert_eq!(row.status, STATUS_ALLOWED);
    }

    #[tokio::test]
    async fn list_allowed_filters_denied_users() {
        let repo = UserRepository::new(test_pool().await);
        repo.ensure(1, 1, STATUS_ALLOWED).await.unwrap();
        repo.ensure(2, 2, STATUS_DENIED).await.unwrap();
        repo.ensure(3, 3, STATUS_ALLOWED).await.unwrap();

        let allowed = repo.list_allowed(100).await.unwrap();
        let ids: Vec<i64> = allowed.iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
