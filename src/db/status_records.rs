use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{FromRow, Row};

use crate::domain::{StatusRecord, SyncState};
use crate::error::QueueError;

const PRODUCER: &str = "bot";

/// One row per (chat, message type), tracking the last rendered digest and
/// its synchronization state. The `updating` state is a cooperative lock:
/// it is taken with a conditional UPDATE so only one caller can hold it.
#[derive(Clone)]
pub struct StatusRecordRepository {
    pool: SqlitePool,
}

impl<'r> FromRow<'r, SqliteRow> for StatusRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        Ok(Self {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            chat_id: row.try_get("chat_id")?,
            message_type: row.try_get("message_type")?,
            content_hash: row.try_get("content_hash")?,
            producer: row.try_get("producer")?,
            state: state.parse().map_err(|err| sqlx::Error::ColumnDecode {
                index: "state".to_string(),
                source: Box::new(err),
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StatusRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        chat_id: i64,
        message_type: &str,
    ) -> Result<Option<StatusRecord>, QueueError> {
        let record = sqlx::query_as::<_, StatusRecord>(
            "SELECT * FROM status_records WHERE chat_id = ?1 AND message_type = ?2 LIMIT 1",
        )
        .bind(chat_id)
        .bind(message_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Attempts to take the `updating` claim. Returns false when another
    /// caller already holds it (or the record vanished).
    pub async fn try_claim(&self, chat_id: i64, message_type: &str) -> Result<bool, QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE status_records SET state = ?1, updated_at = ?2
            WHERE chat_id = ?3 AND message_type = ?4 AND state != ?1
            "#,
        )
        .bind(SyncState::Updating.as_str())
        .bind(Utc::now())
        .bind(chat_id)
        .bind(message_type)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Releases the claim without touching the stored hash, leaving the
    /// record content as it was before the failed or no-op sync.
    pub async fn release(&self, chat_id: i64, message_type: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE status_records SET state = ?1, updated_at = ?2
            WHERE chat_id = ?3 AND message_type = ?4
            "#,
        )
        .bind(SyncState::Updated.as_str())
        .bind(Utc::now())
        .bind(chat_id)
        .bind(message_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a message that was actually sent or edited. Inserts a fresh
    /// row (state `added`) for a chat with no record yet; otherwise updates
    /// hash, message id and state, additionally resetting `created_at` when
    /// the message was recreated from scratch.
    pub async fn store_sent(
        &self,
        chat_id: i64,
        message_type: &str,
        message_id: i64,
        content_hash: &str,
        recreated: bool,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let existing = self.get(chat_id, message_type).await?;

        match existing {
            Some(record) if recreated => {
                sqlx::query(
                    r#"
                    UPDATE status_records
                    SET content_hash = ?1, message_id = ?2, state = ?3,
                        created_at = ?4, updated_at = ?4
                    WHERE id = ?5
                    "#,
                )
                .bind(content_hash)
                .bind(message_id)
                .bind(SyncState::Updated.as_str())
                .bind(now)
                .bind(record.id)
                .execute(&self.pool)
                .await?;
            }
            Some(record) => {
                sqlx::query(
                    r#"
                    UPDATE status_records
                    SET content_hash = ?1, message_id = ?2, state = ?3, updated_at = ?4
                    WHERE id = ?5
                    "#,
                )
                .bind(content_hash)
                .bind(message_id)
                .bind(SyncState::Updated.as_str())
                .bind(now)
                .bind(record.id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO status_records (
                        message_id, chat_id, message_type, content_hash,
                        producer, state, created_at, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                    "#,
                )
                .bind(message_id)
                .bind(chat_id)
                .bind(message_type)
                .bind(content_hash)
                .bind(PRODUCER)
                .bind(SyncState::Added.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Crash recovery: claims left behind by a dead process would block
    /// every later sync, so they are released at startup.
    pub async fn reset_stale_claims(&self) -> Result<u64, QueueError> {
        let affected = sqlx::query("UPDATE status_records SET state = ?1 WHERE state = ?2")
            .bind(SyncState::Updated.as_str())
            .bind(SyncState::Updating.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    #[cfg(test)]
    pub(crate) async fn set_created_at(
        &self,
        chat_id: i64,
        message_type: &str,
        created_at: chrono::DateTime<Utc>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE status_records SET created_at = ?1 WHERE chat_id = ?2 AND message_type = ?3",
        )
        .bind(created_at)
        .bind(chat_id)
        .bind(message_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
