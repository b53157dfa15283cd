use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{FromRow, Row};

use crate::domain::job::UnknownValue;
use crate::domain::{DownloadStatus, Job, JobState, NewJob, ProcessedRecord, UploadStatus};
use crate::error::QueueError;

/// Durable store of pending jobs plus the append-only processed archive.
///
/// A (post_id, user_id) pair lives in at most one of the two tables; the
/// move between them happens in a single transaction when a job reaches a
/// terminal state.
#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

/// Bounded window over a user's pending queue, for digest rendering.
#[derive(Debug, Clone)]
pub struct QueuePreview {
    pub post_id: String,
    pub scheduled_time: DateTime<Utc>,
}

/// One backlog entry as seen by the reconciler.
#[derive(Debug, Clone)]
pub struct BacklogItem {
    pub post_id: String,
    pub user_id: i64,
    pub scheduled_time: DateTime<Utc>,
}

fn decode_column<T>(row: &SqliteRow, index: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = UnknownValue>,
{
    let raw: String = row.try_get(index)?;
    raw.parse().map_err(|err: UnknownValue| sqlx::Error::ColumnDecode {
        index: index.to_string(),
        source: Box::new(err),
    })
}

impl<'r> FromRow<'r, SqliteRow> for Job {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            post_id: row.try_get("post_id")?,
            post_url: row.try_get("post_url")?,
            post_owner: row.try_get("post_owner")?,
            link_type: decode_column(row, "link_type")?,
            message_id: row.try_get("message_id")?,
            chat_id: row.try_get("chat_id")?,
            scheduled_time: row.try_get("scheduled_time")?,
            download_status: decode_column(row, "download_status")?,
            upload_status: decode_column(row, "upload_status")?,
            state: decode_column(row, "state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for ProcessedRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            post_id: row.try_get("post_id")?,
            post_url: row.try_get("post_url")?,
            post_owner: row.try_get("post_owner")?,
            link_type: decode_column(row, "link_type")?,
            message_id: row.try_get("message_id")?,
            chat_id: row.try_get("chat_id")?,
            download_status: decode_column(row, "download_status")?,
            upload_status: decode_column(row, "upload_status")?,
            state: decode_column(row, "state")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Adds a request to the queue. Rejected with `DuplicateRequest` if the
    /// (post_id, user_id) pair already exists in the queue or the processed
    /// archive; the check and the insert share one transaction.
    pub async fn enqueue(&self, job: &NewJob) -> Result<String, QueueError> {
        let mut tx = self.pool.begin().await?;

        let present: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM queue WHERE post_id = ?1 AND user_id = ?2
            UNION ALL
            SELECT id FROM processed WHERE post_id = ?1 AND user_id = ?2
            LIMIT 1
            "#,
        )
        .bind(&job.post_id)
        .bind(job.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if present.is_some() {
            return Err(QueueError::DuplicateRequest {
                post_id: job.post_id.clone(),
                user_id: job.user_id,
            });
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO queue (
                user_id, post_id, post_url, post_owner, link_type,
                message_id, chat_id, scheduled_time,
                download_status, upload_status, state, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
            "#,
        )
        .bind(job.user_id)
        .bind(&job.post_id)
        .bind(&job.post_url)
        .bind(&job.post_owner)
        .bind(job.link_type.as_str())
        .bind(job.message_id)
        .bind(job.chat_id)
        .bind(job.scheduled_time)
        .bind(DownloadStatus::NotStarted.as_str())
        .bind(UploadStatus::NotStarted.as_str())
        .bind(JobState::Waiting.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(format!("{}: added to queue", job.post_id))
    }

    /// True if the pair exists in neither the queue nor the processed archive.
    pub async fn is_unique(&self, post_id: &str, user_id: i64) -> Result<bool, QueueError> {
        let present: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM queue WHERE post_id = ?1 AND user_id = ?2
            UNION ALL
            SELECT id FROM processed WHERE post_id = ?1 AND user_id = ?2
            LIMIT 1
            "#,
        )
        .bind(post_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(present.is_none())
    }

    /// Returns the single earliest job due at `now`, or nothing.
    ///
    /// Jobs in the error state stay eligible so that transient collaborator
    /// failures are retried on every due cycle.
    pub async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM queue
            WHERE scheduled_time <= ?1 AND state IN ('waiting', 'processing', 'error')
            ORDER BY scheduled_time ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Updates a job's state and statuses in place. When the new state is
    /// terminal the row is copied into the processed archive and deleted from
    /// the queue atomically.
    pub async fn transition(
        &self,
        post_id: &str,
        new_state: JobState,
        download_status: Option<DownloadStatus>,
        upload_status: Option<UploadStatus>,
        post_owner: Option<&str>,
    ) -> Result<String, QueueError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM queue WHERE post_id = ?1 LIMIT 1")
            .bind(post_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QueueError::NotFound(post_id.to_string()))?;

        let download = download_status.unwrap_or(job.download_status);
        let upload = upload_status.unwrap_or(job.upload_status);
        let owner = post_owner.unwrap_or(&job.post_owner);
        let now = Utc::now();

        // keyed by the row id: the same post may be queued by another user
        sqlx::query(
            r#"
            UPDATE queue
            SET state = ?1, download_status = ?2, upload_status = ?3,
                post_owner = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(new_state.as_str())
        .bind(download.as_str())
        .bind(upload.as_str())
        .bind(owner)
        .bind(now)
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        let response = if new_state.is_terminal() {
            sqlx::query(
                r#"
                INSERT INTO processed (
                    user_id, post_id, post_url, post_owner, link_type,
                    message_id, chat_id, download_status, upload_status, state, timestamp
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )
            .bind(job.user_id)
            .bind(&job.post_id)
            .bind(&job.post_url)
            .bind(owner)
            .bind(job.link_type.as_str())
            .bind(job.message_id)
            .bind(job.chat_id)
            .bind(download.as_str())
            .bind(upload.as_str())
            .bind(new_state.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM queue WHERE id = ?1")
                .bind(job.id)
                .execute(&mut *tx)
                .await?;

            format!("{post_id}: {new_state}")
        } else {
            format!("{post_id}: state updated")
        };

        tx.commit().await?;
        Ok(response)
    }

    /// Chat-facing reschedule; the new time must be strictly in the future.
    pub async fn reschedule(
        &self,
        post_id: &str,
        user_id: i64,
        new_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<String, QueueError> {
        if new_time <= now {
            return Err(QueueError::ScheduleNotInFuture { requested: new_time });
        }
        self.update_schedule_time(post_id, user_id, new_time).await?;
        Ok(format!("{post_id}: scheduled time updated"))
    }

    /// Unchecked schedule write, used by the reconciler (which pins the
    /// earliest backlog item to exactly `now`).
    pub async fn update_schedule_time(
        &self,
        post_id: &str,
        user_id: i64,
        new_time: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE queue SET scheduled_time = ?1, updated_at = ?2
            WHERE post_id = ?3 AND user_id = ?4
            "#,
        )
        .bind(new_time)
        .bind(Utc::now())
        .bind(post_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(QueueError::NotFound(post_id.to_string()));
        }
        Ok(())
    }

    pub async fn user_queue(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<QueuePreview>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT post_id, scheduled_time FROM queue
            WHERE user_id = ?1
            ORDER BY scheduled_time ASC
            LIMIT ?2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(QueuePreview {
                    post_id: row.try_get("post_id")?,
                    scheduled_time: row.try_get("scheduled_time")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(QueueError::from)
    }

    pub async fn user_queue_count(&self, user_id: i64) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// The user's most recent processed entries, newest first.
    pub async fn user_processed(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<ProcessedRecord>, QueueError> {
        let rows = sqlx::query_as::<_, ProcessedRecord>(
            r#"
            SELECT * FROM processed
            WHERE user_id = ?1
            ORDER BY timestamp DESC
            LIMIT ?2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn user_processed_count(&self, user_id: i64) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// A user's pending backlog ordered by scheduled time, bounded to one page.
    pub async fn user_backlog(
        &self,
        user_id: i64,
        page_size: i64,
    ) -> Result<Vec<BacklogItem>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT post_id, user_id, scheduled_time FROM queue
            WHERE user_id = ?1
            ORDER BY scheduled_time ASC
            LIMIT ?2
            "#,
        )
        .bind(user_id)
        .bind(page_size)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BacklogItem {
                    post_id: row.try_get("post_id")?,
                    user_id: row.try_get("user_id")?,
                    scheduled_time: row.try_get("scheduled_time")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(QueueError::from)
    }
}

#[cfg(test)]
pub(crate) fn sample_job(user_id: i64, post_id: &str, scheduled_time: DateTime<Utc>) -> NewJob {
    use crate::domain::LinkType;

    NewJob {
        user_id,
        post_id: post_id.to_string(),
        post_url: format!("https://www.instagram.com/p/{post_id}/"),
        post_owner: "undefined".to_string(),
        link_type: LinkType::Post,
        message_id: 100,
        chat_id: user_id,
        scheduled_time,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn enqueue_rejects_duplicate_pairs() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();

        assert!(repo.is_unique("p1", 1).await.unwrap());
        let status = repo.enqueue(&sample_job(1, "p1", now)).await.unwrap();
        assert_eq!(status, "p1: added to queue");
        assert!(!repo.is_unique("p1", 1).await.unwrap());

        let err = repo.enqueue(&sample_job(1, "p1", now)).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateRequest { .. }));
        assert_eq!(repo.user_queue_count(1).await.unwrap(), 1);

        // same post for a different user is a distinct request
        repo.enqueue(&sample_job(2, "p1", now)).await.unwrap();
    }

    #[tokio::test]
    async fn dedup_spans_the_processed_archive() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();
        repo.enqueue(&sample_job(1, "p1", now)).await.unwrap();

        repo.transition(
            "p1",
            JobState::Processed,
            Some(DownloadStatus::Completed),
            Some(UploadStatus::Completed),
            Some("johndoe"),
        )
        .await
        .unwrap();

        assert_eq!(repo.user_queue_count(1).await.unwrap(), 0);
        assert_eq!(repo.user_processed_count(1).await.unwrap(), 1);
        assert!(!repo.is_unique("p1", 1).await.unwrap());

        let err = repo.enqueue(&sample_job(1, "p1", now)).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateRequest { .. }));
    }

    #[tokio::test]
    async fn pair_lives_in_exactly_one_table_after_terminal_transition() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();
        repo.enqueue(&sample_job(1, "p1", now)).await.unwrap();
        repo.transition("p1", JobState::NotSupported, Some(DownloadStatus::NotSupported), None, None)
            .await
            .unwrap();

        assert_eq!(repo.user_queue_count(1).await.unwrap(), 0);
        let archived = repo.user_processed(1, 10).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].post_id, "p1");
        assert_eq!(archived[0].state, JobState::NotSupported);
    }

    #[tokio::test]
    async fn dequeue_due_returns_single_earliest_eligible_job() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();

        repo.enqueue(&sample_job(1, "later", now - Duration::minutes(5)))
            .await
            .unwrap();
        repo.enqueue(&sample_job(1, "earliest", now - Duration::minutes(30)))
            .await
            .unwrap();
        repo.enqueue(&sample_job(1, "future", now + Duration::minutes(30)))
            .await
            .unwrap();

        let job = repo.dequeue_due(now).await.unwrap().unwrap();
        assert_eq!(job.post_id, "earliest");
        assert_eq!(job.state, JobState::Waiting);

        // nothing due once the past items are gone
        repo.transition("earliest", JobState::Processed, Some(DownloadStatus::Completed), Some(UploadStatus::Completed), None)
            .await
            .unwrap();
        repo.transition("later", JobState::Processed, Some(DownloadStatus::Completed), Some(UploadStatus::Completed), None)
            .await
            .unwrap();
        assert!(repo.dequeue_due(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_due_keeps_error_jobs_eligible() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();
        repo.enqueue(&sample_job(1, "p1", now - Duration::minutes(1)))
            .await
            .unwrap();
        repo.transition("p1", JobState::Error, Some(DownloadStatus::DownloadError), None, None)
            .await
            .unwrap();

        let job = repo.dequeue_due(now).await.unwrap().unwrap();
        assert_eq!(job.post_id, "p1");
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.download_status, DownloadStatus::DownloadError);
    }

    #[tokio::test]
    async fn transition_preserves_unset_fields() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();
        repo.enqueue(&sample_job(1, "p1", now)).await.unwrap();

        repo.transition("p1", JobState::Processing, Some(DownloadStatus::Completed), None, Some("johndoe"))
            .await
            .unwrap();
        let job = repo.dequeue_due(now).await.unwrap().unwrap();
        assert_eq!(job.download_status, DownloadStatus::Completed);
        assert_eq!(job.upload_status, UploadStatus::NotStarted);
        assert_eq!(job.post_owner, "johndoe");

        repo.transition("p1", JobState::Processing, None, Some(UploadStatus::Completed), None)
            .await
            .unwrap();
        let job = repo.dequeue_due(now).await.unwrap().unwrap();
        assert_eq!(job.download_status, DownloadStatus::Completed);
        assert_eq!(job.upload_status, UploadStatus::Completed);
        assert_eq!(job.post_owner, "johndoe");
    }

    #[tokio::test]
    async fn reschedule_rejects_times_not_in_the_future() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();
        repo.enqueue(&sample_job(1, "p1", now)).await.unwrap();

        let err = repo
            .reschedule("p1", 1, now - Duration::seconds(1), now)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ScheduleNotInFuture { .. }));

        let status = repo
            .reschedule("p1", 1, now + Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(status, "p1: scheduled time updated");

        let backlog = repo.user_backlog(1, 10).await.unwrap();
        assert_eq!(backlog[0].scheduled_time, now + Duration::hours(1));
    }

    #[tokio::test]
    async fn user_windows_are_bounded_and_ordered() {
        let repo = QueueRepository::new(test_pool().await);
        let now = Utc::now();
        for i in 0..7 {
            repo.enqueue(&sample_job(1, &format!("q{i}"), now + Duration::minutes(i)))
                .await
                .unwrap();
        }
        let preview = repo.user_queue(1, 5).await.unwrap();
        assert_eq!(preview.len(), 5);
        assert_eq!(preview[0].post_id, "q0");
        assert_eq!(preview[4].post_id, "q4");
        assert_eq!(repo.user_queue_count(1).await.unwrap(), 7);

        for i in 0..7 {
            repo.transition(
                &format!("q{i}"),
                JobState::Processed,
                Some(DownloadStatus::Completed),
                Some(UploadStatus::Completed),
                None,
            )
            .await
            .unwrap();
        }
        let history = repo.user_processed(1, 5).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(repo.user_processed_count(1).await.unwrap(), 7);
    }
}
