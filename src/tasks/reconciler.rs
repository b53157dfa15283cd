use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};

use crate::{
    config::QueueConfig,
    db::{queue::QueueRepository, users::UserRepository},
    error::QueueError,
};

/// Detects per-user backlogs that fell behind while the process was down
/// and shifts them forward as one block: the earliest item lands on `now`
/// and every inter-item delta is preserved, so the backlog restarts
/// immediately without a burst of simultaneous retries and without
/// reordering anyone's jobs.
pub struct Reconciler {
    queue: QueueRepository,
    users: UserRepository,
    grace: Duration,
    page_size: i64,
}

impl Reconciler {
    pub fn new(queue: QueueRepository, users: UserRepository, config: &QueueConfig) -> Self {
        let grace =
            Duration::from_std(config.reconcile_grace).unwrap_or_else(|_| Duration::minutes(10));
        Self {
            queue,
            users,
            grace,
            page_size: config.reconcile_page_size,
        }
    }

    /// One pass over all known users. Returns how many backlogs were shifted.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut shifted = 0;
        for user in self.users.list_allowed(1_000).await? {
            if self.reconcile_user(user.user_id, now).await? {
                shifted += 1;
            }
        }
        if shifted > 0 {
            tracing::info!(target: "reconciler", users = shifted, "overdue backlogs rescheduled");
        }
        Ok(shifted)
    }

    pub async fn reconcile_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let backlog = self.queue.user_backlog(user_id, self.page_size).await?;
        let Some(earliest) = backlog.first() else {
            return Ok(false);
        };

        let lag = now - earliest.scheduled_time;
        if lag <= self.grace {
            return Ok(false);
        }

        for item in &backlog {
            let new_time = item.scheduled_time + lag;
            self.queue
                .update_schedule_time(&item.post_id, item.user_id, new_time)
                .await?;
        }

        tracing::info!(
            target: "reconciler",
            user_id,
            items = backlog.len(),
            lag_secs = lag.num_seconds(),
            "backlog shifted forward"
        );
        Ok(true)
    }
}

/// Registers the periodic reconcile runs and starts the cron scheduler.
pub async fn configure_reconcile_jobs(
    cron_specs: &[String],
    reconciler: Arc<Reconciler>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    for spec in cron_specs {
        let label = spec.clone();
        let reconciler = reconciler.clone();
        let job = CronJob::new_async(spec.as_str(), move |_id, _l| {
            let reconciler = reconciler.clone();
            let cron_label = label.clone();
            Box::pin(async move {
                tracing::debug!(target: "reconciler", cron = %cron_label, "scheduled reconcile run");
                if let Err(err) = reconciler.run_once(Utc::now()).await {
                    tracing::error!(target: "reconciler", error = %err, "reconcile run failed");
                }
            })
        })?;
        scheduler.add(job).await?;
        tracing::info!(target: "reconciler", cron = %spec, "reconcile job registered");
    }
    scheduler.start().await?;
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::QueueConfig;
    use crate::db::queue::sample_job;
    use crate::db::test_pool;
    use crate::db::users::STATUS_ALLOWED;

    fn test_config() -> QueueConfig {
        QueueConfig {
            tick: std::time::Duration::from_secs(60),
            reconcile_grace: std::time::Duration::from_secs(600),
            reconcile_page_size: 1_000,
            reconcile_crons: Vec::new(),
            account_item_spacing: std::time::Duration::from_secs(60),
            account_page_limit: 10,
        }
    }

    fn whole_second_now() -> DateTime<Utc> {
        Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
    }

    #[tokio::test]
    async fn overdue_backlog_shifts_to_now_preserving_gaps() {
        let pool = test_pool().await;
        let queue = QueueRepository::new(pool.clone());
        let users = UserRepository::new(pool);
        let reconciler = Reconciler::new(queue.clone(), users.clone(), &test_config());

        let now = whole_second_now();
        queue
            .enqueue(&sample_job(1, "a", now - Duration::hours(3)))
            .await
            .unwrap();
        queue
            .enqueue(&sample_job(1, "b", now - Duration::hours(1)))
            .await
            .unwrap();
        queue
            .enqueue(&sample_job(1, "c", now + Duration::hours(2)))
            .await
            .unwrap();

        assert!(reconciler.reconcile_user(1, now).await.unwrap());

        let backlog = queue.user_backlog(1, 10).await.unwrap();
        assert_eq!(backlog[0].post_id, "a");
        assert_eq!(backlog[0].scheduled_time, now);
        // the original 2h and 3h inter-item gaps survive the shift
        assert_eq!(backlog[1].scheduled_time - backlog[0].scheduled_time, Duration::hours(2));
        assert_eq!(backlog[2].scheduled_time - backlog[1].scheduled_time, Duration::hours(3));
        assert_eq!(backlog[2].scheduled_time, now + Duration::hours(5));
    }

    #[tokio::test]
    async fn backlog_within_grace_is_left_alone() {
        let pool = test_pool().await;
        let queue = QueueRepository::new(pool.clone());
        let users = UserRepository::new(pool);
        let reconciler = Reconciler::new(queue.clone(), users, &test_config());

        let now = whole_second_now();
        let slightly_late = now - Duration::minutes(5);
        queue
            .enqueue(&sample_job(1, "a", slightly_late))
            .await
            .unwrap();

        assert!(!reconciler.reconcile_user(1, now).await.unwrap());
        let backlog = queue.user_backlog(1, 10).await.unwrap();
        assert_eq!(backlog[0].scheduled_time, slightly_late);
    }

    #[tokio::test]
    async fn run_once_covers_registered_users_independently() {
        let pool = test_pool().await;
        let queue = QueueRepository::new(pool.clone());
        let users = UserRepository::new(pool);
        let reconciler = Reconciler::new(queue.clone(), users.clone(), &test_config());

        let now = whole_second_now();
        users.ensure(1, 1, STATUS_ALLOWED).await.unwrap();
        users.ensure(2, 2, STATUS_ALLOWED).await.unwrap();
        users.ensure(3, 3, STATUS_ALLOWED).await.unwrap();

        queue
            .enqueue(&sample_job(1, "late", now - Duration::hours(2)))
            .await
            .unwrap();
        queue
            .enqueue(&sample_job(2, "fresh", now + Duration::minutes(1)))
            .await
            .unwrap();

        assert_eq!(reconciler.run_once(now).await.unwrap(), 1);
        let shifted = queue.user_backlog(1, 10).await.unwrap();
        assert_eq!(shifted[0].scheduled_time, now);
        let untouched = queue.user_backlog(2, 10).await.unwrap();
        assert_eq!(untouched[0].scheduled_time, now + Duration::minutes(1));
    }
}
