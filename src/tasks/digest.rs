use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use tokio::{task::JoinHandle, time::sleep};

use crate::{
    collaborators::Messenger,
    config::DigestConfig,
    db::{queue::QueueRepository, status_records::StatusRecordRepository, users::UserRepository},
    domain::{StatusRecord, SyncState},
    infrastructure::shutdown::ShutdownListener,
};

pub const STATUS_MESSAGE_TYPE: &str = "status_message";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn content_hash(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Keeps the one live status message per chat in sync with the user's
/// queue and history. Concurrent callers are serialized through the
/// `updating` claim on the status record; the claim is polled, not
/// blocked on, because refreshes per chat are rare.
pub struct DigestSynchronizer {
    queue: QueueRepository,
    records: StatusRecordRepository,
    messenger: Arc<dyn Messenger>,
    config: DigestConfig,
    timezone: Tz,
}

impl DigestSynchronizer {
    pub fn new(
        queue: QueueRepository,
        records: StatusRecordRepository,
        messenger: Arc<dyn Messenger>,
        config: DigestConfig,
        timezone: &str,
    ) -> Self {
        let timezone: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
        Self {
            queue,
            records,
            messenger,
            config,
            timezone,
        }
    }

    pub async fn sync_user(&self, user_id: i64, chat_id: i64) -> Result<()> {
        let digest = self.render_digest(user_id).await?;
        let hash = content_hash(&digest);

        loop {
            let record = self.records.get(chat_id, STATUS_MESSAGE_TYPE).await?;
            match record {
                None => {
                    let message_id = self
                        .messenger
                        .send(chat_id, &digest)
                        .await
                        .with_context(|| format!("failed to send status digest to chat {chat_id}"))?;
                    self.records
                        .store_sent(chat_id, STATUS_MESSAGE_TYPE, message_id, &hash, false)
                        .await?;
                    tracing::info!(target: "digest", chat_id, user_id, message_id, "status digest created");
                    return Ok(());
                }
                Some(record) if record.state == SyncState::Updating => {
                    tracing::debug!(target: "digest", chat_id, "digest record claimed elsewhere, waiting");
                    sleep(self.config.claim_poll).await;
                }
                Some(record) => {
                    if !self.records.try_claim(chat_id, STATUS_MESSAGE_TYPE).await? {
                        // lost the claim race, back to polling
                        continue;
                    }
                    return self.apply_claimed(user_id, chat_id, record, &digest, &hash).await;
                }
            }
        }
    }

    /// Runs with the claim held. Every exit path either stores the result
    /// of an outbound call that actually happened or releases the claim
    /// with the previous content intact.
    async fn apply_claimed(
        &self,
        user_id: i64,
        chat_id: i64,
        record: StatusRecord,
        digest: &str,
        hash: &str,
    ) -> Result<()> {
        let age = Utc::now() - record.created_at;
        let renewal_window = Duration::from_std(self.config.renewal_window)
            .unwrap_or_else(|_| Duration::hours(24));
        let edit_window =
            Duration::from_std(self.config.edit_window).unwrap_or_else(|_| Duration::hours(48));

        if age > renewal_window {
            // the platform refuses edits on old messages, so the digest is
            // recreated before it crosses that line
            if age < edit_window {
                if let Err(err) = self.messenger.delete(chat_id, record.message_id).await {
                    tracing::warn!(
                        target: "digest",
                        error = %err,
                        chat_id,
                        message_id = record.message_id,
                        "failed to delete expiring digest message"
                    );
                }
            } else {
                tracing::warn!(
                    target: "digest",
                    chat_id,
                    message_id = record.message_id,
                    "digest message already past the edit window, delete skipped"
                );
            }

            match self.messenger.send(chat_id, digest).await {
                Ok(message_id) => {
                    self.records
                        .store_sent(chat_id, STATUS_MESSAGE_TYPE, message_id, hash, true)
                        .await?;
                    tracing::info!(target: "digest", chat_id, user_id, message_id, "status digest renewed");
                }
                Err(err) => {
                    self.records.release(chat_id, STATUS_MESSAGE_TYPE).await?;
                    return Err(err)
                        .with_context(|| format!("failed to renew status digest in chat {chat_id}"));
                }
            }
        } else if record.content_hash != hash {
            match self.messenger.edit(chat_id, record.message_id, digest).await {
                Ok(()) => {
                    self.records
                        .store_sent(chat_id, STATUS_MESSAGE_TYPE, record.message_id, hash, false)
                        .await?;
                    tracing::info!(
                        target: "digest",
                        chat_id,
                        user_id,
                        message_id = record.message_id,
                        "status digest updated"
                    );
                }
                Err(err) => {
                    self.records.release(chat_id, STATUS_MESSAGE_TYPE).await?;
                    return Err(err).with_context(|| {
                        format!(
                            "failed to edit status digest {} in chat {chat_id}",
                            record.message_id
                        )
                    });
                }
            }
        } else {
            // content unchanged; the claim still has to be released
            self.records.release(chat_id, STATUS_MESSAGE_TYPE).await?;
            tracing::debug!(target: "digest", chat_id, "status digest unchanged");
        }
        Ok(())
    }

    async fn render_digest(&self, user_id: i64) -> Result<String> {
        let queue_items = self
            .queue
            .user_queue(user_id, self.config.queue_preview)
            .await?;
        let queue_total = self.queue.user_queue_count(user_id).await?;
        let mut history = self
            .queue
            .user_processed(user_id, self.config.processed_preview)
            .await?;
        history.reverse();
        let processed_total = self.queue.user_processed_count(user_id).await?;

        let mut out = format!("<b>Queue ({queue_total}):</b>\n");
        if queue_items.is_empty() {
            out.push_str("<code>queue is empty</code>\n");
        } else {
            for item in &queue_items {
                let at = item.scheduled_time.with_timezone(&self.timezone).format(TIME_FORMAT);
                out.push_str(&format!(
                    "+ <code>{}: will be started {at}</code>\n",
                    item.post_id
                ));
            }
            let shown = queue_items.len() as i64;
            if queue_total > shown {
                out.push_str(&format!("<code>…and {} more</code>\n", queue_total - shown));
            }
        }

        out.push_str(&format!("\n<b>Processed ({processed_total}):</b>\n"));
        if history.is_empty() {
            out.push_str("<code>no processed posts</code>\n");
        } else {
            for item in &history {
                let at = item.timestamp.with_timezone(&self.timezone).format(TIME_FORMAT);
                out.push_str(&format!(
                    "* <code>{}: {} at {at}</code>\n",
                    item.post_id, item.state
                ));
            }
        }
        Ok(out)
    }
}

/// Periodic refresh loop: walks all allowed users on a fixed interval and
/// drives their digest through the synchronizer.
pub struct DigestRefresher {
    users: UserRepository,
    synchronizer: Arc<DigestSynchronizer>,
    interval: std::time::Duration,
}

impl DigestRefresher {
    pub fn new(
        users: UserRepository,
        synchronizer: Arc<DigestSynchronizer>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            users,
            synchronizer,
            interval,
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                target: "digest",
                interval_secs = self.interval.as_secs(),
                "digest refresher started"
            );
            loop {
                tokio::select! {
                    _ = sleep(self.interval) => {}
                    _ = shutdown.notified() => break,
                }

                let users = match self.users.list_allowed(1_000).await {
                    Ok(users) => users,
                    Err(err) => {
                        tracing::error!(target: "digest", error = %err, "failed to list users for refresh");
                        continue;
                    }
                };

                for user in users {
                    if shutdown.is_triggered() {
                        break;
                    }
                    if let Err(err) = self.synchronizer.sync_user(user.user_id, user.chat_id).await {
                        tracing::error!(
                            target: "digest",
                            error = %err,
                            user_id = user.user_id,
                            chat_id = user.chat_id,
                            "digest refresh failed"
                        );
                    }
                }
            }
            tracing::info!(target: "digest", "digest refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::db::queue::sample_job;
    use crate::db::test_pool;
    use crate::error::CollaboratorError;

    #[derive(Debug, PartialEq, Eq, Clone)]
    enum Call {
        Send(i64),
        Edit(i64, i64),
        Delete(i64, i64),
    }

    struct RecordingMessenger {
        calls: Mutex<Vec<Call>>,
        next_id: AtomicI64,
        fail_outbound: AtomicBool,
    }

    impl RecordingMessenger {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                next_id: AtomicI64::new(100),
                fail_outbound: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn fail(&self) -> Result<(), CollaboratorError> {
            if self.fail_outbound.load(Ordering::SeqCst) {
                Err(CollaboratorError::UnexpectedResponse {
                    endpoint: "telegram".to_string(),
                    detail: "outbound disabled".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(&self, chat_id: i64, _text: &str) -> Result<i64, CollaboratorError> {
            self.fail()?;
            self.calls.lock().unwrap().push(Call::Send(chat_id));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn edit(
            &self,
            chat_id: i64,
            message_id: i64,
            _text: &str,
        ) -> Result<(), CollaboratorError> {
            self.fail()?;
            self.calls.lock().unwrap().push(Call::Edit(chat_id, message_id));
            Ok(())
        }

        async fn delete(&self, chat_id: i64, message_id: i64) -> Result<(), CollaboratorError> {
            // deletes stay best-effort even in failure scenarios
            self.calls.lock().unwrap().push(Call::Delete(chat_id, message_id));
            Ok(())
        }
    }

    fn test_config() -> DigestConfig {
        DigestConfig {
            refresh_interval: StdDuration::from_secs(60),
            renewal_window: StdDuration::from_secs(24 * 3_600),
            edit_window: StdDuration::from_secs(48 * 3_600),
            claim_poll: StdDuration::from_millis(20),
            queue_preview: 5,
            processed_preview: 5,
        }
    }

    struct Fixture {
        queue: QueueRepository,
        records: StatusRecordRepository,
        messenger: Arc<RecordingMessenger>,
        sync: DigestSynchronizer,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let queue = QueueRepository::new(pool.clone());
        let records = StatusRecordRepository::new(pool);
        let messenger = RecordingMessenger::new();
        let sync = DigestSynchronizer::new(
            queue.clone(),
            records.clone(),
            messenger.clone(),
            test_config(),
            "UTC",
        );
        Fixture {
            queue,
            records,
            messenger,
            sync,
        }
    }

    #[tokio::test]
    async fn unchanged_content_produces_no_outbound_calls_after_the_first() {
        let f = fixture().await;

        f.sync.sync_user(1, 1).await.unwrap();
        f.sync.sync_user(1, 1).await.unwrap();

        assert_eq!(f.messenger.calls(), vec![Call::Send(1)]);
        // the no-op sync still released its claim
        let record = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();
        assert_eq!(record.state, SyncState::Updated);
    }

    #[tokio::test]
    async fn changed_content_edits_the_existing_message() {
        let f = fixture().await;
        f.sync.sync_user(1, 1).await.unwrap();
        let first = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();

        f.queue
            .enqueue(&sample_job(1, "p1", Utc::now() + ChronoDuration::hours(1)))
            .await
            .unwrap();
        f.sync.sync_user(1, 1).await.unwrap();

        assert_eq!(
            f.messenger.calls(),
            vec![Call::Send(1), Call::Edit(1, first.message_id)]
        );
        let record = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();
        assert_ne!(record.content_hash, first.content_hash);
        assert_eq!(record.message_id, first.message_id);
    }

    #[tokio::test]
    async fn digest_inside_edit_window_is_deleted_then_recreated() {
        let f = fixture().await;
        f.sync.sync_user(1, 1).await.unwrap();
        let first = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();

        f.records
            .set_created_at(1, STATUS_MESSAGE_TYPE, Utc::now() - ChronoDuration::hours(30))
            .await
            .unwrap();
        f.sync.sync_user(1, 1).await.unwrap();

        assert_eq!(
            f.messenger.calls(),
            vec![Call::Send(1), Call::Delete(1, first.message_id), Call::Send(1)]
        );
        let record = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();
        assert_ne!(record.message_id, first.message_id);
        assert!(record.created_at > Utc::now() - ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn digest_past_edit_window_skips_the_delete() {
        let f = fixture().await;
        f.sync.sync_user(1, 1).await.unwrap();

        f.records
            .set_created_at(1, STATUS_MESSAGE_TYPE, Utc::now() - ChronoDuration::hours(50))
            .await
            .unwrap();
        f.sync.sync_user(1, 1).await.unwrap();

        assert_eq!(f.messenger.calls(), vec![Call::Send(1), Call::Send(1)]);
    }

    #[tokio::test]
    async fn held_claim_blocks_the_sync_until_released() {
        let f = fixture().await;
        f.sync.sync_user(1, 1).await.unwrap();
        assert!(f.records.try_claim(1, STATUS_MESSAGE_TYPE).await.unwrap());

        let records = f.records.clone();
        let releaser = tokio::spawn(async move {
            sleep(StdDuration::from_millis(120)).await;
            records.release(1, STATUS_MESSAGE_TYPE).await.unwrap();
        });

        // blocks on the claim, then observes unchanged content
        f.sync.sync_user(1, 1).await.unwrap();
        releaser.await.unwrap();

        assert_eq!(f.messenger.calls(), vec![Call::Send(1)]);
        let record = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();
        assert_eq!(record.state, SyncState::Updated);
    }

    #[tokio::test]
    async fn failed_edit_releases_the_claim_and_keeps_the_old_hash() {
        let f = fixture().await;
        f.sync.sync_user(1, 1).await.unwrap();
        let before = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();

        f.queue
            .enqueue(&sample_job(1, "p1", Utc::now() + ChronoDuration::hours(1)))
            .await
            .unwrap();
        f.messenger.fail_outbound.store(true, Ordering::SeqCst);

        assert!(f.sync.sync_user(1, 1).await.is_err());

        let after = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();
        assert_eq!(after.content_hash, before.content_hash);
        assert_eq!(after.state, SyncState::Updated);

        // next refresh retries from scratch once the messenger recovers
        f.messenger.fail_outbound.store(false, Ordering::SeqCst);
        f.sync.sync_user(1, 1).await.unwrap();
        let recovered = f.records.get(1, STATUS_MESSAGE_TYPE).await.unwrap().unwrap();
        assert_ne!(recovered.content_hash, before.content_hash);
    }

    #[tokio::test]
    async fn digest_rendering_includes_windows_and_counts() {
        let f = fixture().await;
        let base = Utc::now() + ChronoDuration::hours(1);
        for i in 0..7 {
            f.queue
                .enqueue(&sample_job(1, &format!("q{i}"), base + ChronoDuration::minutes(i)))
                .await
                .unwrap();
        }

        let digest = f.sync.render_digest(1).await.unwrap();
        assert!(digest.contains("<b>Queue (7):</b>"));
        assert!(digest.contains("q0"));
        assert!(digest.contains("q4"));
        assert!(!digest.contains("q5"));
        assert!(digest.contains("and 2 more"));
        assert!(digest.contains("<code>no processed posts</code>"));
    }
}
