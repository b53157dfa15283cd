use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use reqwest::Client;
use sqlx::sqlite::SqlitePool;
use teloxide::prelude::*;
use tokio::{task::JoinHandle, time::timeout};
use tokio_cron_scheduler::JobScheduler;

use crate::{
    collaborators::{
        Downloader, HttpDownloader, HttpUploader, Messenger, StubDownloader, StubUploader,
        TelegramMessenger, Uploader,
    },
    config::AppConfig,
    db::{
        self, queue::QueueRepository, status_records::StatusRecordRepository,
        users::UserRepository,
    },
    infrastructure::{
        directories::ResolvedPaths, instance_guard::InstanceGuard, shutdown::Shutdown,
    },
    tasks::{
        digest::{DigestRefresher, DigestSynchronizer},
        reconciler::{configure_reconcile_jobs, Reconciler},
        scheduler::QueueWorker,
    },
    telegram::{types::AppState, BotService},
};

pub struct PostVaultApp {
    _paths: ResolvedPaths,
    _instance_guard: InstanceGuard,
    pool: SqlitePool,
    cron: JobScheduler,
    worker_handle: JoinHandle<()>,
    refresher_handle: JoinHandle<()>,
    telegram: BotService,
    shutdown: Shutdown,
}

impl PostVaultApp {
    pub async fn initialize(
        config: AppConfig,
        paths: ResolvedPaths,
        instance_guard: InstanceGuard,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let pool = db::init_pool(&paths.db_path).await?;

        let queue = QueueRepository::new(pool.clone());
        let records = StatusRecordRepository::new(pool.clone());
        let users = UserRepository::new(pool.clone());

        let stale = records.reset_stale_claims().await?;
        if stale > 0 {
            tracing::warn!(target: "digest", count = stale, "released digest claims left by a previous run");
        }

        let http_client = Client::builder()
            .user_agent(format!("postvault-bot/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        let downloader: Arc<dyn Downloader> = if config.downloader.enabled {
            Arc::new(HttpDownloader::new(
                http_client.clone(),
                config.downloader.clone(),
            ))
        } else {
            tracing::warn!(target: "downloader", "download connector disabled, using stub");
            Arc::new(StubDownloader)
        };
        let uploader: Arc<dyn Uploader> = if config.uploader.enabled {
            Arc::new(HttpUploader::new(http_client, config.uploader.clone()))
        } else {
            tracing::warn!(target: "uploader", "upload connector disabled, using stub");
            Arc::new(StubUploader)
        };

        let bot = Bot::new(&config.telegram_bot_token);
        let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(bot.clone()));

        let digest = Arc::new(DigestSynchronizer::new(
            queue.clone(),
            records,
            messenger,
            config.digest.clone(),
            &config.timezone,
        ));

        let worker = Arc::new(QueueWorker::new(
            queue.clone(),
            downloader.clone(),
            uploader,
            config.queue.tick,
        ));
        let worker_handle = worker.spawn(shutdown.subscribe());

        let refresher = Arc::new(DigestRefresher::new(
            users.clone(),
            digest.clone(),
            config.digest.refresh_interval,
        ));
        let refresher_handle = refresher.spawn(shutdown.subscribe());

        let reconciler = Arc::new(Reconciler::new(queue.clone(), users.clone(), &config.queue));
        match reconciler.run_once(Utc::now()).await {
            Ok(shifted) => {
                tracing::info!(target: "reconciler", users = shifted, "startup reconcile pass finished");
            }
            Err(err) => {
                tracing::error!(target: "reconciler", error = %err, "startup reconcile pass failed");
            }
        }
        let cron = configure_reconcile_jobs(&config.queue.reconcile_crons, reconciler).await?;

        let state = Arc::new(AppState {
            config: config.clone(),
            users,
            queue,
            downloader,
            digest,
        });
        let telegram = BotService::new(bot, state);

        Ok(Self {
            _paths: paths,
            _instance_guard: instance_guard,
            pool,
            cron,
            worker_handle,
            refresher_handle,
            telegram,
            shutdown,
        })
    }

    pub async fn run(self) -> Result<()> {
        let PostVaultApp {
            _paths: _,
            _instance_guard: guard,
            pool,
            mut cron,
            worker_handle,
            refresher_handle,
            telegram,
            shutdown,
        } = self;

        tracing::info!("postvault bot started");

        let mut shutdown_listener = shutdown.subscribe();
        let shutdown_timeout = Duration::from_secs(5);
        let mut telegram_future = Box::pin(telegram.run(shutdown.subscribe()));
        let mut telegram_completed = false;

        tokio::select! {
            _ = shutdown_listener.notified() => {
                tracing::info!("shutdown signal received");
            }
            res = &mut telegram_future => {
                telegram_completed = true;
                if let Err(err) = res {
                    tracing::error!(?err, "telegram dispatcher failed");
                } else {
                    tracing::info!("telegram dispatcher finished");
                }
            }
        }

        shutdown.trigger();

        if !telegram_completed {
            match timeout(shutdown_timeout, &mut telegram_future).await {
                Ok(Err(err)) => {
                    tracing::error!(?err, "telegram dispatcher failed during shutdown");
                }
                Ok(Ok(())) => {}
                Err(_) => {
                    tracing::warn!(
                        target: "telegram",
                        "dispatcher did not stop within {:?}; abandoning it",
                        shutdown_timeout
                    );
                }
            }
        }

        match timeout(shutdown_timeout, cron.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(?err, "reconcile scheduler shutdown failed");
            }
            Err(_) => {
                tracing::warn!(
                    target: "reconciler",
                    "reconcile scheduler did not stop within {:?}",
                    shutdown_timeout
                );
            }
        }

        for (name, mut handle) in [("worker", worker_handle), ("digest", refresher_handle)] {
            let wait = tokio::time::sleep(shutdown_timeout);
            tokio::pin!(wait);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            tracing::error!(task = name, "task ended with a panic");
                        }
                    }
                }
                _ = &mut wait => {
                    tracing::warn!(task = name, "task did not stop within {:?}, aborting it", shutdown_timeout);
                    handle.abort();
                }
            }
        }

        if timeout(shutdown_timeout, pool.close()).await.is_err() {
            tracing::warn!(target: "db", "database pool did not close within {:?}", shutdown_timeout);
        }

        drop(guard);
        tracing::info!("postvault bot stopped");
        Ok(())
    }
}
