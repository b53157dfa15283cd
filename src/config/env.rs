use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub telegram_bot_token: String,
    pub allowed_user_ids: Vec<i64>,
    pub timezone: String,
    pub directories: DirectoryConfig,
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub digest: DigestConfig,
    pub downloader: ConnectorConfig,
    pub uploader: ConnectorConfig,
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub logs_dir: String,
    pub data_dir: String,
    pub db_filename: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

/// Scheduler loop and reconciler settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub tick: Duration,
    pub reconcile_grace: Duration,
    pub reconcile_page_size: i64,
    pub reconcile_crons: Vec<String>,
    pub account_item_spacing: Duration,
    pub account_page_limit: usize,
}

/// Status digest refresh and renewal settings. The edit window is the
/// messaging platform's hard limit on editing old messages; the renewal
/// window has to stay comfortably inside it.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub refresh_interval: Duration,
    pub renewal_window: Duration,
    pub edit_window: Duration,
    pub claim_poll: Duration,
    pub queue_preview: i64,
    pub processed_preview: i64,
}

/// Connection settings for a remote download/upload connector. A disabled
/// connector is replaced by a stub that reports success.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub enabled: bool,
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
}
