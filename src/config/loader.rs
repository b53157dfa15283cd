use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::collaborators::{EnvSecrets, SecretsProvider};

use super::env::{
    AppConfig, ConfigError, ConnectorConfig, DigestConfig, DirectoryConfig, LoggingConfig,
    QueueConfig,
};

pub fn load_config() -> Result<AppConfig, ConfigError> {
    AppConfig::from_env(&EnvSecrets)
}

impl AppConfig {
    fn from_env(secrets: &dyn SecretsProvider) -> Result<Self, ConfigError> {
        let telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;

        let allowed_user_ids = env::var("ALLOWED_USER_IDS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .filter_map(|part| part.trim().parse::<i64>().ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let directories = DirectoryConfig {
            logs_dir: env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            db_filename: env::var("DB_FILENAME").unwrap_or_else(|_| "postvault.db".to_string()),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        let timezone = env::var("BOT_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());

        let queue = QueueConfig {
            tick: Duration::from_secs(parse_u64("QUEUE_TICK_SECONDS").unwrap_or(60)),
            reconcile_grace: Duration::from_secs(
                parse_u64("RECONCILE_GRACE_MINUTES").unwrap_or(10) * 60,
            ),
            reconcile_page_size: parse_i64("RECONCILE_PAGE_SIZE").unwrap_or(1_000),
            reconcile_crons: env::var("RECONCILE_CRONS")
                .map(|value| {
                    value
                        .split(';')
                        .map(|part| part.trim().to_string())
                        .filter(|part| !part.is_empty())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_else(|_| vec!["0 */30 * * * *".to_string()]),
            account_item_spacing: Duration::from_secs(
                parse_u64("ACCOUNT_ITEM_SPACING_SECONDS").unwrap_or(60),
            ),
            account_page_limit: parse_u64("ACCOUNT_PAGE_LIMIT").unwrap_or(10) as usize,
        };

        let digest = DigestConfig {
            refresh_interval: Duration::from_secs(parse_u64("DIGEST_REFRESH_SECONDS").unwrap_or(60)),
            renewal_window: Duration::from_secs(
                parse_u64("DIGEST_RENEWAL_HOURS").unwrap_or(24) * 3_600,
            ),
            edit_window: Duration::from_secs(
                parse_u64("DIGEST_EDIT_WINDOW_HOURS").unwrap_or(48) * 3_600,
            ),
            claim_poll: Duration::from_millis(parse_u64("DIGEST_CLAIM_POLL_MS").unwrap_or(1_000)),
            queue_preview: parse_i64("DIGEST_QUEUE_PREVIEW").unwrap_or(5),
            processed_preview: parse_i64("DIGEST_PROCESSED_PREVIEW").unwrap_or(5),
        };

        let downloader = connector_config(
            secrets.read("configuration/downloader-api"),
            "DOWNLOADER_API_BASE_URL",
        )?;
        let uploader = connector_config(
            secrets.read("configuration/uploader-api"),
            "UPLOADER_API_BASE_URL",
        )?;

        Ok(Self {
            telegram_bot_token,
            allowed_user_ids,
            timezone,
            directories,
            logging,
            queue,
            digest,
            downloader,
            uploader,
        })
    }
}

fn connector_config(
    secrets: HashMap<String, String>,
    base_url_var: &'static str,
) -> Result<ConnectorConfig, ConfigError> {
    let enabled = secrets
        .get("enabled")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);
    let base_url = secrets.get("base_url").cloned().unwrap_or_default();
    if enabled && base_url.is_empty() {
        return Err(ConfigError::Missing(base_url_var));
    }
    let token = secrets.get("token").cloned().filter(|v| !v.is_empty());
    Ok(ConnectorConfig {
        enabled,
        base_url,
        token,
    })
}

fn parse_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse::<u64>().ok())
}

fn parse_i64(key: &str) -> Option<i64> {
    env::var(key).ok().and_then(|value| value.parse::<i64>().ok())
}
