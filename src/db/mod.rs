use std::{path::Path, str::FromStr, time::Duration};

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub mod queue;
pub mod status_records;
pub mod users;

pub async fn init_pool(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    prepare_schema(&pool).await?;
    Ok(pool)
}

async fn prepare_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            post_id TEXT NOT NULL,
            post_url TEXT NOT NULL,
            post_owner TEXT NOT NULL DEFAULT 'undefined',
            link_type TEXT NOT NULL DEFAULT 'post',
            message_id INTEGER NOT NULL,
            chat_id INTEGER NOT NULL,
            scheduled_time DATETIME NOT NULL,
            download_status TEXT NOT NULL DEFAULT 'not_started',
            upload_status TEXT NOT NULL DEFAULT 'not_started',
            state TEXT NOT NULL DEFAULT 'waiting',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            UNIQUE (post_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            post_id TEXT NOT NULL,
            post_url TEXT NOT NULL,
            post_owner TEXT NOT NULL,
            link_type TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            chat_id INTEGER NOT NULL,
            download_status TEXT NOT NULL,
            upload_status TEXT NOT NULL,
            state TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            UNIQUE (post_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS status_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL,
            chat_id INTEGER NOT NULL,
            message_type TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            producer TEXT NOT NULL DEFAULT 'bot',
            state TEXT NOT NULL DEFAULT 'added',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            UNIQUE (chat_id, message_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY,
            chat_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'allowed',
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    prepare_schema(&pool).await.expect("schema");
    pool
}
