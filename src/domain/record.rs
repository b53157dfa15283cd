use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{DownloadStatus, JobState, LinkType, UnknownValue, UploadStatus};

/// Immutable snapshot of a job that reached a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRecord {
    pub id: i64,
    pub user_id: i64,
    pub post_id: String,
    pub post_url: String,
    pub post_owner: String,
    pub link_type: LinkType,
    pub message_id: i64,
    pub chat_id: i64,
    pub download_status: DownloadStatus,
    pub upload_status: UploadStatus,
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
}

/// Synchronization state of a tracked outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Added,
    Updating,
    Updated,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Added => "added",
            SyncState::Updating => "updating",
            SyncState::Updated => "updated",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "added" => Ok(SyncState::Added),
            "updating" => Ok(SyncState::Updating),
            "updated" => Ok(SyncState::Updated),
            other => Err(UnknownValue {
                kind: "sync state",
                value: other.to_string(),
            }),
        }
    }
}

/// Tracks the one live digest message per (chat, message type).
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub id: i64,
    pub message_id: i64,
    pub chat_id: i64,
    pub message_type: String,
    pub content_hash: String,
    pub producer: String,
    pub state: SyncState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
