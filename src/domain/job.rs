use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a stored string does not map onto a lifecycle enum.
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Processing,
    Processed,
    Error,
    NotSupported,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Processing => "processing",
            JobState::Processed => "processed",
            JobState::Error => "error",
            JobState::NotSupported => "not_supported",
        }
    }

    /// Terminal states move the row from the queue into the processed table.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Processed | JobState::NotSupported)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(JobState::Waiting),
            "processing" => Ok(JobState::Processing),
            "processed" => Ok(JobState::Processed),
            "error" => Ok(JobState::Error),
            "not_supported" => Ok(JobState::NotSupported),
            other => Err(UnknownValue {
                kind: "job state",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome of the download step for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    NotStarted,
    Completed,
    SourceNotFound,
    NotSupported,
    DownloadError,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::NotStarted => "not_started",
            DownloadStatus::Completed => "completed",
            DownloadStatus::SourceNotFound => "source_not_found",
            DownloadStatus::NotSupported => "not_supported",
            DownloadStatus::DownloadError => "download_error",
        }
    }

    /// A terminal download status is never fetched again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::SourceNotFound | DownloadStatus::NotSupported
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_started" => Ok(DownloadStatus::NotStarted),
            "completed" => Ok(DownloadStatus::Completed),
            "source_not_found" => Ok(DownloadStatus::SourceNotFound),
            "not_supported" => Ok(DownloadStatus::NotSupported),
            "download_error" => Ok(DownloadStatus::DownloadError),
            other => Err(UnknownValue {
                kind: "download status",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome of the upload step for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    NotStarted,
    Completed,
    UploadError,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::NotStarted => "not_started",
            UploadStatus::Completed => "completed",
            UploadStatus::UploadError => "upload_error",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_started" => Ok(UploadStatus::NotStarted),
            "completed" => Ok(UploadStatus::Completed),
            "upload_error" => Ok(UploadStatus::UploadError),
            other => Err(UnknownValue {
                kind: "upload status",
                value: other.to_string(),
            }),
        }
    }
}

/// What kind of link produced the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    Post,
    Account,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Post => "post",
            LinkType::Account => "account",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "post" => Ok(LinkType::Post),
            "account" => Ok(LinkType::Account),
            other => Err(UnknownValue {
                kind: "link type",
                value: other.to_string(),
            }),
        }
    }
}

/// A fetch-and-relay request accepted from the chat layer.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: i64,
    pub post_id: String,
    pub post_url: String,
    pub post_owner: String,
    pub link_type: LinkType,
    pub message_id: i64,
    pub chat_id: i64,
    pub scheduled_time: DateTime<Utc>,
}

/// A job row as stored in the queue table.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub post_id: String,
    pub post_url: String,
    pub post_owner: String,
    pub link_type: LinkType,
    pub message_id: i64,
    pub chat_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub download_status: DownloadStatus,
    pub upload_status: UploadStatus,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
