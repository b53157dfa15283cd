use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures surfaced by the queue store and its state machine.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("post {post_id} for user {user_id} is already queued or processed")]
    DuplicateRequest { post_id: String, user_id: i64 },

    #[error("scheduled time {requested} is not in the future")]
    ScheduleNotInFuture { requested: DateTime<Utc> },

    #[error("post {0} not found in queue")]
    NotFound(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// Failures raised by the external collaborators (downloader, uploader,
/// messaging client). The scheduler's dispatch table consumes these as
/// transient: the job moves to an error state and is retried on every
/// subsequent due cycle.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response from {endpoint}: {detail}")]
    UnexpectedResponse { endpoint: String, detail: String },

    #[error("telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
}
