pub mod job;
pub mod record;

pub use job::{DownloadStatus, Job, JobState, LinkType, NewJob, UploadStatus};
pub use record::{ProcessedRecord, StatusRecord, SyncState};
