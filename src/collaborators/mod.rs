use async_trait::async_trait;

use crate::domain::{DownloadStatus, UploadStatus};
use crate::error::CollaboratorError;

pub mod downloader;
pub mod messenger;
pub mod secrets;
pub mod uploader;

pub use downloader::{HttpDownloader, StubDownloader};
pub use messenger::TelegramMessenger;
pub use secrets::{EnvSecrets, SecretsProvider};
pub use uploader::{HttpUploader, StubUploader};

/// Result of fetching one piece of content. Terminal source outcomes
/// (gone, unsupported) are successful fetches carrying that status; an
/// `Err` means a transient failure worth retrying.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: DownloadStatus,
    pub owner: Option<String>,
}

/// A page of item identifiers from an account listing.
#[derive(Debug, Clone)]
pub struct AccountPage {
    pub items: Vec<String>,
    pub cursor: Option<String>,
}

/// Fetches content from the supplier into the staging area.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, post_id: &str) -> Result<FetchOutcome, CollaboratorError>;

    async fn list_account_items(
        &self,
        account: &str,
        cursor: Option<&str>,
    ) -> Result<AccountPage, CollaboratorError>;
}

/// Relays staged content to the destination storage.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn relay(&self, subdirectory: &str) -> Result<UploadStatus, CollaboratorError>;
}

/// The outbound messaging client consumed by the digest synchronizer.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends a message and returns its identifier.
    async fn send(&self, chat_id: i64, text: &str) -> Result<i64, CollaboratorError>;

    async fn edit(&self, chat_id: i64, message_id: i64, text: &str)
        -> Result<(), CollaboratorError>;

    async fn delete(&self, chat_id: i64, message_id: i64) -> Result<(), CollaboratorError>;
}
