use std::sync::Arc;

use teloxide::utils::command::BotCommands;

use crate::{
    collaborators::Downloader,
    config::AppConfig,
    db::{
        queue::QueueRepository,
        users::{UserRepository, STATUS_ALLOWED, STATUS_DENIED},
    },
    tasks::digest::DigestSynchronizer,
};

pub type BotResult<T> = Result<T, teloxide::RequestError>;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: UserRepository,
    pub queue: QueueRepository,
    pub downloader: Arc<dyn Downloader>,
    pub digest: Arc<DigestSynchronizer>,
}

impl AppState {
    /// Records the user on first contact and answers whether they may use
    /// the bot. Membership in the configured allow-list decides the status
    /// a new user is stored with; an existing row keeps its stored status.
    pub async fn check_access(&self, user_id: i64, chat_id: i64) -> bool {
        let allowed = self.config.allowed_user_ids.contains(&user_id);
        let status = if allowed { STATUS_ALLOWED } else { STATUS_DENIED };
        if let Err(err) = self.users.ensure(user_id, chat_id, status).await {
            tracing::error!(target: "telegram", error = %err, user_id, "failed to register user");
            return false;
        }
        match self.users.get(user_id).await {
            Ok(Some(row)) => row.status == STATUS_ALLOWED,
            Ok(None) => allowed,
            Err(err) => {
                tracing::error!(target: "telegram", error = %err, user_id, "failed to read user status");
                false
            }
        }
    }
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case", description = "Available commands:")]
pub enum GeneralCommand {
    #[command(description = "register and show the status digest")]
    Start,
    #[command(description = "show this help")]
    Help,
    #[command(description = "refresh the status digest")]
    Queue,
    #[command(description = "move a queued post: /reschedule <post_id> <rfc3339 time>")]
    Reschedule(String),
}
