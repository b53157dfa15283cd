use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode};

use crate::error::CollaboratorError;

use super::Messenger;

/// Telegram-backed messenger. All digest messages are HTML-formatted.
#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, chat_id: i64, text: &str) -> Result<i64, CollaboratorError> {
        let message = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(i64::from(message.id.0))
    }

    async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), CollaboratorError> {
        self.bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }

    async fn delete(&self, chat_id: i64, message_id: i64) -> Result<(), CollaboratorError> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await?;
        Ok(())
    }
}
