use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use teloxide::{
    dispatching::Dispatcher,
    error_handlers::ErrorHandler,
    prelude::*,
    types::{Message, MessageId, User},
    update_listeners,
    utils::command::BotCommands,
};

use crate::{
    domain::{LinkType, NewJob},
    error::QueueError,
    infrastructure::shutdown::ShutdownListener,
};

use super::{
    types::{AppState, BotResult, GeneralCommand},
    utils::{parse_content_link, parse_reschedule_args, ParsedLink},
};

const REJECT_TEXT: &str = "You are not allowed to use this bot.";

pub struct BotService {
    bot: Bot,
    state: Arc<AppState>,
}

/// Logs polling failures from the update listener; transient network
/// errors are teloxide's to retry.
struct ListenerErrorLogger;

impl ErrorHandler<teloxide::RequestError> for ListenerErrorLogger {
    fn handle_error(self: Arc<Self>, error: teloxide::RequestError) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tracing::error!(target: "telegram", error = %error, "update listener error");
        })
    }
}

impl BotService {
    pub fn new(bot: Bot, state: Arc<AppState>) -> Self {
        Self { bot, state }
    }

    pub async fn run(&self, mut shutdown: ShutdownListener) -> Result<()> {
        self.bot
            .set_my_commands(GeneralCommand::bot_commands())
            .await?;
        let me = self.bot.get_me().await?;
        tracing::info!(
            target: "telegram",
            bot_id = me.id.0,
            username = ?me.username,
            "telegram bot connected"
        );

        let handler = Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<GeneralCommand>()
                    .endpoint(Self::on_command),
            )
            .branch(dptree::endpoint(Self::on_plain_message));

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![self.state.clone()])
            .default_handler(|update| async move {
                tracing::debug!(target: "telegram", ?update, "unhandled update");
            })
            .build();

        let listener = update_listeners::polling_default(self.bot.clone()).await;
        let shutdown_token = dispatcher.shutdown_token();
        let mut dispatcher_future =
            Box::pin(dispatcher.dispatch_with_listener(listener, Arc::new(ListenerErrorLogger)));
        let mut dispatcher_finished = false;

        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!(target: "telegram", "dispatcher shutdown requested");
                if let Ok(wait) = shutdown_token.shutdown() {
                    wait.await;
                }
            }
            _ = &mut dispatcher_future => {
                dispatcher_finished = true;
            }
        }

        if !dispatcher_finished {
            dispatcher_future.await;
        }
        Ok(())
    }

    async fn on_command(
        bot: Bot,
        msg: Message,
        cmd: GeneralCommand,
        state: Arc<AppState>,
    ) -> BotResult<()> {
        let Some(user) = msg.from.as_ref() else {
            return Ok(());
        };
        let user_id = user_to_i64(user);
        let chat_id = msg.chat.id.0;

        if !state.check_access(user_id, chat_id).await {
            bot.send_message(msg.chat.id, REJECT_TEXT).await?;
            return Ok(());
        }

        match cmd {
            GeneralCommand::Start => {
                bot.send_message(
                    msg.chat.id,
                    format!(
                        "Welcome! Send one post link per line and it will be fetched \
                         and relayed to storage.\n\n{}",
                        GeneralCommand::descriptions()
                    ),
                )
                .await?;
                Self::refresh_digest(&state, user_id, chat_id).await;
            }
            GeneralCommand::Help => {
                bot.send_message(msg.chat.id, GeneralCommand::descriptions().to_string())
                    .await?;
            }
            GeneralCommand::Queue => {
                Self::refresh_digest(&state, user_id, chat_id).await;
            }
            GeneralCommand::Reschedule(args) => {
                let reply = match parse_reschedule_args(&args) {
                    Some((post_id, new_time)) => {
                        match state
                            .queue
                            .reschedule(&post_id, user_id, new_time, Utc::now())
                            .await
                        {
                            Ok(status) => status,
                            Err(err @ QueueError::Persistence(_)) => {
                                tracing::error!(
                                    target: "telegram",
                                    error = %err,
                                    post_id = %post_id,
                                    user_id,
                                    "reschedule failed"
                                );
                                format!("{post_id}: internal error, try again later")
                            }
                            Err(err) => err.to_string(),
                        }
                    }
                    None => "usage: /reschedule <post_id> <rfc3339 time>".to_string(),
                };
                bot.send_message(msg.chat.id, reply).await?;
                Self::refresh_digest(&state, user_id, chat_id).await;
            }
        }
        Ok(())
    }

    async fn on_plain_message(bot: Bot, msg: Message, state: Arc<AppState>) -> BotResult<()> {
        if !msg.chat.is_private() {
            return Ok(());
        }
        let Some(user) = msg.from.as_ref() else {
            return Ok(());
        };
        let Some(text) = msg.text() else {
            return Ok(());
        };

        let user_id = user_to_i64(user);
        let chat_id = msg.chat.id.0;
        if !state.check_access(user_id, chat_id).await {
            bot.send_message(msg.chat.id, REJECT_TEXT).await?;
            return Ok(());
        }

        let mut replies = Vec::new();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            replies.push(Self::handle_link(&state, user_id, chat_id, msg.id, line).await);
        }
        if replies.is_empty() {
            return Ok(());
        }

        bot.send_message(msg.chat.id, replies.join("\n")).await?;
        Self::refresh_digest(&state, user_id, chat_id).await;
        Ok(())
    }

    /// Turns one inbound line into an enqueue (or an account expansion)
    /// and a per-line status string for the reply.
    async fn handle_link(
        state: &Arc<AppState>,
        user_id: i64,
        chat_id: i64,
        message_id: MessageId,
        line: &str,
    ) -> String {
        match parse_content_link(line) {
            Ok(ParsedLink::Post { post_id, url }) => {
                let job = NewJob {
                    user_id,
                    post_id: post_id.clone(),
                    post_url: url,
                    post_owner: "undefined".to_string(),
                    link_type: LinkType::Post,
                    message_id: i64::from(message_id.0),
                    chat_id,
                    scheduled_time: Utc::now(),
                };
                match state.queue.enqueue(&job).await {
                    Ok(status) => status,
                    Err(QueueError::DuplicateRequest { .. }) => {
                        format!("{post_id}: already in queue or processed")
                    }
                    Err(err) => {
                        tracing::error!(
                            target: "telegram",
                            error = %err,
                            post_id = %post_id,
                            user_id,
                            "enqueue failed"
                        );
                        format!("{post_id}: internal error, try again later")
                    }
                }
            }
            Ok(ParsedLink::Account { username, .. }) => {
                Self::expand_account(state, user_id, chat_id, message_id, &username).await
            }
            Err(err) => err.to_string(),
        }
    }

    /// Walks the account's item pages and enqueues every unseen item with a
    /// fixed spacing between scheduled times, so a large account does not
    /// land on the scheduler as one burst.
    async fn expand_account(
        state: &Arc<AppState>,
        user_id: i64,
        chat_id: i64,
        message_id: MessageId,
        username: &str,
    ) -> String {
        let spacing = Duration::from_std(state.config.queue.account_item_spacing)
            .unwrap_or_else(|_| Duration::seconds(60));
        let mut next_time = Utc::now();
        let mut cursor: Option<String> = None;
        let mut added = 0usize;
        let mut skipped = 0usize;

        for _ in 0..state.config.queue.account_page_limit {
            let page = match state
                .downloader
                .list_account_items(username, cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    tracing::error!(
                        target: "telegram",
                        error = %err,
                        account = username,
                        user_id,
                        "failed to list account items"
                    );
                    return format!("{username}: failed to list account items");
                }
            };

            for item in page.items {
                let job = NewJob {
                    user_id,
                    post_id: item.clone(),
                    post_url: format!("https://www.instagram.com/p/{item}/"),
                    post_owner: username.to_string(),
                    link_type: LinkType::Account,
                    message_id: i64::from(message_id.0),
                    chat_id,
                    scheduled_time: next_time,
                };
                match state.queue.enqueue(&job).await {
                    Ok(_) => {
                        added += 1;
                        next_time += spacing;
                    }
                    Err(QueueError::DuplicateRequest { .. }) => skipped += 1,
                    Err(err) => {
                        tracing::error!(
                            target: "telegram",
                            error = %err,
                            account = username,
                            post_id = %item,
                            user_id,
                            "enqueue failed during account expansion"
                        );
                        return format!("{username}: interrupted, {added} items queued so far");
                    }
                }
            }

            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        format!("{username}: {added} items queued, {skipped} already known")
    }

    async fn refresh_digest(state: &Arc<AppState>, user_id: i64, chat_id: i64) {
        if let Err(err) = state.digest.sync_user(user_id, chat_id).await {
            tracing::error!(
                target: "telegram",
                error = %err,
                user_id,
                chat_id,
                "digest refresh failed"
            );
        }
    }
}

fn user_to_i64(user: &User) -> i64 {
    i64::try_from(user.id.0).unwrap_or(i64::MAX)
}
