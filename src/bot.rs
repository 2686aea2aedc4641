use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use teloxide::dispatching::HandlerExt;
use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode};
use teloxide::update_listeners::Polling;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info};

use crate::config::Config;

/// Long-poll timeout for the command listener
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// A buffered upload, shared by every recipient of one push
#[derive(Debug, Clone)]
pub struct Document {
    pub data: Bytes,
    pub file_name: String,
    pub mime: Option<String>,
    pub caption: String,
}

/// Outbound side of the gateway. The HTTP layer only talks to this trait.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn send_text(&self, to: i64, text: &str, markdown: bool) -> Result<()>;

    async fn send_file(&self, to: i64, document: Document) -> Result<()>;

    async fn send_image(&self, to: i64, image: Bytes, caption: &str) -> Result<()>;
}

/// Telegram Bot API client
#[derive(Clone)]
pub struct TelegramBot {
    bot: Bot,
}

impl TelegramBot {
    /// Build the client against the configured API endpoint and verify the
    /// token with `getMe`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let bot = Bot::new(&config.bot_api_token).set_api_url(config.bot_api_url()?);

        let me = bot
            .get_me()
            .await
            .context("Failed to authenticate against the Telegram Bot API")?;
        info!("Telegram bot @{} ({}) ready", me.username(), me.id);

        Ok(Self { bot })
    }

    /// Serve the `/id` command until the process exits.
    pub async fn run_id_listener(self) {
        let handler = Update::filter_message()
            .filter_command::<Command>()
            .endpoint(answer_command);

        let listener = Polling::builder(self.bot.clone())
            .timeout(POLL_TIMEOUT)
            .build();

        info!("Starting /id command listener...");

        Dispatcher::builder(self.bot, handler)
            .default_handler(|upd| async move {
                debug!("Unhandled update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("bot"))
            .build()
            .dispatch_with_listener(
                listener,
                LoggingErrorHandler::with_custom_text("update listener"),
            )
            .await;
    }
}

#[async_trait]
impl Pusher for TelegramBot {
    #[allow(deprecated)]
    async fn send_text(&self, to: i64, text: &str, markdown: bool) -> Result<()> {
        let mut req = self.bot.send_message(ChatId(to), text);
        if markdown {
            // Legacy Markdown: senders are not expected to escape MarkdownV2
            req = req.parse_mode(ParseMode::Markdown);
        }
        req.await?;
        Ok(())
    }

    async fn send_file(&self, to: i64, document: Document) -> Result<()> {
        // The Bot API sniffs the content type itself; the declared MIME is informational
        if let Some(mime) = &document.mime {
            debug!("[file] {} declared as {}", document.file_name, mime);
        }
        let file = InputFile::memory(document.data.to_vec()).file_name(document.file_name);
        let mut req = self.bot.send_document(ChatId(to), file);
        if !document.caption.is_empty() {
            req = req.caption(document.caption);
        }
        req.await?;
        Ok(())
    }

    async fn send_image(&self, to: i64, image: Bytes, caption: &str) -> Result<()> {
        let mut req = self
            .bot
            .send_photo(ChatId(to), InputFile::memory(image.to_vec()));
        if !caption.is_empty() {
            req = req.caption(caption);
        }
        req.await?;
        Ok(())
    }
}

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
enum Command {
    #[command(description = "show your user ID, or the chat ID in groups")]
    Id,
}

/// What `/id` reports back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    User(u64),
    Chat(i64),
}

impl Identity {
    /// Private chats report the sender, everything else reports the chat.
    pub fn resolve(private: bool, sender: Option<u64>, chat_id: i64) -> Self {
        match (private, sender) {
            (true, Some(user_id)) => Identity::User(user_id),
            _ => Identity::Chat(chat_id),
        }
    }

    pub fn reply_text(&self) -> String {
        match self {
            Identity::User(id) => format!("`User ID: {}`", id),
            Identity::Chat(id) => format!("`Chat ID: {}`", id),
        }
    }
}

#[allow(deprecated)]
async fn answer_command(bot: Bot, msg: Message, cmd: Command) -> ResponseResult<()> {
    match cmd {
        Command::Id => {
            let identity = Identity::resolve(
                msg.chat.is_private(),
                msg.from.as_ref().map(|user| user.id.0),
                msg.chat.id.0,
            );
            if let Err(e) = bot
                .send_message(msg.chat.id, identity.reply_text())
                .parse_mode(ParseMode::Markdown)
                .await
            {
                error!("[bot] reply to /id in chat {} failed: {}", msg.chat.id, e);
            }
        }
    }
    Ok(())
}
