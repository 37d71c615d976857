use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use teloxide::{
    prelude::*,
    types::{BotCommand, ChatId, MessageId},
    utils::command::BotCommands,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chat::Conversations;
use crate::config::TelegramConfig;
use crate::progress::{ProgressNotifier, StatusSink, DEFAULT_MIN_INTERVAL};

const THINKING: &str = "Thinking...";
const BUSY: &str = "A request is already running. Use /stop to cancel it.";

const HELP: &str = "Send any message and it goes to the agent.\n\n\
/new - Start a fresh conversation\n\
/stop - Stop the running request\n\
/help - Show this message";

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    #[command(description = "Welcome message")]
    Start,
    #[command(description = "Start a fresh conversation")]
    New,
    #[command(description = "Stop the running request")]
    Stop,
    #[command(description = "Show commands")]
    Help,
}

/// Splits `text` into chunks of at most `max_len` characters.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(max_len)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Whether a Telegram user id may talk to the bot. An empty list allows nobody.
pub fn is_allowed(allowed_users: &[i64], user_id: Option<i64>) -> bool {
    user_id.is_some_and(|id| allowed_users.contains(&id))
}

/// Progress target: the "Thinking..." message, edited in place.
struct MessageStatus {
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
}

#[async_trait]
impl StatusSink for MessageStatus {
    async fn edit(&self, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(self.chat_id, self.message_id, text)
            .await?;
        Ok(())
    }
}

/// Chats with a request in flight. A chat is claimed before its run is
/// spawned and released once the answer has been delivered.
#[derive(Debug, Clone, Default)]
struct ActiveChats {
    chats: Arc<Mutex<HashSet<i64>>>,
}

impl ActiveChats {
    /// Returns `None` when the chat already has a request running.
    fn claim(&self, chat: i64) -> Option<ChatClaim> {
        let mut chats = self.chats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        chats.insert(chat).then(|| ChatClaim {
            chats: self.chats.clone(),
            chat,
        })
    }
}

struct ChatClaim {
    chats: Arc<Mutex<HashSet<i64>>>,
    chat: i64,
}

impl Drop for ChatClaim {
    fn drop(&mut self) {
        let mut chats = self.chats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        chats.remove(&self.chat);
    }
}

struct BotState {
    conversations: Conversations,
    config: TelegramConfig,
    active: ActiveChats,
}

pub struct TelegramBot {
    bot: Bot,
    state: Arc<BotState>,
}

impl TelegramBot {
    pub fn new(bot: Bot, conversations: Conversations, config: TelegramConfig) -> Self {
        Self {
            bot,
            state: Arc::new(BotState {
                conversations,
                config,
                active: ActiveChats::default(),
            }),
        }
    }

    /// Serves updates until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.bot
            .set_my_commands(vec![
                BotCommand::new("new", "Start a fresh conversation"),
                BotCommand::new("stop", "Stop the running request"),
                BotCommand::new("help", "Show commands"),
            ])
            .await?;

        if self.state.config.allowed_users.is_empty() {
            warn!("telegram.allowed_users is empty; every message will be refused");
        }
        info!("Telegram bot is ready, waiting for messages");

        let handler = Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(handle_command),
            )
            .branch(dptree::endpoint(handle_message));

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![self.state.clone()])
            .build();

        let token = dispatcher.shutdown_token();
        let watcher = tokio::spawn(async move {
            shutdown.cancelled().await;
            match token.shutdown() {
                Ok(done) => done.await,
                Err(e) => warn!("Telegram dispatcher was not running: {}", e),
            }
        });

        dispatcher.dispatch().await;
        watcher.abort();
        self.state.conversations.registry().stop_prefix("");
        info!("Telegram bot stopped");
        Ok(())
    }
}

fn sender_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

async fn refuse(bot: &Bot, msg: &Message) -> ResponseResult<()> {
    warn!(user = ?sender_id(msg), chat = msg.chat.id.0, "Refused message from unlisted user");
    bot.send_message(msg.chat.id, "Not authorized.").await?;
    Ok(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    if !is_allowed(&state.config.allowed_users, sender_id(&msg)) {
        return refuse(&bot, &msg).await;
    }
    let chat_id = msg.chat.id;
    let key = chat_id.0.to_string();

    let response = match cmd {
        Command::Start => format!("Hi! I relay your messages to the agent.\n\n{}", HELP),
        Command::Help => HELP.to_string(),
        Command::New => {
            state.conversations.stop(&key);
            match state.conversations.reset(&key).await {
                Ok(()) => "Started a new conversation.".to_string(),
                Err(e) => format!("Error: {:#}", e),
            }
        }
        Command::Stop => {
            if state.conversations.stop(&key) {
                "Stopping the current request.".to_string()
            } else {
                "Nothing is running.".to_string()
            }
        }
    };

    bot.send_message(chat_id, response).await?;
    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };
    if !is_allowed(&state.config.allowed_users, sender_id(&msg)) {
        return refuse(&bot, &msg).await;
    }

    let chat_id = msg.chat.id;
    info!(chat = chat_id.0, "Message received: {}", text.chars().take(80).collect::<String>());
    let Some(claim) = state.active.claim(chat_id.0) else {
        info!(chat = chat_id.0, "Request already running, message refused");
        bot.send_message(chat_id, BUSY).await?;
        return Ok(());
    };
    let thinking = bot.send_message(chat_id, THINKING).await?;

    // The dispatcher processes a chat's updates in order, so the run goes to
    // its own task and a later /stop is handled while it is in flight.
    tokio::spawn(async move {
        let _claim = claim;
        if let Err(e) = answer(&bot, &state, chat_id, thinking.id, &text).await {
            error!(chat = chat_id.0, "Failed to deliver answer: {}", e);
        }
    });
    Ok(())
}

async fn answer(
    bot: &Bot,
    state: &BotState,
    chat_id: ChatId,
    status_id: MessageId,
    text: &str,
) -> ResponseResult<()> {
    let progress = state.config.progress.then(|| {
        ProgressNotifier::spawn(
            Arc::new(MessageStatus {
                bot: bot.clone(),
                chat_id,
                message_id: status_id,
            }),
            DEFAULT_MIN_INTERVAL,
        )
    });

    let key = chat_id.0.to_string();
    let reply = match state.conversations.submit(&key, text, progress).await {
        Ok(reply) => reply.answer,
        Err(e) => {
            warn!(chat = chat_id.0, "Agent run failed: {:#}", e);
            format!("Error: {:#}", e)
        }
    };

    let mut chunks = split_text(&reply, state.config.max_message_len).into_iter();
    if let Some(first) = chunks.next() {
        if let Err(e) = bot.edit_message_text(chat_id, status_id, &first).await {
            warn!(chat = chat_id.0, "Could not edit status message: {}", e);
            bot.send_message(chat_id, first).await?;
        }
    }
    for chunk in chunks {
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}
