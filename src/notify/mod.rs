//! Outbound messages that are not replies: cron job results, reminders and
//! heartbeat summaries.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::{debug, info};

use crate::config::{NotifyConfig, NotifyProvider, TelegramConfig};

const SLACK_API: &str = "https://slack.com/api";

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends `text` to `destination`, or to the configured default target.
    async fn send(&self, text: &str, destination: Option<&str>) -> Result<()>;
}

/// Drops everything. Used when notifications are switched off.
#[derive(Debug, Default, Clone)]
pub struct DisabledSender;

#[async_trait]
impl MessageSender for DisabledSender {
    async fn send(&self, text: &str, _destination: Option<&str>) -> Result<()> {
        debug!("Notifications disabled, dropping {} chars", text.len());
        Ok(())
    }
}

pub struct TelegramSender {
    bot: Bot,
    default_chat: Option<ChatId>,
}

impl TelegramSender {
    pub fn new(bot: Bot, default_chat: Option<i64>) -> Self {
        Self {
            bot,
            default_chat: default_chat.map(ChatId),
        }
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, text: &str, destination: Option<&str>) -> Result<()> {
        let chat_id = match destination {
            Some(dest) => ChatId(
                dest.trim()
                    .parse::<i64>()
                    .with_context(|| format!("Invalid Telegram chat id: {}", dest))?,
            ),
            None => self
                .default_chat
                .ok_or_else(|| anyhow!("Missing chat id (notify.default_chat_id)"))?,
        };
        self.bot.send_message(chat_id, text).await?;
        info!(chat = chat_id.0, "Sent notification");
        Ok(())
    }
}

pub struct SlackSender {
    client: reqwest::Client,
    token: String,
    default_target: Option<String>,
}

fn is_slack_channel(target: &str) -> bool {
    target.starts_with('C') || target.starts_with('G') || target.starts_with('D')
}

fn is_slack_user(target: &str) -> bool {
    target.starts_with('U') || target.starts_with('W')
}

impl SlackSender {
    pub fn new(token: String, default_target: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            default_target,
        }
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let response: Value = self
            .client
            .post(format!("{}/{}", SLACK_API, method))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Slack {} request failed", method))?
            .json()
            .await?;
        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("Slack API error ({}): {}", method, error);
        }
        Ok(response)
    }

    async fn resolve_channel(&self, target: &str) -> Result<String> {
        if is_slack_channel(target) {
            return Ok(target.to_string());
        }
        if !is_slack_user(target) {
            bail!("Slack target must be a channel id or a user id: {}", target);
        }
        let opened = self
            .call("conversations.open", json!({ "users": target }))
            .await
            .context("Slack DM open failed")?;
        opened
            .pointer("/channel/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Slack conversations.open returned no channel"))
    }
}

#[async_trait]
impl MessageSender for SlackSender {
    async fn send(&self, text: &str, destination: Option<&str>) -> Result<()> {
        if self.token.is_empty() {
            bail!("Missing Slack token (notify.slack_token)");
        }
        let target = destination
            .map(str::to_string)
            .or_else(|| self.default_target.clone())
            .ok_or_else(|| anyhow!("Missing Slack target (notify.slack_default_target)"))?;
        let channel = self.resolve_channel(&target).await?;
        self.call("chat.postMessage", json!({ "channel": channel, "text": text }))
            .await?;
        info!(channel = %channel, "Sent notification");
        Ok(())
    }
}

/// Builds the sender selected in the `notify` section.
pub fn from_config(notify: &NotifyConfig, telegram: &TelegramConfig) -> Result<Arc<dyn MessageSender>> {
    match notify.provider {
        NotifyProvider::None => Ok(Arc::new(DisabledSender)),
        NotifyProvider::Telegram => {
            if !telegram.has_token() {
                bail!("Telegram notifications require telegram.token");
            }
            Ok(Arc::new(TelegramSender::new(
                Bot::new(telegram.token.clone()),
                notify.default_chat_id,
            )))
        }
        NotifyProvider::Slack => Ok(Arc::new(SlackSender::new(
            notify.slack_token.clone(),
            notify.slack_default_target.clone(),
        ))),
    }
}
