//! Telegram boundary: incoming event types, the outbound transport trait,
//! and the Bot API client with its long-polling update loop.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Seconds a `getUpdates` call is allowed to hold the connection open.
const LONG_POLL_SECS: u64 = 50;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Telegram API error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Incoming events
// ============================================================================

/// The user behind a message or a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

/// A text message addressed to a chat the bot can see.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub is_private: bool,
    pub text: String,
    pub sender: Sender,
}

/// Everything the bot reacts to. Update kinds without a variant here are
/// dropped at this boundary and never reach a conversation.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(IncomingMessage),
    MemberJoined { chat_id: i64, user: Sender },
}

// ============================================================================
// Outbound transport
// ============================================================================

/// Outbound chat operations, mockable for conversation tests.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send an HTML message. `keyboard` rows become a one-time reply
    /// keyboard; `None` clears any keyboard left from an earlier message.
    async fn send(
        &self,
        chat_id: i64,
        html: &str,
        keyboard: Option<&[Vec<String>]>,
    ) -> Result<(), TransportError>;

    /// Remove a user from a group without leaving a permanent ban behind.
    async fn remove_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn send(
        &self,
        chat_id: i64,
        html: &str,
        keyboard: Option<&[Vec<String>]>,
    ) -> Result<(), TransportError> {
        (**self).send(chat_id, html, keyboard).await
    }

    async fn remove_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        (**self).remove_member(chat_id, user_id).await
    }
}

// ============================================================================
// Bot API client
// ============================================================================

/// Thin client over `https://api.telegram.org/bot<token>`.
pub struct BotApi {
    client: Client,
    base_url: String,
}

impl BotApi {
    pub fn new(token: &str) -> Self {
        // The overall timeout must outlast a full long-poll cycle.
        let client = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 20))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: format!("https://api.telegram.org/bot{token}"),
        }
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        payload: &impl Serialize,
    ) -> Result<R, TransportError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(payload)
            .send()
            .await?;

        let envelope: ApiEnvelope<R> = response.json().await?;
        if envelope.ok {
            envelope.result.ok_or(TransportError::Api {
                code: 0,
                description: "ok response without result".to_string(),
            })
        } else {
            Err(TransportError::Api {
                code: envelope.error_code.unwrap_or(0),
                description: envelope
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }

    /// Identify the bot account. Startup sanity check.
    pub async fn get_me(&self) -> Result<BotProfile, TransportError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        self.call(
            "getUpdates",
            &serde_json::json!({
                "offset": offset,
                "timeout": LONG_POLL_SECS,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    /// Long-poll for updates and translate them into [`ChatEvent`]s until
    /// cancelled or the receiver is dropped. Updates queued server-side
    /// while the bot was down are delivered on the first call.
    pub async fn poll_updates(&self, events: mpsc::Sender<ChatEvent>, cancel: CancellationToken) {
        let mut offset: i64 = 0;
        loop {
            let batch = tokio::select! {
                () = cancel.cancelled() => break,
                batch = self.get_updates(offset) => batch,
            };

            let updates = match batch {
                Ok(updates) => updates,
                Err(err) => {
                    tracing::warn!(error = %err, "getUpdates failed, backing off");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                    continue;
                }
            };

            for update in updates {
                // Advance past every update, including the ones that do not
                // translate, so they are never redelivered.
                offset = offset.max(update.update_id + 1);
                for event in translate_update(update) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChatTransport for BotApi {
    async fn send(
        &self,
        chat_id: i64,
        html: &str,
        keyboard: Option<&[Vec<String>]>,
    ) -> Result<(), TransportError> {
        let reply_markup = match keyboard {
            Some(rows) => ReplyMarkup::keyboard(rows),
            None => ReplyMarkup::Remove {
                remove_keyboard: true,
            },
        };
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                &SendMessagePayload {
                    chat_id,
                    text: html,
                    parse_mode: "HTML",
                    disable_web_page_preview: true,
                    reply_markup,
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                "banChatMember",
                &serde_json::json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        // Lift the ban straight away: the user is out of the group but free
        // to rejoin once verified.
        let _: serde_json::Value = self
            .call(
                "unbanChatMember",
                &serde_json::json!({ "chat_id": chat_id, "user_id": user_id, "only_if_banned": true }),
            )
            .await?;
        Ok(())
    }
}

fn translate_update(update: Update) -> Vec<ChatEvent> {
    let Some(message) = update.message else {
        return Vec::new();
    };
    let chat_id = message.chat.id;

    if !message.new_chat_members.is_empty() {
        return message
            .new_chat_members
            .into_iter()
            .map(|user| ChatEvent::MemberJoined {
                chat_id,
                user: user.into_sender(),
            })
            .collect();
    }

    match (message.text, message.from) {
        (Some(text), Some(from)) => vec![ChatEvent::Message(IncomingMessage {
            chat_id,
            is_private: message.chat.kind == "private",
            text,
            sender: from.into_sender(),
        })],
        // Stickers, photos, edits and the like.
        _ => Vec::new(),
    }
}

// ============================================================================
// Wire types
// ============================================================================

// `serde(default)` on the generic field would put a `T: Default` bound on
// the derived impl; a missing `Option` field decodes to `None` anyway.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

/// The bot's own account, as reported by `getMe`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotProfile {
    pub id: i64,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    chat: WireChat,
    #[serde(default)]
    from: Option<WireUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    new_chat_members: Vec<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: i64,
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl WireUser {
    fn into_sender(self) -> Sender {
        Sender {
            id: self.id,
            first_name: self.first_name,
            last_name: self.last_name,
            username: self.username,
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
    reply_markup: ReplyMarkup,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ReplyMarkup {
    Keyboard {
        keyboard: Vec<Vec<KeyboardButton>>,
        one_time_keyboard: bool,
        resize_keyboard: bool,
    },
    Remove {
        remove_keyboard: bool,
    },
}

impl ReplyMarkup {
    fn keyboard(rows: &[Vec<String>]) -> Self {
        ReplyMarkup::Keyboard {
            keyboard: rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|text| KeyboardButton { text: text.clone() })
                        .collect()
                })
                .collect(),
            one_time_keyboard: true,
            resize_keyboard: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct KeyboardButton {
    text: String,
}
