//! Mock implementations for testing
//!
//! These enable conversation and dispatcher tests without a live chat
//! service.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::config::{BotConfig, LinkPolicy, OidcConfig, WebConfig};
use crate::telegram::{ChatTransport, IncomingMessage, Sender, TransportError};

// ============================================================================
// Recording Transport
// ============================================================================

/// Chat transport that records every call instead of hitting the network.
#[derive(Default)]
pub struct RecordingTransport {
    /// (chat id, html text, keyboard rows) per send, in order.
    sent: Mutex<Vec<(i64, String, Option<Vec<Vec<String>>>)>>,
    /// (chat id, user id) per removal, in order.
    removed: Mutex<Vec<(i64, i64)>>,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sends(&self) -> Vec<(i64, String, Option<Vec<Vec<String>>>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Just the message texts, in send order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text, _)| text.clone())
            .collect()
    }

    /// The keyboard attached to the most recent send, if any.
    pub fn last_keyboard(&self) -> Option<Vec<Vec<String>>> {
        self.sent.lock().unwrap().last().and_then(|(_, _, kb)| kb.clone())
    }

    pub fn removals(&self) -> Vec<(i64, i64)> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(
        &self,
        chat_id: i64,
        html: &str,
        keyboard: Option<&[Vec<String>]>,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id, html.to_string(), keyboard.map(<[_]>::to_vec)));
        Ok(())
    }

    async fn remove_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.removed.lock().unwrap().push((chat_id, user_id));
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Bot configuration with fixed test values.
pub fn bot_config() -> BotConfig {
    BotConfig {
        telegram_token: "12345:TESTTOKEN".to_string(),
        bot_username: "janus_gate_bot".to_string(),
        db_path: ":memory:".to_string(),
        secret_key: "test-secret-key".to_string(),
        base_url: "https://gate.example.edu".to_string(),
        group_url: "https://t.me/+AAAAAAAAAAAAAAAA".to_string(),
        institution_domain: "studenti.example.edu".to_string(),
        link_policy: LinkPolicy::Single,
    }
}

/// Web configuration matching [`bot_config`], so that tokens minted on one
/// side verify on the other.
pub fn web_config() -> WebConfig {
    WebConfig {
        db_path: ":memory:".to_string(),
        secret_key: "test-secret-key".to_string(),
        port: 8000,
        base_url: "https://gate.example.edu".to_string(),
        bot_username: "janus_gate_bot".to_string(),
        institution_domain: "studenti.example.edu".to_string(),
        link_policy: LinkPolicy::Single,
        oidc: OidcConfig {
            client_id: "janus-client".to_string(),
            client_secret: "shhh".to_string(),
            issuer: "https://accounts.example.com".to_string(),
        },
    }
}

pub fn sender(id: i64) -> Sender {
    Sender {
        id,
        first_name: "Mario".to_string(),
        last_name: Some("Rossi".to_string()),
        username: Some("mrossi".to_string()),
    }
}

/// A message in the sender's own private chat with the bot.
pub fn private_message(sender_id: i64, text: &str) -> IncomingMessage {
    IncomingMessage {
        chat_id: sender_id,
        is_private: true,
        text: text.to_string(),
        sender: sender(sender_id),
    }
}

pub fn group_message(chat_id: i64, sender_id: i64, text: &str) -> IncomingMessage {
    IncomingMessage {
        chat_id,
        is_private: false,
        text: text.to_string(),
        sender: sender(sender_id),
    }
}
