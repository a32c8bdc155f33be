//! The conversation engine: one resumable dialog per chat.
//!
//! A [`Dialog`] owns everything one chat's conversation needs: the chat's
//! storage session, the transport for replies, and the script position.
//! Messages are fed in one at a time with [`Dialog::advance`]; between
//! messages the dialog either sits suspended on a [`Challenge`] or is
//! finished and must be discarded. Script faults surface as
//! [`ScriptError`] so the dispatcher can apply one recovery policy to all
//! of them.

mod challenge;
mod script;

pub use challenge::Challenge;
pub use script::{ScriptConfig, Step};

use thiserror::Error;

use crate::db::{DbError, Session};
use crate::telegram::{ChatTransport, IncomingMessage, TransportError};

/// A fault inside a running script. The dialog that raised one is no
/// longer usable.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Storage error: {0}")]
    Db(#[from] DbError),
    #[error("Chat transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No student on record for identity key {0}")]
    MissingStudent(String),
}

/// What a dialog settles into after one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Suspended; feed it the next message.
    Continue,
    /// Ran to completion; discard it.
    Closed,
}

/// What running one script step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The script finished.
    Done,
    /// Continue in another step, which sees the same message.
    Delegate(Step),
    /// Present `challenge` and suspend; resume in `next` once a reply
    /// satisfies it.
    Wait { challenge: Challenge, next: Step },
}

/// One live conversation.
pub struct Dialog<T: ChatTransport> {
    chat_id: i64,
    transport: T,
    session: Session,
    config: ScriptConfig,
    step: Step,
    pending: Option<Challenge>,
}

impl<T: ChatTransport> Dialog<T> {
    pub fn new(transport: T, session: Session, config: ScriptConfig) -> Self {
        Self {
            chat_id: session.chat_id(),
            transport,
            session,
            config,
            step: Step::Root,
            pending: None,
        }
    }

    /// True while the dialog sits suspended on a challenge.
    pub fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one message to the dialog.
    ///
    /// A reply that fails the pending challenge re-presents the challenge
    /// and changes nothing else. An accepted reply resumes the script,
    /// which runs until it suspends again or finishes.
    pub async fn advance(&mut self, msg: &IncomingMessage) -> Result<Flow, ScriptError> {
        if let Some(challenge) = &self.pending {
            if !challenge.accepts(&msg.text) {
                tracing::debug!(chat_id = self.chat_id, "reply outside offered choices");
                challenge.present(&self.transport, self.chat_id).await?;
                return Ok(Flow::Continue);
            }
            self.pending = None;
        }

        let mut step = std::mem::replace(&mut self.step, Step::Root);
        loop {
            match self.run_step(step, msg).await? {
                StepOutcome::Done => return Ok(Flow::Closed),
                StepOutcome::Delegate(next) => step = next,
                StepOutcome::Wait { challenge, next } => {
                    challenge.present(&self.transport, self.chat_id).await?;
                    self.step = next;
                    self.pending = Some(challenge);
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Abort without running the script further. Dropping the dialog
    /// releases its storage session.
    pub fn stop(self) {
        tracing::debug!(chat_id = self.chat_id, "dialog aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkPolicy;
    use crate::db::Database;
    use crate::testing::{bot_config, group_message, private_message, RecordingTransport};
    use std::sync::Arc;

    fn setup() -> (Database, Arc<RecordingTransport>, ScriptConfig) {
        (
            Database::open_in_memory().unwrap(),
            Arc::new(RecordingTransport::new()),
            ScriptConfig::new(&bot_config()),
        )
    }

    fn dialog(
        db: &Database,
        transport: &Arc<RecordingTransport>,
        config: &ScriptConfig,
        chat_id: i64,
    ) -> Dialog<Arc<RecordingTransport>> {
        Dialog::new(Arc::clone(transport), db.session(chat_id), config.clone())
    }

    /// Seed a verified student already linked to a Telegram account.
    fn seed_linked(db: &Database, prefix: &str, account_id: i64, username: &str, privacy: bool) {
        db.upsert_student(prefix, "Mario", "Rossi").unwrap();
        db.register_account(
            account_id,
            "Mario",
            Some("Rossi"),
            Some(username),
            prefix,
            privacy,
            LinkPolicy::Multiple,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_registration_start_to_finish() {
        let (db, transport, config) = setup();
        db.upsert_student("123456", "Mario", "Rossi").unwrap();
        let token = config.codec.encode(&["R", "123456"]).unwrap();

        let mut dlg = dialog(&db, &transport, &config, 42);

        let flow = dlg
            .advance(&private_message(42, &format!("/start {token}")))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(dlg.is_waiting());
        let texts = transport.sent_texts();
        assert!(texts[0].contains("You are Mario Rossi"));
        assert!(texts[0].contains("123456@studenti.example.edu"));
        assert_eq!(
            transport.last_keyboard(),
            Some(vec![vec!["❌ No.".to_string(), "✅ Yes!".to_string()]])
        );

        let flow = dlg.advance(&private_message(42, "✅ Yes!")).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            transport.last_keyboard(),
            Some(vec![vec!["👤 Hide.".to_string(), "📱 Show!".to_string()]])
        );

        let flow = dlg.advance(&private_message(42, "📱 Show!")).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("Identity verification complete"));

        let account = db.get_account(42).unwrap().unwrap();
        assert_eq!(account.student_email_prefix, "123456");
        assert_eq!(account.username.as_deref(), Some("mrossi"));
        assert!(!db.get_student("123456").unwrap().unwrap().privacy);
    }

    #[tokio::test]
    async fn test_registration_declined_identity() {
        let (db, transport, config) = setup();
        db.upsert_student("123456", "Mario", "Rossi").unwrap();
        let token = config.codec.encode(&["R", "123456"]).unwrap();

        let mut dlg = dialog(&db, &transport, &config, 42);
        dlg.advance(&private_message(42, &format!("/start {token}")))
            .await
            .unwrap();

        let flow = dlg.advance(&private_message(42, "❌ No.")).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("Sign out of every account"));
        assert!(db.get_account(42).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlisted_reply_represents_challenge() {
        let (db, transport, config) = setup();
        db.upsert_student("123456", "Mario", "Rossi").unwrap();
        let token = config.codec.encode(&["R", "123456"]).unwrap();

        let mut dlg = dialog(&db, &transport, &config, 42);
        dlg.advance(&private_message(42, &format!("/start {token}")))
            .await
            .unwrap();

        let flow = dlg.advance(&private_message(42, "maybe")).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(dlg.is_waiting());

        // Same question, same keyboard, nothing else.
        let texts = transport.sent_texts();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], texts[1]);
        assert!(transport.last_keyboard().is_some());

        // A listed reply still resumes the script afterwards.
        let flow = dlg.advance(&private_message(42, "✅ Yes!")).await.unwrap();
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn test_already_verified_short_circuit() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);
        let token = config.codec.encode(&["R", "123456"]).unwrap();

        // Even a valid token does not restart verification.
        let mut dlg = dialog(&db, &transport, &config, 42);
        let flow = dlg
            .advance(&private_message(42, &format!("/start {token}")))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("already completed identity verification"));
    }

    #[tokio::test]
    async fn test_start_without_payload_sends_greeting() {
        let (db, transport, config) = setup();
        let mut dlg = dialog(&db, &transport, &config, 42);

        let flow = dlg.advance(&private_message(42, "/start")).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        let texts = transport.sent_texts();
        assert!(texts[0].contains("https://gate.example.edu/login"));
    }

    #[tokio::test]
    async fn test_tampered_token_is_refused() {
        let (db, transport, config) = setup();
        let mut dlg = dialog(&db, &transport, &config, 42);

        let flow = dlg
            .advance(&private_message(42, "/start notarealtoken"))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("The data received is not valid"));
    }

    #[tokio::test]
    async fn test_unknown_opcode_is_refused() {
        let (db, transport, config) = setup();
        let token = config.codec.encode(&["X", "123456"]).unwrap();

        let mut dlg = dialog(&db, &transport, &config, 42);
        let flow = dlg
            .advance(&private_message(42, &format!("/start {token}")))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("unknown opcode"));
    }

    #[tokio::test]
    async fn test_token_for_missing_student_is_a_fault() {
        let (db, transport, config) = setup();
        let token = config.codec.encode(&["R", "999999"]).unwrap();

        let mut dlg = dialog(&db, &transport, &config, 42);
        let err = dlg
            .advance(&private_message(42, &format!("/start {token}")))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::MissingStudent(key) if key == "999999"));
        assert!(transport.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_start_refused_outside_private_chats() {
        let (db, transport, config) = setup();
        let mut dlg = dialog(&db, &transport, &config, -100200);

        let flow = dlg
            .advance(&group_message(-100200, 42, "/start"))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Closed);
        let sends = transport.sends();
        assert_eq!(sends[0].0, -100200);
        assert!(sends[0].1.contains("only works in private chats (@janus_gate_bot)"));
    }

    #[tokio::test]
    async fn test_plain_chatter_is_ignored() {
        let (db, transport, config) = setup();
        let mut dlg = dialog(&db, &transport, &config, 42);

        let flow = dlg
            .advance(&private_message(42, "hello there"))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_settings_flips_privacy_both_ways() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);

        let mut dlg = dialog(&db, &transport, &config, 42);
        let flow = dlg.advance(&private_message(42, "/settings")).await.unwrap();
        assert_eq!(flow, Flow::Continue);

        let flow = dlg.advance(&private_message(42, "👤 Hide.")).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport.sent_texts().last().unwrap().contains("now hidden"));
        assert!(db.get_student("123456").unwrap().unwrap().privacy);

        let mut dlg = dialog(&db, &transport, &config, 42);
        dlg.advance(&private_message(42, "/settings")).await.unwrap();
        let flow = dlg.advance(&private_message(42, "📱 Show!")).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport.sent_texts().last().unwrap().contains("now visible"));
        assert!(!db.get_student("123456").unwrap().unwrap().privacy);
    }

    #[tokio::test]
    async fn test_settings_same_answer_is_idempotent() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);

        // Answering with the current state twice changes nothing and still
        // reports success each time.
        for _ in 0..2 {
            let mut dlg = dialog(&db, &transport, &config, 42);
            dlg.advance(&private_message(42, "/settings")).await.unwrap();
            let flow = dlg.advance(&private_message(42, "📱 Show!")).await.unwrap();
            assert_eq!(flow, Flow::Closed);
            assert!(transport.sent_texts().last().unwrap().contains("now visible"));
            assert!(!db.get_student("123456").unwrap().unwrap().privacy);
        }
    }

    #[tokio::test]
    async fn test_settings_requires_registration() {
        let (db, transport, config) = setup();
        let mut dlg = dialog(&db, &transport, &config, 42);

        let flow = dlg.advance(&private_message(42, "/settings")).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("not verified your account yet"));
    }

    #[tokio::test]
    async fn test_whois_requires_registration() {
        let (db, transport, config) = setup();
        let mut dlg = dialog(&db, &transport, &config, 42);

        let flow = dlg
            .advance(&private_message(42, "/whois 123456"))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Closed);
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("cannot look up other users' data"));
    }

    #[tokio::test]
    async fn test_whois_by_identity_key() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);

        for query in ["/whois 123456", "/whois 123456@studenti.example.edu"] {
            let mut dlg = dialog(&db, &transport, &config, 42);
            let flow = dlg.advance(&private_message(42, query)).await.unwrap();
            assert_eq!(flow, Flow::Closed);
            let card = transport.sent_texts().last().unwrap().clone();
            assert!(card.contains("Mario Rossi"));
            assert!(card.contains("123456@studenti.example.edu"));
            assert!(card.contains("@mrossi"));
        }
    }

    #[tokio::test]
    async fn test_whois_honors_privacy_except_for_admins_in_private() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", true);
        seed_linked(&db, "654321", 43, "lverdi", false);

        // A plain member sees the placeholder.
        let mut dlg = dialog(&db, &transport, &config, 43);
        dlg.advance(&private_message(43, "/whois 123456"))
            .await
            .unwrap();
        let card = transport.sent_texts().last().unwrap().clone();
        assert!(card.contains("keep their account details private"));
        assert!(!card.contains("@mrossi"));

        // An admin asking in private sees the full card.
        db.set_account_admin(43, true).unwrap();
        let mut dlg = dialog(&db, &transport, &config, 43);
        dlg.advance(&private_message(43, "/whois 123456"))
            .await
            .unwrap();
        let card = transport.sent_texts().last().unwrap().clone();
        assert!(card.contains("Mario Rossi"));
        assert!(card.contains("@mrossi"));

        // The same admin asking in a group does not.
        let mut dlg = dialog(&db, &transport, &config, -100200);
        dlg.advance(&group_message(-100200, 43, "/whois 123456"))
            .await
            .unwrap();
        let card = transport.sent_texts().last().unwrap().clone();
        assert!(card.contains("keep their account details private"));
    }

    #[tokio::test]
    async fn test_whois_by_name_matches_either_order() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);

        for query in ["/whois Mario Rossi", "/whois rossi mario"] {
            let mut dlg = dialog(&db, &transport, &config, 42);
            dlg.advance(&private_message(42, query)).await.unwrap();
            assert!(transport
                .sent_texts()
                .last()
                .unwrap()
                .contains("123456@studenti.example.edu"));
        }
    }

    #[tokio::test]
    async fn test_whois_by_name_lists_every_match() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);
        db.upsert_student("777777", "Mario", "Rossi").unwrap();
        db.set_student_privacy("777777", false).unwrap();

        let mut dlg = dialog(&db, &transport, &config, 42);
        dlg.advance(&private_message(42, "/whois Mario Rossi"))
            .await
            .unwrap();
        let reply = transport.sent_texts().last().unwrap().clone();
        assert!(reply.contains("123456@studenti.example.edu"));
        assert!(reply.contains("777777@studenti.example.edu"));
    }

    #[tokio::test]
    async fn test_whois_by_username_and_by_telegram_id() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);

        for query in ["/whois @mrossi", "/whois tg:42"] {
            let mut dlg = dialog(&db, &transport, &config, 42);
            dlg.advance(&private_message(42, query)).await.unwrap();
            assert!(transport
                .sent_texts()
                .last()
                .unwrap()
                .contains("Mario Rossi"));
        }

        let mut dlg = dialog(&db, &transport, &config, 42);
        dlg.advance(&private_message(42, "/whois @nobody"))
            .await
            .unwrap();
        assert!(transport.sent_texts().last().unwrap().contains("No student found"));
    }

    #[tokio::test]
    async fn test_whois_rejects_malformed_telegram_id() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);

        let mut dlg = dialog(&db, &transport, &config, 42);
        dlg.advance(&private_message(42, "/whois tg:notanumber"))
            .await
            .unwrap();
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("does not seem to be valid"));
    }

    #[tokio::test]
    async fn test_whois_without_query_explains_usage() {
        let (db, transport, config) = setup();
        seed_linked(&db, "123456", 42, "mrossi", false);

        let mut dlg = dialog(&db, &transport, &config, 42);
        let flow = dlg.advance(&private_message(42, "/whois")).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        let usage = transport.sent_texts().last().unwrap().clone();
        assert!(usage.contains("/whois Mario Rossi"));
        assert!(usage.contains("/whois tg:"));
    }

    #[tokio::test]
    async fn test_help_lists_private_commands_only_in_private() {
        let (db, transport, config) = setup();

        let mut dlg = dialog(&db, &transport, &config, 42);
        dlg.advance(&private_message(42, "/help")).await.unwrap();
        let private_help = transport.sent_texts().last().unwrap().clone();
        assert!(private_help.contains("/settings"));

        let mut dlg = dialog(&db, &transport, &config, -100200);
        dlg.advance(&group_message(-100200, 42, "/help")).await.unwrap();
        let group_help = transport.sent_texts().last().unwrap().clone();
        assert!(!group_help.contains("/settings"));
        assert!(group_help.contains("private chat with the bot"));
    }

    #[tokio::test]
    async fn test_commands_match_with_bot_suffix() {
        let (db, transport, config) = setup();
        let mut dlg = dialog(&db, &transport, &config, -100200);

        dlg.advance(&group_message(-100200, 42, "/help@janus_gate_bot"))
            .await
            .unwrap();
        assert!(transport.sent_texts().last().unwrap().contains("Available commands"));
    }
}
