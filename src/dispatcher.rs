//! Routes chat events to per-chat conversations.
//!
//! Every chat gets its own worker task fed through a bounded channel, so a
//! slow conversation never stalls the others. The worker owns the chat's
//! [`Dialog`] across messages and exits once its conversation closes; the
//! dispatcher sweeps finished workers out of its table and runs the join
//! gate.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::db::Database;
use crate::engine::{Dialog, Flow, ScriptConfig, ScriptError};
use crate::telegram::{ChatEvent, ChatTransport, IncomingMessage, Sender};

const FAULT_NOTICE: &str = "☢️ A critical error occurred and the conversation has been \
                            cancelled.\n\nThe error has been saved in the server logs.";

/// Queue depth per chat. A full queue backpressures the update loop.
const CHAT_QUEUE: usize = 16;

pub struct Dispatcher<T> {
    db: Database,
    transport: T,
    config: ScriptConfig,
    chats: HashMap<i64, ChatWorker>,
}

struct ChatWorker {
    tx: mpsc::Sender<IncomingMessage>,
}

impl<T: ChatTransport + Clone + 'static> Dispatcher<T> {
    pub fn new(db: Database, transport: T, config: ScriptConfig) -> Self {
        Self {
            db,
            transport,
            config,
            chats: HashMap::new(),
        }
    }

    pub async fn dispatch(&mut self, event: ChatEvent) {
        // Workers exit once their conversation closes or faults, leaving a
        // closed channel behind; sweep those entries so the table only
        // holds live chats.
        self.chats.retain(|_, worker| !worker.tx.is_closed());

        match event {
            ChatEvent::Message(msg) => self.route_message(msg).await,
            ChatEvent::MemberJoined { chat_id, user } => {
                if let Err(err) = self.gate_join(chat_id, &user).await {
                    tracing::error!(chat_id, user_id = user.id, error = %err, "join gate failed");
                }
            }
        }
    }

    async fn route_message(&mut self, msg: IncomingMessage) {
        let chat_id = msg.chat_id;

        if !self.chats.contains_key(&chat_id) {
            self.chats.insert(chat_id, self.spawn_worker(chat_id));
        }

        let Some(tx) = self.chats.get(&chat_id).map(|worker| worker.tx.clone()) else {
            return;
        };
        if let Err(mpsc::error::SendError(msg)) = tx.send(msg).await {
            // The worker exited between the sweep and the send.
            let worker = self.spawn_worker(chat_id);
            if worker.tx.send(msg).await.is_err() {
                tracing::warn!(chat_id, "replacement conversation worker exited immediately");
            }
            self.chats.insert(chat_id, worker);
        }
    }

    fn spawn_worker(&self, chat_id: i64) -> ChatWorker {
        let (tx, rx) = mpsc::channel(CHAT_QUEUE);
        tokio::spawn(run_conversation(
            chat_id,
            self.db.clone(),
            self.transport.clone(),
            self.config.clone(),
            rx,
        ));
        ChatWorker { tx }
    }

    /// Membership gate: joiners without a linked account are removed, the
    /// rest get their whois card shown to the group.
    async fn gate_join(&self, chat_id: i64, user: &Sender) -> Result<(), ScriptError> {
        let Some(account) = self.db.get_account(user.id)? else {
            tracing::info!(chat_id, user_id = user.id, "removing unverified joiner");
            self.transport.remove_member(chat_id, user.id).await?;
            return Ok(());
        };

        let student = self
            .db
            .get_student(&account.student_email_prefix)?
            .ok_or_else(|| ScriptError::MissingStudent(account.student_email_prefix.clone()))?;
        let accounts = self.db.accounts_for_student(&student.email_prefix)?;
        let card = student.whois(&self.config.institution_domain, &accounts);
        self.transport.send(chat_id, &card, None).await?;
        Ok(())
    }
}

/// One chat's conversation loop. Exits once its conversation closes with
/// nothing left queued, or on a fault; the dispatcher then forgets the
/// chat and respawns on demand.
async fn run_conversation<T: ChatTransport + Clone>(
    chat_id: i64,
    db: Database,
    transport: T,
    config: ScriptConfig,
    mut rx: mpsc::Receiver<IncomingMessage>,
) {
    let mut dialog: Option<Dialog<T>> = None;

    while let Some(msg) = rx.recv().await {
        // A fresh /start outranks whatever the dialog is waiting on.
        if dialog.as_ref().is_some_and(Dialog::is_waiting) && msg.text.starts_with("/start") {
            if let Some(old) = dialog.take() {
                old.stop();
            }
        }

        let current = dialog.get_or_insert_with(|| {
            Dialog::new(transport.clone(), db.session(chat_id), config.clone())
        });

        match current.advance(&msg).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Closed) => {
                dialog = None;
                // Nothing queued: close the channel so the task can end.
                // A message racing past the emptiness check is still
                // drained by this loop; one sent after the close bounces
                // back to the dispatcher, which respawns the worker.
                if rx.is_empty() {
                    rx.close();
                }
            }
            Err(err) => {
                tracing::error!(chat_id, error = %err, "conversation fault");
                if let Err(notice_err) = transport.send(chat_id, FAULT_NOTICE, None).await {
                    tracing::warn!(chat_id, error = %notice_err, "fault notice undeliverable");
                }
                return;
            }
        }
    }
}
