//! Dialog scripts: the conversations the bot can hold.
//!
//! Each variant of [`Step`] is a point a script can resume from, carrying
//! the arguments that point needs. Running a step either finishes the
//! dialog, hands the current message to another step, or suspends on a
//! [`Challenge`].

use regex::Regex;

use crate::config::{BotConfig, LinkPolicy};
use crate::db::{escape_html, Account, DbError, Student};
use crate::deeplink::{TokenCodec, OP_REGISTER};
use crate::telegram::{ChatTransport, IncomingMessage};

use super::{Challenge, Dialog, ScriptError, StepOutcome};

const CONFIRM_NO: &str = "❌ No.";
const CONFIRM_YES: &str = "✅ Yes!";
const PRIVACY_HIDE: &str = "👤 Hide.";
const PRIVACY_SHOW: &str = "📱 Show!";

const NO_STUDENT_FOUND: &str = "⚠️ No student found.";

/// Static configuration every script segment reads.
#[derive(Clone)]
pub struct ScriptConfig {
    /// Own username, shown when pointing users at the private chat.
    pub bot_username: String,
    pub base_url: String,
    pub group_url: String,
    pub institution_domain: String,
    pub link_policy: LinkPolicy,
    pub codec: TokenCodec,
    identity_key: Regex,
}

impl ScriptConfig {
    pub fn new(cfg: &BotConfig) -> Self {
        Self {
            bot_username: cfg.bot_username.clone(),
            base_url: cfg.base_url.clone(),
            group_url: cfg.group_url.clone(),
            institution_domain: cfg.institution_domain.clone(),
            link_policy: cfg.link_policy,
            codec: TokenCodec::new(&cfg.secret_key),
            identity_key: identity_key_pattern(&cfg.institution_domain),
        }
    }
}

/// Matches a bare numeric identity key, or the full institutional address.
fn identity_key_pattern(domain: &str) -> Regex {
    Regex::new(&format!(r"^([0-9]+)(?:@{})?$", regex::escape(domain)))
        .expect("escaped domain always yields a valid pattern")
}

/// Continuation of a dialog script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Classify the first message of a fresh dialog.
    Root,
    /// `/start`, possibly carrying a deep-link payload.
    Start,
    /// Point an unverified user at the sign-in page.
    Greeting,
    /// Decode and dispatch a deep-link token.
    DeepLink { payload: String },
    /// Ask the user to confirm the identity the token names.
    Register { email_prefix: String },
    /// Handle the yes/no answer of the identity confirmation.
    ConfirmIdentity { email_prefix: String },
    /// Handle the privacy answer and write the link.
    ChoosePrivacy { email_prefix: String },
    /// `/settings`: re-ask the privacy question.
    Settings,
    /// Handle the privacy answer of `/settings`.
    SettingsPrivacy { email_prefix: String },
    /// `/whois`: classify the query and dispatch.
    Whois { query: String },
    WhoisStudent { email_prefix: String, admin: bool },
    WhoisName { name: String, admin: bool },
    WhoisHandle { username: String, admin: bool },
    WhoisAccount { account_id: i64, admin: bool },
    /// `/help`.
    Help,
}

impl<T: ChatTransport> Dialog<T> {
    pub(super) async fn run_step(
        &self,
        step: Step,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        match step {
            Step::Root => self.root(msg).await,
            Step::Start => self.start(msg).await,
            Step::Greeting => self.greeting().await,
            Step::DeepLink { payload } => self.deep_link(&payload).await,
            Step::Register { email_prefix } => self.register(&email_prefix).await,
            Step::ConfirmIdentity { email_prefix } => {
                self.confirm_identity(&email_prefix, msg).await
            }
            Step::ChoosePrivacy { email_prefix } => self.choose_privacy(&email_prefix, msg).await,
            Step::Settings => self.settings(msg).await,
            Step::SettingsPrivacy { email_prefix } => {
                self.settings_privacy(&email_prefix, msg).await
            }
            Step::Whois { query } => self.whois(&query, msg).await,
            Step::WhoisStudent { email_prefix, admin } => {
                self.whois_student(&email_prefix, admin, msg).await
            }
            Step::WhoisName { name, admin } => self.whois_name(&name, admin, msg).await,
            Step::WhoisHandle { username, admin } => {
                self.whois_handle(&username, admin, msg).await
            }
            Step::WhoisAccount { account_id, admin } => {
                self.whois_account(account_id, admin, msg).await
            }
            Step::Help => self.help(msg).await,
        }
    }

    // ==================== Entry ====================

    /// Commands match by prefix, so `/whois@botname` works too. Anything
    /// that is not a command ends the dialog without a reply.
    async fn root(&self, msg: &IncomingMessage) -> Result<StepOutcome, ScriptError> {
        let text = msg.text.as_str();

        if text.starts_with("/whois") {
            let query = text
                .split_once(' ')
                .map(|(_, rest)| rest.trim().to_string())
                .unwrap_or_default();
            return Ok(StepOutcome::Delegate(Step::Whois { query }));
        }
        if text.starts_with("/help") {
            return Ok(StepOutcome::Delegate(Step::Help));
        }
        if text.starts_with("/start") {
            if msg.is_private {
                return Ok(StepOutcome::Delegate(Step::Start));
            }
            self.say(&self.private_only_notice()).await?;
            return Ok(StepOutcome::Done);
        }
        if text.starts_with("/settings") {
            if msg.is_private {
                return Ok(StepOutcome::Delegate(Step::Settings));
            }
            self.say(&self.private_only_notice()).await?;
            return Ok(StepOutcome::Done);
        }

        Ok(StepOutcome::Done)
    }

    // ==================== Registration ====================

    async fn start(&self, msg: &IncomingMessage) -> Result<StepOutcome, ScriptError> {
        if self.session.get_account(msg.sender.id)?.is_some() {
            self.say(&format!(
                "⭐️ You have already completed identity verification.\n\n\
                 <a href=\"{}\">Click here to join the group!</a>",
                self.config.group_url
            ))
            .await?;
            return Ok(StepOutcome::Done);
        }

        match msg.text.split_once(' ') {
            None => Ok(StepOutcome::Delegate(Step::Greeting)),
            Some((_, payload)) => Ok(StepOutcome::Delegate(Step::DeepLink {
                payload: payload.to_string(),
            })),
        }
    }

    async fn greeting(&self) -> Result<StepOutcome, ScriptError> {
        self.say(&format!(
            "👋 Hi! I am the bot guarding this group.\n\n\
             To get in, you have to prove that you own a <b>{}</b> account.\n\n\
             <a href=\"{}/login\">Sign in with your institutional account here</a>, \
             then follow the button your browser offers to come back to Telegram! 😊",
            self.config.institution_domain, self.config.base_url
        ))
        .await?;
        Ok(StepOutcome::Done)
    }

    async fn deep_link(&self, payload: &str) -> Result<StepOutcome, ScriptError> {
        let parts = match self.config.codec.decode(payload) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::debug!(chat_id = self.chat_id, error = %err, "deep link rejected");
                self.say("⚠️ The data received is not valid.").await?;
                return Ok(StepOutcome::Done);
            }
        };

        match parts.as_slice() {
            [op, email_prefix] if op.as_str() == OP_REGISTER => {
                Ok(StepOutcome::Delegate(Step::Register {
                    email_prefix: email_prefix.clone(),
                }))
            }
            _ => {
                self.say("⚠️ Received an unknown opcode.").await?;
                Ok(StepOutcome::Done)
            }
        }
    }

    /// The token is authenticated, so the identity it names must exist; a
    /// miss here is a server-side fault, not user error.
    async fn register(&self, email_prefix: &str) -> Result<StepOutcome, ScriptError> {
        let student = self
            .session
            .get_student(email_prefix)?
            .ok_or_else(|| ScriptError::MissingStudent(email_prefix.to_string()))?;

        let identity = format!(
            "{} <{}>",
            student.full_name(),
            student.email(&self.config.institution_domain)
        );
        Ok(StepOutcome::Wait {
            challenge: Challenge::keyboard(
                format!("❔ You are {}, right?", escape_html(&identity)),
                vec![vec![CONFIRM_NO.to_string(), CONFIRM_YES.to_string()]],
            ),
            next: Step::ConfirmIdentity {
                email_prefix: email_prefix.to_string(),
            },
        })
    }

    async fn confirm_identity(
        &self,
        email_prefix: &str,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        if msg.text == CONFIRM_NO {
            self.say("↩️ Sign out of every account in your browser, then send /start again!")
                .await?;
            return Ok(StepOutcome::Done);
        }

        Ok(StepOutcome::Wait {
            challenge: privacy_challenge(),
            next: Step::ChoosePrivacy {
                email_prefix: email_prefix.to_string(),
            },
        })
    }

    async fn choose_privacy(
        &self,
        email_prefix: &str,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        let privacy = msg.text == PRIVACY_HIDE;

        let registered = self.session.register_account(
            msg.sender.id,
            &msg.sender.first_name,
            msg.sender.last_name.as_deref(),
            msg.sender.username.as_deref(),
            email_prefix,
            privacy,
            self.config.link_policy,
        );
        match registered {
            Ok(account) => {
                tracing::info!(
                    chat_id = self.chat_id,
                    account_id = account.id,
                    email_prefix,
                    "account linked"
                );
                self.say(&format!(
                    "✨ Identity verification complete.\n\n\
                     <a href=\"{}\">Click here to join the group!</a>",
                    self.config.group_url
                ))
                .await?;
                Ok(StepOutcome::Done)
            }
            Err(DbError::StudentAlreadyLinked(_)) => {
                self.say("⚠️ This identity is already linked to a different Telegram account.")
                    .await?;
                Ok(StepOutcome::Done)
            }
            Err(err) => Err(err.into()),
        }
    }

    // ==================== Settings ====================

    async fn settings(&self, msg: &IncomingMessage) -> Result<StepOutcome, ScriptError> {
        let Some(account) = self.session.get_account(msg.sender.id)? else {
            self.say("⚠️ You have not verified your account yet!\n\nSend /start to begin!")
                .await?;
            return Ok(StepOutcome::Done);
        };

        Ok(StepOutcome::Wait {
            challenge: privacy_challenge(),
            next: Step::SettingsPrivacy {
                email_prefix: account.student_email_prefix,
            },
        })
    }

    async fn settings_privacy(
        &self,
        email_prefix: &str,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        let privacy = msg.text == PRIVACY_HIDE;
        self.session.set_student_privacy(email_prefix, privacy)?;

        if privacy {
            self.say("👤 Your data is now hidden.").await?;
        } else {
            self.say("📱 Your data is now visible through the /whois command!")
                .await?;
        }
        Ok(StepOutcome::Done)
    }

    // ==================== Whois ====================

    /// Queries classify in order: identity key, full name, username,
    /// numeric id. Unclassifiable input gets the usage message.
    async fn whois(&self, query: &str, msg: &IncomingMessage) -> Result<StepOutcome, ScriptError> {
        let Some(requester) = self.session.get_account(msg.sender.id)? else {
            self.say("⚠️ You are not verified, so you cannot look up other users' data.")
                .await?;
            return Ok(StepOutcome::Done);
        };
        let admin = requester.is_admin;

        if let Some(captures) = self.config.identity_key.captures(query) {
            return Ok(StepOutcome::Delegate(Step::WhoisStudent {
                email_prefix: captures[1].to_string(),
                admin,
            }));
        }
        if query.contains(' ') {
            return Ok(StepOutcome::Delegate(Step::WhoisName {
                name: query.to_string(),
                admin,
            }));
        }
        if let Some(username) = query.strip_prefix('@') {
            return Ok(StepOutcome::Delegate(Step::WhoisHandle {
                username: username.to_string(),
                admin,
            }));
        }
        if let Some(raw_id) = query.strip_prefix("tg:") {
            return match raw_id.parse::<i64>() {
                Ok(account_id) => Ok(StepOutcome::Delegate(Step::WhoisAccount {
                    account_id,
                    admin,
                })),
                Err(_) => {
                    self.say("⚠️ The Telegram id you specified does not seem to be valid.")
                        .await?;
                    Ok(StepOutcome::Done)
                }
            };
        }

        self.say(&format!(
            "⚠️ You must tell me who to look up.\n\n\
             You can search by first and last name, by username, by Telegram id or by email:\n\
             <code>/whois Mario Rossi</code>\n\
             <code>/whois @mrossi</code>\n\
             <code>/whois tg:25167391</code>\n\
             <code>/whois 123456@{}</code>",
            self.config.institution_domain
        ))
        .await?;
        Ok(StepOutcome::Done)
    }

    async fn whois_student(
        &self,
        email_prefix: &str,
        admin: bool,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        let Some(student) = self.session.get_student(email_prefix)? else {
            self.say(NO_STUDENT_FOUND).await?;
            return Ok(StepOutcome::Done);
        };

        let card = self.render_card(&student, admin, msg.is_private)?;
        self.say(&card).await?;
        Ok(StepOutcome::Done)
    }

    async fn whois_name(
        &self,
        name: &str,
        admin: bool,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        let students = self.session.students_by_name(name)?;
        if students.is_empty() {
            self.say(NO_STUDENT_FOUND).await?;
            return Ok(StepOutcome::Done);
        }

        let mut cards = Vec::with_capacity(students.len());
        for student in &students {
            cards.push(self.render_card(student, admin, msg.is_private)?);
        }
        self.say(&cards.join("\n\n")).await?;
        Ok(StepOutcome::Done)
    }

    async fn whois_handle(
        &self,
        username: &str,
        admin: bool,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        let Some(account) = self.session.get_account_by_username(username)? else {
            self.say(NO_STUDENT_FOUND).await?;
            return Ok(StepOutcome::Done);
        };
        self.whois_linked_student(&account, admin, msg).await
    }

    async fn whois_account(
        &self,
        account_id: i64,
        admin: bool,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        let Some(account) = self.session.get_account(account_id)? else {
            self.say(NO_STUDENT_FOUND).await?;
            return Ok(StepOutcome::Done);
        };
        self.whois_linked_student(&account, admin, msg).await
    }

    async fn whois_linked_student(
        &self,
        account: &Account,
        admin: bool,
        msg: &IncomingMessage,
    ) -> Result<StepOutcome, ScriptError> {
        // Accounts reference their student with a foreign key, so the row
        // must be there.
        let student = self
            .session
            .get_student(&account.student_email_prefix)?
            .ok_or_else(|| ScriptError::MissingStudent(account.student_email_prefix.clone()))?;

        let card = self.render_card(&student, admin, msg.is_private)?;
        self.say(&card).await?;
        Ok(StepOutcome::Done)
    }

    /// Administrators asking in private see the full card, privacy flag or
    /// not. Everyone else gets the privacy-honoring rendering.
    fn render_card(
        &self,
        student: &Student,
        admin: bool,
        is_private: bool,
    ) -> Result<String, ScriptError> {
        let accounts = self.session.accounts_for_student(&student.email_prefix)?;
        let domain = &self.config.institution_domain;
        Ok(if admin && is_private {
            student.whois_full(domain, &accounts)
        } else {
            student.whois(domain, &accounts)
        })
    }

    // ==================== Help ====================

    async fn help(&self, msg: &IncomingMessage) -> Result<StepOutcome, ScriptError> {
        let mut text = format!(
            "ℹ️ @{} is the gatekeeper bot of this group.\n\n\
             It verifies that every member owns an institutional account by having \
             them sign in through \
             <a href=\"https://en.wikipedia.org/wiki/OpenID_Connect\">OpenID Connect</a>.\n\n\
             <b>Available commands:</b>\n\
             - /help | Information about the bot\n\
             - /whois | Look up a verified student",
            self.config.bot_username
        );
        if msg.is_private {
            text.push_str(
                "\n- /start | Begin identity verification\
                 \n- /settings | Change your privacy settings",
            );
        } else {
            text.push_str("\n\n<i>More commands are available in a private chat with the bot!</i>");
        }
        self.say(&text).await?;
        Ok(StepOutcome::Done)
    }

    // ==================== Helpers ====================

    async fn say(&self, html: &str) -> Result<(), ScriptError> {
        self.transport.send(self.chat_id, html, None).await?;
        Ok(())
    }

    fn private_only_notice(&self) -> String {
        format!(
            "⚠️ This command only works in private chats (@{}).",
            self.config.bot_username
        )
    }
}

/// The privacy question, shared by registration and `/settings`.
fn privacy_challenge() -> Challenge {
    Challenge::keyboard(
        "📝 Do you want to allow other verified students to associate your <b>real name</b> \
         and your <b>institutional email</b> with your <b>Telegram account</b>?\n\n\
         (Group administrators will see them anyway, and you can change your mind at any \
         time with the /settings command.)",
        vec![vec![PRIVACY_HIDE.to_string(), PRIVACY_SHOW.to_string()]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_pattern() {
        let re = identity_key_pattern("studenti.example.edu");

        assert_eq!(&re.captures("123456").unwrap()[1], "123456");
        assert_eq!(&re.captures("123456@studenti.example.edu").unwrap()[1], "123456");

        assert!(re.captures("mario.rossi").is_none());
        assert!(re.captures("123456@elsewhere.edu").is_none());
        assert!(re.captures("123456@studentiXexample.edu").is_none());
        assert!(re.captures("").is_none());
        assert!(re.captures("12 34").is_none());
    }
}
