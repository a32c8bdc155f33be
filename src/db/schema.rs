//! Database schema and record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS students (
    email_prefix TEXT PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    privacy BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT,
    username TEXT,
    is_admin BOOLEAN NOT NULL DEFAULT 0,
    student_email_prefix TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (student_email_prefix)
        REFERENCES students(email_prefix) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_accounts_student ON accounts(student_email_prefix);
CREATE INDEX IF NOT EXISTS idx_accounts_username ON accounts(username);

CREATE TABLE IF NOT EXISTS api_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token TEXT NOT NULL UNIQUE,
    owner_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (owner_id) REFERENCES accounts(id) ON DELETE CASCADE
);
"#;

/// A verified institutional identity, written by the web callback on every
/// successful sign-in. The `privacy` flag controls whether other verified
/// users may see the identity behind an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub email_prefix: String,
    pub first_name: String,
    pub last_name: String,
    pub privacy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    /// Full institutional address for the given mail domain.
    pub fn email(&self, domain: &str) -> String {
        format!("{}@{domain}", self.email_prefix)
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Whois card respecting the privacy flag.
    pub fn whois(&self, domain: &str, accounts: &[Account]) -> String {
        if self.privacy {
            "👤 The student is verified, but chose to keep their account details private."
                .to_string()
        } else {
            self.whois_full(domain, accounts)
        }
    }

    /// Whois card with every detail, regardless of the privacy flag. Shown
    /// only to admins in private chats.
    pub fn whois_full(&self, domain: &str, accounts: &[Account]) -> String {
        let emoji = if self.privacy { "👤" } else { "🎓" };
        // The prefix comes from provider claims, so the address gets the
        // same escaping as the name.
        let mut rows = vec![
            format!("{emoji} <b>{}</b>", escape_html(&self.full_name())),
            escape_html(&self.email(domain)),
            String::new(),
        ];
        for account in accounts {
            rows.push(account.mini_line());
            rows.push(String::new());
        }
        rows.join("\n")
    }
}

/// A Telegram account linked to a [`Student`], created by the registration
/// script after explicit confirmation. Profile fields are a snapshot taken
/// at link time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub is_admin: bool,
    pub student_email_prefix: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Display name in Telegram's first-then-optional-last convention.
    pub fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {last}", self.first_name),
            None => self.first_name.clone(),
        }
    }

    /// Inline mention that resolves even for users without a username.
    pub fn name_mention(&self) -> String {
        format!(
            r#"<a href="tg://user?id={}">{}</a>"#,
            self.id,
            escape_html(&self.display_name())
        )
    }

    pub fn at_mention(&self) -> Option<String> {
        self.username.as_ref().map(|u| format!("@{u}"))
    }

    /// One line of a whois card.
    pub fn mini_line(&self) -> String {
        match self.at_mention() {
            Some(at) => format!("📱 {} ({at})", self.name_mention()),
            None => format!("📱 {}", self.name_mention()),
        }
    }
}

/// A bearer token granting access to the read-only lookup API. Minted
/// out-of-band by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: i64,
    pub token: String,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Escape user-controlled text for interpolation into Telegram HTML or
/// web pages.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
