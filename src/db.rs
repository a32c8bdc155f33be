//! SQLite persistence shared by the bot and the web callback.
//!
//! Stores verified identities, their linked Telegram accounts, and the
//! bearer tokens for the lookup API.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::LinkPolicy;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Student not found: {0}")]
    StudentNotFound(String),
    #[error("Student already linked to an account: {0}")]
    StudentAlreadyLinked(String),
    #[error("Account not found: {0}")]
    AccountNotFound(i64),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Hand out the exclusive storage handle for one conversation.
    pub fn session(&self, chat_id: i64) -> Session {
        tracing::debug!(chat_id, "session opened");
        Session {
            db: self.clone(),
            chat_id,
        }
    }

    // ==================== Student Operations ====================

    /// Insert an identity on its first authentication, or refresh its name
    /// fields on a later one. The privacy flag and `created_at` survive
    /// re-authentication.
    pub fn upsert_student(
        &self,
        email_prefix: &str,
        first_name: &str,
        last_name: &str,
    ) -> DbResult<Student> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO students (email_prefix, first_name, last_name, privacy, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT(email_prefix) DO UPDATE SET
                 first_name = ?2, last_name = ?3, updated_at = ?4",
            params![email_prefix, first_name, last_name, now.to_rfc3339()],
        )?;

        let student = conn.query_row(
            "SELECT email_prefix, first_name, last_name, privacy, created_at, updated_at
             FROM students WHERE email_prefix = ?1",
            params![email_prefix],
            |row| {
                Ok(Student {
                    email_prefix: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    privacy: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                    updated_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            },
        )?;
        Ok(student)
    }

    /// Get a student by identity key
    pub fn get_student(&self, email_prefix: &str) -> DbResult<Option<Student>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT email_prefix, first_name, last_name, privacy, created_at, updated_at
             FROM students WHERE email_prefix = ?1",
        )?;

        stmt.query_row(params![email_prefix], |row| {
            Ok(Student {
                email_prefix: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                privacy: row.get(3)?,
                created_at: parse_datetime(&row.get::<_, String>(4)?),
                updated_at: parse_datetime(&row.get::<_, String>(5)?),
            })
        })
        .optional()
        .map_err(DbError::from)
    }

    /// Find students whose full name matches, in either word order,
    /// case-insensitively. Distinct students can share a name.
    pub fn students_by_name(&self, name: &str) -> DbResult<Vec<Student>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT email_prefix, first_name, last_name, privacy, created_at, updated_at
             FROM students
             WHERE first_name || ' ' || last_name = ?1 COLLATE NOCASE
                OR last_name || ' ' || first_name = ?1 COLLATE NOCASE
             ORDER BY email_prefix",
        )?;

        let rows = stmt.query_map(params![name], |row| {
            Ok(Student {
                email_prefix: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                privacy: row.get(3)?,
                created_at: parse_datetime(&row.get::<_, String>(4)?),
                updated_at: parse_datetime(&row.get::<_, String>(5)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Set the privacy flag of an identity
    pub fn set_student_privacy(&self, email_prefix: &str, privacy: bool) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE students SET privacy = ?1, updated_at = ?2 WHERE email_prefix = ?3",
            params![privacy, now.to_rfc3339(), email_prefix],
        )?;

        if updated == 0 {
            return Err(DbError::StudentNotFound(email_prefix.to_string()));
        }
        Ok(())
    }

    // ==================== Account Operations ====================

    /// Get a linked account by Telegram user id
    pub fn get_account(&self, id: i64) -> DbResult<Option<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, username, is_admin, student_email_prefix, created_at
             FROM accounts WHERE id = ?1",
        )?;

        stmt.query_row(params![id], |row| {
            Ok(Account {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                username: row.get(3)?,
                is_admin: row.get(4)?,
                student_email_prefix: row.get(5)?,
                created_at: parse_datetime(&row.get::<_, String>(6)?),
            })
        })
        .optional()
        .map_err(DbError::from)
    }

    /// Get a linked account by Telegram username (without the `@`)
    pub fn get_account_by_username(&self, username: &str) -> DbResult<Option<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, username, is_admin, student_email_prefix, created_at
             FROM accounts WHERE username = ?1",
        )?;

        stmt.query_row(params![username], |row| {
            Ok(Account {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                username: row.get(3)?,
                is_admin: row.get(4)?,
                student_email_prefix: row.get(5)?,
                created_at: parse_datetime(&row.get::<_, String>(6)?),
            })
        })
        .optional()
        .map_err(DbError::from)
    }

    /// List the accounts linked to an identity
    pub fn accounts_for_student(&self, email_prefix: &str) -> DbResult<Vec<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, username, is_admin, student_email_prefix, created_at
             FROM accounts WHERE student_email_prefix = ?1 ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map(params![email_prefix], |row| {
            Ok(Account {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                username: row.get(3)?,
                is_admin: row.get(4)?,
                student_email_prefix: row.get(5)?,
                created_at: parse_datetime(&row.get::<_, String>(6)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Link a Telegram account to an identity and store the chosen privacy
    /// flag. Both writes commit in one transaction: a half-linked account
    /// must never be observable.
    #[allow(clippy::too_many_arguments)]
    pub fn register_account(
        &self,
        id: i64,
        first_name: &str,
        last_name: Option<&str>,
        username: Option<&str>,
        email_prefix: &str,
        privacy: bool,
        policy: LinkPolicy,
    ) -> DbResult<Account> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();

        if policy == LinkPolicy::Single {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM accounts WHERE student_email_prefix = ?1)",
                params![email_prefix],
                |row| row.get(0),
            )?;
            if taken {
                return Err(DbError::StudentAlreadyLinked(email_prefix.to_string()));
            }
        }

        let updated = tx.execute(
            "UPDATE students SET privacy = ?1, updated_at = ?2 WHERE email_prefix = ?3",
            params![privacy, now.to_rfc3339(), email_prefix],
        )?;
        if updated == 0 {
            return Err(DbError::StudentNotFound(email_prefix.to_string()));
        }

        tx.execute(
            "INSERT INTO accounts (id, first_name, last_name, username, is_admin, student_email_prefix, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![id, first_name, last_name, username, email_prefix, now.to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(Account {
            id,
            first_name: first_name.to_string(),
            last_name: last_name.map(String::from),
            username: username.map(String::from),
            is_admin: false,
            student_email_prefix: email_prefix.to_string(),
            created_at: now,
        })
    }

    /// Flip the moderator flag of an account. Set by operators, never by
    /// the conversation scripts.
    pub fn set_account_admin(&self, id: i64, is_admin: bool) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE accounts SET is_admin = ?1 WHERE id = ?2",
            params![is_admin, id],
        )?;
        if updated == 0 {
            return Err(DbError::AccountNotFound(id));
        }
        Ok(())
    }

    // ==================== Api Token Operations ====================

    /// Look up an API token by value
    pub fn lookup_api_token(&self, token: &str) -> DbResult<Option<ApiToken>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, token, owner_id, created_at FROM api_tokens WHERE token = ?1",
        )?;

        stmt.query_row(params![token], |row| {
            Ok(ApiToken {
                id: row.get(0)?,
                token: row.get(1)?,
                owner_id: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })
        .optional()
        .map_err(DbError::from)
    }

    /// Mint an API token for an account
    pub fn create_api_token(&self, token: &str, owner_id: i64) -> DbResult<ApiToken> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO api_tokens (token, owner_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, owner_id, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        Ok(ApiToken {
            id,
            token: token.to_string(),
            owner_id,
            created_at: now,
        })
    }
}

/// Exclusive storage handle of one conversation, exposing only the
/// operations the dialog scripts use. Dropping it is the release; ownership
/// guarantees that happens exactly once.
pub struct Session {
    db: Database,
    chat_id: i64,
}

impl Session {
    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn get_student(&self, email_prefix: &str) -> DbResult<Option<Student>> {
        self.db.get_student(email_prefix)
    }

    pub fn students_by_name(&self, name: &str) -> DbResult<Vec<Student>> {
        self.db.students_by_name(name)
    }

    pub fn set_student_privacy(&self, email_prefix: &str, privacy: bool) -> DbResult<()> {
        self.db.set_student_privacy(email_prefix, privacy)
    }

    pub fn get_account(&self, id: i64) -> DbResult<Option<Account>> {
        self.db.get_account(id)
    }

    pub fn get_account_by_username(&self, username: &str) -> DbResult<Option<Account>> {
        self.db.get_account_by_username(username)
    }

    pub fn accounts_for_student(&self, email_prefix: &str) -> DbResult<Vec<Account>> {
        self.db.accounts_for_student(email_prefix)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register_account(
        &self,
        id: i64,
        first_name: &str,
        last_name: Option<&str>,
        username: Option<&str>,
        email_prefix: &str,
        privacy: bool,
        policy: LinkPolicy,
    ) -> DbResult<Account> {
        self.db
            .register_account(id, first_name, last_name, username, email_prefix, privacy, policy)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!(chat_id = self.chat_id, "session released");
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
