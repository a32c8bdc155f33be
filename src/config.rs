//! Process configuration, read once from the environment at startup.
//!
//! The bot and the web callback run as separate processes sharing only the
//! database file and the token signing key, so each binary reads its own
//! subset of the `JANUS_*` variables.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    InvalidVar { var: &'static str, value: String },
}

/// How many Telegram accounts a single verified identity may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPolicy {
    /// One account per identity; a second link attempt is rejected.
    #[default]
    Single,
    /// Any number of accounts may claim the same identity.
    Multiple,
}

impl LinkPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "multiple" => Some(Self::Multiple),
            _ => None,
        }
    }

    fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("JANUS_LINK_POLICY") {
            Ok(value) => Self::parse(&value).ok_or(ConfigError::InvalidVar {
                var: "JANUS_LINK_POLICY",
                value,
            }),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Settings for the `janus-bot` binary.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_token: String,
    /// Own username, shown when pointing users at the private chat.
    pub bot_username: String,
    pub db_path: String,
    pub secret_key: String,
    /// Public base URL of the web callback, linked from the sign-in prompt.
    pub base_url: String,
    /// Invite link of the gated group, offered after a successful link.
    pub group_url: String,
    /// Institutional mail domain, e.g. `studenti.example.edu`.
    pub institution_domain: String,
    pub link_policy: LinkPolicy,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            telegram_token: required("JANUS_TELEGRAM_TOKEN")?,
            bot_username: required("JANUS_BOT_USERNAME")?,
            db_path: db_path_or_default(),
            secret_key: required("JANUS_SECRET_KEY")?,
            base_url: required("JANUS_BASE_URL")?,
            group_url: required("JANUS_GROUP_URL")?,
            institution_domain: required("JANUS_INSTITUTION_DOMAIN")?,
            link_policy: LinkPolicy::from_env()?,
        })
    }
}

/// Settings for the `janus-web` binary.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub db_path: String,
    pub secret_key: String,
    pub port: u16,
    /// Public base URL of this process; the OIDC redirect URI is derived
    /// from it.
    pub base_url: String,
    /// Bot username for the final `t.me/<bot>?start=<token>` hop.
    pub bot_username: String,
    pub institution_domain: String,
    pub link_policy: LinkPolicy,
    pub oidc: OidcConfig,
}

impl WebConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("JANUS_PORT") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidVar {
                var: "JANUS_PORT",
                value,
            })?,
            Err(_) => 8000,
        };
        Ok(Self {
            db_path: db_path_or_default(),
            secret_key: required("JANUS_SECRET_KEY")?,
            port,
            base_url: required("JANUS_BASE_URL")?,
            bot_username: required("JANUS_BOT_USERNAME")?,
            institution_domain: required("JANUS_INSTITUTION_DOMAIN")?,
            link_policy: LinkPolicy::from_env()?,
            oidc: OidcConfig::from_env()?,
        })
    }
}

/// OpenID Connect relying-party credentials.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Issuer base URL; discovery is fetched from
    /// `<issuer>/.well-known/openid-configuration`.
    pub issuer: String,
}

impl OidcConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            client_id: required("JANUS_OIDC_CLIENT_ID")?,
            client_secret: required("JANUS_OIDC_CLIENT_SECRET")?,
            issuer: required("JANUS_OIDC_ISSUER")?,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn db_path_or_default() -> String {
    std::env::var("JANUS_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.janus-gate/janus.db")
    })
}
