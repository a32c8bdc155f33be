//! Web surface: the OIDC sign-in flow that mints deep-link tokens, plus a
//! token-gated read-only lookup API.

mod handlers;

pub use handlers::create_router;

use std::sync::Arc;

use crate::config::WebConfig;
use crate::db::Database;
use crate::deeplink::TokenCodec;
use crate::oidc::OidcClient;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub codec: TokenCodec,
    pub oidc: Arc<OidcClient>,
    pub config: Arc<WebConfig>,
}

impl AppState {
    pub fn new(db: Database, oidc: OidcClient, config: WebConfig) -> Self {
        Self {
            db,
            codec: TokenCodec::new(&config.secret_key),
            oidc: Arc::new(oidc),
            config: Arc::new(config),
        }
    }
}
