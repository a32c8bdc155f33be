//! Janus Gate - institutional identity gate for Telegram groups
//!
//! Links OAuth-verified institutional identities to Telegram accounts and
//! gates group membership on that link. Two binaries share this library:
//! `janus-bot` (long-polling dialog bot and join gate) and `janus-web`
//! (OIDC sign-in callback plus a read-only lookup API).

pub mod config;
pub mod db;
pub mod deeplink;
pub mod dispatcher;
pub mod engine;
pub mod oidc;
pub mod telegram;
pub mod web;

#[cfg(test)]
pub mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize JSON logging for a binary. Honors `RUST_LOG` when set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "janus_gate=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();
}
