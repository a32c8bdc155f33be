//! `janus-bot` - long-polling dialog bot and join gate.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use janus_gate::config::BotConfig;
use janus_gate::db::Database;
use janus_gate::dispatcher::Dispatcher;
use janus_gate::engine::ScriptConfig;
use janus_gate::telegram::BotApi;

/// Updates buffered between the poller and the dispatcher.
const EVENT_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    janus_gate::init_tracing();

    // Configuration
    let config = BotConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    let api = Arc::new(BotApi::new(&config.telegram_token));

    // The token must belong to the account the deep links point at.
    let profile = api.get_me().await?;
    if profile.username.as_deref() != Some(config.bot_username.as_str()) {
        tracing::warn!(
            configured = %config.bot_username,
            actual = ?profile.username,
            "JANUS_BOT_USERNAME does not match the token's account"
        );
    }
    tracing::info!(id = profile.id, name = %profile.first_name, "Bot identified");

    let script_config = ScriptConfig::new(&config);
    let mut dispatcher = Dispatcher::new(db, Arc::clone(&api), script_config);

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    let cancel = CancellationToken::new();

    let poller = {
        let api = Arc::clone(&api);
        let cancel = cancel.clone();
        tokio::spawn(async move { api.poll_updates(events_tx, cancel).await })
    };

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => dispatcher.dispatch(event).await,
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutting down");
                cancel.cancel();
                break;
            }
        }
    }

    poller.await?;
    Ok(())
}
