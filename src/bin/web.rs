//! `janus-web` - OIDC sign-in callback and lookup API server.

use std::net::SocketAddr;
use std::path::PathBuf;

use tower_http::trace::TraceLayer;

use janus_gate::config::WebConfig;
use janus_gate::db::Database;
use janus_gate::oidc::OidcClient;
use janus_gate::web::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    janus_gate::init_tracing();

    // Configuration
    let config = WebConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    // Discover the provider endpoints once, up front.
    let redirect_uri = format!("{}/authorize", config.base_url.trim_end_matches('/'));
    let oidc = OidcClient::discover(config.oidc.clone(), redirect_uri).await?;

    let port = config.port;
    let state = AppState::new(db, oidc, config);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Janus web server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
