use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use authgate::build_state;
use authgate::core::auth::{SessionManager, app_router};
use authgate::core::clock::SystemClock;
use authgate::core::config::{AuthConfig, ServerConfig};
use authgate::core::db::{
    CredentialStore, DbConfig, IdentityRepository, MemoryCredentialStore, MemorySessionStore,
    SessionRepository, SessionStore, connect, health_check,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file (if exists)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let auth_config = AuthConfig::from_env()?;
    let server_config = ServerConfig::from_env();

    // Log config status (without revealing secrets)
    tracing::info!(
        "Config loaded: database={}, issuer={}, access_ttl={}s, refresh_ttl={}s, rotation={}",
        server_config.has_database(),
        auth_config.issuer,
        auth_config.access_token_ttl_secs,
        auth_config.refresh_token_ttl_secs,
        auth_config.rotate_refresh_tokens
    );

    let (credentials, sessions): (Arc<dyn CredentialStore>, Arc<dyn SessionStore>) =
        match &server_config.database_url {
            Some(url) => {
                let pool = connect(&DbConfig::new(url.clone())).await?;
                health_check(&pool).await?;
                tracing::info!("Database connection established");
                (
                    Arc::new(IdentityRepository::new(pool.clone())),
                    Arc::new(SessionRepository::new(pool)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory storage");
                (
                    Arc::new(MemoryCredentialStore::new()),
                    Arc::new(MemorySessionStore::new()),
                )
            }
        };

    let state = build_state(&auth_config, credentials, sessions, Arc::new(SystemClock));

    spawn_session_sweep(
        Arc::clone(&state.sessions),
        Duration::from_secs(server_config.session_sweep_interval_secs.max(1)),
    );

    let app = app_router(state, Router::new()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(&server_config.bind_addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// Periodically delete expired sessions
fn spawn_session_sweep(manager: Arc<SessionManager>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = manager.purge_expired_sessions().await {
                tracing::warn!("Session sweep failed: {}", e);
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
