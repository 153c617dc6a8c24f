use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use palaver_core::auth::JwtValidator;
use palaver_core::registry::ConnectionRegistry;
use palaver_core::router::MessageRouter;
use palaver_core::AppState;
use palaver_gateway::gateway_router;
use tracing_subscriber::EnvFilter;

mod cli;
mod collaborators;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("palaver=info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;
    let gateway_config = config.gateway.to_gateway_config();

    let backend = Arc::new(collaborators::RestBackend::new(&config.backend)?);
    let registry = Arc::new(ConnectionRegistry::new(gateway_config.max_sessions_per_user));
    let router = Arc::new(MessageRouter::new(
        registry.clone(),
        backend.clone(),
        backend.clone(),
        backend.clone(),
    ));
    let state = AppState {
        registry: registry.clone(),
        router,
        auth: Arc::new(JwtValidator::new(&config.auth.jwt_secret)),
        config: gateway_config,
    };

    let app = gateway_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;

    tracing::info!(
        bind = %config.server.bind_address,
        backend = %config.backend.base_url,
        heartbeat_timeout_seconds = config.gateway.heartbeat_timeout_seconds,
        max_sessions_per_user = config.gateway.max_sessions_per_user,
        "gateway listening"
    );

    let shutdown_registry = registry;
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(
            active_sessions = shutdown_registry.active_sessions(),
            "shutting down (ctrl-c)"
        );
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}
