use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use storefront_api::{
    build_router, config::AppConfig, db, events, services::payment_gateway::SandboxGateway,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!(environment = %config.environment, "starting storefront-api");

    let pool = db::connect(&config)
        .await
        .context("failed to connect to database")?;

    let (event_sender, _event_task) = events::spawn_logging_consumer(1024);

    let gateway = Arc::new(SandboxGateway::new(config.payment_signature_secret.clone()));

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(
        Arc::new(pool),
        Arc::new(config),
        Arc::new(event_sender),
        gateway,
    ));

    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, router)
        .await
        .context("server error")?;

    Ok(())
}
