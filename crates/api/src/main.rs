//! Xainik payments API server

use std::net::SocketAddr;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xainik_api::{create_router, AppState, Config};
use xainik_shared::{create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,xainik_api=debug,xainik_billing=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    tracing::info!("Starting Xainik API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::debug!(?config, "Configuration loaded");

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;

    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(pool, config, http_client)?;

    let app = create_router(state).layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
