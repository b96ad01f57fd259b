use std::net::SocketAddr;
use std::sync::Arc;

use indicator_engine::config::{EngineConfig, LoggingConfig};
use indicator_engine::delivery::ChannelTransport;
use indicator_engine::server::{create_router, AppState};
use indicator_engine::{Collaborators, Engine, SERVICE_VERSION};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = EngineConfig::from_env()?;
    init_tracing(&config.logging);

    tracing::info!(version = SERVICE_VERSION, "Starting indicator engine");

    let addr: SocketAddr = config.server.addr.parse()?;
    let transport = Arc::new(ChannelTransport::new());
    let engine = Engine::start(config, Collaborators::in_memory(transport.clone()))?;

    let app = create_router(AppState::new(Arc::clone(&engine), transport));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown();
    Ok(())
}
