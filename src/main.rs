//! hybridex server binary

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hybridex::api::create_engine_router;
use hybridex::command::{server, Protocol};
use hybridex::config::{AppConfig, LogFormat};
use hybridex::runtime::{self, Settings};
use hybridex::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config)?;

    let runtime = runtime::init(Settings::from(&config));
    let engine = Engine::new(runtime);
    engine.start_background();
    tracing::info!(
        workers = config.workers.threads,
        gc_enabled = config.gc.enabled,
        "Engine started"
    );

    let protocol = Protocol::from_version(u64::from(config.server.protocol)).unwrap_or_default();
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    let http = if config.server.http_port == 0 {
        tracing::info!("HTTP surface disabled via configuration (http_port = 0)");
        None
    } else {
        let http_addr = format!("{}:{}", config.server.host, config.server.http_port);
        let http_listener = TcpListener::bind(&http_addr)
            .await
            .with_context(|| format!("failed to bind to {}", http_addr))?;
        tracing::info!(addr = %http_addr, "Listening for HTTP traffic");
        let router = create_engine_router(engine.clone());
        Some(tokio::spawn(async move {
            axum::serve(http_listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
        }))
    };

    server::serve(engine.clone(), listener, protocol, shutdown_signal()).await?;

    if let Some(http) = http {
        http.await.context("HTTP server task panicked")??;
    }
    engine.shutdown();
    runtime::teardown();
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("hybridex=info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}
