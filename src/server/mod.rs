//! HTTP front end for the range interception layer.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::signal;

use crate::config::Config;
use crate::streaming::{router, HttpPassThrough, RangeBroker, RangeInterceptor};

/// Build the router and start the broker that feeds it.
///
/// Must be called from within a tokio runtime.
pub fn create_app(config: &Config) -> Router {
    let pass_through = Arc::new(HttpPassThrough::new(config.intercept.upstream.clone()));
    let (interceptor, needed) = RangeInterceptor::new(config.intercept.clone(), pass_through);

    RangeBroker::for_source(interceptor.clone(), config.intercept.source.as_deref()).spawn(needed);

    router(interceptor)
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let app = create_app(&config);

    tracing::info!(
        source = config.intercept.source.as_deref().unwrap_or("."),
        upstream = config.intercept.upstream.as_deref().unwrap_or("none"),
        "Starting server on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
