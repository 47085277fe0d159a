use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use cachegw_client::{Connector, MemoryConnector, RespConnector};
use cachegw_server::{http, Args, BackendKind, GatewayConfig, LifecycleManager, LifecycleState};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let backend = args.backend;
    let config = args.into_config().context("invalid configuration")?;
    match backend {
        BackendKind::Resp => serve(RespConnector::from_config(&config.pool), config).await,
        BackendKind::Memory => serve(MemoryConnector::new(), config).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn serve<C: Connector>(connector: C, config: GatewayConfig) -> Result<()> {
    let lifecycle = Arc::new(
        LifecycleManager::start(connector, &config)
            .await
            .context("gateway failed to start")?,
    );
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(listen = %config.listen, backend = %config.pool.addr(), "serving http");

    let on_signal = lifecycle.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        on_signal.shutdown().await;
    });

    // Stop accepting as soon as the lifecycle leaves Ready.
    let mut state = lifecycle.subscribe();
    let served = axum::serve(listener, http::router(lifecycle.clone(), &config.default_key))
        .with_graceful_shutdown(async move {
            let _ = state.wait_for(|state| *state != LifecycleState::Ready).await;
        })
        .await;

    lifecycle.shutdown().await;
    served.context("http server failed")
}

async fn wait_for_signal() {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
