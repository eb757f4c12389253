//! This crate implements an HTTP server answering with the next upcoming event of an iCalendar feed.
//!
//! Send `POST /ics/next-event` with a JSON body `{"icsUrl": "<feed url>", "tz": "<zone>"}`.

mod cli;
mod config;
mod error;
mod rate_limit;
mod route;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{prelude::*, reload, EnvFilter, Registry};

use crate::{
    cli::Arguments,
    config::{AppConfig, ConfigLoader, Settings, SCHEMA},
    route::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arguments::parse();
    let settings = Settings::from_env();
    let debug = args.debug || settings.debug;
    let log_filter = init_logging(debug)?;
    let mut loader = ConfigLoader::new(settings.clone(), SCHEMA, vec![args.config.clone()]);
    let mut config: AppConfig = loader.load()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    config.debug |= debug;
    if config.debug && !debug {
        log_filter.reload(log_level(true))?;
    }
    info!(
        environment = settings.environment(),
        files = ?loader.loaded_files(),
        "configuration loaded"
    );
    match args.command {
        Some(command) => cli::run(command, &config).await,
        None => serve(config, loader).await,
    }
}

/// Log to stdout, the returned handle switches the level once the configuration is known.
fn init_logging(debug: bool) -> Result<reload::Handle<EnvFilter, Registry>> {
    let (filter, handle) = reload::Layer::new(log_level(debug));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(handle)
}

/// `RUST_LOG` overrides the default level.
fn log_level(debug: bool) -> EnvFilter {
    let default_filter = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

async fn serve(config: AppConfig, loader: ConfigLoader) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let reload = config.reload.clone();
    let (sender, receiver) = watch::channel(Arc::new(config));
    if reload.enabled {
        tokio::spawn(config::watch_changes(
            loader,
            sender,
            Duration::from_secs(reload.interval_secs.max(1)),
        ));
    }
    info!(app = %receiver.borrow().app_name, %addr, "listening");
    let app = route::router(AppState::new(receiver));
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
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
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use std::env;

    use tracing::Level;

    use crate::{init_logging, log_level};

    #[test]
    fn test_debug_level_after_configuration() {
        env::remove_var("RUST_LOG");
        let log_filter = init_logging(false).unwrap();
        assert!(!tracing::enabled!(Level::DEBUG));
        log_filter.reload(log_level(true)).unwrap();
        assert!(tracing::enabled!(Level::DEBUG));
    }
}
