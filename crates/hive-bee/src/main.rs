//! Hive Bee binary
//!
//! A worker node of the Hive matrix fabric.

use std::sync::Arc;

use hive_bee::{BeeConfig, BeeNode, Error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hive_bee=info,hive=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Hive Bee v{}", hive_bee::config::HIVE_VERSION);

    let config = BeeConfig::from_env()?;
    let node = BeeNode::new(config);

    tokio::spawn(shutdown_on_signal(Arc::clone(&node)));

    match node.run().await {
        Ok(()) => Ok(()),
        Err(Error::ControllerLost) => {
            tracing::error!("Controller lost, exiting");
            Err(Error::ControllerLost.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Shut the node down on every SIGINT/SIGTERM; repeats are harmless.
async fn shutdown_on_signal(node: Arc<BeeNode>) {
    loop {
        wait_for_signal().await;
        tracing::info!("Signal received");
        node.shutdown().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot watch SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Cannot watch SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot watch SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
}
