//! wfcoord — measurement-campaign coordinator.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use wfcoord::config::{Args, Config};
use wfcoord::http;
use wfcoord::state::Coordinator;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wfcoord=info".parse().expect("static directive parses")),
        )
        .init();

    let args = Args::parse();
    let config = match Config::resolve(args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("wfcoord v{} starting", VERSION);
    info!(
        "datadir: {} | samples per cell: {} | visits per connection: {}",
        config.datadir.display(),
        config.samples,
        config.visits
    );

    let addr = format!("{}:{}", config.host, config.port);
    let coordinator = match Coordinator::bootstrap(config).await {
        Ok(coordinator) => Arc::new(coordinator),
        Err(e) => {
            error!("Bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    // Heartbeat so long campaigns leave a trail in the logs even when no
    // worker is reporting.
    let progress = coordinator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let experiment = progress.experiment.lock().await;
            let report = experiment.status();
            info!(
                "Status: {}/{} samples | {} open cells | {} unique clients",
                report.total_collected,
                report.total_to_collect,
                experiment.matrix().open_len(),
                report.unique_clients.len()
            );
        }
    });

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Coordinator listening on {}", addr);

    let app = http::router(coordinator);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
    info!("Shutting down");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
