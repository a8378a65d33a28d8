use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info};

use treekv::{Config, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let metrics_addr: SocketAddr = config
        .metrics_listen_addr()
        .parse()
        .expect("invalid metrics listen address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("failed to install Prometheus exporter");

    metrics::describe_gauge!("treekv_clients_connected", "Number of connected clients");
    metrics::describe_gauge!("treekv_stores", "Number of named stores");
    metrics::describe_counter!("treekv_frames_total", "Request frames received");
    metrics::describe_counter!("treekv_commands_total", "Commands dispatched, per command");
    metrics::describe_histogram!(
        "treekv_command_duration_seconds",
        "Command processing latency in seconds"
    );

    let server = Arc::new(Server::new());
    if let Err(e) = server.start_server(&config, None).await {
        error!(error = %e, "failed to start server");
        std::process::exit(1);
    }

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received SIGINT, shutting down");
    }

    if let Err(e) = server.stop_server() {
        error!(error = %e, "failed to stop server");
    }
    server.wait_for_termination().await;
    info!("finished serving requests");
}
