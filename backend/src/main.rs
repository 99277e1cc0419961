// =============================================================================
// GT06 INGEST — Fleet Telemetry Server (Rust/Axum/Tokio)
// =============================================================================
// Accepts raw GT06 terminal connections on a TCP listener, runs each through
// the login/data/teardown session state machine, and exposes health,
// metrics, and downlink-command endpoints over a separate HTTP listener.
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use gt06_ingest::config::Settings;
use gt06_ingest::contracts::{
    Contracts, CountingBroadcaster, InMemoryPersistence, NoopNotifier, StaticDeviceRegistry,
    SystemClock,
};
use gt06_ingest::downlink::DownlinkController;
use gt06_ingest::http::{self, AppState};
use gt06_ingest::liveness;
use gt06_ingest::metrics::Metrics;
use gt06_ingest::pipeline::IngestPipeline;
use gt06_ingest::registry::ConnectionRegistry;
use gt06_ingest::session;

/// GT06 GPS/GSM fleet telemetry ingest server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// TCP port the GT06 terminal listener binds to.
    #[arg(long)]
    port: Option<u16>,

    /// HTTP port for health/metrics/command endpoints.
    #[arg(long)]
    http_port: Option<u16>,

    /// Emit structured JSON logs instead of the human-readable format.
    #[arg(long)]
    log_json: bool,

    /// Comma-separated IMEIs to seed the in-memory device allow-list with.
    #[arg(long, value_delimiter = ',')]
    allow_imei: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(port) = cli.port {
        settings.listen_port = port;
    }
    if let Some(http_port) = cli.http_port {
        settings.http_port = http_port;
    }
    if cli.log_json {
        settings.log_json = true;
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "gt06_ingest=info,tower_http=info".into());
    if settings.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "gt06 ingest server starting");

    let registry = Arc::new(ConnectionRegistry::new());
    let metrics = Arc::new(Metrics::new());

    let device_registry = Arc::new(StaticDeviceRegistry::new(cli.allow_imei.clone()));
    if cli.allow_imei.is_empty() {
        warn!("no --allow-imei provided; every login will be rejected as unregistered");
    }

    let contracts = Contracts {
        registry: device_registry,
        persistence: Arc::new(InMemoryPersistence::new()),
        broadcaster: Arc::new(CountingBroadcaster::default()),
        notifier: Arc::new(NoopNotifier::default()),
        clock: Arc::new(SystemClock),
    };

    let pipeline = Arc::new(IngestPipeline::new(contracts.clone(), metrics.clone(), settings.clone()));
    let downlink = Arc::new(DownlinkController::new(
        registry.clone(),
        metrics.clone(),
        settings.downlink_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let liveness_task = tokio::spawn(liveness::run(registry.clone(), pipeline.clone(), shutdown_rx));

    let tcp_addr = SocketAddr::from(([0, 0, 0, 0], settings.listen_port));
    let listener = match TcpListener::bind(tcp_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%tcp_addr, error = %e, "failed to bind terminal listener");
            std::process::exit(1);
        }
    };
    info!(%tcp_addr, "terminal listener bound");

    let accept_registry = registry.clone();
    let accept_contracts = contracts.clone();
    let accept_pipeline = pipeline.clone();
    let accept_settings = Arc::new(settings.clone());
    let accept_metrics = metrics.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let registry = accept_registry.clone();
                    let contracts = accept_contracts.clone();
                    let pipeline = accept_pipeline.clone();
                    let settings = accept_settings.clone();
                    let metrics = accept_metrics.clone();
                    tokio::spawn(async move {
                        session::handle_connection(stream, remote_addr, registry, contracts, pipeline, settings, metrics)
                            .await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    });

    let http_state = AppState {
        registry: registry.clone(),
        downlink,
        metrics: metrics.clone(),
    };
    let http_addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let http_listener = match TcpListener::bind(http_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%http_addr, error = %e, "failed to bind http listener");
            std::process::exit(1);
        }
    };
    info!(%http_addr, "http listener bound");

    let app = http::router(http_state);
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async {
                tokio::signal::ctrl_c().await.ok();
            })
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "http server exited with error");
            });
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    accept_task.abort();
    let _ = liveness_task.await;
    let _ = http_task.await;
}
