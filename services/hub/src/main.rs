use bridge_protocol::SystemClock;
use bridge_router::Router;
use bridge_satellite::{SatelliteAdapter, SatelliteConfig};
use bridge_store::StateStore;
use bridge_subscriptions::SubscriptionManager;
use clap::Parser;
use hub::config::{self, HubConfig};
use hub::state::AppState;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bridge hub: brokers telemetry and control between a companion satellite
/// device and any number of downstream application clients.
#[derive(Debug, Parser)]
#[command(name = "hub", version = env!("CARGO_PKG_VERSION"), disable_version_flag = true)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Load and validate configuration, then exit without starting the hub.
    #[arg(long)]
    validate: bool,

    /// Print version and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("BRIDGE_CONFIG_PATH").ok().map(PathBuf::from));

    let config = match config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.validate {
        info!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    run(config).await
}

async fn run(config: HubConfig) -> ExitCode {
    let clock: Arc<dyn bridge_protocol::Clock> = Arc::new(SystemClock);
    let store = Arc::new(StateStore::new());
    let subs = Arc::new(SubscriptionManager::new());
    let router = Router::new(store.clone(), subs.clone(), clock.clone(), true, 60_000);

    let satellite_config = SatelliteConfig {
        host: config.companion.host.clone(),
        port: config.companion.port,
        device_id: config.companion.device_id.clone(),
        product_name: config.companion.product_name.clone(),
        keys_per_row: 8,
        keys_total: 32,
        bitmap_size: 72,
        auto_reconnect: config.companion.auto_reconnect,
        reconnect_base_delay_ms: config.companion.reconnect_delay,
        max_reconnect_attempts: config.companion.max_reconnect_attempts,
        heartbeat_interval_ms: config.companion.heartbeat_interval,
        connection_timeout_ms: config.companion.connection_timeout,
    };
    let satellite = SatelliteAdapter::new(satellite_config, store.clone(), router.clone(), clock.clone());
    router.register_target(satellite.as_route_target()).expect("companion.satellite registers exactly once at startup");
    satellite.spawn();

    let config = Arc::new(config);
    let bind_addr = format!("{}:{}", config.transport.host, config.transport.port);
    let state = AppState::new(config, store, subs, router.clone(), satellite, clock);

    let app = hub::build_router(state.clone());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("fatal: failed to bind {bind_addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %bind_addr, "hub listening");

    let shutdown_state = state.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_state.notify_shutdown();
            router.shutdown().await;
        })
        .await;

    match result {
        Ok(()) => {
            info!("hub shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("fatal: server error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
