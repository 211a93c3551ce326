//! Flora daemon - Mi Flora to MQTT bridge.
//!
//! Run with: `cargo run -p flora-daemon -- --config config.toml`

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flora_core::{GattPoller, MiBeaconDecoder, ReconciliationEngine, deliver, scan};
use flora_daemon::config::default_config_path;
use flora_daemon::{AppState, Config, Reporter, api, lifecycle};
use flora_types::DeviceIdentity;
use flora_types::uuids::MIFLORA_PRODUCT_ID;

/// Advertisements buffered between the radio and the engine.
const INBOUND_CAPACITY: usize = 256;

/// Flora daemon - Mi Flora to MQTT bridge.
#[derive(Parser, Debug)]
#[command(name = "flora-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, conflicts_with = "config_dir")]
    config: Option<PathBuf>,

    /// Directory containing config.toml.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration, print the sensor list and exit.
    #[arg(long)]
    check: bool,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        match (&self.config, &self.config_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => dir.join("config.toml"),
            (None, None) => default_config_path(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("flora_daemon={}", level).parse()?)
                .add_directive(format!("flora_core={}", level).parse()?),
        )
        .init();

    let path = args.config_path();
    let config = Config::load_validated(&path)?;
    info!("Loaded configuration from {}", path.display());
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    if args.check {
        print_check(&config);
        return Ok(());
    }

    run(config).await
}

fn print_check(config: &Config) {
    println!("Configuration OK");
    println!("Reporting method: {}", config.general.reporting_method);
    let devices = config.allowed_devices();
    if devices.is_empty() {
        println!("Sensors: none configured, every named device will be reported");
        return;
    }
    println!("Sensors:");
    for device in devices {
        println!("  {} -> {} (channel {})", device.mac, device.name.label(), device.name.channel());
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let adapter = scan::get_adapter(config.adapter()).await?;
    let reporter = Reporter::from_config(&config)?;
    info!(
        "Reporting via {} to base topic '{}'",
        config.general.reporting_method,
        config.base_topic()
    );

    let engine = ReconciliationEngine::new(
        config.engine_config(),
        Arc::new(MiBeaconDecoder::new().with_product(MIFLORA_PRODUCT_ID)),
        Arc::new(GattPoller::new(adapter.clone())),
    );
    let shutdown = CancellationToken::new();

    let delivery = tokio::spawn(deliver(
        engine.subscribe(),
        Arc::clone(&reporter.publisher),
        Arc::clone(&reporter.announcer),
        Duration::from_secs(config.daemon.publish_timeout),
        CancellationToken::new(),
    ));

    let server = if config.http.enabled {
        let state = AppState::new(engine.registry(), config.general.reporting_method);
        let app = Router::new()
            .merge(api::router())
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind(&config.http.bind).await?;
        info!("Status API listening on {}", listener.local_addr()?);
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                error!("Status API failed: {}", e);
            }
        }))
    } else {
        None
    };

    if !config.daemon.enabled {
        let expected: HashSet<DeviceIdentity> = config
            .allowed_devices()
            .iter()
            .map(|device| DeviceIdentity::from(&device.mac))
            .collect();
        let events = engine.subscribe();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            lifecycle::until_all_published(events, expected).await;
            stop.cancel();
        });
    }

    {
        let stop = shutdown.clone();
        tokio::spawn(async move {
            lifecycle::shutdown_signal().await;
            stop.cancel();
        });
    }

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let scanner = {
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = scan::subscribe(&adapter, tx, stop.clone()).await {
                error!("Advertisement scanner stopped: {}", e);
                stop.cancel();
            }
        })
    };

    engine.run(rx, shutdown.clone()).await;

    // The engine has dropped its event sender; delivery drains what is left and stops.
    if tokio::time::timeout(Duration::from_secs(config.daemon.publish_timeout), delivery)
        .await
        .is_err()
    {
        warn!("Event delivery did not drain in time");
    }
    if let Err(e) = scanner.await {
        warn!("Scanner task failed: {}", e);
    }
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!("Status API task failed: {}", e);
        }
    }
    reporter.close().await;

    info!("Flora daemon stopped");
    Ok(())
}
