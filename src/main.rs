use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aawgd::auth::{DigestAuth, DEFAULT_REALM};
use aawgd::bluetooth;
use aawgd::config::{apply_env_overrides, ConfigStore, ConnectionStrategy};
use aawgd::orchestrator::{Orchestrator, RuntimeStatus};
use aawgd::otg::{GadgetController, UeventDispatcher};
use aawgd::proxy::ProxyStats;
use aawgd::state::AppState;
use aawgd::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// aawgd command line arguments
#[derive(Parser, Debug)]
#[command(name = "aawgd")]
#[command(version, about = "Wireless Android Auto gateway daemon", long_about = None)]
struct CliArgs {
    /// Data directory path (default: /etc/aawgd)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Proxy port announced to the phone (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Connection strategy (overrides config)
    #[arg(short = 's', long, value_name = "STRATEGY")]
    strategy: Option<ConnectionStrategy>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!(
        "Starting aawgd v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_DATE")
    );

    // Determine data directory (CLI arg takes precedence)
    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("config.json")).await?;
    config_store.override_with(|config| {
        apply_env_overrides(config);
        if let Some(port) = args.port {
            config.proxy.port = port;
        }
        if let Some(strategy) = args.strategy {
            config.connection_strategy = strategy;
        }
    });
    let config = config_store.get();
    tracing::info!(
        "Connection strategy: {}, proxy port {}",
        config.connection_strategy,
        config.proxy.port
    );

    let uevents = Arc::new(UeventDispatcher::new());
    if let Err(e) = uevents.start() {
        tracing::warn!(
            "Failed to start uevent monitoring, accessory requests will not be seen: {}",
            e
        );
    }

    let gadgets = Arc::new(GadgetController::new(&config.usb, uevents));
    let bluetooth = bluetooth::create_service(&config.bluetooth);
    let stats = Arc::new(ProxyStats::new());
    let status = Arc::new(RuntimeStatus::new(config.connection_strategy));

    let auth = if config.web.auth_enabled {
        let auth = DigestAuth::load_or_create(Path::new(&config.web.auth_file), DEFAULT_REALM)?;
        tracing::info!("Web authentication enabled for realm '{}'", auth.realm());
        Some(Arc::new(auth))
    } else {
        tracing::warn!("Web authentication disabled");
        None
    };

    let state = AppState::new(
        config_store.clone(),
        gadgets.clone(),
        bluetooth.clone(),
        status.clone(),
        stats.clone(),
        auth,
    );

    // Strategy and USB settings are read once by the orchestrator
    let mut config_changes = config_store.subscribe();
    tokio::spawn(async move {
        while config_changes.recv().await.is_ok() {
            tracing::info!("Configuration saved, changes apply after restart");
        }
    });

    // The orchestrator blocks on sockets and device nodes; give it its own thread
    let orchestrator = Orchestrator::new(&config, gadgets, bluetooth, stats, status);
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("orchestrator".to_string())
        .spawn(move || {
            let _ = done_tx.send(orchestrator.run());
        })?;

    let web_server = async {
        if !config.web.enabled {
            tracing::info!("Web configuration server disabled");
            return std::future::pending::<std::io::Result<()>>().await;
        }

        let addr: SocketAddr = format!("{}:{}", config.web.bind_address, config.web.port)
            .parse()
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid web address: {}", e),
                )
            })?;
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;

        tracing::info!("Starting HTTP server on {}", addr);
        axum::serve(listener, web::create_router(state.clone())).await
    };

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
        result = web_server => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
            Ok(())
        }
        result = done_rx => match result {
            Ok(Err(e)) => {
                tracing::error!("Orchestrator stopped: {}", e);
                Err(anyhow::anyhow!("orchestrator stopped: {}", e))
            }
            _ => Ok(()),
        },
    };

    cleanup(&state);
    tracing::info!("Shutdown complete");
    result
}

/// Unbind gadgets so the head unit sees a clean disconnect
fn cleanup(state: &Arc<AppState>) {
    state.gadgets.disable_all();
    if let Err(e) = state.bluetooth.power_off() {
        tracing::debug!("Failed to power off bluetooth: {}", e);
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "aawgd=error,tower_http=error",
        LogLevel::Warn => "aawgd=warn,tower_http=warn",
        LogLevel::Info => "aawgd=info,tower_http=info",
        LogLevel::Verbose => "aawgd=debug,tower_http=info",
        LogLevel::Debug => "aawgd=debug,tower_http=debug",
        LogLevel::Trace => "aawgd=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("AAWGD_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/etc/aawgd")
}
