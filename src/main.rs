use clap::Parser;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetgate::db;
use fleetgate::gateway::{GatewayConnector, GatewayPool};
use fleetgate::reconcile::{EngineSettings, ReconcileEngine, ReconcileScheduler};
use fleetgate::server::config::{generate_panel_path, ServerConfig};
use fleetgate::server::self_update_service::SelfUpdateService;
use fleetgate::server::shutdown_signal;
use fleetgate::services::provisioning::ProvisioningService;
use fleetgate::version::VERSION;
use fleetgate::web::{create_axum_router, AppState};

#[derive(Parser, Debug)]
#[command(version = VERSION, about = "Subscription gateway for X-UI node fleets")]
struct Args {
    /// Path to a TOML config file. Environment variables override its values.
    #[arg(short, long)]
    config: Option<String>,

    /// Print a random panel path and exit.
    #[arg(long)]
    generate_path: bool,
}

fn init_logging(log_dir: &str) {
    let file_layer = fmt::layer()
        .with_writer(rolling::daily(log_dir, "fleetgate.log"))
        .with_ansi(false)
        .json();
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();
    if args.generate_path {
        println!("{}", generate_panel_path());
        return Ok(());
    }

    let config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir);
    info!(version = VERSION, "Starting fleetgate...");
    if config.panel_path_generated {
        warn!(
            panel_path = %config.panel_path,
            "No panel path configured; generated one for this run. Set PANEL_PATH to keep it stable."
        );
    }

    let db = match db::connect(&config.database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to the database. Exiting.");
            return Err(e.into());
        }
    };
    info!("Database ready.");

    let call_timeout = Duration::from_secs(config.gateway_timeout_secs);
    let gateways: Arc<dyn GatewayConnector> = Arc::new(GatewayPool::new(call_timeout));

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let engine = Arc::new(ReconcileEngine::new(
        db.clone(),
        gateways.clone(),
        EngineSettings {
            call_timeout,
            max_concurrent: config.max_concurrent_node_calls,
        },
    ));
    let scheduler = Arc::new(ReconcileScheduler::new(
        engine,
        Duration::from_secs(config.sync_interval_secs),
    ));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let restart = Arc::new(Notify::new());
    let updater = SelfUpdateService::new(config.clone(), shutdown_rx.clone(), restart.clone());
    tokio::spawn(updater.start_periodic_check());

    let provisioning = Arc::new(ProvisioningService::new(
        db.clone(),
        gateways.clone(),
        call_timeout,
    ));
    let app_state = Arc::new(AppState {
        db,
        config: config.clone(),
        gateways,
        provisioning,
    });
    let app_router = create_axum_router(app_state);

    let http_addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(address = %http_addr, panel_path = %config.panel_path, "HTTP server listening.");

    axum::serve(
        listener,
        app_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(restart))
    .await?;

    // An in-flight tick finishes before the scheduler observes this.
    let _ = shutdown_tx.send(());
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Reconcile scheduler task failed.");
    }
    info!("Shutdown complete.");
    Ok(())
}
