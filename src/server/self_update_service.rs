use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task;
use tokio::time::{interval_at, Instant};
use tracing::{error, info};

use crate::server::config::ServerConfig;
use crate::version::VERSION;

const FIRST_CHECK_DELAY: Duration = Duration::from_secs(60);

/// One blocking update run. Yields the installed version, `None` when the
/// running binary is already current.
type Installer = fn() -> Result<Option<String>, String>;

fn install_latest_release() -> Result<Option<String>, String> {
    let status = self_update::backends::github::Update::configure()
        .repo_owner("fleetgate")
        .repo_name("fleetgate")
        .bin_name("fleetgate")
        .show_download_progress(false)
        .no_confirm(true)
        .current_version(VERSION)
        .build()
        .and_then(|updater| updater.update())
        .map_err(|e| e.to_string())?;
    Ok(status.updated().then(|| status.version().to_string()))
}

/// Installs new releases in place. After a successful install it notifies
/// `restart` and stops; the process then shuts down through the same path as
/// on a signal and the supervisor starts the new binary.
pub struct SelfUpdateService {
    config: Arc<ServerConfig>,
    shutdown_rx: watch::Receiver<()>,
    restart: Arc<Notify>,
    installer: Installer,
    first_check_delay: Duration,
}

impl SelfUpdateService {
    pub fn new(
        config: Arc<ServerConfig>,
        shutdown_rx: watch::Receiver<()>,
        restart: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            shutdown_rx,
            restart,
            installer: install_latest_release,
            first_check_delay: FIRST_CHECK_DELAY,
        }
    }

    pub async fn start_periodic_check(mut self) {
        if !self.config.auto_update {
            info!("Auto update disabled.");
            return;
        }
        if self.config.is_in_container {
            info!("Running in a container, skipping self-update checks.");
            return;
        }

        let period = Duration::from_secs(self.config.update_check_interval_secs.max(1));
        let mut interval = interval_at(Instant::now() + self.first_check_delay, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.run_update_check().await {
                        self.restart.notify_one();
                        break;
                    }
                },
                _ = self.shutdown_rx.changed() => {
                    info!("Self-update service shutting down.");
                    break;
                }
            }
        }
    }

    /// Returns true when a new binary was installed.
    async fn run_update_check(&self) -> bool {
        info!(current_version = VERSION, "Checking for a new version...");

        match task::spawn_blocking(self.installer).await {
            Ok(Ok(Some(version))) => {
                info!(%version, "Update installed, requesting a graceful restart.");
                true
            }
            Ok(Ok(None)) => {
                info!("Already up to date.");
                false
            }
            Ok(Err(e)) => {
                error!(error = %e, "Update check failed.");
                false
            }
            Err(e) => {
                error!(error = %e, "Update task panicked.");
                false
            }
        }
    }
}
