use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::engine::ReconcileEngine;

/// Runs the engine on a fixed interval until shutdown. Ticks never overlap.
pub struct ReconcileScheduler {
    engine: Arc<ReconcileEngine>,
    period: Duration,
}

impl ReconcileScheduler {
    pub fn new(engine: Arc<ReconcileEngine>, period: Duration) -> Self {
        Self {
            engine,
            period: period.max(Duration::from_secs(1)),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        info!(
            interval_seconds = self.period.as_secs(),
            "Reconciliation scheduler started."
        );
        let mut interval = interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_tick().await;
                },
                _ = shutdown_rx.changed() => {
                    info!("Reconciliation scheduler shutting down.");
                    break;
                }
            }
        }
    }

    /// Runs one tick on its own task so a panic inside it is contained.
    async fn run_tick(&self) {
        debug!("Running reconciliation tick...");
        let engine = self.engine.clone();
        match tokio::spawn(async move { engine.reconcile().await }).await {
            Ok(Ok(_report)) => {}
            Ok(Err(e)) => error!(error = %e, "Reconciliation tick failed."),
            Err(e) => error!(error = %e, "Reconciliation tick panicked."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::services::{binding_service, node_service, subscription_service, NewBinding};
    use crate::db::test_support::temp_db;
    use crate::gateway::mock::MockGateway;
    use crate::reconcile::engine::EngineSettings;

    #[tokio::test]
    async fn test_stops_on_shutdown_signal() {
        let (db, _dir) = temp_db().await;
        let engine = Arc::new(ReconcileEngine::new(
            db,
            Arc::new(MockGateway::new()),
            EngineSettings::default(),
        ));
        let scheduler = Arc::new(ReconcileScheduler::new(engine, Duration::from_secs(1)));
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(scheduler.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_tick_does_not_stop_the_loop() {
        let (db, _dir) = temp_db().await;
        let node = node_service::create_node(
            &db,
            node_service::NewNode {
                name: "ams".to_string(),
                address: "https://ams.example.com".to_string(),
                username: "admin".to_string(),
                password: "secret".to_string(),
                proxy_url: None,
            },
        )
        .await
        .unwrap();
        let inbound = node_service::create_node_inbound(
            &db,
            node.id,
            node_service::NewNodeInbound { inbound_id: 1, name: None, traffic_multiplier: 1.0 },
        )
        .await
        .unwrap();
        let sub = subscription_service::create_subscription(
            &db,
            subscription_service::NewSubscription {
                enabled: true,
                show_multiplier: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let email = format!("{}-{}", sub.id, inbound.id);
        binding_service::add_binding(
            &db,
            NewBinding {
                subscription_id: sub.id.clone(),
                node_inbound_id: inbound.id,
                client_uuid: "9b2f1c7e-0000-4000-8000-000000000002".to_string(),
                email: email.clone(),
                client_disabled: false,
            },
        )
        .await
        .unwrap();

        let mock = MockGateway::new();
        mock.set_traffic(node.id, &email, 40, 2);
        mock.panic_on_collect(node.id, 1);
        let engine = Arc::new(ReconcileEngine::new(
            db.clone(),
            Arc::new(mock.clone()),
            EngineSettings::default(),
        ));
        let scheduler = Arc::new(ReconcileScheduler::new(engine, Duration::from_secs(1)));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        // The first tick panics before writing anything; only a later tick
        // can store the usage.
        let used = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let used = subscription_service::get_subscription(&db, &sub.id)
                    .await
                    .unwrap()
                    .unwrap()
                    .used_bytes;
                if used > 0 {
                    return used;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(used, 42);
        assert_eq!(mock.pending_collect_panics(node.id), 0);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_is_contained() {
        let (db, _dir) = temp_db().await;
        let engine = Arc::new(ReconcileEngine::new(
            db.clone(),
            Arc::new(MockGateway::new()),
            EngineSettings::default(),
        ));
        let scheduler = Arc::new(ReconcileScheduler::new(engine, Duration::from_secs(1)));

        // A closed store makes every snapshot read fail.
        db.close().await.unwrap();
        scheduler.run_tick().await;
    }
}
