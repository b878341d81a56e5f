use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use sea_orm::{DatabaseConnection, DbErr};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::SubscriptionState;
use crate::db::services::{
    accounting, binding_service, clamp_multiplier, ActiveSubscription, BoundInbound,
};
use crate::gateway::{ClientTraffic, GatewayClient, GatewayConnector, GatewayError, NodeEndpoint};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] DbErr),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Upper bound for every single remote call.
    pub call_timeout: Duration,
    /// Remote calls in flight at once for one subscription.
    pub max_concurrent: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            max_concurrent: 8,
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub subscriptions: usize,
    pub collect_failures: usize,
    pub disabled: usize,
    pub enabled: usize,
    pub quota_hints: usize,
    pub activations: usize,
    pub call_failures: usize,
    pub store_failures: usize,
}

#[derive(Default)]
struct BindingOutcome {
    disabled: bool,
    enabled: bool,
    hinted: bool,
    call_failures: usize,
    store_failures: usize,
}

/// What the engine wants done on one binding this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingAction {
    Disable,
    Enable { hint: Option<i64> },
    Hint(i64),
}

pub struct ReconcileEngine {
    db: DatabaseConnection,
    gateways: Arc<dyn GatewayConnector>,
    settings: EngineSettings,
}

impl ReconcileEngine {
    pub fn new(
        db: DatabaseConnection,
        gateways: Arc<dyn GatewayConnector>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            gateways,
            settings: EngineSettings {
                max_concurrent: settings.max_concurrent.max(1),
                ..settings
            },
        }
    }

    /// One full pass over every subscription that has at least one binding on
    /// an enabled node. Failures on a single node or binding are logged and
    /// skipped; only a failed snapshot read aborts the tick.
    pub async fn reconcile(&self) -> Result<TickReport, ReconcileError> {
        let subscriptions = binding_service::list_active_subscriptions_with_bindings(&self.db).await?;
        let mut report = TickReport {
            subscriptions: subscriptions.len(),
            ..Default::default()
        };

        for active in subscriptions {
            self.reconcile_subscription(active, &mut report).await;
        }

        if report.disabled + report.enabled + report.activations > 0
            || report.collect_failures + report.call_failures + report.store_failures > 0
        {
            info!(
                subscriptions = report.subscriptions,
                disabled = report.disabled,
                enabled = report.enabled,
                quota_hints = report.quota_hints,
                activations = report.activations,
                collect_failures = report.collect_failures,
                call_failures = report.call_failures,
                store_failures = report.store_failures,
                "Reconciliation tick finished."
            );
        } else {
            debug!(subscriptions = report.subscriptions, quota_hints = report.quota_hints, "Reconciliation tick finished.");
        }
        Ok(report)
    }

    async fn reconcile_subscription(&self, active: ActiveSubscription, report: &mut TickReport) {
        let ActiveSubscription {
            mut subscription,
            bindings,
        } = active;
        let sub_id = subscription.id.as_str();

        let collections: Vec<_> = bindings
            .iter()
            .map(|bound| async move { (bound.inbound.id, self.collect(sub_id, bound).await) })
            .collect();
        let collected: HashMap<i32, ClientTraffic> = stream::iter(collections)
            .buffer_unordered(self.settings.max_concurrent)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .filter_map(|(inbound_id, traffic)| traffic.map(|t| (inbound_id, t)))
            .collect();
        report.collect_failures += bindings.len() - collected.len();

        let effective_usage = effective_usage(&bindings, &collected);
        if let Err(e) = accounting::set_used_bytes(&self.db, sub_id, effective_usage).await {
            warn!(subscription_id = %sub_id, error = %e, "Failed to store used bytes.");
            report.store_failures += 1;
        }
        subscription.used_bytes = effective_usage;

        if !subscription.enabled {
            return;
        }

        if subscription.is_pending_first_use() {
            if let Some(expire_at) =
                first_use_expiry(&subscription, &collected, effective_usage, Utc::now())
            {
                match accounting::activate_delayed_expiry(&self.db, sub_id, expire_at).await {
                    Ok(rows) if rows > 0 => {
                        info!(subscription_id = %sub_id, %expire_at, "Subscription used for the first time, expiry started.");
                        subscription.expire_at = Some(expire_at);
                        report.activations += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(subscription_id = %sub_id, error = %e, "Failed to start delayed expiry.");
                        report.store_failures += 1;
                    }
                }
            }
        }

        let state = SubscriptionState::evaluate(&subscription, effective_usage, Utc::now());
        let remaining = (subscription.data_limit_bytes > 0)
            .then(|| (subscription.data_limit_bytes - effective_usage).max(0));

        let actions: Vec<(&BoundInbound, BindingAction)> = bindings
            .iter()
            .filter_map(|bound| {
                plan_binding(state, bound, collected.get(&bound.inbound.id), remaining)
                    .map(|action| (bound, action))
            })
            .collect();
        if actions.is_empty() {
            return;
        }
        debug!(subscription_id = %sub_id, %state, actions = actions.len(), "Converging subscription.");

        let convergences: Vec<_> = actions
            .into_iter()
            .map(|(bound, action)| self.converge(sub_id, bound, action))
            .collect();
        let outcomes: Vec<BindingOutcome> = stream::iter(convergences)
            .buffer_unordered(self.settings.max_concurrent)
            .collect()
            .await;
        for outcome in outcomes {
            report.disabled += outcome.disabled as usize;
            report.enabled += outcome.enabled as usize;
            report.quota_hints += outcome.hinted as usize;
            report.call_failures += outcome.call_failures;
            report.store_failures += outcome.store_failures;
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.settings.call_timeout)),
        }
    }

    fn client(&self, bound: &BoundInbound) -> Result<Arc<dyn GatewayClient>, GatewayError> {
        self.gateways.client_for(&NodeEndpoint::from(&bound.node))
    }

    async fn collect(&self, sub_id: &str, bound: &BoundInbound) -> Option<ClientTraffic> {
        let result = match self.client(bound) {
            Ok(client) => {
                self.call(client.get_client_traffic(&bound.binding.email))
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(traffic) => Some(traffic),
            Err(e) => {
                warn!(
                    subscription_id = %sub_id,
                    node_id = bound.node.id,
                    inbound_id = bound.inbound.inbound_id,
                    error = %e,
                    "Failed to collect client traffic."
                );
                None
            }
        }
    }

    async fn converge(
        &self,
        sub_id: &str,
        bound: &BoundInbound,
        action: BindingAction,
    ) -> BindingOutcome {
        let mut outcome = BindingOutcome::default();
        let client = match self.client(bound) {
            Ok(client) => client,
            Err(e) => {
                warn!(subscription_id = %sub_id, node_id = bound.node.id, error = %e, "No gateway client for node.");
                outcome.call_failures += 1;
                return outcome;
            }
        };
        let inbound_id = bound.inbound.inbound_id;
        let uuid = bound.binding.client_uuid.as_str();
        let email = bound.binding.email.as_str();

        let (toggle, hint) = match action {
            BindingAction::Disable => (Some(false), None),
            BindingAction::Enable { hint } => (Some(true), hint),
            BindingAction::Hint(hint) => (None, Some(hint)),
        };

        if let Some(enabled) = toggle {
            match self
                .call(client.set_client_enabled(inbound_id, uuid, email, enabled))
                .await
            {
                Ok(()) => {
                    if enabled {
                        outcome.enabled = true;
                    } else {
                        outcome.disabled = true;
                    }
                    if bound.binding.client_disabled == enabled {
                        if let Err(e) = accounting::set_binding_disabled(
                            &self.db,
                            sub_id,
                            bound.inbound.id,
                            !enabled,
                        )
                        .await
                        {
                            warn!(subscription_id = %sub_id, node_inbound_id = bound.inbound.id, error = %e, "Failed to store client state.");
                            outcome.store_failures += 1;
                        }
                    }
                    info!(
                        subscription_id = %sub_id,
                        node_id = bound.node.id,
                        inbound_id,
                        enabled,
                        "Client state changed on node."
                    );
                }
                Err(e) => {
                    warn!(
                        subscription_id = %sub_id,
                        node_id = bound.node.id,
                        inbound_id,
                        enabled,
                        error = %e,
                        "Failed to change client state on node."
                    );
                    outcome.call_failures += 1;
                    return outcome;
                }
            }
        }

        if let Some(total) = hint {
            match self
                .call(client.set_client_quota(inbound_id, uuid, email, total))
                .await
            {
                Ok(()) => outcome.hinted = true,
                Err(e) => {
                    warn!(
                        subscription_id = %sub_id,
                        node_id = bound.node.id,
                        inbound_id,
                        total,
                        error = %e,
                        "Failed to push quota hint."
                    );
                    outcome.call_failures += 1;
                }
            }
        }
        outcome
    }
}

/// `floor(Σ raw × multiplier)` over the bindings whose collection succeeded.
fn effective_usage(bindings: &[BoundInbound], collected: &HashMap<i32, ClientTraffic>) -> i64 {
    let weighted: f64 = bindings
        .iter()
        .filter_map(|bound| {
            collected.get(&bound.inbound.id).map(|traffic| {
                traffic.raw_bytes() as f64 * clamp_multiplier(bound.inbound.traffic_multiplier)
            })
        })
        .sum();
    weighted.floor() as i64
}

/// The node-side limit that lets this node consume the remaining quota on
/// top of what it already counted. The allowance is rounded up and never
/// below one byte: a limit equal to the counter cuts the client at once, and
/// a limit of 0 means unlimited to the node.
pub fn quota_hint(raw_bytes: i64, remaining: i64, multiplier: f64) -> i64 {
    let allowance = (remaining as f64 / clamp_multiplier(multiplier)).ceil() as i64;
    raw_bytes.saturating_add(allowance.max(1))
}

fn plan_binding(
    state: SubscriptionState,
    bound: &BoundInbound,
    traffic: Option<&ClientTraffic>,
    remaining: Option<i64>,
) -> Option<BindingAction> {
    match state {
        SubscriptionState::AdminDisabled => None,
        SubscriptionState::Suspended(_) => {
            (!bound.binding.client_disabled).then_some(BindingAction::Disable)
        }
        SubscriptionState::Active => {
            let needs_enable =
                bound.binding.client_disabled || traffic.is_some_and(|t| !t.enable);
            let hint = traffic.and_then(|t| {
                let target = match remaining {
                    Some(remaining) => {
                        quota_hint(t.raw_bytes(), remaining, bound.inbound.traffic_multiplier)
                    }
                    None => 0,
                };
                (target != t.total).then_some(target)
            });
            match (needs_enable, hint) {
                (true, hint) => Some(BindingAction::Enable { hint }),
                (false, Some(hint)) => Some(BindingAction::Hint(hint)),
                (false, None) => None,
            }
        }
    }
}

/// When a delay-started subscription has been used, the moment its clock
/// should run out: the earliest expiry a node already started, otherwise
/// the full duration from now. `None` also when that moment is not
/// representable.
fn first_use_expiry(
    subscription: &crate::db::entities::subscription::Model,
    collected: &HashMap<i32, ClientTraffic>,
    effective_usage: i64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let reported = collected
        .values()
        .map(|t| t.expiry_time)
        .filter(|&ms| ms > 0)
        .min()
        .and_then(DateTime::from_timestamp_millis);
    if reported.is_some() {
        return reported;
    }
    if effective_usage <= 0 {
        return None;
    }
    let expire_at = TimeDelta::try_seconds(subscription.expire_after_first_use_seconds)
        .and_then(|delay| now.checked_add_signed(delay));
    if expire_at.is_none() {
        warn!(
            subscription_id = %subscription.id,
            delay_seconds = subscription.expire_after_first_use_seconds,
            "Delayed expiry is out of range, not starting it."
        );
    }
    expire_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::{node, node_inbound, subscription};
    use crate::db::services::{
        list_bindings, node_service, subscription_service, NewBinding, SubscriptionUpdate,
        BYTES_PER_GB,
    };
    use crate::db::test_support::temp_db;
    use crate::gateway::mock::{Call, MockGateway};

    struct Fixture {
        db: DatabaseConnection,
        mock: MockGateway,
        engine: ReconcileEngine,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (db, dir) = temp_db().await;
        let mock = MockGateway::new();
        let engine = ReconcileEngine::new(
            db.clone(),
            Arc::new(mock.clone()),
            EngineSettings {
                call_timeout: Duration::from_millis(200),
                max_concurrent: 4,
            },
        );
        Fixture {
            db,
            mock,
            engine,
            _dir: dir,
        }
    }

    async fn node_with_inbound(db: &DatabaseConnection, name: &str, multiplier: f64) -> (node::Model, node_inbound::Model) {
        let node = node_service::create_node(
            db,
            node_service::NewNode {
                name: name.to_string(),
                address: format!("https://{name}.example.com"),
                username: "admin".to_string(),
                password: "secret".to_string(),
                proxy_url: None,
            },
        )
        .await
        .unwrap();
        let inbound = node_service::create_node_inbound(
            db,
            node.id,
            node_service::NewNodeInbound {
                inbound_id: 1,
                name: None,
                traffic_multiplier: multiplier,
            },
        )
        .await
        .unwrap();
        (node, inbound)
    }

    async fn subscription_with_quota(db: &DatabaseConnection, limit: i64) -> subscription::Model {
        subscription_service::create_subscription(
            db,
            subscription_service::NewSubscription {
                data_limit_bytes: limit,
                enabled: true,
                show_multiplier: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    /// Binds and returns the remote lookup key.
    async fn bind(
        db: &DatabaseConnection,
        sub: &subscription::Model,
        inbound: &node_inbound::Model,
        client_disabled: bool,
    ) -> String {
        let email = format!("{}-{}", sub.id, inbound.id);
        binding_service::add_binding(
            db,
            NewBinding {
                subscription_id: sub.id.clone(),
                node_inbound_id: inbound.id,
                client_uuid: "9b2f1c7e-0000-4000-8000-000000000001".to_string(),
                email: email.clone(),
                client_disabled,
            },
        )
        .await
        .unwrap();
        email
    }

    async fn used_bytes(db: &DatabaseConnection, id: &str) -> i64 {
        subscription_service::get_subscription(db, id)
            .await
            .unwrap()
            .unwrap()
            .used_bytes
    }

    async fn disabled_flags(db: &DatabaseConnection, id: &str) -> Vec<bool> {
        list_bindings(db, id)
            .await
            .unwrap()
            .iter()
            .map(|b| b.binding.client_disabled)
            .collect()
    }

    #[test]
    fn test_quota_hint_divides_remaining_by_multiplier() {
        assert_eq!(quota_hint(100, 1000, 1.0), 1100);
        assert_eq!(quota_hint(100, 1000, 3.0), 434);
    }

    #[test]
    fn test_quota_hint_stays_above_counter() {
        // A limit of 0 would lift the node-side limit entirely.
        assert_eq!(quota_hint(0, 1, 2.0), 1);
        assert_eq!(quota_hint(0, 0, 2.0), 1);
        // A limit equal to the counter would cut the client on the node.
        assert_eq!(quota_hint(500, 1, 2.0), 501);
    }

    #[tokio::test]
    async fn test_used_bytes_is_floor_of_weighted_sum() {
        let f = fixture().await;
        let (a, ia) = node_with_inbound(&f.db, "a", 1.5).await;
        let (b, ib) = node_with_inbound(&f.db, "b", 1.5).await;
        let sub = subscription_with_quota(&f.db, 0).await;
        let ea = bind(&f.db, &sub, &ia, false).await;
        let eb = bind(&f.db, &sub, &ib, false).await;
        f.mock.set_traffic(a.id, &ea, 1, 2);
        f.mock.set_traffic(b.id, &eb, 3, 0);

        let report = f.engine.reconcile().await.unwrap();

        assert_eq!(report.subscriptions, 1);
        // 4.5 + 4.5, floored once after summing.
        assert_eq!(used_bytes(&f.db, &sub.id).await, 9);
    }

    #[tokio::test]
    async fn test_over_limit_through_multiplier_suspends() {
        let f = fixture().await;
        let (n, inbound) = node_with_inbound(&f.db, "ams", 2.0).await;
        let sub = subscription_with_quota(&f.db, 10 * BYTES_PER_GB).await;
        let email = bind(&f.db, &sub, &inbound, false).await;
        f.mock.set_traffic(n.id, &email, 2 * BYTES_PER_GB, 3 * BYTES_PER_GB);

        let report = f.engine.reconcile().await.unwrap();

        assert_eq!(used_bytes(&f.db, &sub.id).await, 10 * BYTES_PER_GB);
        assert_eq!(report.disabled, 1);
        assert!(f.mock.mutations().contains(&Call::SetEnabled {
            node_id: n.id,
            email: email.clone(),
            enabled: false,
        }));
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![true]);
        assert!(!f.mock.client(n.id, &email).unwrap().enable);
    }

    #[tokio::test]
    async fn test_second_tick_is_idempotent() {
        let f = fixture().await;
        let (a, ia) = node_with_inbound(&f.db, "a", 1.0).await;
        let (b, ib) = node_with_inbound(&f.db, "b", 2.0).await;
        let healthy = subscription_with_quota(&f.db, 10_000).await;
        let suspended = subscription_with_quota(&f.db, 100).await;
        let ha = bind(&f.db, &healthy, &ia, false).await;
        let hb = bind(&f.db, &healthy, &ib, false).await;
        let sa = bind(&f.db, &suspended, &ia, false).await;
        f.mock.set_traffic(a.id, &ha, 100, 100);
        f.mock.set_traffic(b.id, &hb, 50, 0);
        f.mock.set_traffic(a.id, &sa, 500, 0);

        let first = f.engine.reconcile().await.unwrap();
        assert_eq!(first.disabled, 1);
        assert_eq!(first.quota_hints, 2);
        f.mock.clear_calls();

        let second = f.engine.reconcile().await.unwrap();
        assert!(f.mock.mutations().is_empty(), "unexpected calls: {:?}", f.mock.mutations());
        assert_eq!(second.disabled + second.enabled + second.quota_hints, 0);
    }

    #[tokio::test]
    async fn test_nearly_spent_quota_keeps_a_node_side_limit() {
        let f = fixture().await;
        let (a, ia) = node_with_inbound(&f.db, "a", 1.0).await;
        let (b, ib) = node_with_inbound(&f.db, "b", 2.0).await;
        let (c, ic) = node_with_inbound(&f.db, "c", 2.0).await;
        let sub = subscription_with_quota(&f.db, 101).await;
        let ea = bind(&f.db, &sub, &ia, false).await;
        let eb = bind(&f.db, &sub, &ib, false).await;
        let ec = bind(&f.db, &sub, &ic, false).await;
        f.mock.set_traffic(a.id, &ea, 50, 0);
        f.mock.set_traffic(b.id, &eb, 25, 0);
        f.mock.set_traffic(c.id, &ec, 0, 0);

        f.engine.reconcile().await.unwrap();

        // used = 50 + 50 + 0, one byte left.
        assert_eq!(used_bytes(&f.db, &sub.id).await, 100);
        assert_eq!(f.mock.client(a.id, &ea).unwrap().total, 51);
        assert_eq!(f.mock.client(b.id, &eb).unwrap().total, 26);
        assert_eq!(f.mock.client(c.id, &ec).unwrap().total, 1);
        f.mock.clear_calls();

        let second = f.engine.reconcile().await.unwrap();
        assert!(f.mock.mutations().is_empty(), "unexpected calls: {:?}", f.mock.mutations());
        assert_eq!(second.enabled + second.quota_hints, 0);
    }

    #[tokio::test]
    async fn test_quota_hints_split_remaining_per_node() {
        let f = fixture().await;
        let (a, ia) = node_with_inbound(&f.db, "a", 1.0).await;
        let (b, ib) = node_with_inbound(&f.db, "b", 2.0).await;
        let sub = subscription_with_quota(&f.db, 1000).await;
        let ea = bind(&f.db, &sub, &ia, false).await;
        let eb = bind(&f.db, &sub, &ib, false).await;
        f.mock.set_traffic(a.id, &ea, 100, 0);
        f.mock.set_traffic(b.id, &eb, 100, 0);

        f.engine.reconcile().await.unwrap();

        // used = 100 + 200, remaining = 700
        assert_eq!(f.mock.client(a.id, &ea).unwrap().total, 800);
        assert_eq!(f.mock.client(b.id, &eb).unwrap().total, 450);
    }

    #[tokio::test]
    async fn test_raised_quota_recovers_suspended_subscription() {
        let f = fixture().await;
        let (n, inbound) = node_with_inbound(&f.db, "ams", 2.0).await;
        let sub = subscription_with_quota(&f.db, 10 * BYTES_PER_GB).await;
        let email = bind(&f.db, &sub, &inbound, false).await;
        f.mock.set_traffic(n.id, &email, 5 * BYTES_PER_GB, 0);
        f.engine.reconcile().await.unwrap();
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![true]);

        subscription_service::update_subscription(
            &f.db,
            &sub.id,
            SubscriptionUpdate {
                data_limit_bytes: Some(20 * BYTES_PER_GB),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        f.mock.clear_calls();

        let report = f.engine.reconcile().await.unwrap();

        assert_eq!(report.enabled, 1);
        assert!(f.mock.mutations().contains(&Call::SetEnabled {
            node_id: n.id,
            email: email.clone(),
            enabled: true,
        }));
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![false]);
        // 5 GiB raw plus 10 GiB remaining at ×2.
        assert_eq!(
            f.mock.client(n.id, &email).unwrap().total,
            5 * BYTES_PER_GB + 5 * BYTES_PER_GB
        );
    }

    #[tokio::test]
    async fn test_admin_disabled_is_left_alone() {
        let f = fixture().await;
        let (a, ia) = node_with_inbound(&f.db, "a", 1.0).await;
        let (b, ib) = node_with_inbound(&f.db, "b", 1.0).await;
        let sub = subscription_with_quota(&f.db, 10).await;
        let ea = bind(&f.db, &sub, &ia, true).await;
        let eb = bind(&f.db, &sub, &ib, false).await;
        f.mock.set_traffic(a.id, &ea, 1000, 0);
        f.mock.set_traffic(b.id, &eb, 1000, 0);
        subscription_service::update_subscription(
            &f.db,
            &sub.id,
            SubscriptionUpdate {
                enabled: Some(false),
                expire_at: Some(Some(Utc::now() - TimeDelta::days(3))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        f.engine.reconcile().await.unwrap();

        assert!(f.mock.mutations().is_empty());
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![true, false]);
        assert_eq!(used_bytes(&f.db, &sub.id).await, 2000);
    }

    #[tokio::test]
    async fn test_expired_subscription_is_suspended() {
        let f = fixture().await;
        let (n, inbound) = node_with_inbound(&f.db, "ams", 1.0).await;
        let sub = subscription_with_quota(&f.db, 0).await;
        let email = bind(&f.db, &sub, &inbound, false).await;
        f.mock.set_traffic(n.id, &email, 0, 0);
        subscription_service::update_subscription(
            &f.db,
            &sub.id,
            SubscriptionUpdate {
                expire_at: Some(Some(Utc::now() - TimeDelta::minutes(1))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let report = f.engine.reconcile().await.unwrap();

        assert_eq!(report.disabled, 1);
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![true]);
    }

    #[tokio::test]
    async fn test_failed_node_does_not_block_others() {
        let f = fixture().await;
        let (a, ia) = node_with_inbound(&f.db, "a", 1.0).await;
        let (b, ib) = node_with_inbound(&f.db, "b", 1.0).await;
        let sub = subscription_with_quota(&f.db, 100).await;
        let ea = bind(&f.db, &sub, &ia, false).await;
        let eb = bind(&f.db, &sub, &ib, false).await;
        f.mock.set_traffic(a.id, &ea, 5000, 0);
        f.mock.set_traffic(b.id, &eb, 100, 0);
        f.mock.fail_node(a.id);

        let report = f.engine.reconcile().await.unwrap();

        assert_eq!(report.collect_failures, 1);
        assert_eq!(used_bytes(&f.db, &sub.id).await, 100);
        // Over limit on the degraded total: B gets disabled, A's call fails
        // and its flag stays clear for the next tick.
        assert_eq!(report.disabled, 1);
        assert_eq!(report.call_failures, 1);
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![false, true]);

        f.mock.recover_node(a.id);
        f.engine.reconcile().await.unwrap();
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![true, true]);
        assert_eq!(used_bytes(&f.db, &sub.id).await, 5100);
    }

    #[tokio::test]
    async fn test_hanging_node_times_out() {
        let f = fixture().await;
        let (a, ia) = node_with_inbound(&f.db, "a", 1.0).await;
        let (b, ib) = node_with_inbound(&f.db, "b", 1.0).await;
        let sub = subscription_with_quota(&f.db, 0).await;
        let ea = bind(&f.db, &sub, &ia, false).await;
        let eb = bind(&f.db, &sub, &ib, false).await;
        f.mock.set_traffic(a.id, &ea, 7, 0);
        f.mock.set_traffic(b.id, &eb, 11, 0);
        f.mock.hang_node(a.id);

        let report = tokio::time::timeout(Duration::from_secs(5), f.engine.reconcile())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.collect_failures, 1);
        assert_eq!(used_bytes(&f.db, &sub.id).await, 11);
    }

    #[tokio::test]
    async fn test_multiplier_changes_limit_in_raw_bytes() {
        let f = fixture().await;
        let (cheap, ic) = node_with_inbound(&f.db, "cheap", 1.0).await;
        let (dear, id) = node_with_inbound(&f.db, "dear", 3.0).await;
        let on_cheap = subscription_with_quota(&f.db, 3000).await;
        let on_dear = subscription_with_quota(&f.db, 3000).await;
        let ec = bind(&f.db, &on_cheap, &ic, false).await;
        let ed = bind(&f.db, &on_dear, &id, false).await;

        f.mock.set_traffic(cheap.id, &ec, 1000, 0);
        f.mock.set_traffic(dear.id, &ed, 1000, 0);
        f.engine.reconcile().await.unwrap();
        assert_eq!(disabled_flags(&f.db, &on_cheap.id).await, vec![false]);
        assert_eq!(disabled_flags(&f.db, &on_dear.id).await, vec![true]);

        f.mock.set_traffic(cheap.id, &ec, 3000, 0);
        f.engine.reconcile().await.unwrap();
        assert_eq!(disabled_flags(&f.db, &on_cheap.id).await, vec![true]);
    }

    #[tokio::test]
    async fn test_node_side_disable_is_repaired() {
        let f = fixture().await;
        let (n, inbound) = node_with_inbound(&f.db, "ams", 1.0).await;
        let sub = subscription_with_quota(&f.db, 0).await;
        let email = bind(&f.db, &sub, &inbound, false).await;
        f.mock.set_traffic(n.id, &email, 10, 0);
        f.mock.set_remote_enabled(n.id, &email, false);

        let report = f.engine.reconcile().await.unwrap();

        assert_eq!(report.enabled, 1);
        assert!(f.mock.client(n.id, &email).unwrap().enable);
        assert_eq!(disabled_flags(&f.db, &sub.id).await, vec![false]);
    }

    #[tokio::test]
    async fn test_delayed_expiry_starts_on_first_use() {
        let f = fixture().await;
        let (n, inbound) = node_with_inbound(&f.db, "ams", 1.0).await;
        let sub = subscription_service::create_subscription(
            &f.db,
            subscription_service::NewSubscription {
                enabled: true,
                show_multiplier: 1,
                expire_after_first_use_seconds: 86_400,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let email = bind(&f.db, &sub, &inbound, false).await;
        f.mock.set_traffic(n.id, &email, 0, 0);

        let report = f.engine.reconcile().await.unwrap();
        assert_eq!(report.activations, 0);

        f.mock.set_traffic(n.id, &email, 1, 0);
        let before = Utc::now();
        let report = f.engine.reconcile().await.unwrap();
        assert_eq!(report.activations, 1);
        let expire_at = subscription_service::get_subscription(&f.db, &sub.id)
            .await
            .unwrap()
            .unwrap()
            .expire_at
            .unwrap();
        assert!(expire_at >= before + TimeDelta::seconds(86_399));
        assert!(expire_at <= Utc::now() + TimeDelta::seconds(86_400));
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_does_not_stop_the_tick() {
        use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter};

        let f = fixture().await;
        let (n, inbound) = node_with_inbound(&f.db, "ams", 1.0).await;
        let broken = subscription_with_quota(&f.db, 0).await;
        subscription::Entity::update_many()
            .col_expr(
                subscription::Column::ExpireAfterFirstUseSeconds,
                Expr::value(10_000_000_000_000i64),
            )
            .filter(subscription::Column::Id.eq(broken.id.clone()))
            .exec(&f.db)
            .await
            .unwrap();
        let over = subscription_with_quota(&f.db, 10).await;
        let eb = bind(&f.db, &broken, &inbound, false).await;
        let eo = bind(&f.db, &over, &inbound, false).await;
        f.mock.set_traffic(n.id, &eb, 100, 0);
        f.mock.set_traffic(n.id, &eo, 100, 0);

        let engine = Arc::new(f.engine);
        let report = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reconcile().await }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(report.subscriptions, 2);
        assert_eq!(report.activations, 0);
        let broken = subscription_service::get_subscription(&f.db, &broken.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broken.used_bytes, 100);
        assert_eq!(broken.expire_at, None);
        assert_eq!(used_bytes(&f.db, &over.id).await, 100);
        assert_eq!(disabled_flags(&f.db, &over.id).await, vec![true]);
    }

    #[tokio::test]
    async fn test_delayed_expiry_prefers_node_reported_start() {
        let f = fixture().await;
        let (n, inbound) = node_with_inbound(&f.db, "ams", 1.0).await;
        let sub = subscription_service::create_subscription(
            &f.db,
            subscription_service::NewSubscription {
                enabled: true,
                show_multiplier: 1,
                expire_after_first_use_seconds: 86_400,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let email = bind(&f.db, &sub, &inbound, false).await;
        f.mock.set_traffic(n.id, &email, 0, 0);
        let reported = (Utc::now() + TimeDelta::hours(5)).timestamp_millis();
        f.mock.set_expiry(n.id, &email, reported);

        f.engine.reconcile().await.unwrap();

        let expire_at = subscription_service::get_subscription(&f.db, &sub.id)
            .await
            .unwrap()
            .unwrap()
            .expire_at
            .unwrap();
        assert_eq!(expire_at.timestamp_millis(), reported);
    }
}
