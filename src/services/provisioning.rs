use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::entities::{node, subscription};
use crate::db::services::{
    self as store, check_durations, gb_to_bytes, shift_days, BoundInbound, NewBinding,
    NewSubscription, SubscriptionUpdate, MAX_VALIDITY_DAYS,
};
use crate::gateway::{ClientSpec, GatewayClient, GatewayConnector, GatewayError, NodeEndpoint};
use crate::reconcile::{quota_hint, SubscriptionState};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Subscription {0} not found")]
    SubscriptionNotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Database error: {0}")]
    Db(#[from] DbErr),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CreateSubscription {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub data_gb: f64,
    #[serde(default)]
    pub days: i32,
    #[serde(default)]
    pub ip_limit: i32,
    #[serde(default = "default_show_multiplier")]
    pub show_multiplier: i32,
    #[serde(default)]
    pub expire_after_first_use_seconds: i64,
    /// Node inbound row ids to provision on.
    #[serde(default)]
    pub node_ids: Vec<i32>,
}

fn default_show_multiplier() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSubscription {
    pub subscription: subscription::Model,
    pub client_uuid: String,
    pub errors: Vec<String>,
}

/// A partial edit as sent by the admin API.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EditSubscription {
    #[serde(default, deserialize_with = "crate::db::services::double_option")]
    pub comment: Option<Option<String>>,
    pub data_gb: Option<f64>,
    pub days: Option<i32>,
    pub ip_limit: Option<i32>,
    pub enabled: Option<bool>,
    pub show_multiplier: Option<i32>,
    pub expire_after_first_use_seconds: Option<i64>,
    #[serde(default)]
    pub remove_expiry: bool,
    /// Pulls the current expiry this many days closer.
    pub remove_days: Option<i64>,
    pub expire_at: Option<DateTime<Utc>>,
}

impl EditSubscription {
    fn touches_expiry(&self) -> bool {
        self.remove_expiry || self.remove_days.is_some() || self.expire_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BulkExtend {
    pub sub_ids: Vec<String>,
    #[serde(default)]
    pub data_gb: f64,
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub remove_expiry: bool,
    #[serde(default)]
    pub remove_data_limit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingAction {
    Add,
    Remove,
}

/// Expiry as the remote panel expects it: absolute unix milliseconds, a
/// negative duration while a delay-started subscription is unused, or 0.
pub fn remote_expiry_ms(sub: &subscription::Model) -> i64 {
    if sub.is_pending_first_use() {
        return -sub.expire_after_first_use_seconds.saturating_mul(1000);
    }
    sub.expire_at.map_or(0, |at| at.timestamp_millis())
}

/// Admin-facing operations that change a subscription together with its
/// clients on the fleet. Remote calls are best effort: failures are logged
/// or reported back, the store change always goes through.
pub struct ProvisioningService {
    db: DatabaseConnection,
    gateways: Arc<dyn GatewayConnector>,
    call_timeout: Duration,
}

impl ProvisioningService {
    pub fn new(
        db: DatabaseConnection,
        gateways: Arc<dyn GatewayConnector>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            gateways,
            call_timeout,
        }
    }

    fn client(&self, node: &node::Model) -> Result<Arc<dyn GatewayClient>, GatewayError> {
        self.gateways.client_for(&NodeEndpoint::from(node))
    }

    pub async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.call_timeout)),
        }
    }

    async fn load(&self, sub_id: &str) -> Result<subscription::Model, ProvisionError> {
        store::get_subscription(&self.db, sub_id)
            .await?
            .ok_or_else(|| ProvisionError::SubscriptionNotFound(sub_id.to_string()))
    }

    pub async fn create_subscription(
        &self,
        req: CreateSubscription,
    ) -> Result<CreatedSubscription, ProvisionError> {
        check_durations(req.days as i64, req.expire_after_first_use_seconds)
            .map_err(ProvisionError::InvalidInput)?;
        let sub = store::create_subscription(
            &self.db,
            NewSubscription {
                id: None,
                comment: req.comment,
                data_limit_bytes: gb_to_bytes(req.data_gb),
                validity_days: req.days,
                ip_limit: req.ip_limit,
                enabled: true,
                show_multiplier: req.show_multiplier,
                expire_after_first_use_seconds: req.expire_after_first_use_seconds,
            },
        )
        .await?;
        info!(subscription_id = %sub.id, "Subscription created.");

        let client_uuid = Uuid::new_v4().to_string();
        let errors = self
            .provision_inbounds(&sub, &client_uuid, &req.node_ids, &HashSet::new())
            .await?;
        Ok(CreatedSubscription {
            subscription: sub,
            client_uuid,
            errors,
        })
    }

    /// Binds the subscription to more inbounds. Already bound inbounds are
    /// skipped and the subscription's existing client id is reused.
    pub async fn add_bindings(
        &self,
        sub_id: &str,
        node_inbound_ids: &[i32],
    ) -> Result<Vec<String>, ProvisionError> {
        let sub = self.load(sub_id).await?;
        let existing = store::list_bindings(&self.db, sub_id).await?;
        let bound: HashSet<i32> = existing.iter().map(|b| b.inbound.id).collect();
        let client_uuid = existing
            .first()
            .map(|b| b.binding.client_uuid.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.provision_inbounds(&sub, &client_uuid, node_inbound_ids, &bound)
            .await
    }

    async fn provision_inbounds(
        &self,
        sub: &subscription::Model,
        client_uuid: &str,
        node_inbound_ids: &[i32],
        skip: &HashSet<i32>,
    ) -> Result<Vec<String>, ProvisionError> {
        // Clients joining a subscription that is not active start disabled.
        let start_disabled =
            SubscriptionState::evaluate(sub, sub.used_bytes, Utc::now()) != SubscriptionState::Active;
        let remaining = (sub.data_limit_bytes > 0)
            .then(|| (sub.data_limit_bytes - sub.used_bytes).max(0));
        let expiry_time = remote_expiry_ms(sub);

        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for &ni_id in node_inbound_ids {
            if skip.contains(&ni_id) || !seen.insert(ni_id) {
                continue;
            }
            let Some((inbound, node)) = store::get_node_inbound_with_node(&self.db, ni_id).await?
            else {
                errors.push(format!("inbound {ni_id}: not found"));
                continue;
            };

            let email = format!("{}-{}", sub.id, inbound.id);
            let spec = ClientSpec {
                id: client_uuid.to_string(),
                email: email.clone(),
                limit_ip: sub.ip_limit,
                total_bytes: remaining.map_or(0, |r| quota_hint(0, r, inbound.traffic_multiplier)),
                expiry_time,
                enable: !start_disabled,
                sub_id: sub.id.clone(),
                comment: sub.comment.clone().unwrap_or_default(),
            };
            let added = match self.client(&node) {
                Ok(client) => self.call(client.add_client(inbound.inbound_id, &spec)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = added {
                warn!(subscription_id = %sub.id, node_id = node.id, inbound_id = inbound.inbound_id, error = %e, "Failed to add client.");
                errors.push(format!("inbound {ni_id}: {e}"));
                continue;
            }

            store::add_binding(
                &self.db,
                NewBinding {
                    subscription_id: sub.id.clone(),
                    node_inbound_id: inbound.id,
                    client_uuid: client_uuid.to_string(),
                    email,
                    client_disabled: start_disabled,
                },
            )
            .await?;
            info!(subscription_id = %sub.id, node_id = node.id, inbound_id = inbound.inbound_id, "Client added to node.");
        }
        Ok(errors)
    }

    async fn delete_remote(&self, sub_id: &str, bound: &BoundInbound) {
        let deleted = match self.client(&bound.node) {
            Ok(client) => {
                self.call(client.delete_client(bound.inbound.inbound_id, &bound.binding.client_uuid))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = deleted {
            warn!(subscription_id = %sub_id, node_id = bound.node.id, error = %e, "Failed to delete client from node.");
        }
    }

    async fn push_enabled(&self, sub_id: &str, bindings: &[BoundInbound], enabled: bool) {
        for bound in bindings {
            let result = match self.client(&bound.node) {
                Ok(client) => {
                    self.call(client.set_client_enabled(
                        bound.inbound.inbound_id,
                        &bound.binding.client_uuid,
                        &bound.binding.email,
                        enabled,
                    ))
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(subscription_id = %sub_id, node_id = bound.node.id, enabled, error = %e, "Failed to push client state.");
            }
        }
    }

    async fn push_expiry(&self, sub: &subscription::Model, bindings: &[BoundInbound]) {
        let expiry_time = remote_expiry_ms(sub);
        for bound in bindings {
            let result = match self.client(&bound.node) {
                Ok(client) => {
                    self.call(client.update_client_expiry(
                        bound.inbound.inbound_id,
                        &bound.binding.client_uuid,
                        &bound.binding.email,
                        expiry_time,
                        sub.ip_limit,
                    ))
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(subscription_id = %sub.id, node_id = bound.node.id, error = %e, "Failed to push client expiry.");
            }
        }
    }

    /// Returns false when the binding did not exist.
    pub async fn remove_binding(&self, sub_id: &str, node_inbound_id: i32) -> Result<bool, ProvisionError> {
        let bindings = store::list_bindings(&self.db, sub_id).await?;
        let Some(bound) = bindings.iter().find(|b| b.inbound.id == node_inbound_id) else {
            return Ok(false);
        };
        self.delete_remote(sub_id, bound).await;
        store::remove_binding(&self.db, sub_id, node_inbound_id).await?;
        Ok(true)
    }

    pub async fn delete_subscription(&self, sub_id: &str) -> Result<bool, ProvisionError> {
        for bound in store::list_bindings(&self.db, sub_id).await? {
            self.delete_remote(sub_id, &bound).await;
        }
        let deleted = store::delete_subscription(&self.db, sub_id).await? > 0;
        if deleted {
            info!(subscription_id = %sub_id, "Subscription deleted.");
        }
        Ok(deleted)
    }

    pub async fn update_subscription(
        &self,
        sub_id: &str,
        edit: EditSubscription,
    ) -> Result<subscription::Model, ProvisionError> {
        check_durations(
            edit.days.unwrap_or(0) as i64,
            edit.expire_after_first_use_seconds.unwrap_or(0),
        )
        .map_err(ProvisionError::InvalidInput)?;
        let current = self.load(sub_id).await?;

        let mut expire_at: Option<Option<DateTime<Utc>>> = None;
        if edit.remove_expiry {
            expire_at = Some(None);
        }
        if edit.expire_after_first_use_seconds.unwrap_or(0) <= 0 {
            if let (Some(days), Some(at)) = (edit.remove_days.filter(|d| *d > 0), current.expire_at) {
                let moved = shift_days(at, -days).ok_or_else(|| {
                    ProvisionError::InvalidInput(format!("cannot move expiry back by {days} days"))
                })?;
                expire_at = Some(Some(moved));
            }
        }
        if let Some(at) = edit.expire_at {
            expire_at = Some(Some(at));
        }

        let update = SubscriptionUpdate {
            comment: edit.comment.clone(),
            data_limit_bytes: edit.data_gb.map(gb_to_bytes),
            validity_days: edit.days,
            ip_limit: edit.ip_limit,
            expire_at,
            enabled: edit.enabled,
            show_multiplier: edit.show_multiplier,
            expire_after_first_use_seconds: edit.expire_after_first_use_seconds,
        };
        let remote_expiry = update.touches_remote_client() || edit.touches_expiry();
        let updated = store::update_subscription(&self.db, sub_id, update).await?;

        let bindings = store::list_bindings(&self.db, sub_id).await?;
        if let Some(enabled) = edit.enabled {
            if enabled {
                store::reset_bindings_disabled(&self.db, sub_id).await?;
            }
            self.push_enabled(sub_id, &bindings, enabled).await;
            info!(subscription_id = %sub_id, enabled, "Subscription toggled.");
        }
        if remote_expiry {
            self.push_expiry(&updated, &bindings).await;
        }
        Ok(updated)
    }

    /// Zeroes the usage cache. Remote counters are left as they are.
    pub async fn reset_usage(&self, sub_id: &str) -> Result<bool, ProvisionError> {
        Ok(store::reset_used_bytes(&self.db, sub_id).await? > 0)
    }

    pub async fn bulk_toggle(&self, sub_ids: &[String], enabled: bool) -> Result<usize, ProvisionError> {
        let mut toggled = 0;
        for sub_id in sub_ids {
            match self
                .update_subscription(
                    sub_id,
                    EditSubscription {
                        enabled: Some(enabled),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => toggled += 1,
                Err(ProvisionError::SubscriptionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(toggled)
    }

    pub async fn bulk_delete(&self, sub_ids: &[String]) -> Result<usize, ProvisionError> {
        let mut deleted = 0;
        for sub_id in sub_ids {
            if self.delete_subscription(sub_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Adds data and days to many subscriptions at once. Days extend the
    /// current expiry, or start from now for subscriptions without one.
    pub async fn bulk_extend(&self, req: &BulkExtend) -> Result<usize, ProvisionError> {
        if req.days.unsigned_abs() > MAX_VALIDITY_DAYS as u64 {
            return Err(ProvisionError::InvalidInput(format!(
                "extension of {} days exceeds the maximum of {MAX_VALIDITY_DAYS}",
                req.days
            )));
        }
        let mut extended = 0;
        for sub_id in &req.sub_ids {
            let Some(sub) = store::get_subscription(&self.db, sub_id).await? else {
                continue;
            };

            let mut update = SubscriptionUpdate::default();
            if req.remove_data_limit {
                update.data_limit_bytes = Some(0);
            } else if req.data_gb != 0.0 {
                let delta = (req.data_gb * store::BYTES_PER_GB as f64) as i64;
                update.data_limit_bytes = Some(sub.data_limit_bytes.saturating_add(delta).max(0));
            }
            if req.remove_expiry {
                update.expire_at = Some(None);
            } else if req.days != 0 {
                let base = match sub.expire_at {
                    Some(at) => Some(at),
                    None if req.days > 0 => Some(Utc::now()),
                    None => None,
                };
                if let Some(base) = base {
                    let extended_to = shift_days(base, req.days).ok_or_else(|| {
                        ProvisionError::InvalidInput(format!(
                            "expiry of {sub_id} cannot be moved by {} days",
                            req.days
                        ))
                    })?;
                    update.expire_at = Some(Some(extended_to));
                }
            }
            if update.data_limit_bytes.is_none() && update.expire_at.is_none() {
                continue;
            }

            let expiry_changed = update.expire_at.is_some();
            let updated = store::update_subscription(&self.db, sub_id, update).await?;
            if expiry_changed {
                let bindings = store::list_bindings(&self.db, sub_id).await?;
                self.push_expiry(&updated, &bindings).await;
            }
            extended += 1;
        }
        Ok(extended)
    }

    pub async fn bulk_bindings(
        &self,
        sub_ids: &[String],
        node_inbound_ids: &[i32],
        action: BindingAction,
    ) -> Result<Vec<String>, ProvisionError> {
        let mut errors = Vec::new();
        for sub_id in sub_ids {
            match action {
                BindingAction::Add => match self.add_bindings(sub_id, node_inbound_ids).await {
                    Ok(errs) => errors.extend(errs.into_iter().map(|e| format!("{sub_id}/{e}"))),
                    Err(ProvisionError::SubscriptionNotFound(_)) => {}
                    Err(e) => return Err(e),
                },
                BindingAction::Remove => {
                    for &ni_id in node_inbound_ids {
                        self.remove_binding(sub_id, ni_id).await?;
                    }
                }
            }
        }
        Ok(errors)
    }
}
