use chrono::{DateTime, Utc};
use std::fmt;

use crate::db::entities::subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Expired,
    OverLimit,
}

/// What a subscription should look like on the fleet right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Switched off by an administrator. The engine leaves the fleet alone.
    AdminDisabled,
    Suspended(SuspendReason),
    Active,
}

impl SubscriptionState {
    /// Evaluates the state from presentation-owned fields and the usage
    /// computed during this tick. Administrative disable wins over everything;
    /// expiry is reported before the quota when both hold.
    pub fn evaluate(
        subscription: &subscription::Model,
        effective_usage: i64,
        now: DateTime<Utc>,
    ) -> Self {
        if !subscription.enabled {
            return Self::AdminDisabled;
        }
        if subscription.expire_at.is_some_and(|at| at < now) {
            return Self::Suspended(SuspendReason::Expired);
        }
        if subscription.data_limit_bytes > 0 && effective_usage >= subscription.data_limit_bytes {
            return Self::Suspended(SuspendReason::OverLimit);
        }
        Self::Active
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdminDisabled => f.write_str("admin_disabled"),
            Self::Suspended(SuspendReason::Expired) => f.write_str("expired"),
            Self::Suspended(SuspendReason::OverLimit) => f.write_str("over_limit"),
            Self::Active => f.write_str("active"),
        }
    }
}
