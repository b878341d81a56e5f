use chrono::{DateTime, TimeDelta, Utc};
use rand::{distr::Alphanumeric, Rng};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr,
    EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};
use serde::Serialize;

use crate::db::entities::{access_log, node, subscription};

pub const BYTES_PER_GB: i64 = 1_073_741_824;
const SUBSCRIPTION_ID_LEN: usize = 20;

/// Longest validity a subscription may carry, in days.
pub const MAX_VALIDITY_DAYS: i64 = 36_500;
/// Longest delay-start duration, in seconds.
pub const MAX_FIRST_USE_SECONDS: i64 = MAX_VALIDITY_DAYS * 86_400;

/// `at` moved by `days`, or `None` when the result is not representable.
pub fn shift_days(at: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_days(days).and_then(|delta| at.checked_add_signed(delta))
}

/// Rejects validity or delay-start durations beyond the supported range.
pub fn check_durations(validity_days: i64, first_use_seconds: i64) -> Result<(), String> {
    if validity_days > MAX_VALIDITY_DAYS {
        return Err(format!(
            "validity of {validity_days} days exceeds the maximum of {MAX_VALIDITY_DAYS}"
        ));
    }
    if first_use_seconds > MAX_FIRST_USE_SECONDS {
        return Err(format!(
            "delay of {first_use_seconds} seconds exceeds the maximum of {MAX_FIRST_USE_SECONDS}"
        ));
    }
    Ok(())
}

fn expiry_out_of_range(days: i64) -> DbErr {
    DbErr::Custom(format!("expiry {days} days from now is out of range"))
}

pub fn generate_subscription_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SUBSCRIPTION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Converts a (possibly fractional) GB figure into bytes. Negative input means unlimited.
pub fn gb_to_bytes(gb: f64) -> i64 {
    if gb.is_finite() && gb > 0.0 {
        (gb * BYTES_PER_GB as f64) as i64
    } else {
        0
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSubscription {
    pub id: Option<String>,
    pub comment: Option<String>,
    pub data_limit_bytes: i64,
    pub validity_days: i32,
    pub ip_limit: i32,
    pub enabled: bool,
    pub show_multiplier: i32,
    pub expire_after_first_use_seconds: i64,
}

/// Partial update of presentation-owned fields. `used_bytes` is written through
/// [`reset_used_bytes`] only.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub comment: Option<Option<String>>,
    pub data_limit_bytes: Option<i64>,
    pub validity_days: Option<i32>,
    pub ip_limit: Option<i32>,
    /// `Some(None)` removes the expiry.
    pub expire_at: Option<Option<DateTime<Utc>>>,
    pub enabled: Option<bool>,
    pub show_multiplier: Option<i32>,
    pub expire_after_first_use_seconds: Option<i64>,
}

impl SubscriptionUpdate {
    pub fn touches_remote_client(&self) -> bool {
        self.expire_at.is_some()
            || self.validity_days.is_some()
            || self.ip_limit.is_some()
            || self.expire_after_first_use_seconds.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentAccess {
    pub subscription_id: String,
    pub accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewStats {
    pub total_subs: u64,
    pub active_subs: u64,
    pub nodes: u64,
    pub recent: Vec<RecentAccess>,
}

pub async fn create_subscription(
    db: &DatabaseConnection,
    input: NewSubscription,
) -> Result<subscription::Model, DbErr> {
    check_durations(input.validity_days as i64, input.expire_after_first_use_seconds)
        .map_err(DbErr::Custom)?;
    let now = Utc::now();
    let expire_at = if input.validity_days > 0 && input.expire_after_first_use_seconds <= 0 {
        let days = input.validity_days as i64;
        Some(shift_days(now, days).ok_or_else(|| expiry_out_of_range(days))?)
    } else {
        None
    };

    let new_sub = subscription::ActiveModel {
        id: Set(input
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_subscription_id)),
        comment: Set(input.comment.filter(|c| !c.is_empty())),
        data_limit_bytes: Set(input.data_limit_bytes.max(0)),
        validity_days: Set(input.validity_days.max(0)),
        ip_limit: Set(input.ip_limit.max(0)),
        used_bytes: Set(0),
        expire_at: Set(expire_at),
        enabled: Set(input.enabled),
        show_multiplier: Set(input.show_multiplier.max(1)),
        expire_after_first_use_seconds: Set(input.expire_after_first_use_seconds.max(0)),
        created_at: Set(now),
    };
    new_sub.insert(db).await
}

pub async fn get_subscription(
    db: &DatabaseConnection,
    subscription_id: &str,
) -> Result<Option<subscription::Model>, DbErr> {
    subscription::Entity::find_by_id(subscription_id.to_owned())
        .one(db)
        .await
}

/// Looks a subscription up by its label first, then by id.
pub async fn find_subscription_by_comment_or_id(
    db: &DatabaseConnection,
    key: &str,
) -> Result<Option<subscription::Model>, DbErr> {
    subscription::Entity::find()
        .filter(
            Condition::any()
                .add(subscription::Column::Comment.eq(key))
                .add(subscription::Column::Id.eq(key)),
        )
        .one(db)
        .await
}

/// Newest first. `per_page == 0` returns everything.
pub async fn list_subscriptions(
    db: &DatabaseConnection,
    page: u64,
    per_page: u64,
    search: Option<&str>,
) -> Result<(Vec<subscription::Model>, u64), DbErr> {
    let mut query = subscription::Entity::find();
    if let Some(term) = search.filter(|s| !s.is_empty()) {
        query = query.filter(
            Condition::any()
                .add(subscription::Column::Id.contains(term))
                .add(subscription::Column::Comment.contains(term)),
        );
    }
    let total = query.clone().count(db).await?;

    let mut query = query.order_by_desc(subscription::Column::CreatedAt);
    if per_page > 0 {
        query = query
            .limit(per_page)
            .offset(page.saturating_sub(1) * per_page);
    }
    Ok((query.all(db).await?, total))
}

pub async fn update_subscription(
    db: &DatabaseConnection,
    subscription_id: &str,
    update: SubscriptionUpdate,
) -> Result<subscription::Model, DbErr> {
    let id = subscription_id.to_owned();
    db.transaction::<_, subscription::Model, DbErr>(|txn| {
        Box::pin(async move {
            let model = subscription::Entity::find_by_id(id.clone())
                .one(txn)
                .await?
                .ok_or_else(|| DbErr::RecordNotFound(format!("Subscription {id} not found")))?;
            check_durations(
                update.validity_days.unwrap_or(0) as i64,
                update.expire_after_first_use_seconds.unwrap_or(0),
            )
            .map_err(DbErr::Custom)?;

            let delay_start = update
                .expire_after_first_use_seconds
                .unwrap_or(model.expire_after_first_use_seconds)
                > 0;

            let mut active = model.clone().into_active_model();
            if let Some(val) = update.comment {
                active.comment = Set(val.filter(|c| !c.is_empty()));
            }
            if let Some(val) = update.data_limit_bytes {
                active.data_limit_bytes = Set(val.max(0));
            }
            if let Some(val) = update.ip_limit {
                active.ip_limit = Set(val.max(0));
            }
            if let Some(val) = update.enabled {
                active.enabled = Set(val);
            }
            if let Some(val) = update.show_multiplier {
                active.show_multiplier = Set(val.max(1));
            }
            if let Some(val) = update.expire_after_first_use_seconds {
                active.expire_after_first_use_seconds = Set(val.max(0));
                if val > 0 {
                    // Switching to delay-start restarts the clock at first use.
                    active.expire_at = Set(None);
                }
            }
            if let Some(days) = update.validity_days {
                active.validity_days = Set(days.max(0));
                if days > 0 && update.expire_at.is_none() && !delay_start {
                    let days = days as i64;
                    let expire_at =
                        shift_days(Utc::now(), days).ok_or_else(|| expiry_out_of_range(days))?;
                    active.expire_at = Set(Some(expire_at));
                }
            }
            if let Some(val) = update.expire_at {
                active.expire_at = Set(val);
            }

            if !active.is_changed() {
                return Ok(model);
            }
            active.update(txn).await
        })
    })
    .await
    .map_err(|e| match e {
        sea_orm::TransactionError::Connection(err) => err,
        sea_orm::TransactionError::Transaction(err) => err,
    })
}

/// The only way presentation code may write `used_bytes`.
pub async fn reset_used_bytes(db: &DatabaseConnection, subscription_id: &str) -> Result<u64, DbErr> {
    let res = subscription::Entity::update_many()
        .col_expr(subscription::Column::UsedBytes, Expr::value(0i64))
        .filter(subscription::Column::Id.eq(subscription_id))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Removes the subscription with its bindings and access logs.
pub async fn delete_subscription(db: &DatabaseConnection, subscription_id: &str) -> Result<u64, DbErr> {
    use crate::db::entities::subscription_node;

    let txn = db.begin().await?;
    subscription_node::Entity::delete_many()
        .filter(subscription_node::Column::SubscriptionId.eq(subscription_id))
        .exec(&txn)
        .await?;
    access_log::Entity::delete_many()
        .filter(access_log::Column::SubscriptionId.eq(subscription_id))
        .exec(&txn)
        .await?;
    let res = subscription::Entity::delete_by_id(subscription_id.to_owned())
        .exec(&txn)
        .await?;
    txn.commit().await?;
    Ok(res.rows_affected)
}

pub async fn overview_stats(db: &DatabaseConnection) -> Result<OverviewStats, DbErr> {
    let now = Utc::now();
    let total_subs = subscription::Entity::find().count(db).await?;
    let active_subs = subscription::Entity::find()
        .filter(subscription::Column::Enabled.eq(true))
        .filter(
            Condition::any()
                .add(subscription::Column::ExpireAt.is_null())
                .add(subscription::Column::ExpireAt.gt(now)),
        )
        .filter(
            Condition::any()
                .add(subscription::Column::DataLimitBytes.eq(0))
                .add(
                    Expr::col(subscription::Column::UsedBytes)
                        .lt(Expr::col(subscription::Column::DataLimitBytes)),
                ),
        )
        .count(db)
        .await?;
    let nodes = node::Entity::find()
        .filter(node::Column::Enabled.eq(true))
        .count(db)
        .await?;
    let recent = access_log::Entity::find()
        .order_by_desc(access_log::Column::AccessedAt)
        .limit(10)
        .all(db)
        .await?
        .into_iter()
        .map(|log| RecentAccess {
            subscription_id: log.subscription_id,
            accessed_at: log.accessed_at,
        })
        .collect();

    Ok(OverviewStats {
        total_subs,
        active_subs,
        nodes,
        recent,
    })
}
