//! Writes owned by the reconciliation engine. Each touches exactly one
//! engine-owned column and leaves presentation-owned fields of the row alone.

use chrono::{DateTime, Utc};
use sea_orm::{sea_query::Expr, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};

use crate::db::entities::{subscription, subscription_node};

pub async fn set_used_bytes(
    db: &DatabaseConnection,
    subscription_id: &str,
    used_bytes: i64,
) -> Result<u64, DbErr> {
    let res = subscription::Entity::update_many()
        .col_expr(subscription::Column::UsedBytes, Expr::value(used_bytes))
        .filter(subscription::Column::Id.eq(subscription_id))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

pub async fn set_binding_disabled(
    db: &DatabaseConnection,
    subscription_id: &str,
    node_inbound_id: i32,
    disabled: bool,
) -> Result<u64, DbErr> {
    let res = subscription_node::Entity::update_many()
        .col_expr(subscription_node::Column::ClientDisabled, Expr::value(disabled))
        .filter(subscription_node::Column::SubscriptionId.eq(subscription_id))
        .filter(subscription_node::Column::NodeInboundId.eq(node_inbound_id))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Starts the clock of a delay-started subscription. No-op once `expire_at`
/// is set.
pub async fn activate_delayed_expiry(
    db: &DatabaseConnection,
    subscription_id: &str,
    expire_at: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let res = subscription::Entity::update_many()
        .col_expr(subscription::Column::ExpireAt, Expr::value(expire_at))
        .filter(subscription::Column::Id.eq(subscription_id))
        .filter(subscription::Column::ExpireAt.is_null())
        .filter(subscription::Column::ExpireAfterFirstUseSeconds.gt(0))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}
