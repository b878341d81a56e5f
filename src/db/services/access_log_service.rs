use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::Serialize;

use crate::db::entities::{access_log, subscription};
use crate::db::services::binding_service;

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    #[serde(flatten)]
    pub subscription: subscription::Model,
    pub access_count: u64,
    pub first_access: Option<DateTime<Utc>>,
    pub last_access: Option<DateTime<Utc>>,
    pub last_user_agent: Option<String>,
    pub nodes: Vec<String>,
}

pub async fn log_access(
    db: &DatabaseConnection,
    subscription_id: &str,
    ip_address: Option<String>,
    user_agent: Option<String>,
) -> Result<(), DbErr> {
    access_log::ActiveModel {
        subscription_id: Set(subscription_id.to_owned()),
        ip_address: Set(ip_address.filter(|s| !s.is_empty())),
        user_agent: Set(user_agent.filter(|s| !s.is_empty())),
        accessed_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(())
}

pub async fn subscription_stats(
    db: &DatabaseConnection,
    subscription_id: &str,
) -> Result<Option<SubscriptionStats>, DbErr> {
    let Some(sub) = subscription::Entity::find_by_id(subscription_id.to_owned())
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    let logs = access_log::Entity::find().filter(access_log::Column::SubscriptionId.eq(subscription_id));
    let access_count = logs.clone().count(db).await?;
    let first = logs
        .clone()
        .order_by_asc(access_log::Column::AccessedAt)
        .one(db)
        .await?;
    let last = logs
        .order_by_desc(access_log::Column::AccessedAt)
        .one(db)
        .await?;

    let nodes = binding_service::list_bindings(db, subscription_id)
        .await?
        .iter()
        .map(|b| b.display_name().to_owned())
        .collect();

    Ok(Some(SubscriptionStats {
        subscription: sub,
        access_count,
        first_access: first.map(|l| l.accessed_at),
        last_access: last.as_ref().map(|l| l.accessed_at),
        last_user_agent: last.and_then(|l| l.user_agent),
        nodes,
    }))
}
