use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subscriptions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub comment: Option<String>,
    /// Quota in quota-currency bytes, 0 means unlimited.
    pub data_limit_bytes: i64,
    pub validity_days: i32,
    pub ip_limit: i32,
    /// Effective usage cache. Written by the reconciliation engine only,
    /// presentation code may reset it to zero.
    pub used_bytes: i64,
    pub expire_at: Option<ChronoDateTimeUtc>,
    pub enabled: bool,
    pub show_multiplier: i32,
    /// Delay-start validity. While `expire_at` is unset the clock has not started.
    pub expire_after_first_use_seconds: i64,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::subscription_node::Entity")]
    SubscriptionNodes,
    #[sea_orm(has_many = "super::access_log::Entity")]
    AccessLogs,
}

impl Related<super::subscription_node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SubscriptionNodes.def()
    }
}

impl Related<super::access_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AccessLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_pending_first_use(&self) -> bool {
        self.expire_after_first_use_seconds > 0 && self.expire_at.is_none()
    }
}
