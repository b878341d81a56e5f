use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subscription_nodes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub subscription_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub node_inbound_id: i32,
    /// Credential id on the remote panel, identical for every binding of a subscription.
    pub client_uuid: String,
    /// Remote lookup key for traffic counters.
    pub email: String,
    /// Set once the engine has disabled the client on this node.
    pub client_disabled: bool,
    pub sort_order: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::subscription::Entity",
        from = "Column::SubscriptionId",
        to = "super::subscription::Column::Id",
        on_delete = "Cascade",
        on_update = "Cascade"
    )]
    Subscription,
    #[sea_orm(
        belongs_to = "super::node_inbound::Entity",
        from = "Column::NodeInboundId",
        to = "super::node_inbound::Column::Id",
        on_delete = "Cascade",
        on_update = "Cascade"
    )]
    NodeInbound,
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl Related<super::node_inbound::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NodeInbound.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
