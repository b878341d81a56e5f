use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A meterable inbound (listener) on a node. Several inbounds of the same node
/// may carry different traffic multipliers.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "node_inbounds")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub node_id: i32,
    /// Inbound id as known by the remote panel.
    pub inbound_id: i32,
    pub name: Option<String>,
    /// Quota-currency bytes per raw byte measured on this inbound. Always >= 1.0.
    pub traffic_multiplier: f64,
    pub enabled: bool,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::node::Entity",
        from = "Column::NodeId",
        to = "super::node::Column::Id",
        on_delete = "Cascade",
        on_update = "Cascade"
    )]
    Node,
    #[sea_orm(has_many = "super::subscription_node::Entity")]
    SubscriptionNodes,
}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Node.def()
    }
}

impl Related<super::subscription_node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SubscriptionNodes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
