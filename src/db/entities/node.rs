use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    /// Panel base URL, e.g. `https://1.2.3.4:2053/secretpath`.
    pub address: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub proxy_url: Option<String>,
    pub enabled: bool,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::node_inbound::Entity")]
    NodeInbounds,
}

impl Related<super::node_inbound::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NodeInbounds.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
