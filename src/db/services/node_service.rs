use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;

use crate::db::entities::{node, node_inbound, subscription_node};

/// Multipliers below 1.0 (or non-finite ones) become 1.0.
pub fn clamp_multiplier(multiplier: f64) -> f64 {
    if multiplier.is_finite() && multiplier > 1.0 {
        multiplier
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    pub username: String,
    pub password: String,
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `Some(None)` clears the proxy.
    #[serde(default, deserialize_with = "super::double_option")]
    pub proxy_url: Option<Option<String>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNodeInbound {
    pub inbound_id: i32,
    pub name: Option<String>,
    #[serde(default = "default_multiplier")]
    pub traffic_multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInboundUpdate {
    pub inbound_id: Option<i32>,
    pub name: Option<String>,
    pub traffic_multiplier: Option<f64>,
    pub enabled: Option<bool>,
}

// --- Nodes ---

pub async fn create_node(db: &DatabaseConnection, input: NewNode) -> Result<node::Model, DbErr> {
    let new_node = node::ActiveModel {
        name: Set(input.name),
        address: Set(input.address.trim_end_matches('/').to_owned()),
        username: Set(input.username),
        password: Set(input.password),
        proxy_url: Set(input.proxy_url.filter(|p| !p.is_empty())),
        enabled: Set(true),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    new_node.insert(db).await
}

pub async fn list_nodes(db: &DatabaseConnection) -> Result<Vec<node::Model>, DbErr> {
    node::Entity::find()
        .order_by_asc(node::Column::Id)
        .all(db)
        .await
}

pub async fn get_node(db: &DatabaseConnection, node_id: i32) -> Result<Option<node::Model>, DbErr> {
    node::Entity::find_by_id(node_id).one(db).await
}

pub async fn update_node(
    db: &DatabaseConnection,
    node_id: i32,
    update: NodeUpdate,
) -> Result<node::Model, DbErr> {
    let model = node::Entity::find_by_id(node_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("Node with id {node_id} not found")))?;

    let mut active = model.clone().into_active_model();
    if let Some(val) = update.name {
        active.name = Set(val);
    }
    if let Some(val) = update.address {
        active.address = Set(val.trim_end_matches('/').to_owned());
    }
    if let Some(val) = update.username {
        active.username = Set(val);
    }
    if let Some(val) = update.password {
        active.password = Set(val);
    }
    if let Some(val) = update.proxy_url {
        active.proxy_url = Set(val.filter(|p| !p.is_empty()));
    }
    if let Some(val) = update.enabled {
        active.enabled = Set(val);
    }
    if !active.is_changed() {
        return Ok(model);
    }
    active.update(db).await
}

/// Deletes a node together with its inbounds and every binding to them.
/// Returns the number of deleted node rows.
pub async fn delete_node(db: &DatabaseConnection, node_id: i32) -> Result<u64, DbErr> {
    let txn = db.begin().await?;

    let inbound_ids: Vec<i32> = node_inbound::Entity::find()
        .filter(node_inbound::Column::NodeId.eq(node_id))
        .all(&txn)
        .await?
        .into_iter()
        .map(|ni| ni.id)
        .collect();

    if !inbound_ids.is_empty() {
        subscription_node::Entity::delete_many()
            .filter(subscription_node::Column::NodeInboundId.is_in(inbound_ids))
            .exec(&txn)
            .await?;
        node_inbound::Entity::delete_many()
            .filter(node_inbound::Column::NodeId.eq(node_id))
            .exec(&txn)
            .await?;
    }

    let res = node::Entity::delete_by_id(node_id).exec(&txn).await?;
    txn.commit().await?;
    Ok(res.rows_affected)
}

// --- Node inbounds ---

pub async fn create_node_inbound(
    db: &DatabaseConnection,
    node_id: i32,
    input: NewNodeInbound,
) -> Result<node_inbound::Model, DbErr> {
    if get_node(db, node_id).await?.is_none() {
        return Err(DbErr::RecordNotFound(format!("Node with id {node_id} not found")));
    }
    let new_inbound = node_inbound::ActiveModel {
        node_id: Set(node_id),
        inbound_id: Set(input.inbound_id),
        name: Set(input.name.filter(|n| !n.is_empty())),
        traffic_multiplier: Set(clamp_multiplier(input.traffic_multiplier)),
        enabled: Set(true),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    new_inbound.insert(db).await
}

pub async fn list_node_inbounds(
    db: &DatabaseConnection,
    node_id: i32,
) -> Result<Vec<node_inbound::Model>, DbErr> {
    node_inbound::Entity::find()
        .filter(node_inbound::Column::NodeId.eq(node_id))
        .order_by_asc(node_inbound::Column::Id)
        .all(db)
        .await
}

pub async fn get_node_inbound(
    db: &DatabaseConnection,
    node_inbound_id: i32,
) -> Result<Option<node_inbound::Model>, DbErr> {
    node_inbound::Entity::find_by_id(node_inbound_id).one(db).await
}

/// An inbound together with its owning node, which carries the address and
/// credentials needed to reach the panel.
pub async fn get_node_inbound_with_node(
    db: &DatabaseConnection,
    node_inbound_id: i32,
) -> Result<Option<(node_inbound::Model, node::Model)>, DbErr> {
    let found = node_inbound::Entity::find_by_id(node_inbound_id)
        .find_also_related(node::Entity)
        .one(db)
        .await?;
    Ok(found.and_then(|(inbound, node)| node.map(|n| (inbound, n))))
}

pub async fn update_node_inbound(
    db: &DatabaseConnection,
    node_id: i32,
    node_inbound_id: i32,
    update: NodeInboundUpdate,
) -> Result<node_inbound::Model, DbErr> {
    let model = node_inbound::Entity::find_by_id(node_inbound_id)
        .filter(node_inbound::Column::NodeId.eq(node_id))
        .one(db)
        .await?
        .ok_or_else(|| {
            DbErr::RecordNotFound(format!(
                "Inbound {node_inbound_id} not found on node {node_id}"
            ))
        })?;

    let mut active = model.clone().into_active_model();
    if let Some(val) = update.inbound_id {
        active.inbound_id = Set(val);
    }
    if let Some(val) = update.name {
        active.name = Set(Some(val).filter(|n| !n.is_empty()));
    }
    if let Some(val) = update.traffic_multiplier {
        active.traffic_multiplier = Set(clamp_multiplier(val));
    }
    if let Some(val) = update.enabled {
        active.enabled = Set(val);
    }
    if !active.is_changed() {
        return Ok(model);
    }
    active.update(db).await
}

pub async fn delete_node_inbound(
    db: &DatabaseConnection,
    node_id: i32,
    node_inbound_id: i32,
) -> Result<u64, DbErr> {
    let txn = db.begin().await?;
    let owned = node_inbound::Entity::find_by_id(node_inbound_id)
        .filter(node_inbound::Column::NodeId.eq(node_id))
        .one(&txn)
        .await?;
    if owned.is_none() {
        txn.commit().await?;
        return Ok(0);
    }

    subscription_node::Entity::delete_many()
        .filter(subscription_node::Column::NodeInboundId.eq(node_inbound_id))
        .exec(&txn)
        .await?;
    let res = node_inbound::Entity::delete_by_id(node_inbound_id)
        .exec(&txn)
        .await?;
    txn.commit().await?;
    Ok(res.rows_affected)
}
