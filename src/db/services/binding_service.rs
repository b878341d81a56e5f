use std::collections::{BTreeMap, HashMap};

use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;

use crate::db::entities::{node, node_inbound, subscription, subscription_node};

/// A binding joined with the inbound it points at and the node that hosts it.
#[derive(Debug, Clone, Serialize)]
pub struct BoundInbound {
    pub binding: subscription_node::Model,
    pub inbound: node_inbound::Model,
    pub node: node::Model,
}

impl BoundInbound {
    pub fn display_name(&self) -> &str {
        self.inbound.name.as_deref().unwrap_or(&self.node.name)
    }
}

/// One subscription as seen by the reconciliation engine: its desired-state
/// fields and every binding that sits on an enabled node and inbound.
#[derive(Debug, Clone)]
pub struct ActiveSubscription {
    pub subscription: subscription::Model,
    pub bindings: Vec<BoundInbound>,
}

pub struct NewBinding {
    pub subscription_id: String,
    pub node_inbound_id: i32,
    pub client_uuid: String,
    pub email: String,
    pub client_disabled: bool,
}

/// Inserts or replaces the binding of a subscription to an inbound. New
/// bindings are appended after the existing ones.
pub async fn add_binding(
    db: &DatabaseConnection,
    input: NewBinding,
) -> Result<subscription_node::Model, DbErr> {
    let txn = db.begin().await?;

    let max_order: Option<Option<i32>> = subscription_node::Entity::find()
        .select_only()
        .column_as(subscription_node::Column::SortOrder.max(), "max_order")
        .filter(subscription_node::Column::SubscriptionId.eq(input.subscription_id.as_str()))
        .into_tuple()
        .one(&txn)
        .await?;
    let next_order = max_order.flatten().map_or(0, |m| m + 1);

    subscription_node::Entity::delete_many()
        .filter(subscription_node::Column::SubscriptionId.eq(input.subscription_id.as_str()))
        .filter(subscription_node::Column::NodeInboundId.eq(input.node_inbound_id))
        .exec(&txn)
        .await?;

    let model = subscription_node::ActiveModel {
        subscription_id: Set(input.subscription_id),
        node_inbound_id: Set(input.node_inbound_id),
        client_uuid: Set(input.client_uuid),
        email: Set(input.email),
        client_disabled: Set(input.client_disabled),
        sort_order: Set(next_order),
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;
    Ok(model)
}

pub async fn remove_binding(
    db: &DatabaseConnection,
    subscription_id: &str,
    node_inbound_id: i32,
) -> Result<u64, DbErr> {
    let res = subscription_node::Entity::delete_many()
        .filter(subscription_node::Column::SubscriptionId.eq(subscription_id))
        .filter(subscription_node::Column::NodeInboundId.eq(node_inbound_id))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// All bindings of a subscription, ordered by their display hint.
pub async fn list_bindings(
    db: &DatabaseConnection,
    subscription_id: &str,
) -> Result<Vec<BoundInbound>, DbErr> {
    let bindings = subscription_node::Entity::find()
        .filter(subscription_node::Column::SubscriptionId.eq(subscription_id))
        .order_by_asc(subscription_node::Column::SortOrder)
        .order_by_asc(subscription_node::Column::NodeInboundId)
        .all(db)
        .await?;
    if bindings.is_empty() {
        return Ok(Vec::new());
    }

    let inbound_ids: Vec<i32> = bindings.iter().map(|b| b.node_inbound_id).collect();
    let inbounds: HashMap<i32, (node_inbound::Model, Option<node::Model>)> =
        node_inbound::Entity::find()
            .filter(node_inbound::Column::Id.is_in(inbound_ids))
            .find_also_related(node::Entity)
            .all(db)
            .await?
            .into_iter()
            .map(|(inbound, node)| (inbound.id, (inbound, node)))
            .collect();

    Ok(bindings
        .into_iter()
        .filter_map(|binding| {
            let (inbound, node) = inbounds.get(&binding.node_inbound_id)?;
            Some(BoundInbound {
                inbound: inbound.clone(),
                node: node.clone()?,
                binding,
            })
        })
        .collect())
}

/// Clears every cached `client_disabled` flag of a subscription.
pub async fn reset_bindings_disabled(
    db: &DatabaseConnection,
    subscription_id: &str,
) -> Result<u64, DbErr> {
    let res = subscription_node::Entity::update_many()
        .col_expr(subscription_node::Column::ClientDisabled, Expr::value(false))
        .filter(subscription_node::Column::SubscriptionId.eq(subscription_id))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Snapshot read for one reconciliation tick. Only bindings whose node and
/// inbound are both enabled are included; subscriptions without any such
/// binding are left out. Subscriptions come back oldest first.
pub async fn list_active_subscriptions_with_bindings(
    db: &DatabaseConnection,
) -> Result<Vec<ActiveSubscription>, DbErr> {
    let txn = db.begin().await?;

    let nodes: HashMap<i32, node::Model> = node::Entity::find()
        .filter(node::Column::Enabled.eq(true))
        .all(&txn)
        .await?
        .into_iter()
        .map(|n| (n.id, n))
        .collect();
    if nodes.is_empty() {
        txn.commit().await?;
        return Ok(Vec::new());
    }

    let inbounds: HashMap<i32, node_inbound::Model> = node_inbound::Entity::find()
        .filter(node_inbound::Column::Enabled.eq(true))
        .filter(node_inbound::Column::NodeId.is_in(nodes.keys().copied().collect::<Vec<_>>()))
        .all(&txn)
        .await?
        .into_iter()
        .map(|ni| (ni.id, ni))
        .collect();
    if inbounds.is_empty() {
        txn.commit().await?;
        return Ok(Vec::new());
    }

    let bindings = subscription_node::Entity::find()
        .filter(
            subscription_node::Column::NodeInboundId
                .is_in(inbounds.keys().copied().collect::<Vec<_>>()),
        )
        .order_by_asc(subscription_node::Column::SortOrder)
        .order_by_asc(subscription_node::Column::NodeInboundId)
        .all(&txn)
        .await?;

    let mut by_subscription: BTreeMap<String, Vec<BoundInbound>> = BTreeMap::new();
    for binding in bindings {
        let Some(inbound) = inbounds.get(&binding.node_inbound_id) else {
            continue;
        };
        let Some(node) = nodes.get(&inbound.node_id) else {
            continue;
        };
        by_subscription
            .entry(binding.subscription_id.clone())
            .or_default()
            .push(BoundInbound {
                inbound: inbound.clone(),
                node: node.clone(),
                binding,
            });
    }
    if by_subscription.is_empty() {
        txn.commit().await?;
        return Ok(Vec::new());
    }

    let subscriptions = subscription::Entity::find()
        .filter(subscription::Column::Id.is_in(by_subscription.keys().cloned().collect::<Vec<_>>()))
        .order_by_asc(subscription::Column::CreatedAt)
        .order_by_asc(subscription::Column::Id)
        .all(&txn)
        .await?;
    txn.commit().await?;

    Ok(subscriptions
        .into_iter()
        .filter_map(|sub| {
            let bindings = by_subscription.remove(&sub.id)?;
            Some(ActiveSubscription {
                subscription: sub,
                bindings,
            })
        })
        .collect())
}
