use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::db::entities::{node, node_inbound};
use crate::db::services::{self, NewNode, NewNodeInbound, NodeInboundUpdate, NodeUpdate};
use crate::gateway::NodeEndpoint;
use crate::web::{AppError, AppState};

#[derive(Serialize)]
pub struct ConnectionTestResponse {
    ok: bool,
    error: Option<String>,
}

fn validate_address(address: &str) -> Result<(), AppError> {
    if address.starts_with("http://") || address.starts_with("https://") {
        Ok(())
    } else {
        Err(AppError::InvalidInput(
            "Node address must start with http:// or https://".to_string(),
        ))
    }
}

async fn list_nodes_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<node::Model>>, AppError> {
    Ok(Json(services::list_nodes(&app_state.db).await?))
}

async fn create_node_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NewNode>,
) -> Result<(StatusCode, Json<node::Model>), AppError> {
    validate_address(&payload.address)?;
    let node = services::create_node(&app_state.db, payload).await?;
    info!(node_id = node.id, name = %node.name, "Node created.");
    Ok((StatusCode::CREATED, Json(node)))
}

async fn update_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Json(payload): Json<NodeUpdate>,
) -> Result<Json<node::Model>, AppError> {
    if let Some(address) = &payload.address {
        validate_address(address)?;
    }
    Ok(Json(services::update_node(&app_state.db, node_id, payload).await?))
}

async fn delete_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<StatusCode, AppError> {
    if services::delete_node(&app_state.db, node_id).await? == 0 {
        return Err(AppError::NotFound(format!("Node {node_id} not found")));
    }
    app_state.gateways.evict(node_id);
    info!(node_id, "Node deleted.");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_inbounds_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<Vec<node_inbound::Model>>, AppError> {
    Ok(Json(services::list_node_inbounds(&app_state.db, node_id).await?))
}

async fn create_inbound_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Json(payload): Json<NewNodeInbound>,
) -> Result<(StatusCode, Json<node_inbound::Model>), AppError> {
    let inbound = services::create_node_inbound(&app_state.db, node_id, payload).await?;
    Ok((StatusCode::CREATED, Json(inbound)))
}

async fn update_inbound_handler(
    State(app_state): State<Arc<AppState>>,
    Path((node_id, node_inbound_id)): Path<(i32, i32)>,
    Json(payload): Json<NodeInboundUpdate>,
) -> Result<Json<node_inbound::Model>, AppError> {
    Ok(Json(
        services::update_node_inbound(&app_state.db, node_id, node_inbound_id, payload).await?,
    ))
}

async fn delete_inbound_handler(
    State(app_state): State<Arc<AppState>>,
    Path((node_id, node_inbound_id)): Path<(i32, i32)>,
) -> Result<StatusCode, AppError> {
    if services::delete_node_inbound(&app_state.db, node_id, node_inbound_id).await? == 0 {
        return Err(AppError::NotFound(format!(
            "Inbound {node_inbound_id} not found on node {node_id}"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Logs in to the node's panel with a fresh session.
async fn test_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<ConnectionTestResponse>, AppError> {
    let node = services::get_node(&app_state.db, node_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Node {node_id} not found")))?;

    let result = match app_state.gateways.client_for(&NodeEndpoint::from(&node)) {
        Ok(client) => app_state.provisioning.call(client.test_connection()).await,
        Err(e) => Err(e),
    };
    Ok(Json(match result {
        Ok(()) => ConnectionTestResponse { ok: true, error: None },
        Err(e) => ConnectionTestResponse {
            ok: false,
            error: Some(e.to_string()),
        },
    }))
}

pub fn create_nodes_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/nodes", get(list_nodes_handler).post(create_node_handler))
        .route("/nodes/{id}", put(update_node_handler).delete(delete_node_handler))
        .route("/nodes/{id}/test", get(test_node_handler))
        .route(
            "/nodes/{id}/inbounds",
            get(list_inbounds_handler).post(create_inbound_handler),
        )
        .route(
            "/nodes/{id}/inbounds/{ni}",
            put(update_inbound_handler).delete(delete_inbound_handler),
        )
}
