use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::entities::subscription;
use crate::db::services::{self, BoundInbound, SubscriptionStats};
use crate::reconcile::SubscriptionState;
use crate::services::provisioning::{BindingAction, BulkExtend, CreateSubscription, EditSubscription};
use crate::web::{AppError, AppState};

// --- Request/Response Structs ---

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    page: u64,
    #[serde(default)]
    per_page: u64,
    search: Option<String>,
}

fn default_page() -> u64 {
    1
}

#[derive(Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    subscription: subscription::Model,
    state: String,
    url: String,
}

#[derive(Serialize)]
pub struct SubscriptionPage {
    items: Vec<SubscriptionView>,
    total: u64,
    page: u64,
    per_page: u64,
}

#[derive(Serialize)]
pub struct SubscriptionDetail {
    #[serde(flatten)]
    view: SubscriptionView,
    nodes: Vec<BoundInbound>,
}

#[derive(Serialize)]
pub struct CreateSubscriptionResponse {
    id: String,
    uuid: String,
    url: String,
    errors: Vec<String>,
}

#[derive(Deserialize)]
pub struct NodeIdsRequest {
    node_ids: Vec<i32>,
}

#[derive(Serialize)]
pub struct ErrorsResponse {
    errors: Vec<String>,
}

#[derive(Deserialize)]
pub struct BulkToggleRequest {
    sub_ids: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize)]
pub struct BulkDeleteRequest {
    sub_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct BulkNodesRequest {
    sub_ids: Vec<String>,
    node_ids: Vec<i32>,
    action: BindingAction,
}

#[derive(Serialize)]
pub struct CountResponse {
    count: usize,
}

fn view(app_state: &AppState, headers: &HeaderMap, sub: subscription::Model) -> SubscriptionView {
    let state = SubscriptionState::evaluate(&sub, sub.used_bytes, Utc::now()).to_string();
    SubscriptionView {
        url: app_state.subscription_url(headers, &sub.id),
        state,
        subscription: sub,
    }
}

// --- Route Handlers ---

async fn list_subscriptions_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<SubscriptionPage>, AppError> {
    let (rows, total) = services::list_subscriptions(
        &app_state.db,
        query.page,
        query.per_page,
        query.search.as_deref(),
    )
    .await?;
    Ok(Json(SubscriptionPage {
        items: rows
            .into_iter()
            .map(|sub| view(&app_state, &headers, sub))
            .collect(),
        total,
        page: query.page,
        per_page: query.per_page,
    }))
}

async fn create_subscription_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSubscription>,
) -> Result<(StatusCode, Json<CreateSubscriptionResponse>), AppError> {
    if !payload.data_gb.is_finite() || payload.data_gb < 0.0 {
        return Err(AppError::InvalidInput("data_gb must be a non-negative number".to_string()));
    }
    let created = app_state.provisioning.create_subscription(payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSubscriptionResponse {
            url: app_state.subscription_url(&headers, &created.subscription.id),
            id: created.subscription.id,
            uuid: created.client_uuid,
            errors: created.errors,
        }),
    ))
}

async fn get_subscription_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sub_id): Path<String>,
) -> Result<Json<SubscriptionDetail>, AppError> {
    let sub = services::get_subscription(&app_state.db, &sub_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Subscription {sub_id} not found")))?;
    let nodes = services::list_bindings(&app_state.db, &sub_id).await?;
    Ok(Json(SubscriptionDetail {
        view: view(&app_state, &headers, sub),
        nodes,
    }))
}

async fn update_subscription_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sub_id): Path<String>,
    Json(payload): Json<EditSubscription>,
) -> Result<Json<SubscriptionView>, AppError> {
    let updated = app_state
        .provisioning
        .update_subscription(&sub_id, payload)
        .await?;
    Ok(Json(view(&app_state, &headers, updated)))
}

async fn delete_subscription_handler(
    State(app_state): State<Arc<AppState>>,
    Path(sub_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if app_state.provisioning.delete_subscription(&sub_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Subscription {sub_id} not found")))
    }
}

async fn add_nodes_handler(
    State(app_state): State<Arc<AppState>>,
    Path(sub_id): Path<String>,
    Json(payload): Json<NodeIdsRequest>,
) -> Result<Json<ErrorsResponse>, AppError> {
    let errors = app_state
        .provisioning
        .add_bindings(&sub_id, &payload.node_ids)
        .await?;
    Ok(Json(ErrorsResponse { errors }))
}

async fn remove_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path((sub_id, node_inbound_id)): Path<(String, i32)>,
) -> Result<StatusCode, AppError> {
    if app_state
        .provisioning
        .remove_binding(&sub_id, node_inbound_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Binding not found".to_string()))
    }
}

async fn reset_usage_handler(
    State(app_state): State<Arc<AppState>>,
    Path(sub_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if app_state.provisioning.reset_usage(&sub_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Subscription {sub_id} not found")))
    }
}

async fn stats_handler(
    State(app_state): State<Arc<AppState>>,
    Path(sub_id): Path<String>,
) -> Result<Json<SubscriptionStats>, AppError> {
    services::subscription_stats(&app_state.db, &sub_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Subscription {sub_id} not found")))
}

async fn bulk_toggle_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<BulkToggleRequest>,
) -> Result<Json<CountResponse>, AppError> {
    let count = app_state
        .provisioning
        .bulk_toggle(&payload.sub_ids, payload.enabled)
        .await?;
    Ok(Json(CountResponse { count }))
}

async fn bulk_delete_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<BulkDeleteRequest>,
) -> Result<Json<CountResponse>, AppError> {
    let count = app_state.provisioning.bulk_delete(&payload.sub_ids).await?;
    Ok(Json(CountResponse { count }))
}

async fn bulk_extend_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<BulkExtend>,
) -> Result<Json<CountResponse>, AppError> {
    let count = app_state.provisioning.bulk_extend(&payload).await?;
    Ok(Json(CountResponse { count }))
}

async fn bulk_nodes_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<BulkNodesRequest>,
) -> Result<Json<ErrorsResponse>, AppError> {
    let errors = app_state
        .provisioning
        .bulk_bindings(&payload.sub_ids, &payload.node_ids, payload.action)
        .await?;
    Ok(Json(ErrorsResponse { errors }))
}

pub fn create_subscriptions_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/subscriptions",
            get(list_subscriptions_handler).post(create_subscription_handler),
        )
        .route(
            "/subscriptions/{id}",
            get(get_subscription_handler)
                .put(update_subscription_handler)
                .delete(delete_subscription_handler),
        )
        .route("/subscriptions/{id}/nodes", post(add_nodes_handler))
        .route(
            "/subscriptions/{id}/nodes/{inbound_id}",
            delete(remove_node_handler),
        )
        .route("/subscriptions/{id}/reset-usage", post(reset_usage_handler))
        .route("/subscriptions/{id}/stats", get(stats_handler))
        .route("/bulk/toggle", post(bulk_toggle_handler))
        .route("/bulk/delete", post(bulk_delete_handler))
        .route("/bulk/extend", post(bulk_extend_handler))
        .route("/bulk/nodes", post(bulk_nodes_handler))
}
