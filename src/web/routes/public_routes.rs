use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::warn;

use crate::db::services::{self, BoundInbound};
use crate::gateway::NodeEndpoint;
use crate::links::{self, UsageSummary};
use crate::web::{AppError, AppState, ClientIp};

async fn links_for(app_state: &AppState, bound: &BoundInbound) -> Vec<String> {
    let fetched = match app_state
        .gateways
        .client_for(&NodeEndpoint::from(&bound.node))
    {
        Ok(client) => {
            app_state
                .provisioning
                .call(client.get_inbound(bound.inbound.inbound_id))
                .await
        }
        Err(e) => Err(e),
    };
    match fetched {
        Ok(inbound) => links::inbound_links(
            &bound.binding.client_uuid,
            bound.display_name(),
            &bound.node.address,
            &inbound,
        ),
        Err(e) => {
            warn!(
                subscription_id = %bound.binding.subscription_id,
                node_id = bound.node.id,
                error = %e,
                "Failed to fetch inbound for subscription links."
            );
            Vec::new()
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::InternalServerError(format!("Invalid header value: {e}")))
}

/// Plain-text link list consumed by VPN clients.
async fn subscription_handler(
    State(app_state): State<Arc<AppState>>,
    Path(sub_id): Path<String>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let sub = services::get_subscription(&app_state.db, &sub_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Subscription not found".to_string()))?;

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    if let Err(e) = services::log_access(&app_state.db, &sub.id, ip, user_agent).await {
        warn!(subscription_id = %sub.id, error = %e, "Failed to log subscription access.");
    }

    let usage = UsageSummary::of(&sub);
    let config = &app_state.config;
    let mut lines: Vec<String> =
        links::info_links(&usage, &config.data_label, &config.expire_label, Utc::now()).into();

    let bindings: Vec<BoundInbound> = services::list_bindings(&app_state.db, &sub.id)
        .await?
        .into_iter()
        .filter(|b| b.node.enabled && b.inbound.enabled)
        .collect();
    let fetches: Vec<_> = bindings
        .iter()
        .map(|bound| links_for(&app_state, bound))
        .collect();
    let per_binding: Vec<Vec<String>> = stream::iter(fetches)
        .buffered(config.max_concurrent_node_calls.max(1))
        .collect()
        .await;
    lines.extend(per_binding.into_iter().flatten());

    let sub_url = app_state.subscription_url(&headers, &sub.id);
    let response_headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        ),
        (
            header::HeaderName::from_static("profile-title"),
            header_value(&BASE64.encode(config.profile_title.as_bytes()))?,
        ),
        (
            header::HeaderName::from_static("subscription-userinfo"),
            header_value(&usage.userinfo_header())?,
        ),
        (
            header::HeaderName::from_static("profile-update-interval"),
            HeaderValue::from_static("1"),
        ),
        (
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=fleetgate"),
        ),
        (
            header::HeaderName::from_static("profile-web-page-url"),
            header_value(&sub_url)?,
        ),
    ];
    Ok((response_headers, lines.join("\n")).into_response())
}

pub fn create_public_router() -> Router<Arc<AppState>> {
    Router::new().route("/sub/{id}", get(subscription_handler))
}
