use axum::{
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, Method},
    routing::get,
    Json, Router,
};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::db::services::{self, OverviewStats};
use crate::gateway::GatewayConnector;
use crate::server::config::ServerConfig;
use crate::services::provisioning::ProvisioningService;
use crate::version::VERSION;
use crate::web::routes::*;

pub use crate::web::error::AppError;

pub mod error;
pub mod routes;

pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<ServerConfig>,
    pub gateways: Arc<dyn GatewayConnector>,
    pub provisioning: Arc<ProvisioningService>,
}

impl AppState {
    /// Public origin for subscription URLs: the configured base URL, else the
    /// request's own scheme and host.
    pub fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.config.base_url {
            return base.clone();
        }
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("http");
        format!("{scheme}://{host}")
    }

    pub fn subscription_url(&self, headers: &HeaderMap, sub_id: &str) -> String {
        format!("{}/sub/{sub_id}", self.base_url(headers))
    }
}

/// The caller's address: first `X-Forwarded-For` entry, else the peer address.
pub struct ClientIp(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
        let peer = || {
            parts
                .extensions
                .get::<axum::extract::ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        };
        Ok(ClientIp(forwarded.or_else(peer)))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    #[serde(flatten)]
    stats: OverviewStats,
}

async fn status_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, AppError> {
    let stats = services::overview_stats(&app_state.db).await?;
    Ok(Json(StatusResponse {
        version: VERSION,
        stats,
    }))
}

pub fn create_axum_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route("/status", get(status_handler))
        .merge(subscription_routes::create_subscriptions_router())
        .merge(node_routes::create_nodes_router());

    Router::new()
        .nest(&format!("/{}/api", app_state.config.panel_path), api)
        .merge(public_routes::create_public_router())
        .layer(cors)
        .with_state(app_state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::gateway::mock::MockGateway;
    use std::time::Duration;

    pub struct TestApp {
        pub router: Router,
        pub state: Arc<AppState>,
        pub mock: MockGateway,
        pub _dir: tempfile::TempDir,
    }

    pub fn test_config() -> ServerConfig {
        ServerConfig {
            database_url: String::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            panel_path: "secret".to_string(),
            panel_path_generated: false,
            base_url: Some("https://sub.example.com".to_string()),
            sync_interval_secs: 20,
            gateway_timeout_secs: 1,
            max_concurrent_node_calls: 4,
            profile_title: "Test Title".to_string(),
            data_label: "Data".to_string(),
            expire_label: "Expires".to_string(),
            log_dir: "logs".to_string(),
            auto_update: false,
            update_check_interval_secs: 3600,
            is_in_container: false,
        }
    }

    pub async fn test_app() -> TestApp {
        let (db, dir) = temp_db().await;
        let mock = MockGateway::new();
        let gateways: Arc<dyn GatewayConnector> = Arc::new(mock.clone());
        let provisioning = Arc::new(ProvisioningService::new(
            db.clone(),
            gateways.clone(),
            Duration::from_secs(1),
        ));
        let state = Arc::new(AppState {
            db,
            config: Arc::new(test_config()),
            gateways,
            provisioning,
        });
        TestApp {
            router: create_axum_router(state.clone()),
            state,
            mock,
            _dir: dir,
        }
    }
}
