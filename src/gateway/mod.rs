//! The per-node gateway capability: everything the rest of the crate needs from
//! a remote panel, independent of its wire format.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::entities::node;

pub mod pool;
pub mod xui_client;

#[cfg(test)]
pub(crate) mod mock;

pub use pool::GatewayPool;
pub use xui_client::XuiClient;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Node unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("Node authentication failed: {0}")]
    AuthFailure(String),
    #[error("Node protocol error: {0}")]
    Protocol(String),
    #[error("Node call timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything needed to reach one node's panel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEndpoint {
    pub node_id: i32,
    pub address: String,
    pub username: String,
    pub password: String,
    pub proxy_url: Option<String>,
}

impl From<&node::Model> for NodeEndpoint {
    fn from(node: &node::Model) -> Self {
        Self {
            node_id: node.id,
            address: node.address.clone(),
            username: node.username.clone(),
            password: node.password.clone(),
            proxy_url: node.proxy_url.clone(),
        }
    }
}

/// Counters and limits the node currently holds for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientTraffic {
    pub up: i64,
    pub down: i64,
    /// The node-side limit in raw bytes, 0 when unlimited.
    pub total: i64,
    /// Absolute expiry in unix milliseconds; negative while a delay-start
    /// client has not connected yet; 0 when none.
    pub expiry_time: i64,
    pub enable: bool,
}

impl ClientTraffic {
    pub fn raw_bytes(&self) -> i64 {
        self.up.max(0).saturating_add(self.down.max(0))
    }
}

/// A client to provision on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSpec {
    pub id: String,
    pub email: String,
    pub limit_ip: i32,
    pub total_bytes: i64,
    pub expiry_time: i64,
    pub enable: bool,
    pub sub_id: String,
    pub comment: String,
}

/// A remote inbound's transport configuration, as needed by the link formatter.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundConfig {
    pub id: i32,
    pub port: u16,
    pub protocol: String,
    pub remark: String,
    pub stream_settings: serde_json::Value,
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn get_client_traffic(&self, email: &str) -> Result<ClientTraffic, GatewayError>;

    async fn set_client_enabled(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        email: &str,
        enabled: bool,
    ) -> Result<(), GatewayError>;

    /// Sets the node-side traffic limit in raw bytes (0 removes it).
    async fn set_client_quota(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        email: &str,
        total_bytes: i64,
    ) -> Result<(), GatewayError>;

    async fn add_client(&self, inbound_id: i32, client: &ClientSpec) -> Result<(), GatewayError>;

    async fn delete_client(&self, inbound_id: i32, client_uuid: &str) -> Result<(), GatewayError>;

    async fn update_client_expiry(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        email: &str,
        expiry_time: i64,
        ip_limit: i32,
    ) -> Result<(), GatewayError>;

    async fn get_inbound(&self, inbound_id: i32) -> Result<InboundConfig, GatewayError>;

    async fn test_connection(&self) -> Result<(), GatewayError>;
}

/// Hands out a client for a node. Implementations may cache sessions.
pub trait GatewayConnector: Send + Sync {
    fn client_for(&self, endpoint: &NodeEndpoint) -> Result<Arc<dyn GatewayClient>, GatewayError>;

    /// Drops any cached session for a node that was deleted.
    fn evict(&self, _node_id: i32) {}
}
