use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{GatewayClient, GatewayConnector, GatewayError, NodeEndpoint, XuiClient};

/// Keeps one logged-in panel session per node. A cached client is replaced
/// as soon as the node's address, credentials or proxy change.
pub struct GatewayPool {
    clients: DashMap<i32, (NodeEndpoint, Arc<XuiClient>)>,
    timeout: Duration,
}

impl GatewayPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl GatewayConnector for GatewayPool {
    fn client_for(&self, endpoint: &NodeEndpoint) -> Result<Arc<dyn GatewayClient>, GatewayError> {
        if let Some(entry) = self.clients.get(&endpoint.node_id) {
            let (cached_endpoint, client) = entry.value();
            if cached_endpoint == endpoint {
                return Ok(client.clone());
            }
        }

        debug!(node_id = endpoint.node_id, "Creating panel client.");
        let client = Arc::new(XuiClient::new(endpoint, self.timeout)?);
        self.clients
            .insert(endpoint.node_id, (endpoint.clone(), client.clone()));
        Ok(client)
    }

    fn evict(&self, node_id: i32) {
        self.clients.remove(&node_id);
    }
}
