//! In-memory gateway used by engine and provisioning tests. Every node keeps
//! its clients keyed by email and every call is recorded.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    ClientSpec, ClientTraffic, GatewayClient, GatewayConnector, GatewayError, InboundConfig,
    NodeEndpoint,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Traffic { node_id: i32, email: String },
    SetEnabled { node_id: i32, email: String, enabled: bool },
    SetQuota { node_id: i32, email: String, total: i64 },
    Add { node_id: i32, inbound_id: i32, spec: ClientSpec },
    Delete { node_id: i32, inbound_id: i32, client_uuid: String },
    UpdateExpiry { node_id: i32, email: String, expiry_time: i64, ip_limit: i32 },
}

impl Call {
    fn is_mutation(&self) -> bool {
        !matches!(self, Call::Traffic { .. })
    }
}

#[derive(Default)]
struct State {
    clients: HashMap<(i32, String), ClientTraffic>,
    failing_nodes: HashSet<i32>,
    hanging_nodes: HashSet<i32>,
    panicking_collects: HashMap<i32, usize>,
    calls: Vec<Call>,
}

#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<State>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the client if needed and sets its counters.
    pub fn set_traffic(&self, node_id: i32, email: &str, up: i64, down: i64) {
        let mut state = self.state.lock().unwrap();
        let client = state
            .clients
            .entry((node_id, email.to_string()))
            .or_insert(ClientTraffic { enable: true, ..Default::default() });
        client.up = up;
        client.down = down;
    }

    pub fn set_expiry(&self, node_id: i32, email: &str, expiry_time: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(client) = state.clients.get_mut(&(node_id, email.to_string())) {
            client.expiry_time = expiry_time;
        }
    }

    pub fn set_remote_enabled(&self, node_id: i32, email: &str, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(client) = state.clients.get_mut(&(node_id, email.to_string())) {
            client.enable = enabled;
        }
    }

    pub fn client(&self, node_id: i32, email: &str) -> Option<ClientTraffic> {
        self.state
            .lock()
            .unwrap()
            .clients
            .get(&(node_id, email.to_string()))
            .copied()
    }

    /// Every call to this node fails until `recover_node`.
    pub fn fail_node(&self, node_id: i32) {
        self.state.lock().unwrap().failing_nodes.insert(node_id);
    }

    /// Every call to this node sleeps far past any test timeout.
    pub fn hang_node(&self, node_id: i32) {
        self.state.lock().unwrap().hanging_nodes.insert(node_id);
    }

    /// The next `count` traffic reads on this node panic.
    pub fn panic_on_collect(&self, node_id: i32, count: usize) {
        self.state.lock().unwrap().panicking_collects.insert(node_id, count);
    }

    pub fn pending_collect_panics(&self, node_id: i32) -> usize {
        self.state
            .lock()
            .unwrap()
            .panicking_collects
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn recover_node(&self, node_id: i32) {
        let mut state = self.state.lock().unwrap();
        state.failing_nodes.remove(&node_id);
        state.hanging_nodes.remove(&node_id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

impl GatewayConnector for MockGateway {
    fn client_for(&self, endpoint: &NodeEndpoint) -> Result<Arc<dyn GatewayClient>, GatewayError> {
        Ok(Arc::new(MockClient {
            node_id: endpoint.node_id,
            state: self.state.clone(),
        }))
    }
}

struct MockClient {
    node_id: i32,
    state: Arc<Mutex<State>>,
}

impl MockClient {
    async fn enter(&self, call: Call) -> Result<(), GatewayError> {
        let (failing, hanging) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            (
                state.failing_nodes.contains(&self.node_id),
                state.hanging_nodes.contains(&self.node_id),
            )
        };
        if hanging {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if failing {
            return Err(GatewayError::Protocol(format!("node {} is down", self.node_id)));
        }
        Ok(())
    }

    fn with_client<T>(
        &self,
        email: &str,
        f: impl FnOnce(&mut ClientTraffic) -> T,
    ) -> Result<T, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state
            .clients
            .get_mut(&(self.node_id, email.to_string()))
            .map(f)
            .ok_or_else(|| GatewayError::Protocol(format!("client {email} not found")))
    }
}

#[async_trait]
impl GatewayClient for MockClient {
    async fn get_client_traffic(&self, email: &str) -> Result<ClientTraffic, GatewayError> {
        let crash = {
            let mut state = self.state.lock().unwrap();
            match state.panicking_collects.get_mut(&self.node_id) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if crash {
            panic!("node {} crashed while reading {email}", self.node_id);
        }
        self.enter(Call::Traffic { node_id: self.node_id, email: email.to_string() })
            .await?;
        self.with_client(email, |c| *c)
    }

    async fn set_client_enabled(
        &self,
        _inbound_id: i32,
        _client_uuid: &str,
        email: &str,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        self.enter(Call::SetEnabled { node_id: self.node_id, email: email.to_string(), enabled })
            .await?;
        self.with_client(email, |c| c.enable = enabled)
    }

    async fn set_client_quota(
        &self,
        _inbound_id: i32,
        _client_uuid: &str,
        email: &str,
        total_bytes: i64,
    ) -> Result<(), GatewayError> {
        self.enter(Call::SetQuota {
            node_id: self.node_id,
            email: email.to_string(),
            total: total_bytes,
        })
        .await?;
        self.with_client(email, |c| c.total = total_bytes.max(0))
    }

    async fn add_client(&self, inbound_id: i32, client: &ClientSpec) -> Result<(), GatewayError> {
        self.enter(Call::Add { node_id: self.node_id, inbound_id, spec: client.clone() })
            .await?;
        self.state.lock().unwrap().clients.insert(
            (self.node_id, client.email.clone()),
            ClientTraffic {
                up: 0,
                down: 0,
                total: client.total_bytes,
                expiry_time: client.expiry_time,
                enable: client.enable,
            },
        );
        Ok(())
    }

    async fn delete_client(&self, inbound_id: i32, client_uuid: &str) -> Result<(), GatewayError> {
        self.enter(Call::Delete {
            node_id: self.node_id,
            inbound_id,
            client_uuid: client_uuid.to_string(),
        })
        .await
    }

    async fn update_client_expiry(
        &self,
        _inbound_id: i32,
        _client_uuid: &str,
        email: &str,
        expiry_time: i64,
        ip_limit: i32,
    ) -> Result<(), GatewayError> {
        self.enter(Call::UpdateExpiry {
            node_id: self.node_id,
            email: email.to_string(),
            expiry_time,
            ip_limit,
        })
        .await?;
        self.with_client(email, |c| c.expiry_time = expiry_time)
    }

    async fn get_inbound(&self, inbound_id: i32) -> Result<InboundConfig, GatewayError> {
        Ok(InboundConfig {
            id: inbound_id,
            port: 443,
            protocol: "vless".to_string(),
            remark: format!("inbound-{inbound_id}"),
            stream_settings: serde_json::json!({ "network": "tcp", "security": "none" }),
        })
    }

    async fn test_connection(&self) -> Result<(), GatewayError> {
        if self.state.lock().unwrap().failing_nodes.contains(&self.node_id) {
            return Err(GatewayError::AuthFailure("bad credentials".to_string()));
        }
        Ok(())
    }
}
