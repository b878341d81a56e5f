use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ClientSpec, ClientTraffic, GatewayClient, GatewayError, InboundConfig, NodeEndpoint};

/// Session-authenticated client for an X-UI style panel.
pub struct XuiClient {
    base: String,
    username: String,
    password: String,
    http: Client,
    logged_in: Mutex<bool>,
}

#[derive(Deserialize)]
struct PanelResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    id: i32,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    remark: String,
    #[serde(default)]
    settings: String,
    #[serde(default)]
    stream_settings: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTraffic {
    #[serde(default)]
    up: i64,
    #[serde(default)]
    down: i64,
    #[serde(default)]
    total: i64,
    #[serde(default)]
    expiry_time: i64,
    #[serde(default = "default_true")]
    enable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawClient<'a> {
    id: &'a str,
    flow: &'a str,
    email: &'a str,
    limit_ip: i32,
    #[serde(rename = "totalGB")]
    total_gb: i64,
    expiry_time: i64,
    enable: bool,
    tg_id: &'a str,
    sub_id: &'a str,
    comment: &'a str,
}

impl<'a> From<&'a ClientSpec> for RawClient<'a> {
    fn from(spec: &'a ClientSpec) -> Self {
        Self {
            id: &spec.id,
            flow: "",
            email: &spec.email,
            limit_ip: spec.limit_ip,
            total_gb: spec.total_bytes,
            expiry_time: spec.expiry_time,
            enable: spec.enable,
            tg_id: "",
            sub_id: &spec.sub_id,
            comment: &spec.comment,
        }
    }
}

impl XuiClient {
    pub fn new(endpoint: &NodeEndpoint, timeout: Duration) -> Result<Self, GatewayError> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .connect_timeout(timeout);
        if let Some(proxy_url) = endpoint.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        Ok(Self {
            base: endpoint.address.trim_end_matches('/').to_owned(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            http: builder.build()?,
            logged_in: Mutex::new(false),
        })
    }

    async fn login(&self) -> Result<(), GatewayError> {
        let resp = self
            .http
            .post(format!("{}/login", self.base))
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::AuthFailure(format!(
                "login returned status {}",
                resp.status()
            )));
        }
        let body: PanelResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::AuthFailure(format!("unreadable login response: {e}")))?;
        if !body.success {
            return Err(GatewayError::AuthFailure(if body.msg.is_empty() {
                "login rejected".to_string()
            } else {
                body.msg
            }));
        }
        debug!(base = %self.base, "Logged in to panel.");
        Ok(())
    }

    async fn ensure_login(&self) -> Result<(), GatewayError> {
        let mut logged_in = self.logged_in.lock().await;
        if !*logged_in {
            self.login().await?;
            *logged_in = true;
        }
        Ok(())
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<PanelResponse, GatewayError> {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::AuthFailure(format!("{path} returned {status}")));
        }
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Protocol(format!("{path} returned {status}")));
        }
        match serde_json::from_str::<PanelResponse>(&text) {
            Ok(parsed) => Ok(parsed),
            // Expired sessions get redirected to the HTML login page.
            Err(_) if text.trim_start().starts_with('<') => Err(GatewayError::AuthFailure(
                format!("{path} answered with a login page"),
            )),
            Err(e) => Err(GatewayError::Protocol(format!("{path} returned invalid JSON: {e}"))),
        }
    }

    /// Sends a request, logging in first and retrying once on an auth failure.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<PanelResponse, GatewayError> {
        self.ensure_login().await?;
        match self.send_once(method.clone(), path, body).await {
            Err(GatewayError::AuthFailure(reason)) => {
                debug!(base = %self.base, %reason, "Session rejected, logging in again.");
                *self.logged_in.lock().await = false;
                self.ensure_login().await?;
                self.send_once(method, path, body).await
            }
            other => other,
        }
    }

    async fn call_ok(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(), GatewayError> {
        let resp = self.call(method, path, body).await?;
        if resp.success {
            Ok(())
        } else {
            Err(GatewayError::Protocol(format!("{path} failed: {}", resp.msg)))
        }
    }

    async fn call_obj<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let resp = self.call(Method::GET, path, None).await?;
        if !resp.success {
            return Err(GatewayError::Protocol(format!("{path} failed: {}", resp.msg)));
        }
        let obj = resp
            .obj
            .filter(|v| !v.is_null())
            .ok_or_else(|| GatewayError::Protocol(format!("{path} returned no object")))?;
        serde_json::from_value(obj)
            .map_err(|e| GatewayError::Protocol(format!("{path} returned unexpected object: {e}")))
    }

    async fn raw_inbound(&self, inbound_id: i32) -> Result<RawInbound, GatewayError> {
        self.call_obj(&format!("/panel/api/inbounds/get/{inbound_id}")).await
    }

    /// The client object stored in the inbound's settings, as the panel has it.
    async fn find_client(&self, inbound_id: i32, email: &str) -> Result<Value, GatewayError> {
        let inbound = self.raw_inbound(inbound_id).await?;
        let settings: Value = serde_json::from_str(&inbound.settings).map_err(|e| {
            GatewayError::Protocol(format!("inbound {inbound_id} has unreadable settings: {e}"))
        })?;
        settings
            .get("clients")
            .and_then(Value::as_array)
            .and_then(|clients| {
                clients
                    .iter()
                    .find(|c| c.get("email").and_then(Value::as_str) == Some(email))
            })
            .cloned()
            .ok_or_else(|| {
                GatewayError::Protocol(format!("client {email} not found on inbound {inbound_id}"))
            })
    }

    async fn update_client(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        client: Value,
    ) -> Result<(), GatewayError> {
        let settings = json!({ "clients": [client] }).to_string();
        self.call_ok(
            Method::POST,
            &format!("/panel/api/inbounds/updateClient/{client_uuid}"),
            Some(&json!({ "id": inbound_id, "settings": settings })),
        )
        .await
    }

    async fn patch_client(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        email: &str,
        patch: impl FnOnce(&mut serde_json::Map<String, Value>),
    ) -> Result<(), GatewayError> {
        let mut client = self.find_client(inbound_id, email).await?;
        let fields = client.as_object_mut().ok_or_else(|| {
            GatewayError::Protocol(format!("client {email} is not a JSON object"))
        })?;
        patch(fields);
        self.update_client(inbound_id, client_uuid, client).await
    }
}

#[async_trait]
impl GatewayClient for XuiClient {
    async fn get_client_traffic(&self, email: &str) -> Result<ClientTraffic, GatewayError> {
        let raw: RawTraffic = self
            .call_obj(&format!(
                "/panel/api/inbounds/getClientTraffics/{}",
                urlencoding::encode(email)
            ))
            .await?;
        Ok(ClientTraffic {
            up: raw.up,
            down: raw.down,
            total: raw.total,
            expiry_time: raw.expiry_time,
            enable: raw.enable,
        })
    }

    async fn set_client_enabled(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        email: &str,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        self.patch_client(inbound_id, client_uuid, email, |c| {
            c.insert("enable".to_string(), Value::Bool(enabled));
        })
        .await
    }

    async fn set_client_quota(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        email: &str,
        total_bytes: i64,
    ) -> Result<(), GatewayError> {
        self.patch_client(inbound_id, client_uuid, email, |c| {
            c.insert("totalGB".to_string(), json!(total_bytes.max(0)));
        })
        .await
    }

    async fn add_client(&self, inbound_id: i32, client: &ClientSpec) -> Result<(), GatewayError> {
        let settings = json!({ "clients": [RawClient::from(client)] }).to_string();
        self.call_ok(
            Method::POST,
            "/panel/api/inbounds/addClient",
            Some(&json!({ "id": inbound_id, "settings": settings })),
        )
        .await
    }

    async fn delete_client(&self, inbound_id: i32, client_uuid: &str) -> Result<(), GatewayError> {
        self.call_ok(
            Method::POST,
            &format!("/panel/api/inbounds/{inbound_id}/delClient/{client_uuid}"),
            None,
        )
        .await
    }

    async fn update_client_expiry(
        &self,
        inbound_id: i32,
        client_uuid: &str,
        email: &str,
        expiry_time: i64,
        ip_limit: i32,
    ) -> Result<(), GatewayError> {
        self.patch_client(inbound_id, client_uuid, email, |c| {
            c.insert("expiryTime".to_string(), json!(expiry_time));
            c.insert("limitIp".to_string(), json!(ip_limit.max(0)));
        })
        .await
    }

    async fn get_inbound(&self, inbound_id: i32) -> Result<InboundConfig, GatewayError> {
        let raw = self.raw_inbound(inbound_id).await?;
        let stream_settings = if raw.stream_settings.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&raw.stream_settings).map_err(|e| {
                GatewayError::Protocol(format!(
                    "inbound {inbound_id} has unreadable stream settings: {e}"
                ))
            })?
        };
        Ok(InboundConfig {
            id: raw.id,
            port: raw.port,
            protocol: raw.protocol,
            remark: raw.remark,
            stream_settings,
        })
    }

    async fn test_connection(&self) -> Result<(), GatewayError> {
        let mut logged_in = self.logged_in.lock().await;
        *logged_in = false;
        self.login().await?;
        *logged_in = true;
        Ok(())
    }
}
