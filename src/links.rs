//! Builds the plain-text subscription document served to end-user clients.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::entities::subscription;
use crate::db::services::BYTES_PER_GB;
use crate::gateway::InboundConfig;

const DATA_INFO_UUID: &str = "00000000-0000-0000-0000-000000000001";
const EXPIRY_INFO_UUID: &str = "00000000-0000-0000-0000-000000000002";

/// Usage figures as shown to the end user, already scaled by the
/// subscription's display multiplier.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSummary {
    pub used_bytes: i64,
    pub limit_bytes: i64,
    pub expire_at: Option<DateTime<Utc>>,
}

impl UsageSummary {
    pub fn of(sub: &subscription::Model) -> Self {
        let scale = i64::from(sub.show_multiplier.max(1));
        Self {
            used_bytes: sub.used_bytes.max(0).saturating_mul(scale),
            limit_bytes: sub.data_limit_bytes.max(0).saturating_mul(scale),
            expire_at: sub.expire_at,
        }
    }

    pub fn expire_timestamp(&self) -> i64 {
        self.expire_at.map_or(0, |at| at.timestamp())
    }

    /// Value of the `subscription-userinfo` header understood by most clients.
    pub fn userinfo_header(&self) -> String {
        format!(
            "upload=0;download={};total={};expire={}",
            self.used_bytes,
            self.limit_bytes,
            self.expire_timestamp()
        )
    }

    pub fn data_text(&self) -> String {
        let used = self.used_bytes as f64 / BYTES_PER_GB as f64;
        if self.limit_bytes > 0 {
            let total = self.limit_bytes as f64 / BYTES_PER_GB as f64;
            format!("{used:.2} GB / {total:.1} GB")
        } else {
            format!("{used:.2} GB / Unlimited")
        }
    }

    pub fn expiry_text(&self, now: DateTime<Utc>) -> String {
        match self.expire_at {
            None => "No Expiry".to_string(),
            Some(at) => {
                let left = (at - now).num_seconds();
                if left > 0 {
                    format!("{}d {}h", left / 86_400, (left % 86_400) / 3_600)
                } else {
                    "Expired".to_string()
                }
            }
        }
    }
}

/// The two placeholder entries that carry remaining data and expiry in their
/// display name.
pub fn info_links(
    usage: &UsageSummary,
    data_label: &str,
    expire_label: &str,
    now: DateTime<Utc>,
) -> [String; 2] {
    let data = format!("{data_label}: {}", usage.data_text());
    let expiry = format!("{expire_label}: {}", usage.expiry_text(now));
    [
        format!("vless://{DATA_INFO_UUID}@0.0.0.0:443?type=tcp#{}", urlencoding::encode(&data)),
        format!("vless://{EXPIRY_INFO_UUID}@0.0.0.0:443?type=tcp#{}", urlencoding::encode(&expiry)),
    ]
}

/// Host part of a panel address such as `https://node.example.com:2053/path`.
pub fn host_of(address: &str) -> &str {
    let without_scheme = address.rsplit("//").next().unwrap_or(address);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    authority.split(':').next().unwrap_or(authority)
}

/// Every link for one binding. Inbounds with external proxies get one link per
/// proxy; otherwise the node's own host and the inbound port are used.
pub fn inbound_links(
    client_uuid: &str,
    label: &str,
    node_address: &str,
    inbound: &InboundConfig,
) -> Vec<String> {
    let stream = &inbound.stream_settings;
    let security = str_at(stream, &["security"]).unwrap_or("none");
    let server = host_of(node_address);

    let proxies = stream
        .get("externalProxy")
        .and_then(Value::as_array)
        .filter(|p| !p.is_empty());
    let Some(proxies) = proxies else {
        return vec![format_vless(client_uuid, label, server, inbound.port, stream, security)];
    };

    proxies
        .iter()
        .enumerate()
        .map(|(i, proxy)| {
            let dest = str_at(proxy, &["dest"]).unwrap_or(server);
            let port = proxy
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(inbound.port);
            let proxy_security = match str_at(proxy, &["forceTls"]) {
                None | Some("same") => security,
                Some(forced) => forced,
            };
            let name = if i == 0 {
                label.to_string()
            } else {
                format!("{label}-{}", i + 1)
            };
            format_vless(client_uuid, &name, dest, port, stream, proxy_security)
        })
        .collect()
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
}

fn first_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(Value::as_str)
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// Formats a `vless://` URI from an inbound's stream settings.
pub fn format_vless(
    client_uuid: &str,
    label: &str,
    server: &str,
    port: u16,
    stream: &Value,
    security: &str,
) -> String {
    let network = str_at(stream, &["network"]).unwrap_or("tcp");
    let mut params: Vec<(&str, String)> = vec![
        ("type", network.to_string()),
        ("security", security.to_string()),
    ];

    match network {
        "tcp" => {
            let header = stream.get("tcpSettings").and_then(|t| t.get("header"));
            if let Some(header) = header {
                let header_type = str_at(header, &["type"]).unwrap_or("none");
                if header_type != "none" {
                    params.push(("headerType", header_type.to_string()));
                }
                if let Some(path) = non_empty(first_str(header, &["request", "path"])) {
                    params.push(("path", path.to_string()));
                }
                if let Some(host) = non_empty(first_str(header, &["request", "headers", "Host"])) {
                    params.push(("host", host.to_string()));
                }
            }
        }
        "ws" => {
            params.push((
                "path",
                str_at(stream, &["wsSettings", "path"]).unwrap_or("/").to_string(),
            ));
            if let Some(host) = non_empty(str_at(stream, &["wsSettings", "headers", "Host"])) {
                params.push(("host", host.to_string()));
            }
        }
        "grpc" => {
            params.push((
                "serviceName",
                str_at(stream, &["grpcSettings", "serviceName"])
                    .unwrap_or_default()
                    .to_string(),
            ));
            params.push(("mode", "multi".to_string()));
        }
        "kcp" => {
            params.push((
                "headerType",
                str_at(stream, &["kcpSettings", "header", "type"])
                    .unwrap_or("none")
                    .to_string(),
            ));
            if let Some(seed) = non_empty(str_at(stream, &["kcpSettings", "seed"])) {
                params.push(("seed", seed.to_string()));
            }
        }
        "httpupgrade" | "xhttp" => {
            let key = if network == "xhttp" {
                "xhttpSettings"
            } else {
                "httpupgradeSettings"
            };
            params.push(("path", str_at(stream, &[key, "path"]).unwrap_or("/").to_string()));
            if let Some(host) = non_empty(str_at(stream, &[key, "host"])) {
                params.push(("host", host.to_string()));
            }
            if network == "xhttp" {
                params.push(("mode", str_at(stream, &[key, "mode"]).unwrap_or("auto").to_string()));
            }
        }
        _ => {}
    }

    match security {
        "tls" => {
            let tls = stream.get("tlsSettings").unwrap_or(&Value::Null);
            if let Some(fp) = non_empty(str_at(tls, &["fingerprint"])) {
                params.push(("fp", fp.to_string()));
            }
            let alpn: Vec<&str> = tls
                .get("alpn")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !alpn.is_empty() {
                params.push(("alpn", alpn.join(",")));
            }
            if let Some(sni) = non_empty(str_at(tls, &["serverName"])) {
                params.push(("sni", sni.to_string()));
            }
            if tls.get("allowInsecure").and_then(Value::as_bool) == Some(true) {
                params.push(("allowInsecure", "1".to_string()));
            }
        }
        "reality" => {
            let reality = stream.get("realitySettings").unwrap_or(&Value::Null);
            params.push((
                "pbk",
                str_at(reality, &["publicKey"]).unwrap_or_default().to_string(),
            ));
            if let Some(fp) = non_empty(str_at(reality, &["fingerprint"])) {
                params.push(("fp", fp.to_string()));
            }
            if let Some(sni) = non_empty(first_str(reality, &["serverNames"])) {
                params.push(("sni", sni.to_string()));
            }
            if let Some(sid) = non_empty(first_str(reality, &["shortIds"])) {
                params.push(("sid", sid.to_string()));
            }
            if let Some(spx) = non_empty(str_at(reality, &["spiderX"])) {
                params.push(("spx", spx.to_string()));
            }
        }
        _ => {}
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!(
        "vless://{client_uuid}@{server}:{port}?{query}#{}",
        urlencoding::encode(label)
    )
}
