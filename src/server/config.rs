use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::db::services::generate_subscription_id;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    /// Secret first path segment of the admin API.
    pub panel_path: String,
    /// Set when no panel path was configured and a random one was generated.
    #[serde(skip)]
    pub panel_path_generated: bool,

    /// Public origin used to build subscription URLs. Derived from the
    /// request's Host header when unset.
    pub base_url: Option<String>,

    pub sync_interval_secs: u64,
    pub gateway_timeout_secs: u64,
    pub max_concurrent_node_calls: usize,

    pub profile_title: String,
    pub data_label: String,
    pub expire_label: String,

    pub log_dir: String,

    pub auto_update: bool,
    pub update_check_interval_secs: u64,
    pub is_in_container: bool,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    database_url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    panel_path: Option<String>,
    base_url: Option<String>,
    sync_interval_secs: Option<u64>,
    gateway_timeout_secs: Option<u64>,
    max_concurrent_node_calls: Option<usize>,
    profile_title: Option<String>,
    data_label: Option<String>,
    expire_label: Option<String>,
    log_dir: Option<String>,
    auto_update: Option<bool>,
    update_check_interval_secs: Option<u64>,
    is_in_container: Option<bool>,
}

fn default_database_url() -> String {
    "sqlite://fleetgate.db?mode=rwc".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_profile_title() -> String {
    "Fleetgate Subscription".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

/// A fresh random panel path.
pub fn generate_panel_path() -> String {
    generate_subscription_id()
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: PartialServerConfig = if let Some(path_str) = config_path {
            let path = Path::new(path_str);
            if path.exists() {
                let contents = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
                toml::from_str(&contents)
                    .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))?
            } else {
                return Err(format!("Config file {path:?} does not exist"));
            }
        } else {
            PartialServerConfig::default()
        };

        // 2. Load from environment variables
        let env_config: PartialServerConfig = envy::from_env::<PartialServerConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        // 3. Merge: environment overrides file
        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialServerConfig, file: PartialServerConfig) -> Result<Self, String> {
        let panel_path = env
            .panel_path
            .or(file.panel_path)
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        let panel_path_generated = panel_path.is_none();

        let config = ServerConfig {
            database_url: env
                .database_url
                .or(file.database_url)
                .unwrap_or_else(default_database_url),
            host: env.host.or(file.host).unwrap_or_else(default_host),
            port: env.port.or(file.port).unwrap_or(5000),
            panel_path: panel_path.unwrap_or_else(generate_panel_path),
            panel_path_generated,
            base_url: env
                .base_url
                .or(file.base_url)
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            sync_interval_secs: env
                .sync_interval_secs
                .or(file.sync_interval_secs)
                .unwrap_or(20),
            gateway_timeout_secs: env
                .gateway_timeout_secs
                .or(file.gateway_timeout_secs)
                .unwrap_or(10),
            max_concurrent_node_calls: env
                .max_concurrent_node_calls
                .or(file.max_concurrent_node_calls)
                .unwrap_or(8),
            profile_title: env
                .profile_title
                .or(file.profile_title)
                .unwrap_or_else(default_profile_title),
            data_label: env
                .data_label
                .or(file.data_label)
                .unwrap_or_else(|| "Data left".to_string()),
            expire_label: env
                .expire_label
                .or(file.expire_label)
                .unwrap_or_else(|| "Expires".to_string()),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            auto_update: env.auto_update.or(file.auto_update).unwrap_or(false),
            update_check_interval_secs: env
                .update_check_interval_secs
                .or(file.update_check_interval_secs)
                .unwrap_or(3600),
            is_in_container: env
                .is_in_container
                .or(file.is_in_container)
                .unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.sync_interval_secs == 0 {
            return Err("SYNC_INTERVAL_SECS must be greater than 0".to_string());
        }
        if self.gateway_timeout_secs == 0 {
            return Err("GATEWAY_TIMEOUT_SECS must be greater than 0".to_string());
        }
        if self.max_concurrent_node_calls == 0 {
            return Err("MAX_CONCURRENT_NODE_CALLS must be greater than 0".to_string());
        }
        if self.update_check_interval_secs == 0 {
            return Err("UPDATE_CHECK_INTERVAL_SECS must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(s: &str) -> PartialServerConfig {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_defaults_and_generated_path() {
        let config = ServerConfig::merge(Default::default(), Default::default()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.sync_interval_secs, 20);
        assert_eq!(config.database_url, "sqlite://fleetgate.db?mode=rwc");
        assert!(config.panel_path_generated);
        assert_eq!(config.panel_path.len(), 20);
        assert_eq!(config.base_url, None);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = from_toml(
            r#"
            port = 8080
            panel_path = "/from-file/"
            sync_interval_secs = 60
            base_url = "https://sub.example.com/"
            "#,
        );
        let env = PartialServerConfig {
            port: Some(9090),
            ..Default::default()
        };

        let config = ServerConfig::merge(env, file).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.panel_path, "from-file");
        assert!(!config.panel_path_generated);
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.base_url.as_deref(), Some("https://sub.example.com"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let env = PartialServerConfig {
            sync_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::merge(env, Default::default()).is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(ServerConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
