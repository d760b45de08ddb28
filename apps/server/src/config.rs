//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use homectl_core::{Credentials, TapoAccount, TuyaDeviceConfig};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to; 0 picks the first free port in the
    /// default range.
    /// Override: `HOMECTL_BIND_PORT`
    pub bind_port: u16,

    /// Origin prefixes allowed to call the API from a browser.
    pub trusted_origins: Vec<String>,

    /// Run discovery probes continuously.
    /// Override: `HOMECTL_AUTO_DISCOVERY`
    pub auto_discovery: bool,

    /// Seconds between discovery passes.
    /// Override: `HOMECTL_DISCOVERY_INTERVAL`
    pub discovery_interval: u64,

    /// Seconds a device may be missing before it is removed.
    pub grace_period: u64,

    /// Poll bulbs for state changes made elsewhere.
    pub polling_enabled: bool,

    /// Seconds between polls.
    /// Override: `HOMECTL_POLL_INTERVAL`
    pub poll_interval: u64,

    /// Maximum concurrent device operations.
    pub worker_pool_size: usize,

    /// Milliseconds before a device operation is abandoned.
    pub operation_timeout_ms: u64,

    /// Tapo account and bulb addresses.
    pub tapo: TapoSection,

    /// Tuya devices with their local keys.
    pub tuya: Vec<TuyaDeviceConfig>,
}

/// Tapo credentials as written in the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TapoSection {
    /// Override: `HOMECTL_TAPO_USERNAME`
    pub username: Option<String>,
    /// Override: `HOMECTL_TAPO_PASSWORD`
    pub password: Option<String>,
    pub hosts: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = homectl_core::Config::default();
        Self {
            bind_port: 49500,
            trusted_origins: vec![
                "http://localhost".to_string(),
                "http://127.0.0.1".to_string(),
            ],
            auto_discovery: core.auto_discovery,
            discovery_interval: core.discovery_interval_secs,
            grace_period: core.grace_period_secs,
            polling_enabled: core.polling_enabled,
            poll_interval: core.poll_interval_secs,
            worker_pool_size: core.worker_pool_size,
            operation_timeout_ms: core.operation_timeout_ms,
            tapo: TapoSection::default(),
            tuya: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `HOMECTL_*` overrides looked up through `var`.
    ///
    /// Unparseable values are ignored with a warning.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    log::warn!("Ignoring invalid value for {}: {:?}", key, value);
                    None
                }
            }
        }

        if let Some(port) = parse("HOMECTL_BIND_PORT", var("HOMECTL_BIND_PORT")) {
            self.bind_port = port;
        }
        if let Some(enabled) = parse("HOMECTL_AUTO_DISCOVERY", var("HOMECTL_AUTO_DISCOVERY")) {
            self.auto_discovery = enabled;
        }
        if let Some(secs) = parse(
            "HOMECTL_DISCOVERY_INTERVAL",
            var("HOMECTL_DISCOVERY_INTERVAL"),
        ) {
            self.discovery_interval = secs;
        }
        if let Some(secs) = parse("HOMECTL_POLL_INTERVAL", var("HOMECTL_POLL_INTERVAL")) {
            self.poll_interval = secs;
        }
        if let Some(username) = var("HOMECTL_TAPO_USERNAME") {
            self.tapo.username = Some(username);
        }
        if let Some(password) = var("HOMECTL_TAPO_PASSWORD") {
            self.tapo.password = Some(password);
        }
    }

    fn credentials(&self) -> Credentials {
        let tapo_account = match (&self.tapo.username, &self.tapo.password) {
            (Some(username), Some(password)) if !username.trim().is_empty() => {
                Some(TapoAccount {
                    username: username.trim().to_string(),
                    password: password.clone(),
                })
            }
            (Some(_), None) | (None, Some(_)) => {
                log::warn!("Tapo account needs both username and password; ignoring it");
                None
            }
            _ => None,
        };

        Credentials {
            tapo_account,
            tapo_hosts: self.tapo.hosts.clone(),
            tuya_devices: self.tuya.clone(),
        }
    }

    /// Converts to homectl-core's Config type.
    pub fn to_core_config(&self) -> homectl_core::Config {
        homectl_core::Config {
            auto_discovery: self.auto_discovery,
            discovery_interval_secs: self.discovery_interval,
            grace_period_secs: self.grace_period,
            polling_enabled: self.polling_enabled,
            poll_interval_secs: self.poll_interval,
            worker_pool_size: self.worker_pool_size,
            operation_timeout_ms: self.operation_timeout_ms,
            credentials: self.credentials(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_convert_to_valid_core_config() {
        let core = ServerConfig::default().to_core_config();
        assert!(core.validate().is_ok());
        assert_eq!(core.grace_period_secs, 120);
        assert_eq!(core.poll_interval_secs, 5);
        assert!(core.credentials.tapo_account.is_none());
    }

    #[test]
    fn loads_yaml_with_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind_port: 8080
poll_interval: 10
tapo:
  username: me@example.com
  password: secret
  hosts: ["192.168.1.40", "192.168.1.41"]
tuya:
  - id: bf0123456789abcdef
    name: Desk lamp
    ip: 192.168.1.50
    local_key: "0123456789abcdef"
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.poll_interval, 10);
        // Unset keys keep their defaults.
        assert!(config.auto_discovery);

        let core = config.to_core_config();
        let account = core.credentials.tapo_account.as_ref().unwrap();
        assert_eq!(account.username, "me@example.com");
        assert_eq!(core.credentials.tapo_hosts.len(), 2);
        let tuya = core.credentials.tuya_device("bf0123456789abcdef").unwrap();
        assert_eq!(tuya.name, "Desk lamp");
        assert_eq!(tuya.version, "3.3");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::load(Some(&dir.path().join("absent.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_port: [not, a, port]").unwrap();
        assert!(ServerConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = ServerConfig {
            bind_port: 8080,
            ..ServerConfig::default()
        };
        config.apply_overrides(lookup(&[
            ("HOMECTL_BIND_PORT", "9090"),
            ("HOMECTL_AUTO_DISCOVERY", "false"),
            ("HOMECTL_POLL_INTERVAL", "not-a-number"),
            ("HOMECTL_TAPO_USERNAME", "env@example.com"),
            ("HOMECTL_TAPO_PASSWORD", "envpass"),
        ]));

        assert_eq!(config.bind_port, 9090);
        assert!(!config.auto_discovery);
        assert_eq!(config.poll_interval, 5);
        let core = config.to_core_config();
        assert!(!core.auto_discovery);
        assert_eq!(
            core.credentials.tapo_account.unwrap().username,
            "env@example.com"
        );
    }

    #[test]
    fn half_a_tapo_account_is_dropped() {
        let config = ServerConfig {
            tapo: TapoSection {
                username: Some("me@example.com".into()),
                password: None,
                hosts: vec!["192.168.1.40".into()],
            },
            ..ServerConfig::default()
        };
        let credentials = config.to_core_config().credentials;
        assert!(credentials.tapo_account.is_none());
        assert_eq!(credentials.tapo_hosts, vec!["192.168.1.40"]);
    }
}
