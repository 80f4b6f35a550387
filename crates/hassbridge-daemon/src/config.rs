//! Daemon configuration file.

use anyhow::Context;
use hassbridge_plugin::PluginConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Plugin name, used in log lines and runtime notifications.
    #[serde(default = "default_name")]
    pub name: String,
    pub hass: PluginConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Address the dashboard stream listens on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_name() -> String {
    "HASS".to_string()
}

fn default_bind() -> SocketAddr {
    ([127, 0, 0, 1], 5050).into()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn minimal_config() {
        let config = DaemonConfig::parse(
            r#"
            [hass]
            ha_url = "http://hass.local:8123"
            token = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "HASS");
        assert_eq!(config.stream.bind, default_bind());
        assert_eq!(config.hass.namespace, "default");
        assert_eq!(config.hass.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn example_config_parses() {
        let config = DaemonConfig::parse(include_str!("../hassbridge.example.toml")).unwrap();
        assert_eq!(config.stream.bind.port(), 5050);
        assert!(config.hass.cert_verify);
    }

    #[test]
    fn missing_hass_table_is_an_error() {
        assert!(DaemonConfig::parse("name = \"x\"").is_err());
    }
}
