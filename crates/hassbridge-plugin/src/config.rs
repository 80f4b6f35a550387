//! Plugin configuration.

use hassbridge_core::Credential;
use reqwest::Url;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Path of the event channel, relative to the base URL.
pub const WEBSOCKET_PATH: &str = "/api/websocket";

/// Configuration of one source connection.
///
/// Deserialized from the `[hass]` table of the daemon config. Durations are
/// given in (possibly fractional) seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Base URL of the service, e.g. `http://hass.local:8123`.
    pub ha_url: String,
    /// Long-lived access token.
    #[serde(default)]
    pub token: Option<String>,
    /// Legacy API password. Deprecated in favour of `token`.
    #[serde(default)]
    pub ha_key: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Log protocol traffic at info level.
    #[serde(default)]
    pub verbose: bool,
    /// PEM bundle of CA certificates to trust instead of the system roots.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default = "default_cert_verify")]
    pub cert_verify: bool,
    /// HTTP request and socket connect timeout.
    #[serde(default, deserialize_with = "optional_seconds")]
    pub timeout: Option<Duration>,
    /// Wait between priming and the started notification.
    #[serde(default, deserialize_with = "seconds")]
    pub app_init_delay: Duration,
    /// Wait between connection attempts.
    #[serde(default = "default_retry_delay", deserialize_with = "seconds")]
    pub retry_delay: Duration,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_cert_verify() -> bool {
    true
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn optional_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<f64>::deserialize(deserializer)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
        .transpose()
}

impl PluginConfig {
    /// A config with defaults for everything but the URL.
    pub fn new(ha_url: impl Into<String>) -> Self {
        Self {
            ha_url: ha_url.into(),
            token: None,
            ha_key: None,
            namespace: default_namespace(),
            verbose: false,
            cert_path: None,
            cert_verify: default_cert_verify(),
            timeout: None,
            app_init_delay: Duration::ZERO,
            retry_delay: default_retry_delay(),
        }
    }

    /// Credential by precedence: token, then legacy key.
    pub fn credential(&self) -> Option<Credential> {
        Credential::select(self.token.as_deref(), self.ha_key.as_deref())
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.ha_url.trim().trim_end_matches('/')
    }

    /// Event channel URL: `http` becomes `ws`, `https` becomes `wss`.
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        let url = Url::parse(self.base_url()).map_err(|source| ConfigError::InvalidUrl {
            url: self.ha_url.clone(),
            source,
        })?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        let rest = &self.base_url()[url.scheme().len()..];
        Ok(format!("{scheme}{rest}{WEBSOCKET_PATH}"))
    }

    /// Check the config before any connection is attempted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ha_url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        self.websocket_url().map(drop)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ha_url not found in configuration")]
    MissingUrl,
    #[error("invalid ha_url {url:?}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme {0:?} in ha_url, expected http or https")]
    UnsupportedScheme(String),
    #[error("cannot read CA bundle {path}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CA bundle {path}: {reason}")]
    InvalidCertificate { path: PathBuf, reason: String },
    #[error("TLS setup failed")]
    Tls(#[from] rustls::Error),
    #[error("HTTP client setup failed")]
    HttpClient(#[source] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_rewrites_scheme() {
        let config = PluginConfig::new("http://hass.local:8123");
        assert_eq!(
            config.websocket_url().unwrap(),
            "ws://hass.local:8123/api/websocket"
        );

        let config = PluginConfig::new("https://hass.example.com/");
        assert_eq!(
            config.websocket_url().unwrap(),
            "wss://hass.example.com/api/websocket"
        );
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let config = PluginConfig::new("  http://hass.local:8123/ \n");
        assert_eq!(config.base_url(), "http://hass.local:8123");
        assert_eq!(
            config.websocket_url().unwrap(),
            "ws://hass.local:8123/api/websocket"
        );
    }

    #[test]
    fn websocket_url_rejects_other_schemes() {
        let config = PluginConfig::new("ftp://hass.local");
        assert!(matches!(
            config.websocket_url(),
            Err(ConfigError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(PluginConfig::new("").validate().is_err());
    }

    #[test]
    fn defaults_from_toml() {
        let config: PluginConfig = toml::from_str(r#"ha_url = "http://h:8123""#).unwrap();
        assert_eq!(config.namespace, "default");
        assert!(config.cert_verify);
        assert!(!config.verbose);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.app_init_delay, Duration::ZERO);
        assert_eq!(config.timeout, None);
        assert!(config.credential().is_none());
    }

    #[test]
    fn fractional_seconds() {
        let config: PluginConfig = toml::from_str(
            r#"
            ha_url = "http://h:8123"
            token = "t"
            ha_key = "k"
            app_init_delay = 2
            retry_delay = 0.5
            timeout = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.app_init_delay, Duration::from_secs(2));
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.credential(), Some(Credential::Token("t".into())));
    }
}
