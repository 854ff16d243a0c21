//! Configuration types for rivven-unidb
//!
//! - [`ConnectionConfig`]: per-connection parameters handed to an adapter
//! - [`DispatcherConfig`]: cache, capacity and retry settings for a [`Dispatcher`]
//!
//! Dispatcher configuration can be loaded from YAML with `${VAR}` /
//! `${VAR:-default}` environment expansion:
//!
//! ```yaml
//! cache_enabled: true
//! cache_ttl_ms: 30000
//! max_connections: 20
//! retry:
//!   max_retries: 5
//!   backoff_factor: 2.0
//!   min_delay_ms: 50
//!   max_delay_ms: ${UNIDB_MAX_DELAY_MS:-2000}
//! ```
//!
//! [`Dispatcher`]: crate::dispatcher::Dispatcher

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::security::{is_sensitive_key, redact_url, REDACTED};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Wrapper for sensitive configuration values
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Access the underlying secret
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Parameters for opening one connection.
///
/// Every field is optional; each adapter fills in its own defaults for
/// host, port and mode. An explicit `url` takes precedence over the
/// individual network fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server host (network backends)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Server port (network backends)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// User name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password (never serialized in clear)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SensitiveString>,
    /// Database name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// File path (relational-file backend), `:memory:` for an in-memory database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Full connection URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Additional driver-specific options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Create an empty configuration (all adapter defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from a connection URL
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Create a configuration for a database file
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Set host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SensitiveString::new(password));
        self
    }

    /// Set database name
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set file path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add a driver-specific option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Password in clear, for adapters building a handshake
    pub fn password_secret(&self) -> Option<&str> {
        self.password.as_ref().map(SensitiveString::expose_secret)
    }

    /// JSON view of this configuration with every credential redacted
    pub fn redacted(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        if let Some(host) = &self.host {
            obj.insert("host".into(), host.clone().into());
        }
        if let Some(port) = self.port {
            obj.insert("port".into(), port.into());
        }
        if let Some(user) = &self.user {
            obj.insert("user".into(), user.clone().into());
        }
        if self.password.is_some() {
            obj.insert("password".into(), REDACTED.into());
        }
        if let Some(database) = &self.database {
            obj.insert("database".into(), database.clone().into());
        }
        if let Some(path) = &self.path {
            obj.insert("path".into(), path.clone().into());
        }
        if let Some(url) = &self.url {
            obj.insert("url".into(), redact_url(url).into());
        }
        if !self.options.is_empty() {
            let options = self
                .options
                .iter()
                .map(|(k, v)| {
                    let value = if is_sensitive_key(k) {
                        REDACTED.to_string()
                    } else {
                        v.clone()
                    };
                    (k.clone(), serde_json::Value::String(value))
                })
                .collect::<serde_json::Map<_, _>>();
            obj.insert("options".into(), serde_json::Value::Object(options));
        }
        serde_json::Value::Object(obj)
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatcherConfig {
    /// Cache query results by request fingerprint
    #[serde(default)]
    pub cache_enabled: bool,

    /// How long a cached result stays valid
    #[serde(
        rename = "cache_ttl_ms",
        default = "default_cache_ttl",
        with = "duration_ms"
    )]
    pub cache_ttl: Duration,

    /// Maximum number of concurrently registered connections
    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1, max = 10000))]
    pub max_connections: usize,

    /// Retry policy applied around every backend call
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryPolicy,

    /// Serialize calls on the same connection id
    #[serde(default = "default_serialize_per_connection")]
    pub serialize_per_connection: bool,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_max_connections() -> usize {
    10
}

fn default_serialize_per_connection() -> bool {
    true
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cache_enabled: false,
            cache_ttl: default_cache_ttl(),
            max_connections: default_max_connections(),
            retry: RetryPolicy::default(),
            serialize_per_connection: default_serialize_per_connection(),
        }
    }
}

impl DispatcherConfig {
    /// Create a default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable result caching
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Set cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set maximum connection count
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable per-connection serialization
    pub fn with_serialize_per_connection(mut self, enabled: bool) -> Self {
        self.serialize_per_connection = enabled;
        self
    }

    /// Parse a YAML document, expanding environment variables first
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
        config.validate_config()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&content)
    }

    /// Validate field ranges and cross-field constraints
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Invalid dispatcher config: {}", e)))?;
        if self.retry.min_delay > self.retry.max_delay {
            return Err(Error::config(format!(
                "retry.min_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.min_delay.as_millis(),
                self.retry.max_delay.as_millis()
            )));
        }
        Ok(())
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Serde helper: `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_string_never_prints() {
        let secret = SensitiveString::new("hunter2");
        assert_eq!(format!("{:?}", secret), REDACTED);
        assert_eq!(
            serde_json::to_string(&secret).unwrap(),
            format!("\"{}\"", REDACTED)
        );
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_connection_config_redacted() {
        let config = ConnectionConfig::new()
            .with_host("db.internal")
            .with_user("app")
            .with_password("hunter2")
            .with_option("api_key", "abc")
            .with_option("sslmode", "require");

        let redacted = config.redacted();
        assert_eq!(redacted["password"], REDACTED);
        assert_eq!(redacted["options"]["api_key"], REDACTED);
        assert_eq!(redacted["options"]["sslmode"], "require");
        assert!(!redacted.to_string().contains("hunter2"));
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_expand_env_vars_default() {
        let expanded = expand_env_vars("value: ${RIVVEN_UNIDB_SURELY_UNSET:-fallback}");
        assert_eq!(expanded, "value: fallback");
    }

    #[test]
    fn test_dispatcher_config_defaults() {
        let config = DispatcherConfig::default();
        assert!(!config.cache_enabled);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.max_connections, 10);
        assert!(config.serialize_per_connection);
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_dispatcher_config_rejects_zero_capacity() {
        let config = DispatcherConfig::default().with_max_connections(0);
        assert!(matches!(
            config.validate_config(),
            Err(Error::Configuration { .. })
        ));
    }
}
