//! Connection and pool configuration
//!
//! Both types are plain immutable values. The core never loads them from
//! anywhere; callers build them, parse a connection string, or deserialize
//! them from their own configuration source.

mod connection_string;

use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Default Postgres port
pub const DEFAULT_PORT: u16 = 5432;

/// Default host
pub const DEFAULT_HOST: &str = "localhost";

/// Connection configuration
///
/// Identifies one database and the credentials used to reach it.
/// Use `ConnectionConfig::builder()` for a fluent API, or
/// [`ConnectionConfig::parse`] for a `postgres://` connection string.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Database name
    pub database: String,
    /// Username
    pub username: String,
    /// Password (optional)
    #[serde(default)]
    pub password: Option<String>,
    /// Host name, IP address, or Unix socket directory (starts with `/`)
    #[serde(default = "default_host")]
    pub host: String,
    /// Port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Lowercase result-set column names
    #[serde(default)]
    pub lowercase_columns: bool,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("lowercase_columns", &self.lowercase_columns)
            .finish()
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ConnectionConfig {
    /// Create new configuration with defaults
    ///
    /// # Defaults
    ///
    /// - `password`: None
    /// - `host`: `localhost`
    /// - `port`: 5432
    /// - `lowercase_columns`: false
    pub fn new(database: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            username: username.into(),
            password: None,
            host: default_host(),
            port: DEFAULT_PORT,
            lowercase_columns: false,
        }
    }

    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```
    /// use fraiseql_conn::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::builder("mydb", "app")
    ///     .password("secret")
    ///     .host("db.internal")
    ///     .port(5433)
    ///     .lowercase_columns(true)
    ///     .build();
    ///
    /// assert_eq!(config.port, 5433);
    /// assert!(config.lowercase_columns);
    /// ```
    pub fn builder(
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: Self::new(database, username),
        }
    }

    /// Parse a `postgres://` connection string
    pub fn parse(connection_string: &str) -> Result<Self> {
        connection_string::parse(connection_string)
    }

    /// Set password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Whether `host` names a Unix socket directory
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }
}

impl std::str::FromStr for ConnectionConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Builder for `ConnectionConfig`
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set the host (or Unix socket directory)
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Lowercase column names reported by result sets
    pub fn lowercase_columns(mut self, enabled: bool) -> Self {
        self.config.lowercase_columns = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

/// Pool configuration
///
/// Opaque to the connection handle: its presence switches the handle into
/// pooled mode and it is passed through to the pool constructor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Connections opened by `warm_up`
    #[serde(default)]
    pub min_size: usize,
    /// Maximum number of connections checked out or idle
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// How long `acquire` waits for capacity, in seconds when deserialized
    #[serde(
        default = "default_acquire_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub acquire_timeout: Duration,
}

fn default_max_size() -> usize {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_max_size(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl PoolConfig {
    /// Pool with `max_size` connections and default timeout
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    /// Set the number of connections opened up front
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Set the acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Check sizes are consistent
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("pool max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::new("db", "user");

        assert_eq!(config.database, "db");
        assert_eq!(config.username, "user");
        assert!(config.password.is_none());
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert!(!config.lowercase_columns);
        assert!(!config.is_unix_socket());
    }

    #[test]
    fn test_connection_config_builder_fluent() {
        let config = ConnectionConfig::builder("mydb", "myuser")
            .password("secret")
            .host("/var/run/postgresql")
            .port(6432)
            .lowercase_columns(true)
            .build();

        assert_eq!(config.password, Some("secret".to_string()));
        assert_eq!(config.port, 6432);
        assert!(config.lowercase_columns);
        assert!(config.is_unix_socket());
    }

    #[test]
    fn test_connection_config_debug_redacts_password() {
        let config = ConnectionConfig::builder("app", "svc").password("hunter2").build();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("svc"));
    }

    #[test]
    fn test_connection_config_deserialize() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"database": "app", "username": "svc", "password": "pw", "lowercase_columns": true}"#,
        )
        .unwrap();

        assert_eq!(config.database, "app");
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert!(config.lowercase_columns);
    }

    #[test]
    fn test_pool_config_deserialize_seconds() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max_size": 4, "acquire_timeout": 1.5}"#).unwrap();

        assert_eq!(config.min_size, 0);
        assert_eq!(config.max_size, 4);
        assert_eq!(config.acquire_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_pool_config_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(PoolConfig::new(0).validate().is_err());
        assert!(PoolConfig::new(2).min_size(3).validate().is_err());
        assert!(PoolConfig::new(3).min_size(3).validate().is_ok());
    }
}
