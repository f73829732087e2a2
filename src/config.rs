//! Configuration for the taskrelay service.
//!
//! All configuration is loaded from environment variables. Required
//! variables fail startup with a [`ConfigError`]; optional ones carry the
//! defaults documented on each section. Intervals and timeouts are integer
//! seconds.

use crate::errors::ConfigError;
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

/// HTTP server port.
///
/// Wraps a u16 port number for the HTTP server. Provides type safety and
/// validation for port values.
#[derive(Clone, Debug)]
pub struct HttpPort(u16);

impl TryFrom<String> for HttpPort {
    type Error = ConfigError;
    fn try_from(value: String) -> Result<Self> {
        if value.is_empty() {
            Ok(Self(8080))
        } else {
            value
                .parse::<u16>()
                .map(Self)
                .map_err(|_| ConfigError::InvalidPortNumber { port: value.clone() })
        }
    }
}

impl AsRef<u16> for HttpPort {
    fn as_ref(&self) -> &u16 {
        &self.0
    }
}

/// HTTP server configuration.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub host: String,
    pub port: HttpPort,
}

impl HttpConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: default_env("HTTP_HOST", "0.0.0.0"),
            port: default_env("HTTP_PORT", "8080").try_into()?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port.as_ref())
    }
}

/// Single-task executor configuration.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Number of workers pulling from the dispatcher.
    pub workers: usize,
    /// Interval between queue polls.
    pub poll_interval: Duration,
    /// A task whose retries reach this cap is dropped from the queue.
    pub max_task_retries: i32,
    /// Pending tasks claimed longer ago than this are returned to Created by
    /// the sweeper. Zero disables the sweeper.
    pub claim_timeout: Duration,
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workers: usize_env("EXECUTOR_WORKERS", 5)?.max(1),
            poll_interval: duration_env("EXECUTOR_POLL_INTERVAL", 1)?,
            max_task_retries: usize_env("EXECUTOR_MAX_TASK_RETRIES", 10)? as i32,
            claim_timeout: duration_env("EXECUTOR_CLAIM_TIMEOUT", 600)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var_name: "EXECUTOR_POLL_INTERVAL".to_string(),
                details: "poll interval must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

/// Task-list executor configuration.
#[derive(Clone, Debug)]
pub struct ListExecutorConfig {
    /// Maximum number of concurrently executing task lists.
    pub workers: usize,
    pub poll_interval: Duration,
}

impl ListExecutorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workers: usize_env("LIST_EXECUTOR_WORKERS", 5)?.max(1),
            poll_interval: duration_env("LIST_EXECUTOR_POLL_INTERVAL", 1)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var_name: "LIST_EXECUTOR_POLL_INTERVAL".to_string(),
                details: "poll interval must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

/// Policy engine endpoint configuration.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub addr: String,
}

/// Cache service endpoint configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub addr: String,
}

/// Event bus (AMQP) configuration. The injector is disabled when no address
/// is configured.
#[derive(Clone, Debug)]
pub struct EventsConfig {
    pub addr: Option<String>,
    pub queue: String,
}

impl EventsConfig {
    pub fn from_env() -> Self {
        Self {
            addr: std::env::var("AMQP_ADDR").ok().filter(|v| !v.is_empty()),
            queue: default_env("AMQP_QUEUE", "external"),
        }
    }
}

/// Inbound JWT authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub enabled: bool,
    pub jwk_url: String,
    pub refresh_interval: Duration,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        let enabled = bool_env("AUTH_ENABLED");
        let jwk_url = optional_env("AUTH_JWK_URL");
        if enabled && jwk_url.is_empty() {
            return Err(ConfigError::EnvVarRequired {
                var_name: "AUTH_JWK_URL".to_string(),
            });
        }
        Ok(Self {
            enabled,
            jwk_url,
            refresh_interval: duration_env("AUTH_REFRESH_INTERVAL", 3600)?,
        })
    }
}

/// Outbound OAuth2 client-credentials configuration. When fully set, policy
/// and cache calls carry a bearer token obtained from the token endpoint.
#[derive(Clone, Debug)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl OAuthConfig {
    pub fn from_env() -> Option<Self> {
        let client_id = optional_env("OAUTH_CLIENT_ID");
        let client_secret = optional_env("OAUTH_CLIENT_SECRET");
        let token_url = optional_env("OAUTH_TOKEN_URL");
        if client_id.is_empty() || client_secret.is_empty() || token_url.is_empty() {
            return None;
        }
        Some(Self {
            client_id,
            client_secret,
            token_url,
        })
    }
}

/// Metrics listener configuration.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub addr: String,
}

/// Main configuration for the taskrelay service.
///
/// Loaded once at startup with [`Config::new`]; every background component
/// receives the section it needs by value.
#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub http: HttpConfig,
    pub database_url: String,
    pub policy: PolicyConfig,
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
    pub list_executor: ListExecutorConfig,
    pub events: EventsConfig,
    pub auth: AuthConfig,
    pub oauth: Option<OAuthConfig>,
    pub metrics: MetricsConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Required environment variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `POLICY_ADDR`: base URL of the policy engine
    /// - `CACHE_ADDR`: base URL of the cache service
    /// - `AUTH_JWK_URL`: JWKS endpoint, required only when `AUTH_ENABLED=true`
    pub fn new() -> Result<Self> {
        let executor = ExecutorConfig::from_env()?;
        executor.validate()?;

        let list_executor = ListExecutorConfig::from_env()?;
        list_executor.validate()?;

        Ok(Self {
            version: version()?,
            http: HttpConfig::from_env()?,
            database_url: require_env("DATABASE_URL")?,
            policy: PolicyConfig {
                addr: require_env("POLICY_ADDR")?,
            },
            cache: CacheConfig {
                addr: require_env("CACHE_ADDR")?,
            },
            executor,
            list_executor,
            events: EventsConfig::from_env(),
            auth: AuthConfig::from_env()?,
            oauth: OAuthConfig::from_env(),
            metrics: MetricsConfig {
                addr: default_env("METRICS_ADDR", "0.0.0.0:2112"),
            },
            log_level: default_env("LOG_LEVEL", "info"),
        })
    }
}

/// Retrieves a required environment variable.
fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarRequired {
        var_name: name.to_string(),
    })
}

/// Retrieves an optional environment variable, returning an empty string if
/// not set.
fn optional_env(name: &str) -> String {
    std::env::var(name).unwrap_or("".to_string())
}

/// Retrieves an environment variable with a default value if not set.
fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or(default_value.to_string())
}

fn bool_env(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn usize_env(name: &str, default_value: usize) -> Result<usize> {
    let value = optional_env(name);
    if value.is_empty() {
        return Ok(default_value);
    }
    value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
        var_name: name.to_string(),
        details: format!("expected a non-negative integer, got: {}", value),
    })
}

/// Parses a duration expressed as integer seconds.
fn duration_env(name: &str, default_secs: u64) -> Result<Duration> {
    let value = optional_env(name);
    if value.is_empty() {
        return Ok(Duration::from_secs(default_secs));
    }
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidDuration {
            var_name: name.to_string(),
            value,
        })
}

/// Retrieves the service version from compile-time environment variables.
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotAvailable)
}
