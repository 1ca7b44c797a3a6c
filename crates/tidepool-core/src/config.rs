//! Pool configuration.

use std::time::Duration;

use crate::credentials::Credentials;
use crate::error::PoolError;

/// Configuration for a connection pool.
///
/// Built with chained setters and validated once when the pool is
/// initialized; immutable afterwards.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tidepool_core::PoolConfig;
///
/// let config = PoolConfig::new("ws://localhost:8000/rpc")
///     .min_size(2)
///     .max_size(10)
///     .acquisition_timeout(Duration::from_secs(10));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_size, 10);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Endpoint URI (`ws://` or `wss://`).
    pub uri: String,
    /// Credentials presented after connecting, if any.
    pub credentials: Option<Credentials>,
    /// Namespace selected after authentication.
    pub namespace: Option<String>,
    /// Database selected after authentication.
    pub database: Option<String>,
    /// Number of connections the pool maintains at rest.
    pub min_size: usize,
    /// Hard cap on live plus in-flight connections.
    pub max_size: usize,
    /// Bound on a single connection attempt or probe.
    pub connection_timeout: Duration,
    /// Bound on the total time spent inside an acquire.
    pub acquisition_timeout: Duration,
    /// Idle duration after which a connection above `min_size` is reaped.
    pub max_idle_time: Duration,
    /// Age after which a connection is retired regardless of health.
    pub max_lifetime: Duration,
    /// Number of acquisitions after which a connection is retired.
    pub max_usage_count: u64,
    /// Cadence of the background health maintainer.
    pub health_check_interval: Duration,
    /// Total connection attempts before giving up (at least one try).
    pub retry_attempts: u32,
    /// Minimum wait between connection attempts.
    pub retry_delay: Duration,
    /// Re-issue namespace/database selection when a connection is returned.
    pub reset_on_return: bool,
    /// Statement executed once on the first established connection.
    pub schema_bootstrap: Option<String>,
    /// Require a TLS endpoint (`wss://`).
    pub tls: bool,
}

impl PoolConfig {
    /// Create a configuration for the given endpoint with default limits.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            credentials: None,
            namespace: None,
            database: None,
            min_size: 2,
            max_size: 10,
            connection_timeout: Duration::from_secs(5),
            acquisition_timeout: Duration::from_secs(10),
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            max_usage_count: 1000,
            health_check_interval: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            reset_on_return: true,
            schema_bootstrap: None,
            tls: false,
        }
    }

    /// Set the credentials presented after connecting.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the namespace selected after authentication.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the database selected after authentication.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the resting pool size.
    #[must_use]
    pub const fn min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    /// Set the connection cap.
    #[must_use]
    pub const fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    /// Set the bound on a single connection attempt or probe.
    #[must_use]
    pub const fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the bound on the total time spent inside an acquire.
    #[must_use]
    pub const fn acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Set the idle-reaping threshold.
    #[must_use]
    pub const fn max_idle_time(mut self, timeout: Duration) -> Self {
        self.max_idle_time = timeout;
        self
    }

    /// Set the lifetime-retirement threshold.
    #[must_use]
    pub const fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set the usage-count retirement threshold.
    #[must_use]
    pub const fn max_usage_count(mut self, count: u64) -> Self {
        self.max_usage_count = count;
        self
    }

    /// Set the maintainer cadence.
    #[must_use]
    pub const fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the total number of connection attempts.
    #[must_use]
    pub const fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the minimum wait between connection attempts.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enable or disable namespace/database re-selection on return.
    #[must_use]
    pub const fn reset_on_return(mut self, reset: bool) -> Self {
        self.reset_on_return = reset;
        self
    }

    /// Set the one-time schema bootstrap statement.
    #[must_use]
    pub fn schema_bootstrap(mut self, statement: impl Into<String>) -> Self {
        self.schema_bootstrap = Some(statement.into());
        self
    }

    /// Require a TLS endpoint.
    #[must_use]
    pub const fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ConfigurationInvalid`] naming the first
    /// offending option.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.uri.trim().is_empty() {
            return Err(PoolError::config_invalid("uri must not be empty"));
        }
        if self.tls && !self.uri.starts_with("wss://") {
            return Err(PoolError::config_invalid(
                "tls is required but the endpoint is not wss://",
            ));
        }
        if self.min_size == 0 {
            return Err(PoolError::config_invalid("min_size must be at least 1"));
        }
        if self.max_size < self.min_size {
            return Err(PoolError::config_invalid(
                "max_size must be at least min_size",
            ));
        }
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("acquisition_timeout", self.acquisition_timeout),
            ("max_idle_time", self.max_idle_time),
            ("max_lifetime", self.max_lifetime),
            ("health_check_interval", self.health_check_interval),
            ("retry_delay", self.retry_delay),
        ] {
            if value.is_zero() {
                return Err(PoolError::config_invalid(format!(
                    "{name} must be positive"
                )));
            }
        }
        if self.max_usage_count == 0 {
            return Err(PoolError::config_invalid(
                "max_usage_count must be at least 1",
            ));
        }
        Ok(())
    }

    /// Total connection attempts, clamped to at least one try.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }
}
