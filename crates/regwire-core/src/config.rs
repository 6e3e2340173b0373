//! Client-wide options for the regwire request engine.
//!
//! This module provides the configuration that applies across every registry
//! host a client talks to: retry budget, backoff delays, identity, trusted
//! certificate sources, and the transport template from which per-host HTTP
//! clients are built.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

// Retry and backoff defaults

/// Default number of times a host may fail before it is dropped
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default initial backoff delay in milliseconds
pub const DEFAULT_DELAY_INIT_MS: u64 = 1_000;

/// Default maximum backoff delay in milliseconds
pub const DEFAULT_DELAY_MAX_MS: u64 = 30_000;

/// Multiplier used to derive `delay_max` when only `delay_init` is set
pub const DELAY_MAX_FACTOR: u32 = 30;

// Transport template defaults

/// Default request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 300;

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Default idle timeout for connection pools in seconds
pub const DEFAULT_POOL_IDLE_TIMEOUT: u64 = 90;

/// Default maximum idle connections per host
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Settings for the transport template.
///
/// Per-host HTTP clients are built from these settings; hosts that need TLS
/// customization get their own client built from the same template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TransportSettings {
    /// Request timeout in seconds
    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Connection pool idle timeout in seconds
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum idle connections per host
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT
}

const fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

const fn default_pool_idle_timeout_secs() -> u64 {
    DEFAULT_POOL_IDLE_TIMEOUT
}

const fn default_pool_max_idle() -> usize {
    DEFAULT_POOL_MAX_IDLE_PER_HOST
}

impl TransportSettings {
    /// Create transport settings with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout_secs: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout_secs = seconds;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Get the request timeout as a Duration.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get the connect timeout as a Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get the pool idle timeout as a Duration.
    #[must_use]
    pub const fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-wide options for the request engine.
///
/// Controls the shared retry budget, the exponential backoff window, the
/// identity presented to registries, and the certificate sources trusted in
/// addition to the system roots.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClientOptions {
    /// Number of failures after which a host is dropped from rotation
    #[validate(range(min = 1, max = 10))]
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Initial backoff delay in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "default_delay_init_ms")]
    pub delay_init_ms: u64,

    /// Maximum backoff delay in milliseconds; derived from `delay_init_ms`
    /// when absent and never allowed below it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_max_ms: Option<u64>,

    /// User agent presented to registries (also the auth client id)
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Additional trusted root CAs as raw PEM blocks
    #[serde(default)]
    pub root_cas: Vec<String>,

    /// Files containing additional trusted root CAs
    #[serde(default)]
    pub ca_files: Vec<PathBuf>,

    /// Directories searched for `<dir>/<hostname>/*.crt` trust anchors
    #[serde(default)]
    pub ca_dirs: Vec<PathBuf>,

    /// Transport template settings
    #[validate(nested)]
    #[serde(default)]
    pub transport: TransportSettings,
}

const fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

const fn default_delay_init_ms() -> u64 {
    DEFAULT_DELAY_INIT_MS
}

fn default_user_agent() -> String {
    concat!("regwire/", env!("CARGO_PKG_VERSION")).to_string()
}

impl ClientOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            delay_init_ms: DEFAULT_DELAY_INIT_MS,
            delay_max_ms: Some(DEFAULT_DELAY_MAX_MS),
            user_agent: default_user_agent(),
            root_cas: Vec::new(),
            ca_files: Vec::new(),
            ca_dirs: Vec::new(),
            transport: TransportSettings::new(),
        }
    }

    /// Set the retry limit.
    #[must_use]
    pub const fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Set the initial backoff delay.
    #[must_use]
    pub fn with_delay_init(mut self, delay: Duration) -> Self {
        self.delay_init_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the maximum backoff delay.
    #[must_use]
    pub fn with_delay_max(mut self, delay: Duration) -> Self {
        self.delay_max_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Override the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Add a trusted root CA as a raw PEM block.
    #[must_use]
    pub fn with_root_ca(mut self, pem: impl Into<String>) -> Self {
        self.root_cas.push(pem.into());
        self
    }

    /// Add a file containing trusted root CAs.
    #[must_use]
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_files.push(path.into());
        self
    }

    /// Add a directory searched for `<hostname>/*.crt` trust anchors.
    #[must_use]
    pub fn with_ca_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_dirs.push(path.into());
        self
    }

    /// Override the transport template settings.
    #[must_use]
    pub const fn with_transport(mut self, settings: TransportSettings) -> Self {
        self.transport = settings;
        self
    }

    /// Get the initial backoff delay as a Duration.
    #[must_use]
    pub const fn delay_init(&self) -> Duration {
        Duration::from_millis(self.delay_init_ms)
    }

    /// Get the effective maximum backoff delay.
    ///
    /// When unset this is `delay_init * 30`; an explicit value is clamped so
    /// it is never below `delay_init`.
    #[must_use]
    pub fn delay_max(&self) -> Duration {
        let derived = self
            .delay_init_ms
            .saturating_mul(u64::from(DELAY_MAX_FACTOR));
        let max = self.delay_max_ms.unwrap_or(derived);
        Duration::from_millis(max.max(self.delay_init_ms))
    }

    /// Validate the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a field is out of range.
    pub fn validated(self) -> Result<Self, Error> {
        Validate::validate(&self).map_err(|err| Error::Config(format!("invalid options: {err}")))?;
        Ok(self)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ClientOptions::new();
        assert_eq!(opts.retry_limit, DEFAULT_RETRY_LIMIT);
        assert_eq!(opts.delay_init(), Duration::from_secs(1));
        assert_eq!(opts.delay_max(), Duration::from_secs(30));
        assert!(opts.user_agent.starts_with("regwire/"));
        assert!(opts.root_cas.is_empty());
    }

    #[test]
    fn test_delay_max_derived_when_unset() {
        let mut opts = ClientOptions::new().with_delay_init(Duration::from_millis(200));
        opts.delay_max_ms = None;
        assert_eq!(opts.delay_max(), Duration::from_secs(6));
    }

    #[test]
    fn test_delay_max_clamped_to_delay_init() {
        let opts = ClientOptions::new()
            .with_delay_init(Duration::from_secs(5))
            .with_delay_max(Duration::from_secs(1));
        assert_eq!(opts.delay_max(), Duration::from_secs(5));
    }

    #[test]
    fn test_builder() {
        let opts = ClientOptions::new()
            .with_retry_limit(5)
            .with_delay_init(Duration::from_millis(100))
            .with_delay_max(Duration::from_secs(10))
            .with_user_agent("regtool/2.0")
            .with_root_ca("-----BEGIN CERTIFICATE-----")
            .with_ca_dir("/etc/registry/certs.d");

        assert_eq!(opts.retry_limit, 5);
        assert_eq!(opts.delay_init(), Duration::from_millis(100));
        assert_eq!(opts.delay_max(), Duration::from_secs(10));
        assert_eq!(opts.user_agent, "regtool/2.0");
        assert_eq!(opts.root_cas.len(), 1);
        assert_eq!(opts.ca_dirs.len(), 1);
    }

    #[test]
    fn test_validation_rejects_zero_retry_limit() {
        let opts = ClientOptions::new().with_retry_limit(0);
        assert!(opts.validated().is_err());
    }

    #[test]
    fn test_validation_accepts_defaults() {
        assert!(ClientOptions::new().validated().is_ok());
    }

    #[test]
    fn test_transport_settings() {
        let settings = TransportSettings::new()
            .with_request_timeout(60)
            .with_connect_timeout(5);
        assert_eq!(settings.request_timeout(), Duration::from_secs(60));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(5));
        assert_eq!(
            settings.pool_idle_timeout(),
            Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT)
        );
    }

    #[test]
    fn test_serde_round_trip_with_defaults() {
        let opts: ClientOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.retry_limit, DEFAULT_RETRY_LIMIT);
        assert_eq!(opts.delay_init_ms, DEFAULT_DELAY_INIT_MS);
        assert!(opts.delay_max_ms.is_none());
        assert_eq!(opts.delay_max(), Duration::from_secs(30));
    }
}
