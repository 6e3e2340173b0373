//! Per-registry host configuration and the lookup contract.
//!
//! A [`HostConfig`] describes one registry endpoint: how to reach it, how it
//! is secured, which mirrors front it, and the pacing and throttling applied
//! to it. Configs are resolved through a [`HostSource`] so embedders can back
//! them with files, flags, or discovery.

use crate::credential::CredentialSource;
use crate::throttle::Throttle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// API option key disabling HEAD probes on hosts that reject them.
pub const API_OPT_DISABLE_HEAD: &str = "disableHead";

/// TLS mode for a registry host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS with certificate verification
    #[default]
    Enabled,
    /// TLS without certificate verification
    Insecure,
    /// Plain HTTP
    Disabled,
}

/// Configuration for a single registry host.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Canonical (normalized) name of the host
    pub name: String,

    /// Network hostname, with optional port
    pub hostname: String,

    /// TLS mode
    #[serde(default)]
    pub tls: TlsMode,

    /// Mirrors configured to serve this host's content, attempted first
    #[serde(default)]
    pub mirrors: Vec<String>,

    /// Selection priority; lower is preferred
    #[serde(default)]
    pub priority: u32,

    /// Requests per second pacing; zero disables pacing
    #[serde(default)]
    pub req_per_sec: f64,

    /// Path prefix inserted between `/v2` and the repository
    #[serde(default)]
    pub path_prefix: String,

    /// Scope auth handlers per repository instead of per host
    #[serde(default)]
    pub repo_auth: bool,

    /// Opaque API options (notably `disableHead`)
    #[serde(default)]
    pub api_opts: HashMap<String, String>,

    /// Inline PEM certificate authority for this host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reg_cert: Option<String>,

    /// Client certificate in PEM form, for mutual TLS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,

    /// Client key in PEM form, for mutual TLS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,

    /// Concurrency throttle for this host
    #[serde(skip)]
    pub throttle: Option<Arc<dyn Throttle>>,

    /// Credential source consulted at signing time
    #[serde(skip)]
    pub credentials: Option<Arc<dyn CredentialSource>>,
}

impl HostConfig {
    /// Synthesize a default configuration from a bare host name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            hostname: name.clone(),
            name,
            ..Self::default()
        }
    }

    /// Set the network hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the TLS mode.
    #[must_use]
    pub const fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Set the mirror list.
    #[must_use]
    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }

    /// Set the selection priority (lower is preferred).
    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the request pacing rate.
    #[must_use]
    pub const fn with_req_per_sec(mut self, rate: f64) -> Self {
        self.req_per_sec = rate;
        self
    }

    /// Set the path prefix.
    #[must_use]
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    /// Enable per-repository auth scoping.
    #[must_use]
    pub const fn with_repo_auth(mut self, enabled: bool) -> Self {
        self.repo_auth = enabled;
        self
    }

    /// Set an API option.
    #[must_use]
    pub fn with_api_opt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.api_opts.insert(key.into(), value.into());
        self
    }

    /// Set the inline host CA.
    #[must_use]
    pub fn with_reg_cert(mut self, pem: impl Into<String>) -> Self {
        self.reg_cert = Some(pem.into());
        self
    }

    /// Set the client certificate and key for mutual TLS.
    #[must_use]
    pub fn with_client_cert(
        mut self,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        self.client_cert = Some(cert_pem.into());
        self.client_key = Some(key_pem.into());
        self
    }

    /// Set the concurrency throttle.
    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Set the credential source.
    #[must_use]
    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Returns true when HEAD probes are disabled by `api_opts`.
    #[must_use]
    pub fn head_disabled(&self) -> bool {
        self.api_opts
            .get(API_OPT_DISABLE_HEAD)
            .is_some_and(|v| v == "true")
    }

    /// Returns true when the transport needs TLS customization.
    #[must_use]
    pub fn needs_custom_tls(&self, extra_roots: bool, ca_dirs: bool) -> bool {
        self.tls == TlsMode::Insecure
            || extra_roots
            || ca_dirs
            || self.reg_cert.is_some()
            || (self.client_cert.is_some() && self.client_key.is_some())
    }
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("tls", &self.tls)
            .field("mirrors", &self.mirrors)
            .field("priority", &self.priority)
            .field("req_per_sec", &self.req_per_sec)
            .field("path_prefix", &self.path_prefix)
            .field("repo_auth", &self.repo_auth)
            .field("api_opts", &self.api_opts)
            .field("has_throttle", &self.throttle.is_some())
            .field("has_credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

/// Lookup contract resolving a logical host name to its configuration.
///
/// The engine synthesizes a default config when the source returns `None`.
/// The returned `name` may differ from the requested one; the engine keys its
/// state on the returned (normalized) name.
pub trait HostSource: Send + Sync {
    /// Resolve the configuration for `name`.
    fn host_config(&self, name: &str) -> Option<HostConfig>;
}

/// Static, in-memory host source.
#[derive(Default, Clone)]
pub struct StaticHosts {
    hosts: HashMap<String, HostConfig>,
}

impl StaticHosts {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host configuration, keyed by its name.
    #[must_use]
    pub fn with_host(mut self, config: HostConfig) -> Self {
        self.hosts.insert(config.name.clone(), config);
        self
    }

    /// Add an alias resolving to an existing configuration.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>, config: HostConfig) -> Self {
        self.hosts.insert(alias.into(), config);
        self
    }
}

impl HostSource for StaticHosts {
    fn host_config(&self, name: &str) -> Option<HostConfig> {
        self.hosts.get(name).cloned()
    }
}
