//! Per-host state and mirror candidate ordering.
//!
//! Every registry host the client talks to gets one [`Host`]: its transport
//! (TLS-customized when the config demands it), its auth handlers, its rate
//! pacer, and its backoff controller. Hosts live for the client's lifetime
//! and are shared by every request, which is what makes backoff a shared
//! budget.

use crate::auth::{AuthHandler, RegistryAuth};
use crate::backoff::Backoff;
use crate::pacer::RatePacer;
use crate::tls;
use regwire_core::config::ClientOptions;
use regwire_core::host::HostConfig;
use regwire_core::throttle::{ReqMeta, ThrottleLease};
use regwire_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::warn;

/// Factory producing the auth handler for a host (or `None` to leave the
/// host unauthenticated). Receives the host config, the host's transport,
/// and the client id presented to token services.
pub type AuthFactory =
    Arc<dyn Fn(&HostConfig, reqwest::Client, &str) -> Option<Arc<dyn AuthHandler>> + Send + Sync>;

/// The default factory: [`RegistryAuth`] bound to the host's transport and
/// credential source.
pub(crate) fn default_auth_factory() -> AuthFactory {
    Arc::new(|config, http, client_id| {
        Some(Arc::new(RegistryAuth::new(
            http,
            client_id,
            config.credentials.clone(),
        )) as Arc<dyn AuthHandler>)
    })
}

/// State for one registry host.
pub(crate) struct Host {
    pub(crate) config: HostConfig,
    pub(crate) http: reqwest::Client,
    pub(crate) pacer: RatePacer,
    pub(crate) backoff: Backoff,
    auth: Mutex<HashMap<String, Arc<dyn AuthHandler>>>,
    auth_factory: AuthFactory,
    client_id: String,
}

impl Host {
    /// Build a fully initialized host from its config.
    ///
    /// TLS assembly failures are logged and the host falls back to the
    /// template transport; a misconfigured trust source should not make the
    /// registry unreachable.
    pub(crate) fn new(
        config: HostConfig,
        opts: &ClientOptions,
        default_http: &reqwest::Client,
        auth_factory: AuthFactory,
    ) -> Arc<Self> {
        let http = match tls::build_host_transport(opts, &config) {
            Ok(Some(custom)) => custom,
            Ok(None) => default_http.clone(),
            Err(err) => {
                warn!(host = %config.name, error = %err,
                    "TLS setup failed, continuing with the default transport");
                default_http.clone()
            }
        };
        let pacer = RatePacer::new(config.req_per_sec);
        let backoff = Backoff::new(
            config.name.clone(),
            opts.delay_init(),
            opts.delay_max(),
            opts.retry_limit,
        );
        Arc::new(Self {
            http,
            pacer,
            backoff,
            auth: Mutex::new(HashMap::new()),
            auth_factory,
            client_id: opts.user_agent.clone(),
            config,
        })
    }

    /// Fetch or lazily create the auth handler for a repository.
    ///
    /// Hosts without `repo_auth` share a single handler under the empty
    /// key regardless of the repository.
    pub(crate) fn get_auth(&self, repository: &str) -> Option<Arc<dyn AuthHandler>> {
        let key = if self.config.repo_auth {
            repository
        } else {
            ""
        };
        let mut map = self.auth.lock().expect("auth map mutex poisoned");
        if let Some(handler) = map.get(key) {
            return Some(handler.clone());
        }
        let handler = (self.auth_factory)(&self.config, self.http.clone(), &self.client_id)?;
        map.insert(key.to_string(), handler.clone());
        Some(handler)
    }

    /// Acquire a throttle slot, or an empty lease when the host has none.
    pub(crate) async fn acquire_throttle(&self, meta: ReqMeta) -> Result<ThrottleLease> {
        match &self.config.throttle {
            Some(throttle) => throttle.acquire(meta).await,
            None => Ok(ThrottleLease::empty()),
        }
    }
}

/// Order candidate hosts for an attempt: backoff-ready hosts first (earliest
/// `backoff_until` wins when any window is open), then priority ascending,
/// and the upstream last among ties so mirrors absorb load.
pub(crate) fn order_candidates(hosts: &mut [Arc<Host>], upstream: &str) {
    let now = Instant::now();
    hosts.sort_by(|a, b| {
        let until_a = a.backoff.until().filter(|t| *t > now);
        let until_b = b.backoff.until().filter(|t| *t > now);
        if until_a.is_some() || until_b.is_some() {
            return until_a.cmp(&until_b);
        }
        a.config
            .priority
            .cmp(&b.config.priority)
            .then_with(|| (a.config.name == upstream).cmp(&(b.config.name == upstream)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use regwire_core::host::TlsMode;
    use std::time::Duration;

    fn build_host(config: HostConfig, opts: &ClientOptions) -> Arc<Host> {
        let default_http = tls::build_default_transport(opts).unwrap();
        Host::new(config, opts, &default_http, default_auth_factory())
    }

    #[test]
    fn auth_map_keyed_by_empty_without_repo_auth() {
        let opts = ClientOptions::new();
        let host = build_host(HostConfig::new("r.example"), &opts);

        let a = host.get_auth("library/busybox").unwrap();
        let b = host.get_auth("library/alpine").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "one shared handler under the empty key");
    }

    #[test]
    fn auth_map_keyed_by_repository_with_repo_auth() {
        let opts = ClientOptions::new();
        let host = build_host(HostConfig::new("r.example").with_repo_auth(true), &opts);

        let a = host.get_auth("library/busybox").unwrap();
        let b = host.get_auth("library/alpine").unwrap();
        let a2 = host.get_auth("library/busybox").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &a2));
    }

    #[test]
    fn disabled_auth_factory_yields_no_handler() {
        let opts = ClientOptions::new();
        let default_http = tls::build_default_transport(&opts).unwrap();
        let factory: AuthFactory = Arc::new(|_, _, _| None);
        let host = Host::new(HostConfig::new("r.example"), &opts, &default_http, factory);
        assert!(host.get_auth("library/busybox").is_none());
    }

    #[test]
    fn bad_tls_config_falls_back_to_default_transport() {
        let opts = ClientOptions::new();
        let config = HostConfig::new("r.example").with_reg_cert("not a pem");
        // must not fail; the host is still usable
        let host = build_host(config, &opts);
        assert_eq!(host.config.name, "r.example");
    }

    #[tokio::test]
    async fn throttle_defaults_to_empty_lease() {
        let opts = ClientOptions::new();
        let host = build_host(HostConfig::new("r.example"), &opts);
        let lease = host.acquire_throttle(ReqMeta::default()).await.unwrap();
        assert!(!lease.is_held());
    }

    #[tokio::test]
    async fn ordering_by_priority_with_upstream_last() {
        let opts = ClientOptions::new();
        let upstream = build_host(
            HostConfig::new("registry.example.com").with_priority(10),
            &opts,
        );
        let m1 = build_host(HostConfig::new("m1.example.com").with_priority(5), &opts);
        let m2 = build_host(HostConfig::new("m2.example.com").with_priority(10), &opts);

        let mut hosts = vec![upstream.clone(), m1.clone(), m2.clone()];
        order_candidates(&mut hosts, "registry.example.com");
        let names: Vec<_> = hosts.iter().map(|h| h.config.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["m1.example.com", "m2.example.com", "registry.example.com"]
        );
    }

    #[tokio::test]
    async fn ordering_sends_backed_off_hosts_last() {
        let opts = ClientOptions::new().with_delay_init(Duration::from_secs(1));
        let upstream = build_host(
            HostConfig::new("registry.example.com").with_priority(10),
            &opts,
        );
        let m1 = build_host(HostConfig::new("m1.example.com").with_priority(5), &opts);
        let m2 = build_host(HostConfig::new("m2.example.com").with_priority(10), &opts);

        m1.backoff.set(None).unwrap();

        let mut hosts = vec![upstream.clone(), m1.clone(), m2.clone()];
        order_candidates(&mut hosts, "registry.example.com");
        let names: Vec<_> = hosts.iter().map(|h| h.config.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["m2.example.com", "registry.example.com", "m1.example.com"]
        );
    }

    #[tokio::test]
    async fn ordering_by_earliest_backoff_window() {
        let opts = ClientOptions::new().with_delay_init(Duration::from_secs(1));
        let a = build_host(HostConfig::new("a.example.com"), &opts);
        let b = build_host(HostConfig::new("b.example.com"), &opts);

        // b's window opens later than a's
        a.backoff.set(None).unwrap();
        b.backoff.set(None).unwrap();
        b.backoff.set(None).unwrap();

        let mut hosts = vec![b.clone(), a.clone()];
        order_candidates(&mut hosts, "a.example.com");
        let names: Vec<_> = hosts.iter().map(|h| h.config.name.as_str()).collect();
        assert_eq!(names, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn insecure_host_gets_its_own_transport() {
        let opts = ClientOptions::new();
        let config = HostConfig::new("r.example").with_tls(TlsMode::Insecure);
        let host = build_host(config, &opts);
        assert_eq!(host.config.tls, TlsMode::Insecure);
    }
}
