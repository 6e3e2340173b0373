//! The registry client and its retry/mirror state machine.
//!
//! [`Client::send`] drives one logical request: order the candidate hosts
//! (mirrors first, upstream last), then loop — acquire the host's throttle,
//! wait out its backoff window, build and sign the attempt, send, classify
//! the response, and decide whether to back the host off, drop it from the
//! candidate list, or retry it immediately. The winning attempt's response
//! is returned with its throttle lease attached; resumable reads re-enter
//! the same loop.

use crate::body::Response;
use crate::hosts::{default_auth_factory, order_candidates, AuthFactory, Host};
use crate::request::{BodySource, Request};
use crate::tls;
use bytes::Bytes;
use regwire_core::config::ClientOptions;
use regwire_core::host::{HostConfig, HostSource};
use regwire_core::throttle::ThrottleLease;
use regwire_core::{Error, Result};
use reqwest::header::{
    HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER, USER_AGENT, WARNING,
};
use reqwest::Method;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Callback receiving deduplicated registry `Warning` header texts.
pub type WarningHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Builder for [`Client`].
pub struct ClientBuilder {
    opts: ClientOptions,
    source: Option<Arc<dyn HostSource>>,
    auth_factory: AuthFactory,
    warning_handler: Option<WarningHandler>,
}

impl ClientBuilder {
    /// Create a builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            opts: ClientOptions::new(),
            source: None,
            auth_factory: default_auth_factory(),
            warning_handler: None,
        }
    }

    /// Set the client options.
    #[must_use]
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Set the host configuration source.
    #[must_use]
    pub fn with_host_source(mut self, source: impl HostSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Replace the auth handler factory.
    #[must_use]
    pub fn with_auth_factory(mut self, factory: AuthFactory) -> Self {
        self.auth_factory = factory;
        self
    }

    /// Disable authentication entirely; requests are never signed.
    #[must_use]
    pub fn without_auth(mut self) -> Self {
        self.auth_factory = Arc::new(|_, _, _| None);
        self
    }

    /// Install a callback for registry `Warning` headers.
    #[must_use]
    pub fn with_warning_handler(mut self, handler: WarningHandler) -> Self {
        self.warning_handler = Some(handler);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns an error when the options fail validation or the template
    /// transport cannot be constructed.
    pub fn build(self) -> Result<Client> {
        let opts = self.opts.validated()?;
        let default_http = tls::build_default_transport(&opts)?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                opts,
                source: self.source,
                default_http,
                auth_factory: self.auth_factory,
                hosts: Mutex::new(HashMap::new()),
                warning_handler: self.warning_handler,
                warned: Mutex::new(HashSet::new()),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct ClientInner {
    pub(crate) opts: ClientOptions,
    source: Option<Arc<dyn HostSource>>,
    default_http: reqwest::Client,
    auth_factory: AuthFactory,
    hosts: Mutex<HashMap<String, Arc<Host>>>,
    warning_handler: Option<WarningHandler>,
    warned: Mutex<HashSet<String>>,
}

/// Registry-aware HTTP request engine.
///
/// Cheap to clone; all clones share host state, so backoff penalties and
/// auth handlers are a budget shared by every caller.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Start building a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The client-wide options.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.opts
    }

    /// Send a logical request, selecting among the host and its mirrors.
    ///
    /// # Errors
    ///
    /// Returns the classified error of the last failed attempt, or
    /// [`Error::AllRequestsFailed`] when no attempt produced a response.
    pub async fn send(&self, request: Request) -> Result<Response> {
        if request.host.is_empty() {
            return Err(Error::Config("request host is required".to_string()));
        }
        let mut response = Response {
            client: self.clone(),
            request,
            host: None,
            inner: None,
            chunk: Bytes::new(),
            read_cur: 0,
            read_max: 0,
            done: false,
            lease: ThrottleLease::empty(),
        };
        response.retry_loop().await?;
        Ok(response)
    }

    /// Fetch or lazily create the state for a named host.
    ///
    /// State is keyed by the normalized name the config source returns; a
    /// lookup under an alias lands on the normalized entry.
    pub(crate) fn get_host(&self, name: &str) -> Arc<Host> {
        {
            let hosts = self.inner.hosts.lock().expect("host map mutex poisoned");
            if let Some(host) = hosts.get(name) {
                return host.clone();
            }
        }

        let config = self
            .inner
            .source
            .as_ref()
            .and_then(|source| source.host_config(name))
            .unwrap_or_else(|| HostConfig::new(name));
        let key = if config.name.is_empty() {
            name.to_string()
        } else {
            config.name.clone()
        };

        // built outside the lock; TLS assembly may touch the filesystem
        let host = Host::new(
            config,
            &self.inner.opts,
            &self.inner.default_http,
            self.inner.auth_factory.clone(),
        );

        let mut hosts = self.inner.hosts.lock().expect("host map mutex poisoned");
        hosts.entry(key).or_insert(host).clone()
    }

    /// Assemble and order the candidate hosts for a request.
    pub(crate) fn candidates(&self, upstream: &str, no_mirrors: bool) -> Vec<Arc<Host>> {
        let top = self.get_host(upstream);
        let upstream_name = top.config.name.clone();
        let mut hosts = Vec::with_capacity(top.config.mirrors.len() + 1);
        if !no_mirrors {
            for mirror in &top.config.mirrors {
                hosts.push(self.get_host(mirror));
            }
        }
        hosts.push(top);
        order_candidates(&mut hosts, &upstream_name);
        hosts
    }

    /// Forward a registry warning, once per distinct text.
    pub(crate) fn forward_warning(&self, text: &str) {
        {
            let mut warned = self.inner.warned.lock().expect("warned mutex poisoned");
            if !warned.insert(text.to_string()) {
                return;
            }
        }
        match &self.inner.warning_handler {
            Some(handler) => handler(text),
            None => warn!(warning = text, "registry warning"),
        }
    }
}

/// Extract the quoted text of a `Warning: 299 - "<text>"` header.
fn parse_warning(value: &str) -> Option<&str> {
    let rest = value.strip_prefix("299 - \"")?;
    let end = rest.find('"')?;
    if end == 0 {
        return None;
    }
    Some(&rest[..end])
}

/// Per-attempt outcome flags driving the candidate-list bookkeeping.
#[derive(Debug, Default)]
struct AttemptFlags {
    backoff: bool,
    drop_host: bool,
    retry_host: bool,
    retry_after: Option<Duration>,
}

impl Response {
    /// The retry/mirror loop: run attempts over the candidate list until one
    /// succeeds or the list empties.
    pub(crate) async fn retry_loop(&mut self) -> Result<()> {
        // any lease from a previous body is stale once we retry
        self.lease.release();

        let client = self.client.clone();
        let mut hosts = client.candidates(&self.request.host, self.request.no_mirrors);
        let mut cursor: usize = 0;
        let mut last_err: Option<Error> = None;

        loop {
            if hosts.is_empty() {
                self.done = true;
                return Err(last_err.unwrap_or(Error::AllRequestsFailed));
            }
            let pos = cursor % hosts.len();
            let host = hosts[pos].clone();
            let mut flags = AttemptFlags::default();

            let mut lease = match host.acquire_throttle(self.request.throttle_meta()).await {
                Ok(lease) => lease,
                Err(err) => {
                    self.done = true;
                    return Err(err);
                }
            };

            match self.attempt(&host, &mut flags).await {
                Ok(response) => {
                    self.inner = Some(response);
                    self.host = Some(host);
                    self.lease = lease;
                    self.done = false;
                    return Ok(());
                }
                Err(err) => {
                    lease.release();
                    if flags.backoff {
                        if self.request.ignore_err {
                            // expected failures never penalize shared state
                            flags.drop_host = true;
                        } else if host.backoff.set(flags.retry_after).is_err() {
                            flags.drop_host = true;
                        }
                    }
                    if err.is_not_retryable() {
                        self.done = true;
                        return Err(last_err.unwrap_or(err));
                    }
                    debug!(host = %host.config.name, error = %err, "registry attempt failed");
                    last_err = Some(err);
                    if flags.drop_host {
                        hosts.remove(pos);
                        cursor = pos;
                    } else if flags.retry_host {
                        cursor = pos;
                    } else {
                        cursor = pos + 1;
                    }
                }
            }
        }
    }

    /// One attempt against one host.
    ///
    /// `flags` reports how the failure should be treated; on success the
    /// verified HTTP response is returned with `read_max` bookkeeping done.
    async fn attempt(
        &mut self,
        host: &Arc<Host>,
        flags: &mut AttemptFlags,
    ) -> Result<reqwest::Response> {
        if self.request.method == Method::HEAD && host.config.head_disabled() {
            flags.drop_host = true;
            return Err(Error::UnsupportedApi(format!(
                "HEAD requests disabled for {}",
                host.config.name
            )));
        }

        let url = self.request.build_url(&host.config)?;

        // the previous attempt's body, if any, is dead weight now
        self.inner = None;
        self.chunk = Bytes::new();

        host.backoff.wait().await;

        let mut headers = self.request.headers.clone();
        if !headers.contains_key(USER_AGENT) {
            let agent = HeaderValue::from_str(&self.client.inner.opts.user_agent)
                .map_err(|err| Error::Config(format!("invalid user agent: {err}")))?;
            headers.insert(USER_AGENT, agent);
        }
        let mut sent_range = headers.contains_key(RANGE);
        if self.read_cur > 0 && self.read_max > 0 {
            if sent_range {
                flags.drop_host = true;
                return Err(Error::UnresumableRange(url.to_string()));
            }
            let range = format!("bytes={}-{}", self.read_cur, self.read_max);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&range)
                    .map_err(|err| Error::Config(format!("invalid range header: {err}")))?,
            );
            sent_range = true;
        }

        let mut builder = host
            .http
            .request(self.request.method.clone(), url.clone())
            .headers(headers);
        if let Some(body) = &self.request.body {
            builder = builder.body(body.make_body()?);
            if let BodySource::Stream { len, .. } = body {
                if *len > 0 {
                    builder = builder.header(CONTENT_LENGTH, *len);
                }
            }
        }

        let auth = host.get_auth(&self.request.repository);
        if let Some(handler) = &auth {
            if !self.request.repository.is_empty() {
                let mut scope = format!("repository:{}:pull", self.request.repository);
                if self.request.method != Method::GET && self.request.method != Method::HEAD {
                    scope.push_str(",push");
                }
                handler.add_scope(&host.config.hostname, &scope);
            }
            builder = match handler.sign_request(builder).await {
                Ok(builder) => builder,
                Err(err) => {
                    if matches!(err, Error::Unauthorized(_)) {
                        flags.drop_host = true;
                    } else {
                        flags.backoff = true;
                    }
                    return Err(err);
                }
            };
        }

        host.pacer.pace().await;

        debug!(method = %self.request.method, url = %url, host = %host.config.name,
            "sending registry request");
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                flags.backoff = true;
                return Err(Error::from(err));
            }
        };

        for value in response.headers().get_all(WARNING) {
            if let Some(text) = value.to_str().ok().and_then(parse_warning) {
                self.client.forward_warning(text);
            }
        }

        let status = response.status();
        if !status.is_success() {
            flags.retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);

            match status.as_u16() {
                401 => match &auth {
                    Some(handler) => match handler.handle_response(&response).await {
                        Ok(()) => flags.retry_host = true,
                        Err(
                            Error::EmptyChallenge(_)
                            | Error::NoNewChallenge(_)
                            | Error::Unauthorized(_),
                        ) => flags.drop_host = true,
                        Err(_) => {}
                    },
                    None => flags.drop_host = true,
                },
                404 | 416 => flags.drop_host = true,
                408 | 429 | 500 | 504 => flags.backoff = true,
                _ => {
                    flags.backoff = true;
                    flags.drop_host = true;
                }
            }

            let body = response.bytes().await.unwrap_or_default();
            return Err(Error::from_status(status, url.as_str(), &body));
        }

        // verify length bookkeeping before handing the body out
        if self.read_cur == 0 {
            if let Some(value) = response.headers().get(CONTENT_LENGTH) {
                let length = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| Error::Parse(format!("invalid Content-Length from {url}")))?;
                if self.read_max > 0 && self.read_max != length {
                    return Err(Error::ContentLengthMismatch {
                        expected: self.read_max,
                        actual: length,
                    });
                }
                if self.read_max == 0 {
                    self.read_max = length;
                }
            }
        }
        if sent_range && !response.headers().contains_key(CONTENT_RANGE) {
            flags.drop_host = true;
            return Err(Error::MissingContentRange(url.to_string()));
        }

        Ok(response)
    }
}
